use crate::error::DetectError;
use std::time::{Duration, Instant};

/// Cooperative time budget for one detection request. Long loops call
/// [`Budget::check`] and bail out with `Timeout` once the deadline passes.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    deadline: Option<Instant>,
    limit: Duration,
}

impl Budget {
    pub fn new(limit: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(limit),
            limit,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            deadline: None,
            limit: Duration::MAX,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<(), DetectError> {
        if self.is_exhausted() {
            Err(DetectError::Timeout {
                budget_ms: self.limit.as_millis() as u64,
            })
        } else {
            Ok(())
        }
    }
}
