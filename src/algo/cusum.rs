use serde::{Deserialize, Serialize};

/// Two-sided tabular CUSUM (Page, 1954).
///
/// `slack` and `threshold` are in the units of the series (already multiplied
/// by the reference σ). The statistic on the alarming side resets to zero
/// after every alarm so repeated excursions are each reported.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Cusum {
    target: f64,
    slack: f64,
    threshold: f64,

    c_pos: f64,
    c_neg: f64,

    pub alarms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CusumStep {
    pub alarm: Option<Shift>,
    /// max(C⁺, C⁻) / threshold, taken before any reset.
    pub score: f64,
}

impl Cusum {
    pub fn new(target: f64, slack: f64, threshold: f64) -> Self {
        Self {
            target,
            slack: slack.max(0.0),
            threshold,
            c_pos: 0.0,
            c_neg: 0.0,
            alarms: 0,
        }
    }

    pub fn update(&mut self, sample: f64) -> CusumStep {
        let deviation = sample - self.target;
        self.c_pos = (self.c_pos + deviation - self.slack).max(0.0);
        self.c_neg = (self.c_neg - deviation - self.slack).max(0.0);

        let score = if self.threshold > 0.0 {
            self.c_pos.max(self.c_neg) / self.threshold
        } else {
            0.0
        };

        let mut alarm = None;
        if self.c_pos > self.threshold {
            alarm = Some(Shift::Up);
            self.c_pos = 0.0;
        }
        if self.c_neg > self.threshold {
            alarm = alarm.or(Some(Shift::Down));
            self.c_neg = 0.0;
        }
        if alarm.is_some() {
            self.alarms += 1;
        }

        CusumStep { alarm, score }
    }

    pub fn statistics(&self) -> (f64, f64) {
        (self.c_pos, self.c_neg)
    }

    pub fn reset(&mut self) {
        self.c_pos = 0.0;
        self.c_neg = 0.0;
    }
}
