pub mod autoregressive;
pub mod bspline;
pub mod cusum;
pub mod dbscan;
pub mod stats;
