mod file_sink;
mod tiered_space;
mod worker_metrics;

pub use file_sink::*;
pub use tiered_space::*;
pub use worker_metrics::*;
