pub mod excl;
pub mod heatmap;
pub mod service;

pub use excl::ExclMatcher;
pub use heatmap::Heatmap;
pub use service::{JobOutputOutcome, SchedulerService};
