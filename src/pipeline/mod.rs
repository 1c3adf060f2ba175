//! The application-processing pipeline and the dispatcher that drives it.

mod dispatcher;
pub mod stages;

pub use dispatcher::{CycleSummary, DispatchConfig, Dispatcher};
