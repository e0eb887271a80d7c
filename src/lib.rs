pub mod config;
pub mod dashboard;
pub mod error;
pub mod queue;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{QueueError, Result};
