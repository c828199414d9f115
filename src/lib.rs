pub mod cli;
pub mod config;
pub mod error;
pub mod source;
pub mod store;
pub mod unified;

pub use config::Config;
pub use error::{IngestError, Result};
pub use store::HealthStore;
