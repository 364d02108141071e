pub mod config;
pub mod error;

pub use config::AgentCoreConfig;
pub use error::{extract_provider_error_message, CoreError, Result};
