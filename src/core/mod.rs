//! Core infrastructure: errors, configuration, logging, environment context

pub mod config;
pub mod context;
pub mod error;
pub mod logging;

pub use config::MaestroConfig;
pub use context::{ContextBuilder, ContextSnapshot};
pub use error::{MaestroError, Result};
