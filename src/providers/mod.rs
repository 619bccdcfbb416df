//! Oracle providers: HTTP streaming backend and the scripted test double

pub mod http;
pub mod scripted;

use std::sync::Arc;

use crate::brain::oracle::Oracle;
use crate::core::config::LlmConfig;

pub use http::HttpOracle;
pub use scripted::ScriptedOracle;

/// Build the oracle named by the configuration.
pub fn from_config(config: &LlmConfig) -> Arc<dyn Oracle> {
    match config.provider.as_str() {
        "scripted" => Arc::new(ScriptedOracle::new()),
        _ => Arc::new(HttpOracle::new(config)),
    }
}
