//! Intent schema: the typed plan produced by translation
//!
//! An [`Intent`] is the validated output of one oracle translation: a goal,
//! a confirmation flag, and an ordered list of steps. Risk ladder:
//! 0 read-only, 1 safe create/move, 2 overwrite, 3 destructive/kill.
//! An intent requires confirmation exactly when any step carries risk >= 3.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::{MaestroError, Result};
use crate::tools::ToolRegistry;

pub const RISK_READ_ONLY: u8 = 0;
pub const RISK_CREATE: u8 = 1;
pub const RISK_OVERWRITE: u8 = 2;
pub const RISK_DESTRUCTIVE: u8 = 3;

/// A validated execution plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Intent {
    pub goal: String,
    #[serde(default)]
    pub requires_confirmation: bool,
    pub steps: Vec<Step>,
}

/// One tool invocation inside an intent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub tool: String,
    pub action: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    pub risk: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

impl Intent {
    /// Parse an intent from raw oracle output.
    ///
    /// Oracles wrap the JSON in prose often enough that we extract the
    /// outermost `{...}` before parsing. The confirmation flag is
    /// recomputed from step risks regardless of what the oracle claimed.
    pub fn parse(raw: &str) -> Result<Self> {
        let json = extract_json(raw).ok_or_else(|| {
            MaestroError::schema(format!(
                "no JSON object found in oracle output ({} chars)",
                raw.len()
            ))
        })?;

        let mut intent: Intent = serde_json::from_str(json)
            .map_err(|e| MaestroError::schema(format!("intent does not match schema: {}", e)))?;

        intent.requires_confirmation = intent.max_risk() >= RISK_DESTRUCTIVE;
        Ok(intent)
    }

    /// Validate the intent against the tool registry.
    ///
    /// Rules: steps non-empty; every (tool, action) known; risk within the
    /// ladder; required argument keys present for the operation.
    pub fn validate(&self, registry: &ToolRegistry) -> Result<()> {
        if self.steps.is_empty() {
            return Err(MaestroError::schema("intent has no steps"));
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.risk > RISK_DESTRUCTIVE {
                return Err(MaestroError::schema(format!(
                    "step {} has risk {} outside 0..=3",
                    i, step.risk
                )));
            }

            let op = registry.lookup(&step.tool, &step.action).ok_or_else(|| {
                MaestroError::schema(format!(
                    "step {} references unknown operation {}.{}",
                    i, step.tool, step.action
                ))
            })?;

            for required in op.required_args() {
                if !step.args.contains_key(*required) {
                    return Err(MaestroError::schema(format!(
                        "step {} ({}.{}) is missing required argument '{}'",
                        i, step.tool, step.action, required
                    )));
                }
            }
        }

        if self.requires_confirmation != (self.max_risk() >= RISK_DESTRUCTIVE) {
            return Err(MaestroError::schema(
                "requires_confirmation inconsistent with step risks",
            ));
        }

        Ok(())
    }

    pub fn max_risk(&self) -> u8 {
        self.steps.iter().map(|s| s.risk).max().unwrap_or(0)
    }
}

impl Step {
    /// `tool.action(k=v, ...)` rendering used by dry runs and observations
    pub fn signature(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{}={}", k, s),
                other => format!("{}={}", k, other),
            })
            .collect();
        format!("{}.{}({})", self.tool, self.action, args.join(", "))
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(|v| v.as_str())
    }
}

/// Extract the outermost `{...}` from text that may surround the JSON.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}
