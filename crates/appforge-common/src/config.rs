use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lower and upper bound for the error-fixing loop.
pub const MIN_FIX_ITERATIONS: u8 = 1;
pub const MAX_FIX_ITERATIONS: u8 = 5;

/// How the sandbox is seeded before code generation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Start from an empty sandbox.
    #[default]
    Naive,
    /// Copy a named template tree into the sandbox first.
    Template,
}

impl InputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Naive => "naive",
            Self::Template => "template",
        }
    }
}

impl FromStr for InputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "naive" => Ok(Self::Naive),
            "template" => Ok(Self::Template),
            _ => Err(format!("Invalid input mode: {}", s)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("maxIterations must be between {MIN_FIX_ITERATIONS} and {MAX_FIX_ITERATIONS}, got {0}")]
    IterationsOutOfRange(u8),

    #[error("template name must not be empty")]
    EmptyTemplateName,
}

/// Declarative flags selecting which capabilities run for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityConfig {
    #[serde(default)]
    pub input_mode: InputMode,
    /// Template to copy when `input_mode` is `template`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub planning: bool,
    #[serde(default)]
    pub compiler_checks: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u8,
    #[serde(default)]
    pub building_blocks: bool,
}

fn default_max_iterations() -> u8 {
    3
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            input_mode: InputMode::Naive,
            template: None,
            planning: false,
            compiler_checks: false,
            max_iterations: default_max_iterations(),
            building_blocks: false,
        }
    }
}

impl CapabilityConfig {
    pub const DEFAULT_TEMPLATE: &'static str = "vite-react-express";

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !(MIN_FIX_ITERATIONS..=MAX_FIX_ITERATIONS).contains(&self.max_iterations) {
            return Err(ConfigValidationError::IterationsOutOfRange(self.max_iterations));
        }
        if let Some(name) = &self.template
            && name.trim().is_empty()
        {
            return Err(ConfigValidationError::EmptyTemplateName);
        }
        Ok(())
    }

    /// Template name to copy, falling back to the default scaffold.
    pub fn template_name(&self) -> &str {
        self.template.as_deref().unwrap_or(Self::DEFAULT_TEMPLATE)
    }
}
