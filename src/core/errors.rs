//! CFN-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, CfnError>;

/// Top-level error type for the content funnel.
///
/// Arbitration failures never appear here: they are folded into
/// [`crate::core::evidence::VerdictStatus`] so a unit always reaches policy.
#[derive(Debug, Error)]
pub enum CfnError {
    #[error("[CFN-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CFN-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CFN-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CFN-2001] invalid rule document: {details}")]
    InvalidRules { details: String },

    #[error("[CFN-2002] rule {rule_id} has an invalid condition: {details}")]
    InvalidCondition { rule_id: String, details: String },

    #[error("[CFN-2003] unsupported rule document format: {path}")]
    UnsupportedRuleFormat { path: PathBuf },

    #[error("[CFN-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[CFN-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[CFN-3001] audit append failed after {attempts} attempts: {details}")]
    AuditAppend { attempts: u32, details: String },

    #[error("[CFN-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CFN-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[CFN-3004] audit chain broken at line {line}: {details}")]
    AuditChain { line: usize, details: String },

    #[error("[CFN-3005] decision sink failed after {attempts} attempts: {details}")]
    SinkEmit { attempts: u32, details: String },

    #[error("[CFN-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl CfnError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CFN-1001",
            Self::MissingConfig { .. } => "CFN-1002",
            Self::ConfigParse { .. } => "CFN-1003",
            Self::InvalidRules { .. } => "CFN-2001",
            Self::InvalidCondition { .. } => "CFN-2002",
            Self::UnsupportedRuleFormat { .. } => "CFN-2003",
            Self::Serialization { .. } => "CFN-2101",
            Self::Sql { .. } => "CFN-2102",
            Self::AuditAppend { .. } => "CFN-3001",
            Self::Io { .. } => "CFN-3002",
            Self::ChannelClosed { .. } => "CFN-3003",
            Self::AuditChain { .. } => "CFN-3004",
            Self::SinkEmit { .. } => "CFN-3005",
            Self::Runtime { .. } => "CFN-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Sql { .. }
                | Self::SinkEmit { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for CfnError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for CfnError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for CfnError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
