use std::fmt::Display;
use thiserror::Error;

/// Malformed or unsupported model configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("the configuration is empty")]
    Empty,
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error("[net] section: {reason}")]
    Net { reason: String },
    #[error("layer {index} ({kind}): {reason}")]
    Layer {
        index: usize,
        kind: String,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn syntax(line: usize, reason: impl Display) -> Self {
        Self::Syntax {
            line,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn net(reason: impl Display) -> Self {
        Self::Net {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn layer(index: usize, kind: impl Display, reason: impl Display) -> Self {
        Self::Layer {
            index,
            kind: kind.to_string(),
            reason: reason.to_string(),
        }
    }
}
