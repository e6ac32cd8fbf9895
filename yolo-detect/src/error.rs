use darknet_config::LayerPosition;
use std::fmt::Display;
use thiserror::Error;

/// Tensors that cannot be combined at some point of the forward pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("layer {position} ({kind}): {reason}")]
pub struct ShapeError {
    /// The failing layer, or [LayerPosition::Input] for a bad input batch.
    pub position: LayerPosition,
    pub kind: String,
    pub reason: String,
}

impl ShapeError {
    pub(crate) fn new(position: LayerPosition, kind: impl Display, reason: impl Display) -> Self {
        Self {
            position,
            kind: kind.to_string(),
            reason: reason.to_string(),
        }
    }
}
