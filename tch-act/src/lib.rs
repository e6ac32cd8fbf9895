#[cfg(feature = "tch")]
pub use impls::*;
#[cfg(feature = "tch")]
mod impls;

#[cfg(feature = "tch")]
pub use r#trait::*;
#[cfg(feature = "tch")]
mod r#trait;

/// Activation functions a darknet layer may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Activation {
    Linear,
    Leaky,
    Relu,
    Logistic,
    Mish,
    Swish,
    Tanh,
}

impl Activation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Leaky => "leaky",
            Self::Relu => "relu",
            Self::Logistic => "logistic",
            Self::Mish => "mish",
            Self::Swish => "swish",
            Self::Tanh => "tanh",
        }
    }
}

impl Default for Activation {
    fn default() -> Self {
        Self::Linear
    }
}
