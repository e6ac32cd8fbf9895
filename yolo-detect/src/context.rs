use crate::common::*;

/// Where parameters live and which floating point type they use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    #[serde(default)]
    pub precision: Precision,
}

impl ExecutionContext {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            precision: Precision::Float,
        }
    }

    pub fn cuda_if_available() -> Self {
        Self {
            device: Device::cuda_if_available(),
            precision: Precision::Float,
        }
    }

    pub fn kind(&self) -> Kind {
        self.precision.kind()
    }

    /// Rejects combinations libtorch cannot run.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !(self.device == Device::Cpu && self.precision == Precision::Half),
            "half precision requires a CUDA device"
        );
        Ok(())
    }

    /// Moves and casts a tensor into this context.
    pub fn place(&self, tensor: &Tensor) -> Tensor {
        tensor.to_device(self.device).to_kind(self.kind())
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Half,
    Float,
    Double,
}

impl Precision {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Half => Kind::Half,
            Self::Float => Kind::Float,
            Self::Double => Kind::Double,
        }
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self::Float
    }
}
