use crate::Activation;
use tch::{nn, Tensor};

/// Negative slope of darknet's leaky activation.
pub const LEAKY_SLOPE: f64 = 0.1;

impl nn::Module for Activation {
    fn forward(&self, xs: &Tensor) -> Tensor {
        use Activation::*;

        match *self {
            Linear => xs.shallow_clone(),
            Leaky => leaky(xs),
            Relu => xs.relu(),
            Logistic => xs.sigmoid(),
            Mish => mish(xs),
            Swish => swish(xs),
            Tanh => xs.tanh(),
        }
    }
}

pub fn leaky(xs: &Tensor) -> Tensor {
    xs.clamp_min(0.0) + xs.clamp_max(0.0) * LEAKY_SLOPE
}

pub fn mish(xs: &Tensor) -> Tensor {
    xs * xs.softplus().tanh()
}

pub fn swish(xs: &Tensor) -> Tensor {
    xs * xs.sigmoid()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::Module, Kind};

    #[test]
    fn leaky_scales_negative_side() {
        let xs = Tensor::of_slice(&[-10.0f32, -1.0, 0.0, 2.0]);
        let ys = Vec::<f32>::from(&Activation::Leaky.forward(&xs));
        assert_eq!(ys, vec![-1.0, -0.1, 0.0, 2.0]);
    }

    #[test]
    fn linear_is_identity() {
        let xs = Tensor::of_slice(&[-3.0f32, 0.5]).to_kind(Kind::Float);
        let ys = Vec::<f32>::from(&Activation::Linear.forward(&xs));
        assert_eq!(ys, vec![-3.0, 0.5]);
    }
}
