mod common;
pub mod config;
pub mod darknet;
pub mod error;
pub mod graph;
mod utils;

pub use config::{DarknetConfig, LayerDescriptor, LayerKind};
pub use darknet::DarknetModel;
pub use error::ConfigError;
pub use graph::{LayerGraph, LayerPosition, NetConfig, Node};
