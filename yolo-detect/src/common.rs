pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::{prelude::*, Transform, XYXY};
pub use darknet_config::{
    darknet::{self, DarknetModel},
    graph::{
        ConvolutionalNode, LayerGraph, LayerPosition, MaxPoolNode, NetConfig, Node, RouteNode,
        ShortcutNode, UpSampleNode, YoloNode, UPSAMPLE_SCALE,
    },
};
pub use itertools::Itertools as _;
pub use log::{debug, info, warn};
pub use ndarray::{Array, Dimension};
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use semver::{Version, VersionReq};
pub use serde::{de::Error as DeserializeError, Deserialize, Deserializer, Serialize};
pub use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fs::{self, File},
    io::BufWriter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
};
pub use tch::{Device, Kind, Tensor};
pub use tch_act::TensorActivationExt as _;
