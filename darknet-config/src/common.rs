pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use byteorder::{LittleEndian, ReadBytesExt};
pub use indexmap::IndexMap;
pub use itertools::Itertools as _;
pub use log::{debug, info, warn};
pub use ndarray::{Array, Array1, Array4, Dimension};
pub use noisy_float::prelude::*;
pub use serde::{de::IntoDeserializer as _, Deserialize, Serialize};
pub use std::{
    fmt,
    fmt::Display,
    fs::{self, File},
    io::{BufReader, Read},
    path::Path,
    str::FromStr,
};
pub use strum::EnumString;
pub use tch_act::Activation;
