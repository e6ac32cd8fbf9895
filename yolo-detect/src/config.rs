use crate::{common::*, context::ExecutionContext};

pub use input::*;
pub use model::*;
pub use nms::*;
pub use output::*;

pub static CONFIG_VERSION: Lazy<VersionReq> = Lazy::new(|| VersionReq::parse("0.1.0").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: Version,
    pub model: ModelConfig,
    pub input: InputConfig,
    #[serde(default)]
    pub nms: NmsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        text.parse()
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: Self = json5::from_str(text)?;
        config.model.context.validate()?;
        Ok(config)
    }
}

mod model {
    use super::*;

    /// Model configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        /// The darknet model configuration file.
        pub cfg_file: PathBuf,
        /// The darknet weights file.
        pub weights_file: PathBuf,
        /// The device and float type the model runs on.
        #[serde(default)]
        pub context: ExecutionContext,
    }
}

mod input {
    use super::*;

    /// Input images options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct InputConfig {
        /// An image file or a directory of images.
        pub images: PathBuf,
        /// Batch size.
        pub batch_size: NonZeroUsize,
        /// Optional file with one class name per line.
        pub classes_file: Option<PathBuf>,
    }
}

mod nms {
    use super::*;

    /// Post-processing options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct NmsConfig {
        #[serde(default = "default_confidence_threshold")]
        pub confidence_threshold: R64,
        #[serde(default = "default_iou_threshold")]
        pub iou_threshold: R64,
    }

    impl Default for NmsConfig {
        fn default() -> Self {
            Self {
                confidence_threshold: default_confidence_threshold(),
                iou_threshold: default_iou_threshold(),
            }
        }
    }

    fn default_confidence_threshold() -> R64 {
        r64(0.5)
    }

    fn default_iou_threshold() -> R64 {
        r64(0.4)
    }
}

mod output {
    use super::*;

    /// Output options.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct OutputConfig {
        /// Write all detections to this JSON file if set.
        pub file: Option<PathBuf>,
    }
}

pub fn deserialize_version<'de, D>(deserializer: D) -> Result<Version, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    let version = Version::parse(&text).map_err(|err| {
        D::Error::custom(format!(
            "failed to parse version number '{}': {:?}",
            text, err
        ))
    })?;

    if !CONFIG_VERSION.matches(&version) {
        return Err(D::Error::custom(format!(
            "incompatible version: get '{}', but it is incompatible with requirement '{}'",
            version, &*CONFIG_VERSION,
        )));
    }

    Ok(version)
}
