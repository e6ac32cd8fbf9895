use crate::{common::*, error::ConfigError};

pub use darknet::*;
pub use descriptor::*;

mod darknet {
    use super::*;

    /// The parsed block list of a darknet configuration file.
    ///
    /// Values are kept verbatim. Type conversion happens when the
    /// [LayerGraph](crate::graph::LayerGraph) is built, because list-valued
    /// keys such as `layers`, `mask` and `anchors` are interpreted
    /// differently per layer kind.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DarknetConfig {
        /// Options of the leading `[net]` section.
        pub net: IndexMap<String, String>,
        /// The layer sections in file order.
        pub layers: Vec<LayerDescriptor>,
    }

    impl DarknetConfig {
        pub fn load<P>(config_file: P) -> Result<Self>
        where
            P: AsRef<Path>,
        {
            let config_file = config_file.as_ref();
            let text = fs::read_to_string(config_file)
                .with_context(|| format!("failed to read '{}'", config_file.display()))?;
            let config: Self = text.parse()?;
            Ok(config)
        }
    }

    impl FromStr for DarknetConfig {
        type Err = Error;

        fn from_str(text: &str) -> Result<Self, Self::Err> {
            let mut blocks: Vec<Block> = vec![];

            for (line_index, line) in text.lines().enumerate() {
                let line_no = line_index + 1;
                let line = line.trim();

                if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                    continue;
                }

                if let Some(header) = line.strip_prefix('[') {
                    let name = header.strip_suffix(']').ok_or_else(|| {
                        ConfigError::syntax(line_no, format!("unclosed section header '{}'", line))
                    })?;
                    blocks.push(Block {
                        name: name.trim().to_string(),
                        line: line_no,
                        params: IndexMap::new(),
                    });
                    continue;
                }

                let block = blocks.last_mut().ok_or_else(|| {
                    ConfigError::syntax(line_no, "expect a section header like '[net]' first")
                })?;

                let (key, value) = line.split_once('=').ok_or_else(|| {
                    ConfigError::syntax(line_no, format!("expect 'key=value', but get '{}'", line))
                })?;
                let key = key.trim();
                let value = value.trim();

                if key.is_empty() {
                    return Err(ConfigError::syntax(line_no, "empty key").into());
                }

                if let Some(prev) = block.params.insert(key.to_string(), value.to_string()) {
                    warn!(
                        "line {}: '{}' is specified again, '{}' is overridden by '{}'",
                        line_no, key, prev, value
                    );
                }
            }

            let mut blocks = blocks.into_iter();

            let net = match blocks.next() {
                Some(Block { name, params, .. }) if is_net_section(&name) => params,
                Some(Block { name, line, .. }) => {
                    return Err(ConfigError::syntax(
                        line,
                        format!("the first section must be [net], but get [{}]", name),
                    )
                    .into())
                }
                None => return Err(ConfigError::Empty.into()),
            };

            let layers: Vec<_> = blocks
                .map(|block| -> Result<_> {
                    let Block { name, line, params } = block;

                    if is_net_section(&name) {
                        return Err(ConfigError::syntax(
                            line,
                            "the [net] section must appear only once in the first place",
                        )
                        .into());
                    }

                    let kind: LayerKind = name.parse()?;
                    Ok(LayerDescriptor { kind, line, params })
                })
                .try_collect()?;

            Ok(Self { net, layers })
        }
    }

    #[derive(Debug)]
    struct Block {
        name: String,
        line: usize,
        params: IndexMap<String, String>,
    }

    fn is_net_section(name: &str) -> bool {
        matches!(name, "net" | "network")
    }
}

mod descriptor {
    use super::*;

    /// The layer kind named by a section header.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString)]
    pub enum LayerKind {
        #[strum(serialize = "convolutional", serialize = "conv")]
        Convolutional,
        #[strum(serialize = "upsample")]
        UpSample,
        #[strum(serialize = "maxpool", serialize = "max")]
        MaxPool,
        #[strum(serialize = "route")]
        Route,
        #[strum(serialize = "shortcut")]
        Shortcut,
        #[strum(serialize = "yolo")]
        Yolo,
        /// A section this crate does not know how to build.
        #[strum(default)]
        Other(String),
    }

    impl LayerKind {
        pub fn name(&self) -> &str {
            match self {
                Self::Convolutional => "convolutional",
                Self::UpSample => "upsample",
                Self::MaxPool => "maxpool",
                Self::Route => "route",
                Self::Shortcut => "shortcut",
                Self::Yolo => "yolo",
                Self::Other(name) => name,
            }
        }
    }

    impl Display for LayerKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.name())
        }
    }

    /// One layer section: its kind and raw `key=value` options.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LayerDescriptor {
        pub kind: LayerKind,
        /// 1-based line number of the section header.
        pub line: usize,
        pub params: IndexMap<String, String>,
    }
}
