use crate::{
    common::*,
    config::{DarknetConfig, LayerDescriptor, LayerKind},
    utils::Params,
};

pub use graph::*;
pub use layer_position::*;
pub use net::*;
pub use node::*;

/// Darknet upsampling is fixed to this factor whatever the section declares.
pub const UPSAMPLE_SCALE: usize = 2;

/// A route concatenates at most this many layers.
pub const MAX_ROUTE_SOURCES: usize = 2;

mod graph {
    use super::*;

    /// The executable layer list built from a [DarknetConfig].
    ///
    /// Node `i` only refers to nodes with smaller indexes, so ascending
    /// index order is always a valid execution order.
    #[derive(Debug, Clone, PartialEq)]
    pub struct LayerGraph {
        pub net: NetConfig,
        pub layers: Vec<Node>,
    }

    impl LayerGraph {
        pub fn from_config_file<P>(config_file: P) -> Result<Self>
        where
            P: AsRef<Path>,
        {
            let config = DarknetConfig::load(config_file)?;
            let graph = Self::from_config(&config)?;
            Ok(graph)
        }

        pub fn from_config(config: &DarknetConfig) -> Result<Self> {
            let DarknetConfig {
                net: ref net_params,
                ref layers,
            } = *config;

            let net = NetConfig::from_params(net_params)?;
            let mut nodes: Vec<Node> = Vec::with_capacity(layers.len());

            for (index, descriptor) in layers.iter().enumerate() {
                let LayerDescriptor {
                    ref kind,
                    ref params,
                    ..
                } = *descriptor;
                let params = Params::layer(index, kind, params);

                // channels of the previous layer, or of the input image
                let input_channels = nodes
                    .last()
                    .map(|node| node.output_channels())
                    .unwrap_or(net.channels);
                let output_channels_of = |from: usize| nodes[from].output_channels();

                let node: Node = match kind {
                    LayerKind::Convolutional => {
                        ConvolutionalNode::build(index, input_channels, &params)?.into()
                    }
                    LayerKind::UpSample => UpSampleNode::build(index, input_channels, &params)?.into(),
                    LayerKind::MaxPool => MaxPoolNode::build(index, input_channels, &params)?.into(),
                    LayerKind::Route => RouteNode::build(index, output_channels_of, &params)?.into(),
                    LayerKind::Shortcut => {
                        ShortcutNode::build(index, input_channels, &params)?.into()
                    }
                    LayerKind::Yolo => {
                        YoloNode::build(index, input_channels, net.height, &params)?.into()
                    }
                    LayerKind::Other(_) => {
                        return Err(params.error("unsupported layer kind").into());
                    }
                };

                debug!(
                    "{}\t{}\tfrom {}\t{} channels",
                    index,
                    kind,
                    node.from_indexes().iter().join(","),
                    node.output_channels()
                );
                nodes.push(node);
            }

            Ok(Self { net, layers: nodes })
        }

        /// The number of nodes.
        pub fn len(&self) -> usize {
            self.layers.len()
        }

        pub fn is_empty(&self) -> bool {
            self.layers.is_empty()
        }

        pub fn yolo_layers(&self) -> impl Iterator<Item = &YoloNode> {
            self.layers.iter().filter_map(|node| match node {
                Node::Yolo(node) => Some(node),
                _ => None,
            })
        }
    }

    impl FromStr for LayerGraph {
        type Err = Error;

        fn from_str(text: &str) -> Result<Self, Self::Err> {
            let config: DarknetConfig = text.parse()?;
            Self::from_config(&config)
        }
    }
}

mod net {
    use super::*;

    const NET_KEYS: &[&str] = &["height", "width", "channels", "batch", "momentum", "decay"];

    /// Global network options from the `[net]` section.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct NetConfig {
        pub height: usize,
        pub width: usize,
        pub channels: usize,
        pub batch: usize,
        pub momentum: R64,
        pub decay: R64,
        /// Options without a typed field, mostly training settings.
        pub extra: IndexMap<String, String>,
    }

    impl NetConfig {
        pub fn from_params(params: &IndexMap<String, String>) -> Result<Self> {
            let params = Params::net(params);

            let height: usize = params.get("height")?;
            let width: usize = params.get("width")?;
            let channels: usize = params.get_or("channels", 3)?;
            let batch: usize = params.get_or("batch", 1)?;
            let momentum: f64 = params.get_or("momentum", 0.9)?;
            let decay: f64 = params.get_or("decay", 0.0001)?;

            ensure!(
                height > 0 && width > 0,
                params.error(format!("invalid input size {}x{}", height, width))
            );
            ensure!(channels > 0, params.error("'channels' must be positive"));
            ensure!(
                momentum.is_finite() && decay.is_finite(),
                params.error("'momentum' and 'decay' must be finite")
            );

            Ok(Self {
                height,
                width,
                channels,
                batch,
                momentum: r64(momentum),
                decay: r64(decay),
                extra: params.unused(NET_KEYS),
            })
        }
    }
}

mod layer_position {
    use super::*;

    /// The source of a layer input: the network input or an earlier layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum LayerPosition {
        Input,
        Absolute(usize),
    }

    impl LayerPosition {
        /// The position right before layer `index`.
        pub fn previous(index: usize) -> Self {
            match index {
                0 => Self::Input,
                _ => Self::Absolute(index - 1),
            }
        }
    }

    impl Display for LayerPosition {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Input => write!(f, "input"),
                Self::Absolute(index) => write!(f, "{}", index),
            }
        }
    }

    /// Resolves a route `layers` value written at layer `current`.
    ///
    /// Non-negative values are absolute indexes and are returned as is.
    /// Negative values count backwards from `current`. Returns `None` if a
    /// negative value reaches before the first layer.
    pub fn resolve_layer_index(current: usize, value: isize) -> Option<usize> {
        if value >= 0 {
            Some(value as usize)
        } else {
            current.checked_sub(value.unsigned_abs())
        }
    }

    pub(crate) fn resolve_source(current: usize, value: isize, params: &Params) -> Result<usize> {
        let index = resolve_layer_index(current, value)
            .filter(|&index| index < current)
            .ok_or_else(|| {
                params.error(format!(
                    "layer index {} resolves outside of [0, {})",
                    value, current
                ))
            })?;
        Ok(index)
    }

    /// Resolves a shortcut `from` value, which always counts from `current`.
    pub(crate) fn resolve_relative_source(
        current: usize,
        offset: isize,
        params: &Params,
    ) -> Result<usize> {
        let index = current as isize + offset;
        ensure!(
            (0..current as isize).contains(&index),
            params.error(format!(
                "'from' {} resolves to layer {}, outside of [0, {})",
                offset, index, current
            ))
        );
        Ok(index as usize)
    }
}

mod node {
    use super::*;

    /// A resolved layer, one variant per supported kind.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Node {
        Convolutional(ConvolutionalNode),
        UpSample(UpSampleNode),
        MaxPool(MaxPoolNode),
        Route(RouteNode),
        Shortcut(ShortcutNode),
        Yolo(YoloNode),
    }

    impl Node {
        pub fn index(&self) -> usize {
            match self {
                Self::Convolutional(node) => node.index,
                Self::UpSample(node) => node.index,
                Self::MaxPool(node) => node.index,
                Self::Route(node) => node.index,
                Self::Shortcut(node) => node.index,
                Self::Yolo(node) => node.index,
            }
        }

        pub fn output_channels(&self) -> usize {
            match self {
                Self::Convolutional(node) => node.output_channels,
                Self::UpSample(node) => node.output_channels,
                Self::MaxPool(node) => node.output_channels,
                Self::Route(node) => node.output_channels,
                Self::Shortcut(node) => node.output_channels,
                Self::Yolo(node) => node.output_channels,
            }
        }

        pub fn kind(&self) -> LayerKind {
            match self {
                Self::Convolutional(_) => LayerKind::Convolutional,
                Self::UpSample(_) => LayerKind::UpSample,
                Self::MaxPool(_) => LayerKind::MaxPool,
                Self::Route(_) => LayerKind::Route,
                Self::Shortcut(_) => LayerKind::Shortcut,
                Self::Yolo(_) => LayerKind::Yolo,
            }
        }

        /// Positions this node reads, in the order they are combined.
        pub fn from_indexes(&self) -> Vec<LayerPosition> {
            match self {
                Self::Route(node) => node
                    .layers
                    .iter()
                    .map(|&index| LayerPosition::Absolute(index))
                    .collect(),
                Self::Shortcut(node) => vec![
                    LayerPosition::previous(node.index),
                    LayerPosition::Absolute(node.from),
                ],
                _ => vec![LayerPosition::previous(self.index())],
            }
        }
    }

    macro_rules! declare_node_conversion {
        ($name:ident, $node:ty) => {
            impl From<$node> for Node {
                fn from(from: $node) -> Self {
                    Self::$name(from)
                }
            }
        };
    }

    declare_node_conversion!(Convolutional, ConvolutionalNode);
    declare_node_conversion!(UpSample, UpSampleNode);
    declare_node_conversion!(MaxPool, MaxPoolNode);
    declare_node_conversion!(Route, RouteNode);
    declare_node_conversion!(Shortcut, ShortcutNode);
    declare_node_conversion!(Yolo, YoloNode);

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ConvolutionalNode {
        pub index: usize,
        pub input_channels: usize,
        pub output_channels: usize,
        pub size: usize,
        pub stride: usize,
        pub padding: usize,
        pub batch_normalize: bool,
        pub activation: Activation,
    }

    impl ConvolutionalNode {
        const KEYS: &'static [&'static str] = &[
            "batch_normalize",
            "filters",
            "size",
            "stride",
            "pad",
            "activation",
        ];

        pub(crate) fn build(index: usize, input_channels: usize, params: &Params) -> Result<Self> {
            let filters: usize = params.get("filters")?;
            let size: usize = params.get_or("size", 1)?;
            let stride: usize = params.get_or("stride", 1)?;
            let pad: usize = params.get_or("pad", 0)?;
            let batch_normalize: usize = params.get_or("batch_normalize", 0)?;
            let activation = params.activation("activation", Activation::Logistic)?;

            ensure!(filters > 0, params.error("'filters' must be positive"));
            ensure!(
                size > 0 && stride > 0,
                params.error("'size' and 'stride' must be positive")
            );
            params.warn_unused(Self::KEYS);

            Ok(Self {
                index,
                input_channels,
                output_channels: filters,
                size,
                stride,
                padding: if pad != 0 { (size - 1) / 2 } else { 0 },
                batch_normalize: batch_normalize != 0,
                activation,
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct UpSampleNode {
        pub index: usize,
        pub output_channels: usize,
        /// The `stride` value as written. The applied factor is always
        /// [UPSAMPLE_SCALE].
        pub declared_stride: usize,
    }

    impl UpSampleNode {
        pub(crate) fn build(index: usize, input_channels: usize, params: &Params) -> Result<Self> {
            let declared_stride: usize = params.get_or("stride", UPSAMPLE_SCALE)?;
            if declared_stride != UPSAMPLE_SCALE {
                warn!(
                    "layer {}: upsample stride {} is ignored, the scale is fixed to {}",
                    index, declared_stride, UPSAMPLE_SCALE
                );
            }
            params.warn_unused(&["stride"]);

            Ok(Self {
                index,
                output_channels: input_channels,
                declared_stride,
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MaxPoolNode {
        pub index: usize,
        pub output_channels: usize,
        pub size: usize,
        pub stride: usize,
    }

    impl MaxPoolNode {
        pub(crate) fn build(index: usize, input_channels: usize, params: &Params) -> Result<Self> {
            let stride: usize = params.get_or("stride", 1)?;
            let size: usize = params.get_or("size", stride)?;
            ensure!(
                size > 0 && stride > 0,
                params.error("'size' and 'stride' must be positive")
            );
            params.warn_unused(&["size", "stride"]);

            Ok(Self {
                index,
                output_channels: input_channels,
                size,
                stride,
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RouteNode {
        pub index: usize,
        pub output_channels: usize,
        /// Absolute source indexes in concatenation order.
        pub layers: Vec<usize>,
    }

    impl RouteNode {
        pub(crate) fn build<F>(index: usize, output_channels_of: F, params: &Params) -> Result<Self>
        where
            F: Fn(usize) -> usize,
        {
            let values: Vec<isize> = params.list("layers")?;
            ensure!(
                (1..=MAX_ROUTE_SOURCES).contains(&values.len()),
                params.error(format!(
                    "'layers' must name 1 to {} layers, but get {}",
                    MAX_ROUTE_SOURCES,
                    values.len()
                ))
            );
            let layers: Vec<usize> = values
                .into_iter()
                .map(|value| resolve_source(index, value, params))
                .try_collect()?;
            let output_channels = layers.iter().map(|&from| output_channels_of(from)).sum();
            params.warn_unused(&["layers"]);

            Ok(Self {
                index,
                output_channels,
                layers,
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ShortcutNode {
        pub index: usize,
        pub output_channels: usize,
        /// Absolute index of the residual source.
        pub from: usize,
        pub activation: Activation,
    }

    impl ShortcutNode {
        pub(crate) fn build(index: usize, input_channels: usize, params: &Params) -> Result<Self> {
            ensure!(
                index > 0,
                params.error("a shortcut cannot be the first layer")
            );
            let from: isize = params.get("from")?;
            let from = resolve_relative_source(index, from, params)?;
            let activation = params.activation("activation", Activation::Linear)?;
            params.warn_unused(&["from", "activation"]);

            Ok(Self {
                index,
                output_channels: input_channels,
                from,
                activation,
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct YoloNode {
        pub index: usize,
        pub output_channels: usize,
        /// `(width, height)` pairs in input pixels, in mask order.
        pub anchors: Vec<(usize, usize)>,
        pub classes: usize,
        pub input_dim: usize,
    }

    impl YoloNode {
        const KEYS: &'static [&'static str] = &["mask", "anchors", "classes", "num"];
        const TRAINING_KEYS: &'static [&'static str] =
            &["jitter", "ignore_thresh", "truth_thresh", "random"];

        pub(crate) fn build(
            index: usize,
            input_channels: usize,
            input_dim: usize,
            params: &Params,
        ) -> Result<Self> {
            let classes: usize = params.get("classes")?;
            let values: Vec<usize> = params.list("anchors")?;
            let mask: Option<Vec<usize>> = params.list_opt("mask")?;

            ensure!(
                values.len() % 2 == 0,
                params.error(format!(
                    "'anchors' must hold (width, height) pairs, but get {} values",
                    values.len()
                ))
            );
            let pairs: Vec<(usize, usize)> = values.into_iter().tuples().collect();

            let anchors: Vec<_> = match mask {
                Some(mask) => mask
                    .into_iter()
                    .map(|position| {
                        pairs.get(position).copied().ok_or_else(|| {
                            params.error(format!(
                                "mask index {} exceeds the {} anchors",
                                position,
                                pairs.len()
                            ))
                        })
                    })
                    .try_collect()?,
                None => pairs,
            };

            let expect_channels = anchors.len() * (5 + classes);
            ensure!(
                input_channels == expect_channels,
                params.error(format!(
                    "expect {} input channels for {} anchors and {} classes, but get {}",
                    expect_channels,
                    anchors.len(),
                    classes,
                    input_channels
                ))
            );

            let known: Vec<_> = Self::KEYS
                .iter()
                .chain(Self::TRAINING_KEYS)
                .copied()
                .collect();
            params.warn_unused(&known);

            Ok(Self {
                index,
                output_channels: input_channels,
                anchors,
                classes,
                input_dim,
            })
        }
    }
}
