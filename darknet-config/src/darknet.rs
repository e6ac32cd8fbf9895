use crate::{
    common::*,
    graph::{
        ConvolutionalNode, LayerGraph, MaxPoolNode, Node, RouteNode, ShortcutNode, UpSampleNode,
        YoloNode,
    },
};
use binread::{BinRead, BinReaderExt};

pub use layer::*;
pub use model::*;
pub use weights::*;

mod model {
    use super::*;

    /// A [LayerGraph] with parameter buffers for every learnable layer.
    #[derive(Debug, Clone)]
    pub struct DarknetModel {
        pub graph: LayerGraph,
        /// Number of images seen in training, from the weights header.
        pub seen: u64,
        pub layers: Vec<Layer>,
    }

    impl DarknetModel {
        /// Allocates zeroed parameters for the graph.
        pub fn new(graph: &LayerGraph) -> Self {
            let layers: Vec<_> = graph
                .layers
                .iter()
                .map(|node| match node {
                    Node::Convolutional(node) => {
                        Layer::Convolutional(ConvolutionalLayer::new(node))
                    }
                    Node::UpSample(node) => Layer::UpSample(UpSampleLayer { node: node.clone() }),
                    Node::MaxPool(node) => Layer::MaxPool(MaxPoolLayer { node: node.clone() }),
                    Node::Route(node) => Layer::Route(RouteLayer { node: node.clone() }),
                    Node::Shortcut(node) => Layer::Shortcut(ShortcutLayer { node: node.clone() }),
                    Node::Yolo(node) => Layer::Yolo(YoloLayer { node: node.clone() }),
                })
                .collect();

            Self {
                graph: graph.clone(),
                seen: 0,
                layers,
            }
        }

        pub fn from_config_file<P>(config_file: P) -> Result<Self>
        where
            P: AsRef<Path>,
        {
            let graph = LayerGraph::from_config_file(config_file)?;
            Ok(Self::new(&graph))
        }

        /// Loads a darknet `.weights` file: a version header followed by
        /// the float stream.
        pub fn load_weights<P>(&mut self, weights_file: P) -> Result<()>
        where
            P: AsRef<Path>,
        {
            #[derive(Debug, Clone, PartialEq, Eq, Hash, BinRead)]
            pub struct Version {
                pub major: u32,
                pub minor: u32,
                pub revision: u32,
            }

            let weights_file = weights_file.as_ref();
            let file = File::open(weights_file)
                .with_context(|| format!("failed to open '{}'", weights_file.display()))?;
            let mut reader = BufReader::new(file);

            let (version, seen) = (|| -> Result<_, binread::Error> {
                let version: Version = reader.read_le()?;
                let Version { major, minor, .. } = version;

                let seen: u64 = if major * 10 + minor >= 2 {
                    reader.read_le()?
                } else {
                    let seen: u32 = reader.read_le()?;
                    seen as u64
                };

                Ok((version, seen))
            })()
            .map_err(|err| format_err!("failed to parse weights header: {:?}", err))?;

            info!(
                "weights version {}.{}.{}, {} images seen",
                version.major, version.minor, version.revision, seen
            );
            self.seen = seen;

            self.load_weights_from_reader(reader)?;
            Ok(())
        }

        /// Fills parameters from a little-endian `f32` stream without header.
        ///
        /// The stream must hold exactly the parameters of this model.
        pub fn load_weights_from_reader<R>(&mut self, mut reader: R) -> Result<()>
        where
            R: Read,
        {
            self.layers
                .iter_mut()
                .enumerate()
                .try_for_each(|(index, layer)| -> Result<_> {
                    layer.load_weights(&mut reader).with_context(|| {
                        format!(
                            "failed to load weights for layer {} ({})",
                            index,
                            layer.kind_name()
                        )
                    })?;
                    Ok(())
                })?;

            let mut probe = [0u8; 1];
            ensure!(
                reader.read(&mut probe)? == 0,
                "the weights file is not totally consumed"
            );

            info!("loaded {} parameters", self.num_parameters());
            Ok(())
        }

        pub fn num_parameters(&self) -> usize {
            self.layers.iter().map(Layer::num_parameters).sum()
        }
    }
}

mod layer {
    use super::*;

    macro_rules! declare_darknet_layer {
        ($name:ident, $node:ty, $weights:ty) => {
            #[derive(Debug, Clone)]
            pub struct $name {
                pub node: $node,
                pub weights: $weights,
            }
        };
        ($name:ident, $node:ty) => {
            #[derive(Debug, Clone)]
            pub struct $name {
                pub node: $node,
            }
        };
    }

    #[derive(Debug, Clone)]
    pub enum Layer {
        Convolutional(ConvolutionalLayer),
        UpSample(UpSampleLayer),
        MaxPool(MaxPoolLayer),
        Route(RouteLayer),
        Shortcut(ShortcutLayer),
        Yolo(YoloLayer),
    }

    impl Layer {
        pub fn load_weights(&mut self, reader: impl ReadBytesExt) -> Result<()> {
            match self {
                Self::Convolutional(layer) => layer.load_weights(reader),
                Self::UpSample(_)
                | Self::MaxPool(_)
                | Self::Route(_)
                | Self::Shortcut(_)
                | Self::Yolo(_) => Ok(()),
            }
        }

        pub fn num_parameters(&self) -> usize {
            match self {
                Self::Convolutional(layer) => layer.weights.num_parameters(),
                _ => 0,
            }
        }

        pub fn kind_name(&self) -> &'static str {
            match self {
                Self::Convolutional(_) => "convolutional",
                Self::UpSample(_) => "upsample",
                Self::MaxPool(_) => "maxpool",
                Self::Route(_) => "route",
                Self::Shortcut(_) => "shortcut",
                Self::Yolo(_) => "yolo",
            }
        }
    }

    declare_darknet_layer!(ConvolutionalLayer, ConvolutionalNode, ConvolutionalWeights);
    declare_darknet_layer!(UpSampleLayer, UpSampleNode);
    declare_darknet_layer!(MaxPoolLayer, MaxPoolNode);
    declare_darknet_layer!(RouteLayer, RouteNode);
    declare_darknet_layer!(ShortcutLayer, ShortcutNode);
    declare_darknet_layer!(YoloLayer, YoloNode);

    impl ConvolutionalLayer {
        pub fn new(node: &ConvolutionalNode) -> Self {
            let ConvolutionalNode {
                input_channels,
                output_channels,
                size,
                batch_normalize,
                ..
            } = *node;

            let weights = ConvolutionalWeights {
                biases: Array1::zeros(output_channels),
                scales: batch_normalize.then(|| ScaleWeights::new(output_channels)),
                weights: Array4::zeros([output_channels, input_channels, size, size]),
            };

            Self {
                node: node.clone(),
                weights,
            }
        }

        pub fn load_weights(&mut self, mut reader: impl ReadBytesExt) -> Result<()> {
            let ConvolutionalWeights {
                ref mut biases,
                ref mut scales,
                ref mut weights,
            } = self.weights;

            read_into(&mut reader, biases)?;
            if let Some(scales) = scales {
                scales.load_weights(&mut reader)?;
            }
            read_into(&mut reader, weights)?;

            Ok(())
        }
    }
}

mod weights {
    use super::*;

    /// Parameters of a convolution in darknet layout.
    #[derive(Debug, Clone)]
    pub struct ConvolutionalWeights {
        /// Additive bias, or the batch-norm shift when `scales` is present.
        pub biases: Array1<f32>,
        pub scales: Option<ScaleWeights>,
        /// `[out_c, in_c, size, size]`
        pub weights: Array4<f32>,
    }

    impl ConvolutionalWeights {
        pub fn num_parameters(&self) -> usize {
            let scales_len = self
                .scales
                .as_ref()
                .map(|scales| scales.num_parameters())
                .unwrap_or(0);
            self.biases.len() + scales_len + self.weights.len()
        }
    }

    /// Batch-norm statistics following the biases in the weights stream.
    #[derive(Debug, Clone)]
    pub struct ScaleWeights {
        pub scales: Array1<f32>,
        pub rolling_mean: Array1<f32>,
        pub rolling_variance: Array1<f32>,
    }

    impl ScaleWeights {
        pub fn new(size: usize) -> Self {
            Self {
                scales: Array1::ones(size),
                rolling_mean: Array1::zeros(size),
                rolling_variance: Array1::ones(size),
            }
        }

        pub fn load_weights(&mut self, mut reader: impl ReadBytesExt) -> Result<()> {
            let Self {
                scales,
                rolling_mean,
                rolling_variance,
            } = self;

            read_into(&mut reader, scales)?;
            read_into(&mut reader, rolling_mean)?;
            read_into(&mut reader, rolling_variance)?;
            Ok(())
        }

        pub fn num_parameters(&self) -> usize {
            self.scales.len() + self.rolling_mean.len() + self.rolling_variance.len()
        }
    }

    pub(super) fn read_into<D>(mut reader: impl ReadBytesExt, array: &mut Array<f32, D>) -> Result<()>
    where
        D: Dimension,
    {
        let expect = array.len();
        let slice = array
            .as_slice_mut()
            .ok_or_else(|| format_err!("the parameter buffer is not contiguous"))?;
        reader
            .read_f32_into::<LittleEndian>(slice)
            .with_context(|| format!("the weights stream ends before {} values are read", expect))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    const CONFIG: &str = "
[net]
height=32
width=32
channels=2

[convolutional]
batch_normalize=1
filters=3
size=3
stride=1
pad=1
activation=leaky

[maxpool]
size=2
stride=2

[convolutional]
filters=2
size=1
stride=1
activation=linear
";

    fn stream(values: impl IntoIterator<Item = f32>) -> Vec<u8> {
        let mut bytes = vec![];
        values.into_iter().for_each(|value| {
            bytes.write_f32::<LittleEndian>(value).unwrap();
        });
        bytes
    }

    fn model() -> Result<DarknetModel> {
        let graph: LayerGraph = CONFIG.parse()?;
        Ok(DarknetModel::new(&graph))
    }

    // first conv: 3 biases + 3 * 3 stats + 3 * 2 * 3 * 3 weights
    // second conv: 2 biases + 2 * 3 * 1 * 1 weights
    const NUM_PARAMETERS: usize = 3 + 9 + 54 + 2 + 6;

    #[test]
    fn allocate_buffers() -> Result<()> {
        let model = model()?;
        assert_eq!(model.layers.len(), 3);
        assert_eq!(model.num_parameters(), NUM_PARAMETERS);

        match &model.layers[0] {
            Layer::Convolutional(layer) => {
                assert_eq!(layer.weights.weights.shape(), &[3, 2, 3, 3]);
                assert!(layer.weights.scales.is_some());
            }
            layer => panic!("unexpected layer {:?}", layer),
        }
        match &model.layers[2] {
            Layer::Convolutional(layer) => assert!(layer.weights.scales.is_none()),
            layer => panic!("unexpected layer {:?}", layer),
        }
        Ok(())
    }

    #[test]
    fn consume_stream_in_build_order() -> Result<()> {
        let mut model = model()?;
        let bytes = stream((0..NUM_PARAMETERS).map(|value| value as f32));
        model.load_weights_from_reader(Cursor::new(bytes))?;

        let first = match &model.layers[0] {
            Layer::Convolutional(layer) => &layer.weights,
            layer => panic!("unexpected layer {:?}", layer),
        };
        let scales = first.scales.as_ref().expect("batch norm statistics");
        assert_eq!(first.biases.to_vec(), vec![0.0, 1.0, 2.0]);
        assert_eq!(scales.scales.to_vec(), vec![3.0, 4.0, 5.0]);
        assert_eq!(scales.rolling_mean.to_vec(), vec![6.0, 7.0, 8.0]);
        assert_eq!(scales.rolling_variance.to_vec(), vec![9.0, 10.0, 11.0]);
        assert_eq!(first.weights[[0, 0, 0, 0]], 12.0);
        assert_eq!(first.weights[[0, 1, 0, 0]], 21.0);
        assert_eq!(first.weights[[2, 1, 2, 2]], 65.0);

        let second = match &model.layers[2] {
            Layer::Convolutional(layer) => &layer.weights,
            layer => panic!("unexpected layer {:?}", layer),
        };
        assert_eq!(second.biases.to_vec(), vec![66.0, 67.0]);
        assert_eq!(second.weights[[1, 2, 0, 0]], 73.0);
        Ok(())
    }

    #[test]
    fn reject_truncated_stream() -> Result<()> {
        let mut model = model()?;
        let bytes = stream((0..NUM_PARAMETERS - 1).map(|value| value as f32));
        let err = model.load_weights_from_reader(Cursor::new(bytes)).unwrap_err();
        assert!(format!("{:#}", err).contains("layer 2"));
        Ok(())
    }

    #[test]
    fn reject_leftover_values() -> Result<()> {
        let mut model = model()?;
        let bytes = stream((0..=NUM_PARAMETERS).map(|value| value as f32));
        let err = model.load_weights_from_reader(Cursor::new(bytes)).unwrap_err();
        assert!(err.to_string().contains("not totally consumed"));
        Ok(())
    }

    #[test]
    fn load_weights_file_with_header() -> Result<()> {
        let mut bytes = vec![];
        [0u32, 2, 0]
            .iter()
            .try_for_each(|&value| bytes.write_u32::<LittleEndian>(value))?;
        bytes.write_u64::<LittleEndian>(32013312)?;
        bytes.extend(stream((0..NUM_PARAMETERS).map(|_| 0.5)));

        let path = std::env::temp_dir().join(format!(
            "darknet-config-weights-{}.weights",
            std::process::id()
        ));
        fs::write(&path, &bytes)?;

        let mut model = model()?;
        let result = model.load_weights(&path);
        fs::remove_file(&path)?;
        result?;

        assert_eq!(model.seen, 32013312);
        Ok(())
    }
}
