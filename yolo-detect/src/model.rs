use crate::{common::*, context::ExecutionContext, decode::decode, error::ShapeError};

pub use layer::*;
pub use yolo_model::*;

/// Batch-norm epsilon used by darknet.
pub const BATCH_NORM_EPS: f64 = 1e-5;

fn to_tensor<D>(array: &Array<f32, D>, ctx: &ExecutionContext) -> Result<Tensor>
where
    D: Dimension,
{
    let shape: Vec<i64> = array.shape().iter().map(|&size| size as i64).collect();
    let data = array
        .as_slice()
        .ok_or_else(|| format_err!("the parameter buffer is not contiguous"))?;
    let tensor = Tensor::of_slice(data).reshape(&shape);
    Ok(ctx.place(&tensor))
}

mod yolo_model {
    use super::*;

    /// A darknet network with parameters placed on a device.
    ///
    /// The model is immutable after construction. Each call to
    /// [forward](YoloModel::forward) owns its own output cache.
    #[derive(Debug)]
    pub struct YoloModel {
        pub net: NetConfig,
        pub layers: Vec<Layer>,
    }

    /// Outputs of every layer together with the merged detections.
    #[derive(Debug)]
    pub struct ForwardOutput {
        /// Output of layer `i` at position `i`.
        pub outputs: Vec<Tensor>,
        pub detections: Option<Tensor>,
    }

    impl YoloModel {
        pub fn new(ctx: &ExecutionContext, model: &DarknetModel) -> Result<Self> {
            ctx.validate()?;
            let layers: Vec<_> = model
                .layers
                .iter()
                .map(|layer| -> Result<_> {
                    let layer: Layer = match layer {
                        darknet::Layer::Convolutional(layer) => {
                            ConvolutionalLayer::new(ctx, layer)?.into()
                        }
                        darknet::Layer::UpSample(layer) => Layer::UpSample(layer.node.clone()),
                        darknet::Layer::MaxPool(layer) => Layer::MaxPool(layer.node.clone()),
                        darknet::Layer::Route(layer) => Layer::Route(layer.node.clone()),
                        darknet::Layer::Shortcut(layer) => Layer::Shortcut(layer.node.clone()),
                        darknet::Layer::Yolo(layer) => Layer::Yolo(layer.node.clone()),
                    };
                    Ok(layer)
                })
                .try_collect()?;

            Ok(Self {
                net: model.graph.net.clone(),
                layers,
            })
        }

        /// Runs the network and returns merged detections of shape
        /// `[batch, candidates, 5 + classes]`, or `None` if the network has
        /// no yolo layer.
        pub fn forward(&self, ctx: &ExecutionContext, input: &Tensor) -> Result<Option<Tensor>> {
            let ForwardOutput { detections, .. } = self.forward_all(ctx, input)?;
            Ok(detections)
        }

        /// Like [forward](YoloModel::forward), but also keeps every layer output.
        pub fn forward_all(&self, ctx: &ExecutionContext, input: &Tensor) -> Result<ForwardOutput> {
            tch::no_grad(|| self.forward_inner(ctx, input))
        }

        fn forward_inner(&self, ctx: &ExecutionContext, input: &Tensor) -> Result<ForwardOutput> {
            let input_error =
                |reason: String| ShapeError::new(LayerPosition::Input, "input", reason);

            let input_size = input.size();
            let (channels, height, width) = match input_size.as_slice() {
                &[_b, c, h, w] => (c, h, w),
                _ => {
                    return Err(input_error(format!(
                        "expect a [batch, channels, height, width] tensor, but get {:?}",
                        input_size
                    ))
                    .into())
                }
            };
            ensure!(
                channels == self.net.channels as i64,
                input_error(format!(
                    "expect {} channels, but get {}",
                    self.net.channels, channels
                ))
            );
            ensure!(
                height == self.net.height as i64 && width == self.net.width as i64,
                input_error(format!(
                    "expect {}x{} images, but get {}x{}",
                    self.net.height, self.net.width, height, width
                ))
            );

            let input = ctx.place(input);
            let mut outputs: Vec<Tensor> = Vec::with_capacity(self.layers.len());
            let mut detections: Vec<(usize, Tensor)> = vec![];

            for layer in &self.layers {
                let fetch = |position: LayerPosition| match position {
                    LayerPosition::Input => &input,
                    LayerPosition::Absolute(index) => &outputs[index],
                };
                let inputs: Vec<&Tensor> = layer.from_indexes().into_iter().map(fetch).collect();

                let output = match layer {
                    Layer::Convolutional(layer) => layer.forward(inputs[0]),
                    Layer::UpSample(_) => forward_upsample(inputs[0])?,
                    Layer::MaxPool(node) => forward_max_pool(node, inputs[0])?,
                    Layer::Route(node) => forward_route(node, &inputs)?,
                    Layer::Shortcut(node) => forward_shortcut(node, inputs[0], inputs[1])?,
                    Layer::Yolo(node) => {
                        let detection = forward_yolo(node, inputs[0])?;
                        detections.push((node.classes, detection));
                        inputs[0].shallow_clone()
                    }
                };

                debug!(
                    "{}\t{}\t{:?}",
                    layer.index(),
                    layer.kind_name(),
                    output.size()
                );
                outputs.push(output);
            }

            let detections = merge_detections(&self.layers, detections)?;
            Ok(ForwardOutput {
                outputs,
                detections,
            })
        }
    }

    fn merge_detections(
        layers: &[Layer],
        detections: Vec<(usize, Tensor)>,
    ) -> Result<Option<Tensor>> {
        let num_classes = match detections.first() {
            Some(&(num_classes, _)) => num_classes,
            None => return Ok(None),
        };

        if let Some(position) = detections
            .iter()
            .position(|&(classes, _)| classes != num_classes)
        {
            let index = layers
                .iter()
                .filter(|layer| matches!(layer, Layer::Yolo(_)))
                .nth(position)
                .map(Layer::index)
                .unwrap_or_default();
            return Err(ShapeError::new(
                LayerPosition::Absolute(index),
                "yolo",
                format!(
                    "expect {} classes as the first yolo layer, but get {}",
                    num_classes, detections[position].0
                ),
            )
            .into());
        }

        let tensors: Vec<_> = detections.into_iter().map(|(_, tensor)| tensor).collect();
        Ok(Some(Tensor::cat(&tensors, 1)))
    }

    fn forward_upsample(xs: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = xs.size4()?;
        let scale = UPSAMPLE_SCALE as i64;
        Ok(xs.upsample_nearest2d(&[h * scale, w * scale], None, None))
    }

    fn forward_max_pool(node: &MaxPoolNode, xs: &Tensor) -> Result<Tensor> {
        let MaxPoolNode { size, stride, .. } = *node;
        let size = size as i64;
        let stride = stride as i64;

        let xs = if stride == 1 && size > 1 {
            // pad right and bottom so that the output keeps the input size
            let (b, c, h, w) = xs.size4()?;
            let pad = size - 1;
            let options = (xs.kind(), xs.device());
            let right = Tensor::full(&[b, c, h, pad], f64::NEG_INFINITY, options);
            let xs = Tensor::cat(&[xs, &right], 3);
            let bottom = Tensor::full(&[b, c, pad, w + pad], f64::NEG_INFINITY, options);
            Tensor::cat(&[&xs, &bottom], 2)
        } else {
            xs.shallow_clone()
        };

        Ok(xs.max_pool2d(&[size, size], &[stride, stride], &[0, 0], &[1, 1], false))
    }

    fn forward_route(node: &RouteNode, inputs: &[&Tensor]) -> Result<Tensor> {
        let error = |reason: String| {
            ShapeError::new(LayerPosition::Absolute(node.index), "route", reason)
        };

        let sizes: Vec<_> = inputs
            .iter()
            .map(|xs| xs.size4())
            .try_collect()
            .map_err(|err| error(format!("{}", err)))?;
        let (b, _, h, w) = sizes[0];

        if let Some(position) = sizes
            .iter()
            .position(|&(ob, _, oh, ow)| (ob, oh, ow) != (b, h, w))
        {
            let (_, _, oh, ow) = sizes[position];
            return Err(error(format!(
                "layer {} has spatial size {}x{}, but layer {} has {}x{}",
                node.layers[position], oh, ow, node.layers[0], h, w
            ))
            .into());
        }

        Ok(Tensor::cat(inputs, 1))
    }

    fn forward_shortcut(node: &ShortcutNode, prev: &Tensor, from: &Tensor) -> Result<Tensor> {
        let ShortcutNode {
            index,
            from: from_index,
            activation,
            ..
        } = *node;

        ensure!(
            prev.size() == from.size(),
            ShapeError::new(
                LayerPosition::Absolute(index),
                "shortcut",
                format!(
                    "layer {} has shape {:?}, but layer {} has shape {:?}",
                    index - 1,
                    prev.size(),
                    from_index,
                    from.size()
                ),
            )
        );

        Ok((prev + from).activation(activation))
    }

    fn forward_yolo(node: &YoloNode, xs: &Tensor) -> Result<Tensor> {
        let YoloNode {
            index,
            ref anchors,
            classes,
            input_dim,
            ..
        } = *node;

        let channels = xs.size()[1];
        let expect = (anchors.len() * (5 + classes)) as i64;
        ensure!(
            channels == expect,
            ShapeError::new(
                LayerPosition::Absolute(index),
                "yolo",
                format!("expect {} input channels, but get {}", expect, channels),
            )
        );

        decode(xs, anchors, classes, input_dim)
    }
}

mod layer {
    use super::*;

    #[derive(Debug)]
    pub enum Layer {
        Convolutional(ConvolutionalLayer),
        UpSample(UpSampleNode),
        MaxPool(MaxPoolNode),
        Route(RouteNode),
        Shortcut(ShortcutNode),
        Yolo(YoloNode),
    }

    impl Layer {
        pub fn index(&self) -> usize {
            match self {
                Self::Convolutional(layer) => layer.node.index,
                Self::UpSample(node) => node.index,
                Self::MaxPool(node) => node.index,
                Self::Route(node) => node.index,
                Self::Shortcut(node) => node.index,
                Self::Yolo(node) => node.index,
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

        pub fn from_indexes(&self) -> Vec<LayerPosition> {
            let index = self.index();
            match self {
                Self::Route(node) => node
                    .layers
                    .iter()
                    .map(|&from| LayerPosition::Absolute(from))
                    .collect(),
                Self::Shortcut(node) => vec![
                    LayerPosition::previous(index),
                    LayerPosition::Absolute(node.from),
                ],
                _ => vec![LayerPosition::previous(index)],
            }
        }
    }

    impl From<ConvolutionalLayer> for Layer {
        fn from(from: ConvolutionalLayer) -> Self {
            Self::Convolutional(from)
        }
    }

    #[derive(Debug)]
    pub struct ConvolutionalLayer {
        pub node: ConvolutionalNode,
        pub weight: Tensor,
        pub bias: Option<Tensor>,
        pub batch_norm: Option<BatchNorm>,
    }

    /// Inference-mode batch normalization with loaded statistics.
    #[derive(Debug)]
    pub struct BatchNorm {
        pub scales: Tensor,
        pub biases: Tensor,
        pub running_mean: Tensor,
        pub running_var: Tensor,
    }

    impl ConvolutionalLayer {
        pub fn new(ctx: &ExecutionContext, from: &darknet::ConvolutionalLayer) -> Result<Self> {
            let darknet::ConvolutionalLayer {
                ref node,
                weights:
                    darknet::ConvolutionalWeights {
                        ref biases,
                        ref scales,
                        ref weights,
                    },
            } = *from;

            let weight = to_tensor(weights, ctx)?;
            let biases = to_tensor(biases, ctx)?;

            let (bias, batch_norm) = match scales {
                Some(darknet::ScaleWeights {
                    scales,
                    rolling_mean,
                    rolling_variance,
                }) => {
                    let batch_norm = BatchNorm {
                        scales: to_tensor(scales, ctx)?,
                        biases,
                        running_mean: to_tensor(rolling_mean, ctx)?,
                        running_var: to_tensor(rolling_variance, ctx)?,
                    };
                    (None, Some(batch_norm))
                }
                None => (Some(biases), None),
            };

            Ok(Self {
                node: node.clone(),
                weight,
                bias,
                batch_norm,
            })
        }

        pub fn forward(&self, xs: &Tensor) -> Tensor {
            let Self {
                node:
                    ConvolutionalNode {
                        stride,
                        padding,
                        activation,
                        ..
                    },
                ref weight,
                ref bias,
                ref batch_norm,
            } = *self;

            let stride = stride as i64;
            let padding = padding as i64;

            let xs = xs.conv2d(
                weight,
                bias.as_ref(),
                &[stride, stride],
                &[padding, padding],
                &[1, 1],
                1,
            );
            let xs = match batch_norm {
                Some(batch_norm) => batch_norm.forward(&xs),
                None => xs,
            };
            xs.activation(activation)
        }
    }

    impl BatchNorm {
        pub fn forward(&self, xs: &Tensor) -> Tensor {
            let Self {
                scales,
                biases,
                running_mean,
                running_var,
            } = self;

            Tensor::batch_norm(
                xs,
                Some(scales),
                Some(biases),
                Some(running_mean),
                Some(running_var),
                false,
                0.1,
                BATCH_NORM_EPS,
                false,
            )
        }
    }
}
