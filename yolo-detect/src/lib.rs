//! Single-pass object detection with darknet models on libtorch.

mod common;
pub mod config;
pub mod context;
pub mod decode;
pub mod error;
pub mod input;
pub mod model;
pub mod nms;
pub mod rescale;

pub use context::{ExecutionContext, Precision};
pub use decode::decode;
pub use error::ShapeError;
pub use model::{ForwardOutput, YoloModel};
pub use nms::{iou, Detection, NonMaxSuppression, NonMaxSuppressionInit};
pub use rescale::rescale_detections;

use crate::{
    common::*,
    config::{Config, InputConfig, ModelConfig, NmsConfig, OutputConfig},
};

/// A detection tagged with its source image, as written to the output file.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    pub image: PathBuf,
    pub class_name: Option<String>,
    #[serde(flatten)]
    pub detection: Detection,
}

/// Runs detection over the configured images.
pub fn start(config: &Config) -> Result<()> {
    let Config {
        model:
            ModelConfig {
                ref cfg_file,
                ref weights_file,
                context: ctx,
            },
        input:
            InputConfig {
                ref images,
                batch_size,
                ref classes_file,
            },
        nms:
            NmsConfig {
                confidence_threshold,
                iou_threshold,
            },
        output: OutputConfig {
            file: ref output_file,
        },
        ..
    } = *config;

    // load model
    let mut darknet_model = DarknetModel::from_config_file(cfg_file)
        .with_context(|| format!("failed to load model config '{}'", cfg_file.display()))?;
    let NetConfig { height, width, .. } = darknet_model.graph.net;
    ensure!(
        height == width,
        "only square inputs are supported, but get {}x{}",
        height,
        width
    );
    let input_dim = height;

    darknet_model
        .load_weights(weights_file)
        .with_context(|| format!("failed to load weights '{}'", weights_file.display()))?;
    let model = YoloModel::new(&ctx, &darknet_model)?;

    let nms = NonMaxSuppressionInit {
        iou_threshold,
        confidence_threshold,
    }
    .build()?;

    let class_names = classes_file
        .as_ref()
        .map(input::load_class_names)
        .transpose()?;

    // run batches
    let image_paths = input::list_images(images)?;
    info!("found {} images", image_paths.len());

    let mut records = vec![];

    for (batch_index, paths) in image_paths.chunks(batch_size.get()).enumerate() {
        let (batch, sizes) = input::load_batch(paths, input_dim)?;
        let prediction = match model.forward(&ctx, &batch)? {
            Some(prediction) => prediction,
            None => bail!("the model has no yolo layer"),
        };

        let detections = nms.forward(&prediction)?;
        let detections = rescale_detections(&detections, input_dim, &sizes)?;
        info!(
            "batch {}: {} detections in {} images",
            batch_index,
            detections.len(),
            paths.len()
        );

        paths.iter().enumerate().for_each(|(image_index, path)| {
            let count = detections
                .iter()
                .filter(|det| det.image_index == image_index)
                .count();
            info!("{}: {} detections", path.display(), count);
        });

        records.extend(detections.into_iter().map(|detection| {
            let class_name = class_names
                .as_ref()
                .and_then(|names| names.get(detection.class_id))
                .cloned();
            debug!(
                "{} class {} ({}) at [{:.1}, {:.1}, {:.1}, {:.1}], objectness {:.3}",
                paths[detection.image_index].display(),
                detection.class_id,
                class_name.as_deref().unwrap_or("-"),
                detection.x1,
                detection.y1,
                detection.x2,
                detection.y2,
                detection.objectness
            );

            DetectionRecord {
                image: paths[detection.image_index].clone(),
                class_name,
                detection,
            }
        }));
    }

    // write output
    if let Some(output_file) = output_file {
        let writer = BufWriter::new(File::create(output_file).with_context(|| {
            format!("failed to create output file '{}'", output_file.display())
        })?);
        serde_json::to_writer_pretty(writer, &records)?;
        info!(
            "wrote {} detections to {}",
            records.len(),
            output_file.display()
        );
    }

    Ok(())
}
