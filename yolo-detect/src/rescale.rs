use crate::{common::*, nms::Detection};

/// Maps detections from the letterboxed network input back to the pixels of
/// the original images.
///
/// `original_sizes[i]` is the `[width, height]` of image `i` in the batch.
/// Boxes are clamped into the original image.
pub fn rescale_detections(
    detections: &[Detection],
    input_dim: usize,
    original_sizes: &[[f64; 2]],
) -> Result<Vec<Detection>> {
    let input_dim = input_dim as f64;
    ensure!(input_dim > 0.0, "the input size must be positive");

    let transforms: Vec<_> = original_sizes
        .iter()
        .enumerate()
        .map(|(index, &[width, height])| -> Result<_> {
            ensure!(
                width > 0.0 && height > 0.0,
                "image {} has an empty size {}x{}",
                index,
                width,
                height
            );
            let transform =
                Transform::from_sizes_letterbox([width, height], [input_dim, input_dim]).inverse();
            Ok((transform, [width, height]))
        })
        .try_collect()?;

    detections
        .iter()
        .map(|detection| -> Result<_> {
            let (transform, [width, height]) =
                transforms.get(detection.image_index).ok_or_else(|| {
                    format_err!(
                        "detection refers to image {}, but the batch has {} images",
                        detection.image_index,
                        transforms.len()
                    )
                })?;
            let rect = (transform * &detection.rect()).clamp_to(*width, *height);
            Ok(detection.with_rect(&rect))
        })
        .try_collect()
}
