use crate::common::*;
use image::{imageops::FilterType, io::Reader as ImageReader, ImageFormat, Pixel as _};
use ndarray::Array3;

/// Canvas color around a letterboxed image.
pub const LETTERBOX_GRAY: u8 = 128;

/// Loads an image as a `[3, input_dim, input_dim]` float tensor in `[0, 1]`.
///
/// The image is resized with its aspect ratio kept and centered on a gray
/// square canvas. Returns the tensor along with the original `[width, height]`.
pub fn load_image<P>(path: P, input_dim: usize) -> Result<(Tensor, [f64; 2])>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    ensure!(input_dim > 0, "the input size must be positive");

    let image = ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_guessed_format()
        .with_context(|| {
            format!(
                "failed to determine the image file format: {}",
                path.display()
            )
        })?
        .decode()
        .with_context(|| format!("failed to decode image file: {}", path.display()))?
        .to_rgb8();

    let (orig_width, orig_height) = image.dimensions();
    ensure!(
        orig_width > 0 && orig_height > 0,
        "image {} is empty",
        path.display()
    );

    let array = letterbox(&image, input_dim);
    let tensor = Tensor::of_slice(array.as_slice().ok_or_else(|| {
        format_err!("the image buffer is not contiguous")
    })?)
    .reshape(&[3, input_dim as i64, input_dim as i64]);

    Ok((tensor, [orig_width as f64, orig_height as f64]))
}

/// Loads images into a `[batch, 3, input_dim, input_dim]` tensor.
pub fn load_batch<P>(paths: &[P], input_dim: usize) -> Result<(Tensor, Vec<[f64; 2]>)>
where
    P: AsRef<Path>,
{
    ensure!(!paths.is_empty(), "the image batch is empty");

    let (images, sizes): (Vec<_>, Vec<_>) = paths
        .iter()
        .map(|path| load_image(path, input_dim))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .unzip();

    Ok((Tensor::stack(&images, 0), sizes))
}

/// Lists an image file, or the image files in a directory sorted by path.
pub fn list_images<P>(path: P) -> Result<Vec<PathBuf>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();

    if path.is_file() {
        return Ok(vec![path.to_owned()]);
    }
    ensure!(
        path.is_dir(),
        "{} is neither a file nor a directory",
        path.display()
    );

    let mut paths: Vec<_> = fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
        .map(|entry| -> Result<_> { Ok(entry?.path()) })
        .filter_ok(|path| path.is_file() && ImageFormat::from_path(path).is_ok())
        .try_collect()?;
    paths.sort();

    Ok(paths)
}

/// Reads one class name per line. Blank lines are skipped.
pub fn load_class_names<P>(path: P) -> Result<Vec<String>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read classes file {}", path.display()))?;
    let names = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    Ok(names)
}

fn letterbox(image: &image::RgbImage, input_dim: usize) -> Array3<f32> {
    let (orig_width, orig_height) = image.dimensions();
    let scale = (input_dim as f64 / orig_width as f64).min(input_dim as f64 / orig_height as f64);
    let resize_width = ((orig_width as f64 * scale).round() as usize).clamp(1, input_dim);
    let resize_height = ((orig_height as f64 * scale).round() as usize).clamp(1, input_dim);
    let off_x = (input_dim - resize_width) / 2;
    let off_y = (input_dim - resize_height) / 2;

    let resized = image::imageops::resize(
        image,
        resize_width as u32,
        resize_height as u32,
        FilterType::CatmullRom,
    );

    // channel first
    Array3::from_shape_fn([3, input_dim, input_dim], |(channel, row, col)| {
        let inside = (off_y..off_y + resize_height).contains(&row)
            && (off_x..off_x + resize_width).contains(&col);
        let component = if inside {
            resized
                .get_pixel((col - off_x) as u32, (row - off_y) as u32)
                .channels()[channel]
        } else {
            LETTERBOX_GRAY
        };
        component as f32 / 255.0
    })
}
