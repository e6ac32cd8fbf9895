use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use darknet_config::{DarknetModel, LayerGraph};
use image::{Rgb, RgbImage};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tch::{Device, Kind, Tensor};
use yolo_detect::{
    config::Config, rescale_detections, ExecutionContext, NonMaxSuppressionInit, YoloModel,
};

// one 1x1 convolution with stride 32 feeding a yolo layer: a 2x2 grid of
// 16x16 anchor boxes on a 64x64 input
const MODEL_CFG: &str = "
[net]
height=64
width=64
channels=3

[convolutional]
filters=6
size=1
stride=32
activation=linear

[yolo]
mask=0
anchors=16,16
classes=1
";

fn weights_file_bytes(objectness_bias: f32) -> Result<Vec<u8>> {
    let mut bytes = vec![];
    // version 0.2.0 with a u64 image counter
    [0u32, 2, 0]
        .iter()
        .try_for_each(|&value| bytes.write_u32::<LittleEndian>(value))?;
    bytes.write_u64::<LittleEndian>(0)?;

    let biases = [0.0, 0.0, 0.0, 0.0, objectness_bias, 10.0];
    biases
        .iter()
        .chain([0f32; 18].iter())
        .try_for_each(|&value| bytes.write_f32::<LittleEndian>(value))?;
    Ok(bytes)
}

fn work_dir(name: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("yolo-detect-e2e-{}-{}", name, std::process::id()));
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn load_model(dir: &Path, objectness_bias: f32) -> Result<(ExecutionContext, YoloModel)> {
    let weights_file = dir.join("model.weights");
    fs::write(&weights_file, weights_file_bytes(objectness_bias)?)?;

    let graph: LayerGraph = MODEL_CFG.parse()?;
    let mut darknet_model = DarknetModel::new(&graph);
    darknet_model.load_weights(&weights_file)?;

    let ctx = ExecutionContext::cpu();
    let model = YoloModel::new(&ctx, &darknet_model)?;
    Ok((ctx, model))
}

#[test]
fn detect_in_every_cell() -> Result<()> {
    let dir = work_dir("cells")?;
    let (ctx, model) = load_model(&dir, 10.0)?;

    let input = Tensor::zeros(&[1, 3, 64, 64], (Kind::Float, Device::Cpu));
    let prediction = model.forward(&ctx, &input)?.expect("detections");
    assert_eq!(prediction.size(), vec![1, 4, 6]);

    let nms = NonMaxSuppressionInit::default().build()?;
    let detections = nms.forward(&prediction)?;
    assert_eq!(detections.len(), 4);
    assert!(detections.iter().all(|det| det.class_id == 0));

    let mut corners: Vec<_> = detections
        .iter()
        .map(|det| (det.x1.round() as i64, det.y1.round() as i64))
        .collect();
    corners.sort();
    assert_eq!(corners, vec![(8, 8), (8, 40), (40, 8), (40, 40)]);

    // the input was a 128x128 image scaled by one half
    let rescaled = rescale_detections(&detections, 64, &[[128.0, 128.0]])?;
    rescaled.iter().for_each(|det| {
        assert!((det.x2 - det.x1 - 32.0).abs() < 1e-3);
        assert!((det.y2 - det.y1 - 32.0).abs() < 1e-3);
    });

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn low_objectness_yields_nothing() -> Result<()> {
    let dir = work_dir("empty")?;
    let (ctx, model) = load_model(&dir, -10.0)?;

    let input = Tensor::zeros(&[2, 3, 64, 64], (Kind::Float, Device::Cpu));
    let prediction = model.forward(&ctx, &input)?.expect("detections");
    assert_eq!(prediction.size(), vec![2, 4, 6]);

    let nms = NonMaxSuppressionInit::default().build()?;
    assert!(nms.forward(&prediction)?.is_empty());

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn run_from_config_file() -> Result<()> {
    let dir = work_dir("config")?;
    fs::write(dir.join("model.cfg"), MODEL_CFG)?;
    fs::write(dir.join("model.weights"), weights_file_bytes(10.0)?)?;
    fs::write(dir.join("classes.txt"), "thing\n")?;

    let images_dir = dir.join("images");
    fs::create_dir_all(&images_dir)?;
    RgbImage::from_pixel(128, 64, Rgb([0, 0, 0])).save(images_dir.join("wide.png"))?;
    RgbImage::from_pixel(64, 64, Rgb([0, 0, 0])).save(images_dir.join("square.png"))?;

    let output_file = dir.join("detections.json");
    let config_text = format!(
        "{{
            version: '0.1.0',
            model: {{
                cfg_file: '{cfg}',
                weights_file: '{weights}',
                context: {{ device: 'cpu' }},
            }},
            input: {{ images: '{images}', batch_size: 2, classes_file: '{classes}' }},
            output: {{ file: '{output}' }},
        }}",
        cfg = dir.join("model.cfg").display(),
        weights = dir.join("model.weights").display(),
        images = images_dir.display(),
        classes = dir.join("classes.txt").display(),
        output = output_file.display(),
    );
    let config_file = dir.join("detect.json5");
    fs::write(&config_file, config_text)?;

    let config = Config::open(&config_file)?;
    yolo_detect::start(&config)?;

    let records: Vec<serde_json::Value> =
        serde_json::from_str(&fs::read_to_string(&output_file)?)?;
    assert_eq!(records.len(), 8);
    assert!(records
        .iter()
        .all(|record| record["class_name"] == "thing" && record["class_id"] == 0));

    // boxes never leave the wide image
    records
        .iter()
        .filter(|record| record["image"].as_str().unwrap().ends_with("wide.png"))
        .for_each(|record| {
            let y1 = record["y1"].as_f64().unwrap();
            let y2 = record["y2"].as_f64().unwrap();
            assert!(0.0 <= y1 && y2 <= 64.0);
        });

    fs::remove_dir_all(&dir)?;
    Ok(())
}
