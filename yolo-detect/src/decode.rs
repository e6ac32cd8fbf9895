use crate::common::*;

/// Decodes the raw output of a yolo layer into box candidates.
///
/// `raw` has shape `[batch, anchors * (5 + classes), grid_h, grid_w]`. The
/// output has shape `[batch, grid_h * grid_w * anchors, 5 + classes]`, one
/// row per grid cell and anchor with the anchor varying fastest. Each row is
/// `[cx, cy, w, h, objectness, class scores..]` in input pixels, with
/// objectness and class scores passed through sigmoid.
pub fn decode(
    raw: &Tensor,
    anchors: &[(usize, usize)],
    num_classes: usize,
    input_dim: usize,
) -> Result<Tensor> {
    let (batch, channels, grid_h, grid_w) = raw.size4()?;
    let num_anchors = anchors.len() as i64;
    let num_attrs = 5 + num_classes as i64;

    ensure!(
        grid_h > 0 && grid_w > 0,
        "the detection grid must not be empty, but get {}x{}",
        grid_h,
        grid_w
    );
    ensure!(num_anchors > 0, "at least one anchor is required");
    ensure!(
        channels == num_anchors * num_attrs,
        "expect {} channels for {} anchors and {} classes, but get {}",
        num_anchors * num_attrs,
        num_anchors,
        num_classes,
        channels
    );

    let stride = input_dim as i64 / grid_h;
    ensure!(
        stride > 0,
        "input size {} is smaller than the grid height {}",
        input_dim,
        grid_h
    );
    let stride = stride as f64;

    let device = raw.device();
    let kind = raw.kind();
    let num_cells = grid_h * grid_w;

    // [b, a * attrs, h, w] -> [b, h * w * a, attrs]
    let xs = raw
        .reshape(&[batch, num_anchors, num_attrs, grid_h, grid_w])
        .permute(&[0, 3, 4, 1, 2])
        .contiguous()
        .reshape(&[batch, num_cells * num_anchors, num_attrs]);

    let xy = xs.narrow(2, 0, 2).sigmoid();
    let wh = xs.narrow(2, 2, 2).exp();
    let scores = xs.narrow(2, 4, 1 + num_classes as i64).sigmoid();

    // (x, y) cell offsets, repeated once per anchor
    let offsets = {
        let ys = Tensor::arange(grid_h, (kind, device));
        let xs = Tensor::arange(grid_w, (kind, device));
        let grids = Tensor::meshgrid(&[&ys, &xs]);
        Tensor::stack(&[&grids[1], &grids[0]], 2)
            .reshape(&[num_cells, 1, 2])
            .expand(&[num_cells, num_anchors, 2], false)
            .reshape(&[1, num_cells * num_anchors, 2])
    };

    // anchors in grid units
    let anchor_sizes = {
        let values: Vec<f64> = anchors
            .iter()
            .flat_map(|&(w, h)| [w as f64 / stride, h as f64 / stride])
            .collect();
        Tensor::of_slice(&values)
            .to_kind(kind)
            .to_device(device)
            .reshape(&[num_anchors, 2])
            .repeat(&[num_cells, 1])
            .reshape(&[1, num_cells * num_anchors, 2])
    };

    let xy = (xy + offsets) * stride;
    let wh = wh * anchor_sizes * stride;

    Ok(Tensor::cat(&[xy, wh, scores], 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn rows(tensor: &Tensor) -> Vec<Vec<f32>> {
        let (_, num_rows, num_attrs) = tensor.size3().unwrap();
        let values = Vec::<f32>::from(&tensor.contiguous().reshape(&[-1]));
        values
            .chunks(num_attrs as usize)
            .take(num_rows as usize)
            .map(|row| row.to_vec())
            .collect()
    }

    #[test]
    fn decode_single_cell() -> Result<()> {
        // tx = ty = tw = th = 0, large objectness and class logit
        let raw = Tensor::of_slice(&[0f32, 0.0, 0.0, 0.0, 20.0, 20.0]).reshape(&[1, 6, 1, 1]);
        let output = decode(&raw, &[(10, 10)], 1, 32)?;
        assert_eq!(output.size(), vec![1, 1, 6]);

        let row = &rows(&output)[0];
        assert_abs_diff_eq!(row[0], 16.0, epsilon = 1e-4);
        assert_abs_diff_eq!(row[1], 16.0, epsilon = 1e-4);
        assert_abs_diff_eq!(row[2], 10.0, epsilon = 1e-4);
        assert_abs_diff_eq!(row[3], 10.0, epsilon = 1e-4);
        assert_abs_diff_eq!(row[4], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(row[5], 1.0, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn rows_are_cell_major_then_anchor() -> Result<()> {
        // 2 anchors, 1 class, 2x2 grid, all logits zero
        let raw = Tensor::zeros(&[1, 12, 2, 2], (Kind::Float, Device::Cpu));
        let output = decode(&raw, &[(8, 4), (16, 32)], 1, 64)?;
        assert_eq!(output.size(), vec![1, 8, 6]);

        // stride 32: centers at 16 and 48
        let expect_centers = [
            (16.0, 16.0),
            (16.0, 16.0),
            (48.0, 16.0),
            (48.0, 16.0),
            (16.0, 48.0),
            (16.0, 48.0),
            (48.0, 48.0),
            (48.0, 48.0),
        ];
        let expect_sizes = [(8.0, 4.0), (16.0, 32.0)];

        rows(&output)
            .iter()
            .enumerate()
            .for_each(|(index, row)| {
                let (cx, cy) = expect_centers[index];
                let (w, h) = expect_sizes[index % 2];
                assert_abs_diff_eq!(row[0], cx, epsilon = 1e-4);
                assert_abs_diff_eq!(row[1], cy, epsilon = 1e-4);
                assert_abs_diff_eq!(row[2], w, epsilon = 1e-4);
                assert_abs_diff_eq!(row[3], h, epsilon = 1e-4);
                assert_abs_diff_eq!(row[4], 0.5, epsilon = 1e-6);
            });
        Ok(())
    }

    #[test]
    fn per_anchor_channels_follow_channel_groups() -> Result<()> {
        // only the second anchor's objectness channel is set
        let mut values = vec![0f32; 12];
        values[6 + 4] = 20.0;
        let raw = Tensor::of_slice(&values).reshape(&[1, 12, 1, 1]);
        let output = decode(&raw, &[(1, 1), (2, 2)], 1, 32)?;

        let rows = rows(&output);
        assert_abs_diff_eq!(rows[0][4], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(rows[1][4], 1.0, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn reject_channel_mismatch() {
        let raw = Tensor::zeros(&[1, 7, 2, 2], (Kind::Float, Device::Cpu));
        assert!(decode(&raw, &[(1, 1)], 1, 64).is_err());

        let raw = Tensor::zeros(&[6, 2, 2], (Kind::Float, Device::Cpu));
        assert!(decode(&raw, &[(1, 1)], 1, 64).is_err());
    }
}
