use crate::common::*;

pub use detection::*;
pub use non_max_suppression::*;

mod detection {
    use super::*;

    /// A de-duplicated box in pixel units.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct Detection {
        /// Position of the image within its batch.
        pub image_index: usize,
        pub x1: f64,
        pub y1: f64,
        pub x2: f64,
        pub y2: f64,
        pub objectness: f64,
        pub class_id: usize,
        pub class_score: f64,
    }

    impl Detection {
        /// The box corners as stored, inverted or not.
        pub fn rect(&self) -> XYXY<f64> {
            XYXY::from_xyxy_unchecked([self.x1, self.y1, self.x2, self.y2])
        }

        pub(crate) fn is_finite(&self) -> bool {
            [self.x1, self.y1, self.x2, self.y2]
                .iter()
                .all(|value| value.is_finite())
        }

        pub fn with_rect(&self, rect: &XYXY<f64>) -> Self {
            let [x1, y1, x2, y2] = rect.xyxy();
            Self {
                x1,
                y1,
                x2,
                y2,
                ..self.clone()
            }
        }
    }

    /// Intersection over union of two detections.
    pub fn iou(lhs: &Detection, rhs: &Detection) -> f64 {
        lhs.rect().iou_with(&rhs.rect())
    }
}

mod non_max_suppression {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct NonMaxSuppressionInit {
        pub iou_threshold: R64,
        pub confidence_threshold: R64,
    }

    impl Default for NonMaxSuppressionInit {
        fn default() -> Self {
            Self {
                iou_threshold: r64(0.4),
                confidence_threshold: r64(0.5),
            }
        }
    }

    impl NonMaxSuppressionInit {
        pub fn build(self) -> Result<NonMaxSuppression> {
            let Self {
                iou_threshold,
                confidence_threshold,
            } = self;

            ensure!(
                (0.0..=1.0).contains(&iou_threshold.raw()),
                "iou_threshold must be in range [0, 1]"
            );
            ensure!(
                (0.0..=1.0).contains(&confidence_threshold.raw()),
                "confidence_threshold must be in range [0, 1]"
            );

            Ok(NonMaxSuppression {
                iou_threshold,
                confidence_threshold,
            })
        }
    }

    /// Confidence filtering followed by greedy per-class suppression.
    #[derive(Debug, Clone)]
    pub struct NonMaxSuppression {
        iou_threshold: R64,
        confidence_threshold: R64,
    }

    impl NonMaxSuppression {
        /// Post-processes decoded candidates of shape
        /// `[batch, candidates, 5 + classes]` with `[cx, cy, w, h]` boxes.
        ///
        /// Output is grouped by image then class in ascending order, and
        /// sorted by descending objectness within each group.
        pub fn forward(&self, prediction: &Tensor) -> Result<Vec<Detection>> {
            let (batch_size, num_candidates, num_attrs) = prediction.size3()?;
            ensure!(
                num_attrs > 5,
                "expect at least one class score per candidate, but get {} attributes",
                num_attrs
            );

            let values: Vec<f32> = tch::no_grad(|| {
                let flat = prediction
                    .to_device(Device::Cpu)
                    .to_kind(Kind::Float)
                    .contiguous()
                    .reshape(&[-1]);
                Vec::<f32>::from(&flat)
            });

            let confidence_threshold = self.confidence_threshold.raw();
            let rows_per_image = num_candidates as usize;
            let num_attrs = num_attrs as usize;

            let candidates: Vec<Detection> = values
                .chunks(num_attrs)
                .enumerate()
                .filter(|(_, row)| row[4] as f64 > confidence_threshold)
                .filter(|(_, row)| row[..4].iter().all(|value| value.is_finite()))
                .map(|(row_index, row)| {
                    let image_index = row_index / rows_per_image;
                    let [cx, cy, w, h] = [row[0], row[1], row[2], row[3]].map(f64::from);
                    let rect = XYXY::from_cxcywh([cx, cy, w.max(0.0), h.max(0.0)]);
                    let [x1, y1, x2, y2] = rect.xyxy();

                    // ties go to the lowest class id
                    let (class_id, class_score) = row[5..].iter().enumerate().fold(
                        (0, row[5]),
                        |(best_id, best_score), (class_id, &score)| {
                            if score > best_score {
                                (class_id, score)
                            } else {
                                (best_id, best_score)
                            }
                        },
                    );

                    Detection {
                        image_index,
                        x1,
                        y1,
                        x2,
                        y2,
                        objectness: row[4] as f64,
                        class_id,
                        class_score: class_score as f64,
                    }
                })
                .collect();

            debug!(
                "{} of {} candidates in {} images pass the confidence threshold",
                candidates.len(),
                batch_size * num_candidates,
                batch_size
            );

            Ok(self.suppress(candidates))
        }

        /// Runs confidence filtering and suppression over detection records.
        ///
        /// Records with non-finite corners are dropped.
        pub fn suppress(&self, detections: Vec<Detection>) -> Vec<Detection> {
            let Self {
                iou_threshold,
                confidence_threshold,
            } = *self;
            let iou_threshold = iou_threshold.raw();
            let confidence_threshold = confidence_threshold.raw();

            let mut groups: BTreeMap<(usize, usize), Vec<Detection>> = BTreeMap::new();
            detections
                .into_iter()
                .filter(|det| det.objectness > confidence_threshold && det.is_finite())
                .for_each(|det| {
                    groups
                        .entry((det.image_index, det.class_id))
                        .or_default()
                        .push(det);
                });

            groups
                .into_values()
                .flat_map(|mut group| {
                    // stable, so equal objectness keeps candidate order
                    group.sort_by(|lhs, rhs| {
                        rhs.objectness
                            .partial_cmp(&lhs.objectness)
                            .unwrap_or(Ordering::Equal)
                    });

                    let mut keep: Vec<Detection> = vec![];
                    group.into_iter().for_each(|det| {
                        let suppressed = keep.iter().any(|kept| iou(kept, &det) > iou_threshold);
                        if !suppressed {
                            keep.push(det);
                        }
                    });
                    keep
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(image_index: usize, class_id: usize, objectness: f64, xyxy: [f64; 4]) -> Detection {
        let [x1, y1, x2, y2] = xyxy;
        Detection {
            image_index,
            x1,
            y1,
            x2,
            y2,
            objectness,
            class_id,
            class_score: 0.9,
        }
    }

    fn nms() -> NonMaxSuppression {
        NonMaxSuppressionInit::default().build().unwrap()
    }

    #[test]
    fn reject_invalid_thresholds() {
        assert!(NonMaxSuppressionInit {
            iou_threshold: r64(1.5),
            confidence_threshold: r64(0.5),
        }
        .build()
        .is_err());
        assert!(NonMaxSuppressionInit {
            iou_threshold: r64(0.5),
            confidence_threshold: r64(-0.1),
        }
        .build()
        .is_err());
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let lhs = det(0, 0, 0.9, [0.0, 0.0, 10.0, 10.0]);
        let rhs = det(0, 0, 0.9, [20.0, 20.0, 30.0, 30.0]);
        assert_eq!(iou(&lhs, &lhs), 1.0);
        assert_eq!(iou(&lhs, &rhs), 0.0);
    }

    #[test]
    fn suppress_overlaps_within_class() {
        let detections = vec![
            det(0, 0, 0.8, [0.0, 0.0, 10.0, 10.0]),
            det(0, 0, 0.9, [1.0, 0.0, 11.0, 10.0]),
            // another class at the same place survives
            det(0, 1, 0.7, [0.0, 0.0, 10.0, 10.0]),
            // below the confidence threshold
            det(0, 0, 0.5, [50.0, 50.0, 60.0, 60.0]),
            // another image
            det(1, 0, 0.6, [0.0, 0.0, 10.0, 10.0]),
        ];

        let output = nms().suppress(detections);
        let summary: Vec<_> = output
            .iter()
            .map(|det| (det.image_index, det.class_id, det.objectness))
            .collect();
        assert_eq!(summary, vec![(0, 0, 0.9), (0, 1, 0.7), (1, 0, 0.6)]);
    }

    #[test]
    fn keep_boxes_below_iou_threshold() {
        // iou = 25 / 175
        let detections = vec![
            det(0, 0, 0.9, [0.0, 0.0, 10.0, 10.0]),
            det(0, 0, 0.8, [5.0, 5.0, 15.0, 15.0]),
        ];
        assert_eq!(nms().suppress(detections).len(), 2);
    }

    #[test]
    fn suppression_is_idempotent() {
        let detections: Vec<_> = (0..20)
            .map(|index| {
                let offset = (index % 7) as f64 * 3.0;
                det(
                    index % 2,
                    index % 3,
                    0.5 + index as f64 / 50.0,
                    [offset, offset, offset + 10.0, offset + 10.0],
                )
            })
            .collect();

        let nms = nms();
        let once = nms.suppress(detections);
        let twice = nms.suppress(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn equal_objectness_keeps_candidate_order() {
        let detections = vec![
            det(0, 0, 0.9, [0.0, 0.0, 10.0, 10.0]),
            det(0, 0, 0.9, [0.0, 0.0, 10.0, 10.0]),
        ];
        let output = nms().suppress(detections.clone());
        assert_eq!(output, vec![detections[0].clone()]);
    }

    #[test]
    fn malformed_boxes_do_not_panic() {
        let detections = vec![
            det(0, 0, 0.9, [0.0, 0.0, 20.0, 20.0]),
            det(0, 0, 0.8, [0.0, 0.0, f64::NAN, 10.0]),
            // inverted corners never overlap anything
            det(0, 0, 0.7, [10.0, 10.0, 0.0, 0.0]),
        ];
        assert_eq!(iou(&detections[0], &detections[2]), 0.0);

        let output = nms().suppress(detections.clone());
        assert_eq!(output, vec![detections[0].clone(), detections[2].clone()]);
        assert_eq!(nms().suppress(output.clone()), output);
    }

    #[test]
    fn forward_decoded_tensor() -> Result<()> {
        // two images, two candidates, two classes
        let rows: Vec<f32> = vec![
            // image 0
            10.0, 10.0, 4.0, 4.0, 0.9, 0.3, 0.3, //
            10.0, 10.0, 4.0, 4.0, 0.2, 0.1, 0.8, //
            // image 1
            20.0, 30.0, 2.0, 6.0, 0.6, 0.1, 0.7, //
            0.0, 0.0, 1.0, 1.0, 0.4, 0.9, 0.9,
        ];
        let prediction = Tensor::of_slice(&rows).reshape(&[2, 2, 7]);
        let output = nms().forward(&prediction)?;

        assert_eq!(output.len(), 2);

        let first = &output[0];
        assert_eq!((first.image_index, first.class_id), (0, 0));
        assert_eq!(
            [first.x1, first.y1, first.x2, first.y2],
            [8.0, 8.0, 12.0, 12.0]
        );
        assert!((first.class_score - 0.3).abs() < 1e-6);

        let second = &output[1];
        assert_eq!((second.image_index, second.class_id), (1, 1));
        assert_eq!(
            [second.x1, second.y1, second.x2, second.y2],
            [19.0, 27.0, 21.0, 33.0]
        );
        Ok(())
    }

    #[test]
    fn forward_without_survivors_is_empty() -> Result<()> {
        let prediction = Tensor::zeros(&[1, 4, 6], (Kind::Float, Device::Cpu));
        assert!(nms().forward(&prediction)?.is_empty());
        Ok(())
    }
}
