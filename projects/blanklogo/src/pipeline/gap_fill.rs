// Detection gap-filler: assigns a bbox to frames the detector missed.
//
// Works on the whole sequence at once, so it must only run after every
// frame's direct detection is known.

use crate::pipeline::types::{BBox, Detection};

/// Fill missed detections from the nearest directly-detected neighbor.
///
/// The nearest earlier detection wins; the nearest later one is used only when
/// nothing earlier exists. A filled entry copies that neighbor's bbox as-is and
/// is marked `interpolated`. Frames with no detected neighbor in either
/// direction stay not-detected.
pub fn fill_missed_detections(detections: &[Detection]) -> Vec<Detection> {
    let n = detections.len();

    let mut before: Vec<Option<BBox>> = Vec::with_capacity(n);
    let mut last_seen = None;
    for d in detections {
        if d.is_direct() {
            last_seen = d.bbox;
        }
        before.push(last_seen);
    }

    let mut after: Vec<Option<BBox>> = vec![None; n];
    let mut next_seen = None;
    for (idx, d) in detections.iter().enumerate().rev() {
        if d.is_direct() {
            next_seen = d.bbox;
        }
        after[idx] = next_seen;
    }

    detections
        .iter()
        .enumerate()
        .map(|(idx, d)| {
            if d.is_direct() {
                return *d;
            }
            match before[idx].or(after[idx]) {
                Some(bbox) => Detection {
                    detected: true,
                    bbox: Some(bbox),
                    confidence: d.confidence,
                    interpolated: true,
                },
                None => *d,
            }
        })
        .collect()
}

/// Number of frames with a region to inpaint.
pub fn count_detected(detections: &[Detection]) -> usize {
    detections.iter().filter(|d| d.region().is_some()).count()
}

pub fn count_interpolated(detections: &[Detection]) -> usize {
    detections
        .iter()
        .filter(|d| d.interpolated && d.detected)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(x: i32) -> Detection {
        Detection::observed(BBox::new(x, 10, x + 40, 30).unwrap(), 0.9)
    }

    #[test]
    fn test_empty_input() {
        assert!(fill_missed_detections(&[]).is_empty());
    }

    #[test]
    fn test_all_detected_is_unchanged() {
        let input: Vec<Detection> = (0..5).map(|i| hit(i * 10)).collect();
        assert_eq!(fill_missed_detections(&input), input);
    }

    #[test]
    fn test_all_missing_is_unchanged() {
        let input = vec![Detection::missing(), Detection::rejected(0.2), Detection::missing()];
        let output = fill_missed_detections(&input);
        assert_eq!(output, input);
        assert_eq!(count_detected(&output), 0);
    }

    #[test]
    fn test_single_gap_prefers_backward_neighbor() {
        let input = vec![hit(0), Detection::missing(), hit(100)];
        let output = fill_missed_detections(&input);
        assert_eq!(output[1].bbox, input[0].bbox);
        assert_ne!(output[1].bbox, input[2].bbox);
        assert!(output[1].interpolated);
        assert!(output[1].detected);
    }

    #[test]
    fn test_run_of_missing_frames_uses_last_detection_before_gap() {
        // Frames 0-2 and 7-9 detected, 3-6 missing.
        let mut input = Vec::new();
        for i in 0..10 {
            if (3..=6).contains(&i) {
                input.push(Detection::missing());
            } else {
                input.push(hit(i * 5));
            }
        }
        let output = fill_missed_detections(&input);
        for det in &output[3..=6] {
            assert_eq!(det.bbox, input[2].bbox);
            assert!(det.interpolated);
        }
        assert_eq!(&output[0..3], &input[0..3]);
        assert_eq!(&output[7..10], &input[7..10]);
        assert_eq!(count_detected(&output), 10);
        assert_eq!(count_interpolated(&output), 4);
    }

    #[test]
    fn test_leading_gap_uses_forward_neighbor() {
        let input = vec![Detection::missing(), Detection::missing(), hit(50), hit(60)];
        let output = fill_missed_detections(&input);
        assert_eq!(output[0].bbox, input[2].bbox);
        assert_eq!(output[1].bbox, input[2].bbox);
    }

    #[test]
    fn test_trailing_gap_uses_backward_neighbor() {
        let input = vec![hit(5), Detection::missing(), Detection::rejected(0.1)];
        let output = fill_missed_detections(&input);
        assert_eq!(output[1].bbox, input[0].bbox);
        assert_eq!(output[2].bbox, input[0].bbox);
        // Rejected confidence is preserved on the filled entry.
        assert_eq!(output[2].confidence, Some(0.1));
    }

    #[test]
    fn test_interpolated_input_is_not_a_source() {
        // A stale interpolated entry must not seed later gaps.
        let stale = Detection {
            detected: true,
            bbox: BBox::new(0, 0, 5, 5),
            confidence: None,
            interpolated: true,
        };
        let input = vec![stale, Detection::missing(), hit(70)];
        let output = fill_missed_detections(&input);
        assert_eq!(output[1].bbox, input[2].bbox);
        assert_eq!(output[0].bbox, input[2].bbox);
    }
}
