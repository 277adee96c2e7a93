use nalgebra::SVector;
use num_traits::ToPrimitive;

/// Perform non-max suppression on `[x1, y1, x2, y2]` boxes & scores, return indices to keep.
pub fn nms(boxes: &[SVector<f32, 4>], scores: &[f32], iou_thresh: f32) -> Vec<usize> {
    let mut idxs: Vec<usize> = (0..boxes.len()).collect();
    idxs.sort_by(|&i, &j| scores[j].total_cmp(&scores[i]));
    let mut keep = Vec::new();
    while let Some(&i) = idxs.first() {
        keep.push(i);
        idxs = idxs
            .into_iter()
            .skip(1)
            .filter(|&j| compute_iou(&boxes[i], &boxes[j]) < iou_thresh)
            .collect();
    }
    keep
}

/// Compute IoU between two bounding boxes given as `[x1, y1, x2, y2]`.
pub fn compute_iou(a: &SVector<f32, 4>, b: &SVector<f32, 4>) -> f32 {
    compute_iou_tlbr(a[0], a[1], a[2], a[3], b[0], b[1], b[2], b[3])
}

/// Helper function to compute IoU from top-left and bottom-right coordinates
#[allow(clippy::too_many_arguments)]
fn compute_iou_tlbr(
    a_x1: f32,
    a_y1: f32,
    a_x2: f32,
    a_y2: f32,
    b_x1: f32,
    b_y1: f32,
    b_x2: f32,
    b_y2: f32,
) -> f32 {
    let x1 = a_x1.max(b_x1);
    let y1 = a_y1.max(b_y1);
    let x2 = a_x2.min(b_x2);
    let y2 = a_y2.min(b_y2);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let a_area = (a_x2 - a_x1).max(0.0) * (a_y2 - a_y1).max(0.0);
    let b_area = (b_x2 - b_x1).max(0.0) * (b_y2 - b_y1).max(0.0);

    let union = a_area + b_area - inter_area;
    if union <= 0.0 {
        return 0.0;
    }

    inter_area / union
}

/// Pixel centre of a `[x1, y1, x2, y2]` box: corners truncated to integers,
/// then `x1 + w / 2` with floor division.
pub fn centroid(tlbr: &SVector<f32, 4>) -> (i32, i32) {
    let px = |v: f32| v.trunc().to_i32().unwrap_or(0);
    let (x1, y1, x2, y2) = (px(tlbr[0]), px(tlbr[1]), px(tlbr[2]), px(tlbr[3]));
    (x1 + (x2 - x1).div_euclid(2), y1 + (y2 - y1).div_euclid(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tlbr(x1: f32, y1: f32, x2: f32, y2: f32) -> SVector<f32, 4> {
        SVector::<f32, 4>::new(x1, y1, x2, y2)
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = tlbr(10.0, 10.0, 50.0, 50.0);
        assert_relative_eq!(compute_iou(&a, &a), 1.0);

        let b = tlbr(100.0, 100.0, 150.0, 150.0);
        assert_eq!(compute_iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        // Two 10x10 boxes sharing a 5x10 strip: 50 / 150
        let a = tlbr(0.0, 0.0, 10.0, 10.0);
        let b = tlbr(5.0, 0.0, 15.0, 10.0);
        assert_relative_eq!(compute_iou(&a, &b), 1.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_iou_degenerate_box() {
        let a = tlbr(10.0, 10.0, 10.0, 10.0);
        assert_eq!(compute_iou(&a, &a), 0.0);
    }

    #[test]
    fn test_nms_drops_overlapping_lower_score() {
        let boxes = vec![
            tlbr(0.0, 0.0, 10.0, 10.0),
            tlbr(1.0, 1.0, 11.0, 11.0),
            tlbr(50.0, 50.0, 60.0, 60.0),
        ];
        let scores = vec![0.6, 0.9, 0.5];
        let keep = nms(&boxes, &scores, 0.5);
        assert_eq!(keep, vec![1, 2]);
    }

    #[test]
    fn test_centroid() {
        assert_eq!(centroid(&tlbr(320.0, 277.0, 380.0, 317.0)), (350, 297));
    }

    #[test]
    fn test_centroid_truncates_then_floors() {
        // corners 320 / 381 after truncation, width 61, half 30
        assert_eq!(centroid(&tlbr(320.9, 277.2, 381.7, 312.0)), (350, 294));
        // the float centre (351.3, 294.6) would round differently
        assert_eq!(centroid(&tlbr(-3.7, 0.0, 4.0, 5.0)), (0, 2));
    }
}
