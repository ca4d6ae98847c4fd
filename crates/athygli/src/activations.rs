//! Softmax operations shared by the portable attention path.

use ndarray::{s, Array4};

/// Applies a numerically stable softmax to one row of logits, in place.
///
/// The row maximum is subtracted before exponentiating so large logits do
/// not overflow. A row whose maximum is `-inf` is fully masked: its weights
/// are zeroed instead of dividing by a zero denominator.
pub fn softmax_row_inplace(row: &mut [f32]) {
    if row.is_empty() {
        return;
    }

    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max == f32::NEG_INFINITY {
        row.fill(0.0);
        return;
    }

    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }

    if sum > 0.0 {
        let scale = 1.0 / sum;
        for v in row.iter_mut() {
            *v *= scale;
        }
    } else {
        row.fill(0.0);
    }
}

/// Applies softmax along the last axis of a 4D score tensor.
pub fn softmax_4d_inplace(scores: &mut Array4<f32>) {
    let (batch_size, num_heads, q_len, _) = scores.dim();

    for b in 0..batch_size {
        for h in 0..num_heads {
            for q in 0..q_len {
                let mut row_view = scores.slice_mut(s![b, h, q, ..]);
                if let Some(slice) = row_view.as_slice_mut() {
                    softmax_row_inplace(slice);
                } else {
                    let max = row_view.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                    if max == f32::NEG_INFINITY {
                        row_view.fill(0.0);
                        continue;
                    }
                    row_view.mapv_inplace(|x| (x - max).exp());
                    let sum = row_view.sum();
                    if sum > 0.0 {
                        row_view /= sum;
                    } else {
                        row_view.fill(0.0);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array4, Axis};

    #[test]
    fn test_softmax_row_stable() {
        let mut row = vec![1000.0, 1000.0, 1000.0, 1000.0];
        softmax_row_inplace(&mut row);
        for v in &row {
            assert_relative_eq!(*v, 0.25, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_softmax_row_fully_masked() {
        let mut row = vec![f32::NEG_INFINITY; 3];
        softmax_row_inplace(&mut row);
        assert_eq!(row, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_softmax_row_partially_masked() {
        let mut row = vec![0.0, f32::NEG_INFINITY];
        softmax_row_inplace(&mut row);
        assert_relative_eq!(row[0], 1.0, epsilon = 1e-6);
        assert_eq!(row[1], 0.0);
    }

    #[test]
    fn test_softmax_4d_rows_sum_to_one() {
        let mut scores =
            Array4::from_shape_fn((1, 2, 3, 4), |(_, h, q, k)| (h + q + k) as f32 * 0.37);
        softmax_4d_inplace(&mut scores);
        for row in scores.lanes(Axis(3)) {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }
}
