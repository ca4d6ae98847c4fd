//! Linear algebra operations for the portable attention path.

use faer::Parallelism;
use ndarray::{Array4, Zip};

/// Batched matrix multiply: `[B, H, M, K] @ [B, H, K, N] -> [B, H, M, N]`.
///
/// Batches are distributed over the rayon pool; the inner GEMM runs
/// single-threaded in faer so the two levels of parallelism do not fight.
pub fn matmul_4d(a: &Array4<f32>, b: &Array4<f32>) -> Array4<f32> {
    let (batch, heads, m, k) = a.dim();
    let n = b.shape()[3];
    debug_assert_eq!(b.shape()[2], k, "inner dimensions must match");

    let mut output = Array4::<f32>::zeros((batch, heads, m, n));

    Zip::from(output.outer_iter_mut())
        .and(a.outer_iter())
        .and(b.outer_iter())
        .par_for_each(|mut out_b, a_b, b_b| {
            Zip::from(out_b.outer_iter_mut())
                .and(a_b.outer_iter())
                .and(b_b.outer_iter())
                .for_each(|mut out_h, a_h, b_h| {
                    let a_s = a_h.as_standard_layout();
                    let b_s = b_h.as_standard_layout();
                    let o_s = out_h
                        .as_slice_mut()
                        .expect("output buffer must be contiguous");

                    faer::linalg::matmul::matmul(
                        faer::mat::from_row_major_slice_mut(o_s, m, n),
                        faer::mat::from_row_major_slice(a_s.as_slice().unwrap(), m, k),
                        faer::mat::from_row_major_slice(b_s.as_slice().unwrap(), k, n),
                        None,
                        1.0,
                        Parallelism::None,
                    );
                });
        });

    output
}

/// Transposes the last two axes into a contiguous tensor:
/// `[B, H, M, N] -> [B, H, N, M]`.
pub fn transpose_last_two(a: &Array4<f32>) -> Array4<f32> {
    a.view()
        .permuted_axes([0, 1, 3, 2])
        .as_standard_layout()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_matmul_4d_matches_manual() {
        let a = array![[[[1.0f32, 2.0], [3.0, 4.0]]]];
        let b = array![[[[5.0f32, 6.0], [7.0, 8.0]]]];
        let c = matmul_4d(&a, &b);
        assert_relative_eq!(c[[0, 0, 0, 0]], 19.0);
        assert_relative_eq!(c[[0, 0, 0, 1]], 22.0);
        assert_relative_eq!(c[[0, 0, 1, 0]], 43.0);
        assert_relative_eq!(c[[0, 0, 1, 1]], 50.0);
    }

    #[test]
    fn test_matmul_4d_rectangular() {
        let a = Array4::from_shape_fn((2, 3, 4, 5), |(b, h, i, j)| {
            (b + 2 * h + 3 * i + 5 * j) as f32 * 0.1
        });
        let b = Array4::from_shape_fn((2, 3, 5, 2), |(bb, h, i, j)| {
            (bb + h + i + 7 * j) as f32 * 0.2
        });
        let c = matmul_4d(&a, &b);
        assert_eq!(c.dim(), (2, 3, 4, 2));

        // spot-check one entry against the naive sum
        let (bb, h, i, j) = (1, 2, 3, 1);
        let mut acc = 0.0;
        for k in 0..5 {
            acc += a[[bb, h, i, k]] * b[[bb, h, k, j]];
        }
        assert_relative_eq!(c[[bb, h, i, j]], acc, epsilon = 1e-5);
    }

    #[test]
    fn test_transpose_last_two() {
        let a = Array4::from_shape_fn((1, 2, 3, 4), |(_, h, i, j)| (h * 12 + i * 4 + j) as f32);
        let t = transpose_last_two(&a);
        assert_eq!(t.dim(), (1, 2, 4, 3));
        assert_eq!(t[[0, 1, 3, 2]], a[[0, 1, 2, 3]]);
    }
}
