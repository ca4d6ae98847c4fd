//! Attention input tensors and their dimensional contract.

use ndarray::Array4;

use crate::error::{AttentionError, AttentionResult};

/// Resolved dimensions of one attention computation.
///
/// All tensors follow the `[batch, heads, seq, dim]` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    pub batch: usize,
    pub heads: usize,
    pub seq_q: usize,
    pub seq_k: usize,
    pub head_dim: usize,
    pub value_dim: usize,
}

impl AttentionDims {
    /// The `1 / sqrt(head_dim)` logit scale.
    pub fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// Shape of the score/weight matrix `[batch, heads, seq_q, seq_k]`.
    pub fn score_shape(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.heads, self.seq_q, self.seq_k)
    }

    /// Shape of the attention output `[batch, heads, seq_q, value_dim]`.
    pub fn output_shape(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.heads, self.seq_q, self.value_dim)
    }
}

/// Query/key/value tensors plus an optional additive bias.
///
/// The bias is added to the scaled logits before softmax and must broadcast
/// to `[batch, heads, seq_q, seq_k]` (axes of size 1 broadcast). Masking is
/// expressed through the bias: `-inf` entries exclude a key position, and a
/// fully `-inf` row produces a zero output row rather than NaN.
#[derive(Debug, Clone)]
pub struct AttentionInputs {
    pub query: Array4<f32>,
    pub key: Array4<f32>,
    pub value: Array4<f32>,
    pub bias: Option<Array4<f32>>,
}

impl AttentionInputs {
    pub fn new(query: Array4<f32>, key: Array4<f32>, value: Array4<f32>) -> Self {
        Self {
            query,
            key,
            value,
            bias: None,
        }
    }

    pub fn with_bias(mut self, bias: Array4<f32>) -> Self {
        self.bias = Some(bias);
        self
    }

    /// Checks every invariant of the dimensional contract and returns the
    /// resolved dimensions. Called once at forward entry, before any kernel.
    pub fn validate(&self) -> AttentionResult<AttentionDims> {
        let (batch, heads, seq_q, head_dim) = self.query.dim();
        let (kb, kh, seq_k, kd) = self.key.dim();
        let (vb, vh, vs, value_dim) = self.value.dim();

        if self.query.is_empty() || self.key.is_empty() || self.value.is_empty() {
            return Err(AttentionError::ShapeMismatch {
                expected: "non-empty query/key/value tensors".into(),
                got: format!(
                    "query {:?}, key {:?}, value {:?}",
                    self.query.shape(),
                    self.key.shape(),
                    self.value.shape()
                ),
            });
        }

        if (kb, kh) != (batch, heads) || (vb, vh) != (batch, heads) {
            return Err(AttentionError::ShapeMismatch {
                expected: format!("key/value batch and head dims [{}, {}, ..]", batch, heads),
                got: format!("key [{}, {}, ..], value [{}, {}, ..]", kb, kh, vb, vh),
            });
        }

        if kd != head_dim {
            return Err(AttentionError::ShapeMismatch {
                expected: format!("key head dim {}", head_dim),
                got: format!("key head dim {}", kd),
            });
        }

        if vs != seq_k {
            return Err(AttentionError::ShapeMismatch {
                expected: format!("value sequence length {}", seq_k),
                got: format!("value sequence length {}", vs),
            });
        }

        let dims = AttentionDims {
            batch,
            heads,
            seq_q,
            seq_k,
            head_dim,
            value_dim,
        };

        if let Some(bias) = &self.bias {
            let target = [batch, heads, seq_q, seq_k];
            let ok = bias
                .shape()
                .iter()
                .zip(target.iter())
                .all(|(&b, &t)| b == t || b == 1);
            if !ok {
                return Err(AttentionError::ShapeMismatch {
                    expected: format!("bias broadcastable to {:?}", target),
                    got: format!("bias {:?}", bias.shape()),
                });
            }
        }

        Ok(dims)
    }
}

/// Gradients of the attention output with respect to the inputs.
#[derive(Debug, Clone)]
pub struct AttentionGradients {
    pub query: Array4<f32>,
    pub key: Array4<f32>,
    pub value: Array4<f32>,
}
