//! Probability helpers for top-k sampling.
//!
//! Probabilities are kept in `f64` even though the network emits `f32`
//! logits, so renormalized rows sum to one well inside `1e-6`.

use std::cmp::Ordering;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::{Error, Result};

/// Row-wise softmax with the row maximum subtracted before exponentiating.
pub fn stable_softmax(logits: ArrayView2<f32>) -> Array2<f64> {
    let mut probs = logits.mapv(f64::from);
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    probs
}

/// The `k` most probable entries of one row, renormalized to sum to one.
#[derive(Clone, Debug, PartialEq)]
pub struct TopK {
    pub indices: Vec<usize>,
    pub probs: Vec<f64>,
}

/// Select the `k` highest-probability indices of `probs`.
///
/// Candidates come back in no particular order and ties resolve arbitrarily.
pub fn top_k(probs: ArrayView1<f64>, k: usize) -> Result<TopK> {
    let vocab = probs.len();
    if k == 0 {
        return Err(Error::Config("top-k must be at least 1".into()));
    }
    if k > vocab {
        return Err(Error::Config(format!(
            "top-k {k} exceeds vocabulary size {vocab}"
        )));
    }

    let mut indices: Vec<usize> = (0..vocab).collect();
    if k < vocab {
        indices.select_nth_unstable_by(k - 1, |&a, &b| {
            probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal)
        });
        indices.truncate(k);
    }

    let mut weights: Vec<f64> = indices.iter().map(|&i| probs[i]).collect();
    let total: f64 = weights.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(Error::Sampling(format!(
            "top-{k} probabilities sum to {total}"
        )));
    }
    for w in &mut weights {
        *w /= total;
    }
    Ok(TopK {
        indices,
        probs: weights,
    })
}

impl TopK {
    /// Draw one vocabulary index using the renormalized weights.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<usize> {
        let dist =
            WeightedIndex::new(&self.probs).map_err(|e| Error::Sampling(e.to_string()))?;
        Ok(self.indices[dist.sample(rng)])
    }

    /// Scatter the candidate weights over a full vocabulary, zero elsewhere.
    pub fn dense(&self, vocab: usize) -> Array1<f64> {
        let mut out = Array1::zeros(vocab);
        for (&i, &p) in self.indices.iter().zip(&self.probs) {
            out[i] = p;
        }
        out
    }
}

/// Softmax, top-k filter and one draw per row of `last_logits`
/// (shape batch x vocab). Rows draw in order from the same generator.
pub fn sample_next_tokens<R: Rng + ?Sized>(
    last_logits: ArrayView2<f32>,
    k: usize,
    rng: &mut R,
) -> Result<Array1<i64>> {
    let probs = stable_softmax(last_logits);
    let next = probs
        .outer_iter()
        .map(|row| {
            let candidates = top_k(row, k)?;
            Ok(candidates.sample(rng)? as i64)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Array1::from(next))
}
