//! Autoregressive top-k sampling loop.
//!
//! Every step re-runs the model over the whole growing sequence; nothing is
//! cached between steps.

use ndarray::{Array1, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::config::GenerateConfig;
use crate::error::{Error, Result};
use crate::model::LanguageModel;
use crate::sampling::sample_next_tokens;

/// Extend `prompt` to `max_length` tokens in each of `batch_size` rows.
///
/// The prompt is copied into every row. When it already has `max_length`
/// tokens or more, it is returned as is and `model` is never called.
pub fn generate<M, R>(
    model: &mut M,
    prompt: &[i64],
    max_length: usize,
    batch_size: usize,
    top_k: usize,
    rng: &mut R,
) -> Result<Array2<i64>>
where
    M: LanguageModel + ?Sized,
    R: Rng + ?Sized,
{
    let config = GenerateConfig::new()
        .with_max_length(max_length)
        .with_batch_size(batch_size)
        .with_top_k(top_k);
    sample_loop(model, prompt, &config, rng)
}

/// Sampling loop that owns its seeded generator.
///
/// Two generators built from the same config produce identical sequences
/// for the same model and prompt.
pub struct Generator {
    config: GenerateConfig,
    rng: StdRng,
}

impl Generator {
    pub fn new(config: GenerateConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    pub fn config(&self) -> &GenerateConfig {
        &self.config
    }

    /// Generate a batch of sequences for `prompt`.
    pub fn generate<M>(&mut self, model: &mut M, prompt: &[i64]) -> Result<Array2<i64>>
    where
        M: LanguageModel + ?Sized,
    {
        sample_loop(model, prompt, &self.config, &mut self.rng)
    }
}

/// Position indices `0..len` for a sequence of `len` tokens.
pub fn position_ids(len: usize) -> Array1<i64> {
    Array1::from_iter(0..len as i64)
}

fn sample_loop<M, R>(
    model: &mut M,
    prompt: &[i64],
    config: &GenerateConfig,
    rng: &mut R,
) -> Result<Array2<i64>>
where
    M: LanguageModel + ?Sized,
    R: Rng + ?Sized,
{
    config.validate()?;
    if prompt.is_empty() {
        return Err(Error::InvalidInput("prompt has no tokens".into()));
    }

    let batch = config.batch_size;
    let mut tokens = Array2::from_shape_fn((batch, prompt.len()), |(_, j)| prompt[j]);
    let mut positions = position_ids(tokens.ncols());
    let mut vocab = None;

    info!(
        prompt_len = prompt.len(),
        max_length = config.max_length,
        batch_size = batch,
        top_k = config.top_k,
        "generating tokens"
    );

    while tokens.ncols() < config.max_length {
        let len = tokens.ncols();
        let logits = model.forward(tokens.view(), positions.view())?;
        let vocab_size = check_logits(&logits, batch, len, vocab)?;
        if vocab.is_none() {
            check_vocab(vocab_size, config)?;
            vocab = Some(vocab_size);
        }

        let last = logits.index_axis(Axis(1), len - 1);
        let next = sample_next_tokens(last, config.top_k, rng)?;
        tokens
            .push_column(next.view())
            .map_err(|_| Error::ShapeMismatch {
                expected: vec![batch],
                got: vec![next.len()],
            })?;
        positions = position_ids(tokens.ncols());

        debug!(step = len - prompt.len(), len = tokens.ncols(), next = ?next.to_vec(), "sampled");
    }

    info!(len = tokens.ncols(), "generation done");
    Ok(tokens)
}

/// Check logits against (batch, len, vocab) and return the vocabulary size.
fn check_logits(
    logits: &Array3<f32>,
    batch: usize,
    len: usize,
    vocab: Option<usize>,
) -> Result<usize> {
    let (b, t, v) = logits.dim();
    let expected_vocab = vocab.unwrap_or(v);
    if b != batch || t != len || v != expected_vocab {
        return Err(Error::ShapeMismatch {
            expected: vec![batch, len, expected_vocab],
            got: vec![b, t, v],
        });
    }
    Ok(v)
}

fn check_vocab(vocab_size: usize, config: &GenerateConfig) -> Result<()> {
    if config.top_k > vocab_size {
        return Err(Error::Config(format!(
            "top-k {} exceeds the model's vocabulary size {vocab_size}",
            config.top_k
        )));
    }
    if let Some(min) = config.min_vocab_size {
        if vocab_size < min {
            return Err(Error::ModelIncompatible(format!(
                "model emits {vocab_size} logits per position but the tokenizer has {min} tokens"
            )));
        }
    }
    Ok(())
}
