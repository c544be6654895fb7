//! Generation settings shared by the library and the CLI.

use crate::error::{Error, Result};

/// Settings for the sampling loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateConfig {
    /// Total sequence length to reach, prompt included.
    pub max_length: usize,
    /// Number of independent rows sampled from the same prompt.
    pub batch_size: usize,
    /// Number of candidates kept before each draw.
    pub top_k: usize,
    /// Seed for the sampling generator.
    pub seed: u64,
    /// Smallest vocabulary the model output must cover, usually the
    /// tokenizer's size.
    pub min_vocab_size: Option<usize>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_length: 40,
            batch_size: 1,
            top_k: 50,
            seed: 0,
            min_vocab_size: None,
        }
    }
}

impl GenerateConfig {
    /// Convenience constructor returning the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_min_vocab_size(mut self, vocab_size: usize) -> Self {
        self.min_vocab_size = Some(vocab_size);
        self
    }

    /// Check the settings that do not depend on the model.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch size must be at least 1".into()));
        }
        if self.top_k == 0 {
            return Err(Error::Config("top-k must be at least 1".into()));
        }
        Ok(())
    }
}
