//! Library crate exposing the sampling components used by the `generate`
//! binary.
//!
//! A GPT-2 graph exported to ONNX is driven one token at a time: every step
//! re-runs the network over the whole sequence, keeps the logits of the last
//! position and draws the next token from the top-k candidates.

pub mod config;
pub mod error;
pub mod generate;
pub mod model;
pub mod sampling;
pub mod tokenizer;

pub use config::GenerateConfig;
pub use error::{Error, Result};
pub use generate::{generate, Generator};
pub use model::{LanguageModel, OnnxModel};
pub use tokenizer::Gpt2Tokenizer;
