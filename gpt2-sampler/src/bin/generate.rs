//! Text generation from a GPT-2 model exported to ONNX.
//!
//! The prompt is tokenized, extended with top-k sampling and each row of the
//! batch is printed on its own line. Logs go to stderr; set `RUST_LOG` to
//! change verbosity.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use gpt2_sampler::{GenerateConfig, Generator, Gpt2Tokenizer, OnnxModel};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the GPT-2 ONNX model file
    #[arg(long)]
    model: PathBuf,

    /// Path to the tokenizer.json for the model's vocabulary
    #[arg(long, default_value = "tokenizer.json")]
    tokenizer: PathBuf,

    /// Prompt to start with
    #[arg(long, default_value = "Hello, I'm a language model,")]
    prompt: String,

    /// Total sequence length to reach, prompt included
    #[arg(long, default_value_t = 40)]
    max_seq_len: usize,

    /// Number of sequences to sample from the prompt
    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Number of candidates kept at each step
    #[arg(long, default_value_t = 50)]
    top_k: usize,

    /// Random seed
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let tokenizer = Gpt2Tokenizer::from_file(&args.tokenizer)
        .with_context(|| format!("loading tokenizer {}", args.tokenizer.display()))?;
    let prompt = tokenizer
        .encode(&args.prompt)
        .context("encoding prompt")?;
    info!(tokens = prompt.len(), "prompt encoded");

    let mut model = OnnxModel::load(&args.model)
        .with_context(|| format!("loading model {}", args.model.display()))?;

    let config = GenerateConfig::new()
        .with_max_length(args.max_seq_len)
        .with_batch_size(args.batch_size)
        .with_top_k(args.top_k)
        .with_seed(args.seed)
        .with_min_vocab_size(tokenizer.vocab_size());
    let mut generator = Generator::new(config);
    let output = generator
        .generate(&mut model, &prompt)
        .context("generating tokens")?;

    for row in output.outer_iter() {
        let text = tokenizer.decode(&row.to_vec()).context("decoding output")?;
        println!(">>>> {}", text);
    }
    Ok(())
}
