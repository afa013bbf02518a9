// Trains a diffusion BERT model on ROCStories or E2E.
//
// The BERT weights and tokenizer come from the Hugging Face hub, e.g. for
// bert-mini:
//
// mkdir -p data && cd data
// wget https://huggingface.co/prajjwal1/bert-mini/resolve/main/pytorch_model.bin
// wget https://huggingface.co/prajjwal1/bert-mini/resolve/main/config.json
// wget https://huggingface.co/bert-base-uncased/resolve/main/tokenizer.json
//
// Convert the weights to a .npz file from python:
//   import numpy as np
//   import torch
//   model = torch.load("./pytorch_model.bin")
//   np.savez("./bert-mini.npz", **{k: v.numpy() for k, v in model.items()})
//
// Then run:
//   cargo run --release --features cli --example text-diffusion-train -- \
//     --train-file data/rocstories_train.csv --eval-file data/rocstories_val.csv
use clap::{Parser, ValueEnum};
use diffusion_bert::{
    checkpoint::{self, LoadMode},
    data::{TextCorpus, TextEncoder},
    pipelines::text_diffusion::TextDiffusionConfig,
    training::{Trainer, TrainingConfig},
    transformers::bert,
    utils,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Dataset {
    RocStories,
    E2e,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The training split.
    #[arg(long, value_name = "FILE")]
    train_file: String,

    /// The evaluation split.
    #[arg(long, value_name = "FILE")]
    eval_file: String,

    #[arg(long, value_enum, default_value_t = Dataset::RocStories)]
    dataset: Dataset,

    /// The Hugging Face name of the BERT checkpoint, selects the heads.
    #[arg(long, default_value = "prajjwal1/bert-mini")]
    model_name: String,

    /// A Hugging Face config.json, defaults to the bert-mini configuration.
    #[arg(long, value_name = "FILE")]
    bert_config: Option<String>,

    /// The pretrained BERT weights.
    #[arg(long, value_name = "FILE", default_value = "data/bert-mini.npz")]
    weights: String,

    #[arg(long, value_name = "FILE", default_value = "data/tokenizer.json")]
    tokenizer: String,

    #[arg(long, default_value_t = 64)]
    max_len: usize,

    #[arg(long, default_value_t = 2000)]
    max_step: usize,

    #[arg(long, default_value_t = 3)]
    epochs: usize,

    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    #[arg(long, default_value_t = 5e-5)]
    learning_rate: f64,

    #[arg(long, default_value_t = 500)]
    warmup_steps: usize,

    #[arg(long, default_value = "./models")]
    output_dir: String,

    /// When set, use the CPU even if some accelerators are available.
    #[arg(long)]
    cpu: bool,

    #[arg(long, default_value_t = 42)]
    seed: i64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    println!("Cuda available: {}", tch::Cuda::is_available());
    println!("Cudnn available: {}", tch::Cuda::cudnn_is_available());
    let device = utils::device(args.cpu);
    tch::manual_seed(args.seed);

    let bert = match &args.bert_config {
        Some(path) => bert::Config::from_json_file(path)?,
        None => TextDiffusionConfig::rocstories().bert,
    };
    let config = TextDiffusionConfig {
        bert,
        head: bert::Head::for_model_name(&args.model_name),
        max_len: args.max_len,
        max_step: args.max_step,
    };
    let (vs, model) = config.build_model(device)?;
    let report = checkpoint::load(&vs, &args.weights, None, LoadMode::Permissive)?;
    println!("Loaded {} tensors, {} missing.", report.applied.len(), report.missing.len());

    let encoder = TextEncoder::from_file(&args.tokenizer, args.max_len)?;
    let (train_set, eval_set) = match args.dataset {
        Dataset::RocStories => (
            TextCorpus::rocstories(&args.train_file, encoder.clone())?,
            TextCorpus::rocstories(&args.eval_file, encoder)?,
        ),
        Dataset::E2e => (
            TextCorpus::e2e(&args.train_file, encoder.clone())?,
            TextCorpus::e2e(&args.eval_file, encoder)?,
        ),
    };

    let training = TrainingConfig {
        epochs: args.epochs,
        train_batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        warmup_steps: args.warmup_steps,
        output_dir: args.output_dir.into(),
        ..Default::default()
    };
    let summary = Trainer::new(training)?.train(&model, &vs, &train_set, &eval_set)?;
    println!("Trained for {} steps, best eval loss {:.4}.", summary.steps, summary.best_eval_loss);
    Ok(())
}
