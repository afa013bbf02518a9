// Generates texts with a trained diffusion BERT model.
//
//   cargo run --release --features cli --example text-diffusion-sample -- \
//     models/bestloss.ot 10 50
//
// The samples are written to samples.txt, one per line.
use clap::Parser;
use diffusion_bert::{
    checkpoint::LoadMode, data::TextEncoder, pipelines::text_diffusion, transformers::bert,
    utils,
};
use std::io::Write;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The trained model weights.
    checkpoint: String,

    /// The DDIM stride, the number of timesteps skipped per step.
    k: usize,

    /// The number of samples to generate.
    n: usize,

    #[arg(long, value_name = "FILE", default_value = "data/tokenizer.json")]
    tokenizer: String,

    /// A Hugging Face config.json, defaults to the bert-mini configuration.
    #[arg(long, value_name = "FILE")]
    bert_config: Option<String>,

    #[arg(long, default_value = "prajjwal1/bert-mini")]
    model_name: String,

    #[arg(long, default_value_t = 64)]
    max_len: usize,

    #[arg(long, default_value_t = 2000)]
    max_step: usize,

    /// Fail when the checkpoint does not match the model exactly.
    #[arg(long)]
    strict: bool,

    /// Drop [CLS], [SEP] and [PAD] from the decoded texts.
    #[arg(long)]
    skip_special_tokens: bool,

    #[arg(long, value_name = "FILE", default_value = "samples.txt")]
    output: String,

    /// When set, use the CPU even if some accelerators are available.
    #[arg(long)]
    cpu: bool,

    #[arg(long)]
    seed: Option<i64>,
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
    if let Some(seed) = args.seed {
        tch::manual_seed(seed);
    }

    let bert = match &args.bert_config {
        Some(path) => bert::Config::from_json_file(path)?,
        None => text_diffusion::TextDiffusionConfig::rocstories().bert,
    };
    let config = text_diffusion::TextDiffusionConfig {
        bert,
        head: bert::Head::for_model_name(&args.model_name),
        max_len: args.max_len,
        max_step: args.max_step,
    };
    let mode = if args.strict { LoadMode::Strict } else { LoadMode::Permissive };
    let (_vs, model) = config.build_pretrained(&args.checkpoint, mode, device)?;
    let encoder = TextEncoder::from_file(&args.tokenizer, args.max_len)?;

    let samples = text_diffusion::generate(&model, args.k, args.n, None, |t| {
        print!("\rnoise level {t}");
        let _ = std::io::stdout().flush();
    })?;
    println!();

    let mut file = std::fs::File::create(&args.output)?;
    for sample in samples.iter() {
        let text = encoder.decode(sample, args.skip_special_tokens)?;
        writeln!(file, "{text}")?;
    }
    println!("Wrote {} samples to {}.", samples.len(), args.output);
    Ok(())
}
