//! sieve CLI - run declarative data-curation pipelines.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sieve::{OperatorContext, OperatorRegistry, Pipeline, PipelineConfig, ServingRegistry};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sieve")]
#[command(version)]
#[command(about = "Checkpointed operator pipelines for curating LLM training data")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to pipeline configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run {
        /// Continue from the last completed checkpoint
        #[arg(long)]
        resume: bool,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Validate configuration file
    Validate,

    /// List registered operators
    Operators,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn print_example_config() {
    let example = r#"# sieve pipeline configuration

[storage]
first_entry_file = "data/input.jsonl"
cache_path = "./cache"
file_name_prefix = "sieve_step"
cache_type = "json"               # json | jsonl

[serving.judge]
kind = "api"
api_url = "https://api.openai.com/v1/chat/completions"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
flavor = "chat"                   # chat | embedding
max_workers = 8
max_retries = 3
timeout_secs = 120

# [serving.local]
# kind = "local"
# engine = "completions_server"
# base_url = "http://localhost:8000/v1"
# model = "Qwen2.5-7B-Instruct"
# batch_size = 32

[[steps]]
operator = "llm_scorer"
serving = "judge"
keys = { input = "text", output = "quality" }
params = { prompt_template = "Rate the educational value of this text from 0 to 1. Reply as 'Score: <n>'.\n\n{text}", clamp = [0.0, 1.0] }

[[steps]]
operator = "score_filter"
keys = { input = "quality" }
params = { min_score = 0.5 }

[[steps]]
operator = "text_flags"
keys = { input = "text" }
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    let config = PipelineConfig::from_file(path)
        .with_context(|| format!("Failed to load config from {path:?}"))?;
    config.validate().context("Invalid pipeline configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Operators => {
            let registry = OperatorRegistry::with_builtins()?;
            for descriptor in registry.descriptors() {
                println!("{:<20} {}", descriptor.name(), descriptor.description());
            }
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            let operators = OperatorRegistry::with_builtins()?;
            let servings = ServingRegistry::from_config(&config)
                .context("Failed to build serving backends")?;

            for (index, step) in config.steps.iter().enumerate() {
                let mut ctx = OperatorContext::new(step.params.clone());
                if let Some(name) = &step.serving {
                    ctx = ctx.with_serving(servings.get(name)?);
                }
                let operator = operators
                    .lookup(&step.operator)
                    .and_then(|d| d.construct(&ctx))
                    .with_context(|| format!("Step {index} ({})", step.operator))?;
                operator
                    .signature()
                    .bind(operator.name(), &step.keys)
                    .with_context(|| format!("Step {index} ({})", step.operator))?;
            }

            let steps: Vec<_> = config.steps.iter().map(|s| s.operator.as_str()).collect();
            info!("Configuration is valid");
            info!("  Input:    {}", config.storage.first_entry_file.display());
            info!("  Cache:    {}", config.storage.cache_path.display());
            info!("  Serving:  {}", servings.names().join(", "));
            info!("  Steps:    {}", steps.join(" → "));
        }

        Commands::Run {
            resume,
            no_progress,
        } => {
            let config = load_config(&cli.config)?;
            let operators = OperatorRegistry::with_builtins()?;
            let servings = ServingRegistry::from_config(&config)
                .context("Failed to build serving backends")?;

            let mut pipeline = Pipeline::from_config(&config, &operators, &servings)
                .context("Failed to assemble pipeline")?;
            pipeline.set_show_progress(!no_progress);

            let report = if resume {
                pipeline.forward_resuming().await
            } else {
                pipeline.forward().await
            }
            .context("Pipeline failed")?;

            println!("\n=== Pipeline Complete ===");
            println!("{}", report.summary());
            if let Some(path) = report.final_checkpoint() {
                println!("Output:    {}", path.display());
            }
        }
    }

    Ok(())
}
