use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use worker_runner::inference::capability;
use worker_runner::storage::settings::{load_settings, WorkerSettings};
use worker_runner::{FinishReason, HostProfile, RequestId, Runner, RunnerConfig};

/// Inspect the host and run generations through the worker runner
#[derive(Parser)]
#[command(name = "worker-runner")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the detected host profile as JSON
    Host,

    /// List registered engines and whether they run on this host
    Engines,

    /// Load a model and stream one completion to stdout
    Generate {
        /// Model file (.gguf), absolute or relative to the models directory
        #[arg(long, short)]
        model: PathBuf,

        /// Prompt text
        #[arg(long, short)]
        prompt: String,

        /// Engine variant to try first
        #[arg(long, short)]
        engine: Option<String>,

        /// Maximum tokens to generate (default: from settings)
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Sampling temperature, 0 = greedy (default: from settings)
        #[arg(long)]
        temperature: Option<f32>,

        /// Stop generating when the output contains this text
        #[arg(long)]
        stop: Vec<String>,

        /// Send the prompt without applying the model's chat template
        #[arg(long)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worker_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Host => {
            let json = serde_json::to_string_pretty(HostProfile::current())?;
            println!("{}", json);
        }
        Commands::Engines => list_engines(),
        Commands::Generate {
            model,
            prompt,
            engine,
            max_tokens,
            temperature,
            stop,
            raw,
        } => {
            let mut settings = load_settings();
            if let Some(max_tokens) = max_tokens {
                settings.max_tokens = max_tokens;
            }
            if let Some(temperature) = temperature {
                settings.temperature = temperature;
            }
            settings.validate();

            let mut request = settings.request(prompt);
            request.stop = stop;
            request.raw_prompt = raw;

            generate(&settings, model, engine, request).await?;
        }
    }

    Ok(())
}

fn list_engines() {
    let host = HostProfile::current();
    let registry = capability::global();
    let compatible: Vec<String> = registry
        .compatible(host)
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    if registry.is_empty() {
        println!("No engines built in (enable the `llama` feature)");
        return;
    }

    for name in registry.names() {
        let rank = registry.get(name).map(|c| c.rank()).unwrap_or_default();
        let status = match compatible.iter().position(|c| c == name) {
            Some(0) => "selected",
            Some(_) => "compatible",
            None => "unavailable",
        };
        println!("{:<20} rank {:<3} {}", name, rank, status);
    }
}

async fn generate(
    settings: &WorkerSettings,
    model: PathBuf,
    engine: Option<String>,
    request: worker_runner::GenerationRequest,
) -> Result<()> {
    let runner = Runner::with_config(RunnerConfig::from(settings));
    let model = settings.model_ref(model);

    runner
        .load_model(model.clone(), engine.as_deref())
        .await
        .with_context(|| format!("could not load '{}'", model))?;

    let id = RequestId::random();
    let mut stream = runner.generate(id.clone(), request).await?;
    let mut stdout = std::io::stdout();
    let mut finish = FinishReason::None;

    loop {
        tokio::select! {
            chunk = stream.recv() => {
                let Some(chunk) = chunk else { break };
                print!("{}", chunk.text);
                stdout.flush()?;
                finish = chunk.finish_reason;
            }
            _ = tokio::signal::ctrl_c() => {
                runner.cancel(&id)?;
                eprintln!("\n[cancelled]");
                break;
            }
        }
    }
    println!();

    if finish == FinishReason::Error {
        tracing::error!("Generation failed, see log above");
    }
    runner.shutdown().await?;
    Ok(())
}
