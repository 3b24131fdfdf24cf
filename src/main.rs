use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};

use common::models::{ModelDescriptor, ModelPriority};
use common::utils::{format_bytes, format_duration};
use model_lifecycle::{LifecycleState, ModelRuntime};
use runtime_config::ConfigManager;

/// Download, validate and load models under a memory budget
#[derive(Parser, Debug)]
#[command(name = "model-lifecycle")]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a model from a JSON descriptor
    Register {
        /// Descriptor file
        descriptor: PathBuf,
    },

    /// List registered models
    List,

    /// Acquire a model, print a summary and unload it again
    Load {
        /// Model id
        id: String,

        /// Admission priority, overriding the descriptor's
        #[arg(short, long, value_enum)]
        priority: Option<Priority>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl From<Priority> for ModelPriority {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Low => ModelPriority::Low,
            Priority::Normal => ModelPriority::Normal,
            Priority::High => ModelPriority::High,
            Priority::Critical => ModelPriority::Critical,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_manager = match &args.config {
        Some(path) => ConfigManager::from_file(path)?,
        None => ConfigManager::new()?,
    };
    let _guard = logging::init(&config_manager.settings().logging)?;

    let runtime = ModelRuntime::new(Arc::new(config_manager))?;

    match args.command {
        Command::Register { descriptor } => register(&runtime, descriptor).await,
        Command::List => list(&runtime).await,
        Command::Load { id, priority } => load(&runtime, &id, priority.map(Into::into)).await,
    }
}

async fn register(runtime: &ModelRuntime, path: PathBuf) -> Result<()> {
    let contents = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let descriptor: ModelDescriptor =
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;

    let id = descriptor.id.clone();
    runtime.register(descriptor).await?;
    println!("Registered {}", id);
    Ok(())
}

async fn list(runtime: &ModelRuntime) -> Result<()> {
    let models = runtime.list_models().await?;
    if models.is_empty() {
        println!("No models registered");
        return Ok(());
    }

    for model in models {
        let location = match &model.local_path {
            Some(path) if model.is_available_locally() => path.display().to_string(),
            _ => format!("{} url(s)", model.download_urls.len()),
        };
        println!(
            "{:<24} {:<12} {:>10}  {:?}  {}",
            model.id,
            model.format,
            format_bytes(model.memory_required),
            model.priority,
            location
        );
    }
    Ok(())
}

async fn load(runtime: &ModelRuntime, id: &str, priority: Option<ModelPriority>) -> Result<()> {
    let handle = runtime.acquire(id, priority);

    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")?
            .progress_chars("#>-"),
    );

    let mut updates = Box::pin(handle.updates());
    while let Some(snapshot) = updates.next().await {
        bar.set_position((snapshot.progress.fraction * 1000.0) as u64);
        let mut message = snapshot.state.to_string();
        if snapshot.state == LifecycleState::Downloading {
            message.push_str(&format!(" {}", format_bytes(snapshot.progress.bytes_downloaded)));
            if let Some(total) = snapshot.progress.bytes_total {
                message.push_str(&format!(" / {}", format_bytes(total)));
            }
            if let Some(eta) = snapshot.progress.eta {
                message.push_str(&format!(" (eta {})", format_duration(eta)));
            }
        }
        bar.set_message(message);
    }

    match handle.wait().await {
        Ok(model) => {
            bar.finish_with_message("Ready");
            println!(
                "Loaded {} with {} ({} admitted, {} mapped)",
                model.descriptor.id,
                model.adapter,
                format_bytes(model.memory_bytes),
                format_bytes(model.service.mapped_len())
            );
            runtime.unload_model(id);
            Ok(())
        }
        Err(error) => {
            bar.abandon_with_message("Failed");
            Err(error.into())
        }
    }
}
