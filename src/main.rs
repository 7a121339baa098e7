use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use openmux::providers::types::{MAX_NEW_TOKENS, TEMPERATURE, TOP_P};
use openmux::providers::{self, GenerationParams, HuggingFaceProvider};
use openmux::{GenerationRequest, Provider, Settings, TaskType};

#[derive(Parser)]
#[command(name = "openmux", version = openmux::VERSION, about = "Route a query to an LLM provider")]
struct Cli {
    /// TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Task type: chat, code or embeddings
    #[arg(long, default_value = "chat")]
    task: TaskType,

    /// Use this model for every task
    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    max_new_tokens: Option<u32>,

    #[arg(long)]
    temperature: Option<f64>,

    #[arg(long)]
    top_p: Option<f64>,

    /// Query text. Omit to start an interactive session.
    query: Vec<String>,
}

impl Cli {
    fn params(&self) -> GenerationParams {
        let mut params = GenerationParams::new();
        if let Some(n) = self.max_new_tokens {
            params.insert(MAX_NEW_TOKENS, n);
        }
        if let Some(t) = self.temperature {
            params.insert(TEMPERATURE, t);
        }
        if let Some(p) = self.top_p {
            params.insert(TOP_P, p);
        }
        params
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("openmux=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let mut config = settings.huggingface.provider_config();
    if let Some(model) = &cli.model {
        config = config.with_model_override(model.clone());
    }

    let candidates: Vec<Arc<dyn Provider>> = vec![Arc::new(HuggingFaceProvider::huggingface(
        config,
        settings.huggingface.connector(),
        settings.pool,
    ))];

    let params = cli.params();
    let result = if cli.query.is_empty() {
        interactive(&candidates, cli.task, &params).await
    } else {
        let query = cli.query.join(" ");
        let output = run_query(&candidates, query, cli.task, &params).await?;
        println!("{output}");
        Ok(())
    };

    for provider in &candidates {
        provider.close();
    }
    result
}

async fn run_query(
    candidates: &[Arc<dyn Provider>],
    query: String,
    task: TaskType,
    params: &GenerationParams,
) -> Result<String> {
    let provider = providers::select(candidates, task).ok_or_else(|| {
        anyhow!("no available provider for task '{task}' (is the API token set?)")
    })?;

    let request = GenerationRequest::new(query, task).with_params(params.clone());
    let output = provider
        .generate(request)
        .await
        .with_context(|| format!("{} failed", provider.name()))?;
    Ok(output.to_string())
}

async fn interactive(
    candidates: &[Arc<dyn Provider>],
    task: TaskType,
    params: &GenerationParams,
) -> Result<()> {
    let mut editor = DefaultEditor::new()?;
    println!("openmux {} ({task}). Type 'exit' or Ctrl-D to quit.", openmux::VERSION);

    loop {
        let line = match tokio::task::block_in_place(|| editor.readline("openmux> ")) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };

        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query == "exit" {
            break;
        }
        if let Err(e) = editor.add_history_entry(query) {
            tracing::debug!(error = %e, "could not record history entry");
        }

        // A failed request ends that request only.
        match run_query(candidates, query.to_owned(), task, params).await {
            Ok(output) => println!("{output}"),
            Err(e) => eprintln!("error: {e:#}"),
        }
    }

    Ok(())
}
