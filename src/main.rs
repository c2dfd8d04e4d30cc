//! Terminal front end for the assistant.
//! See lib.rs for the reusable library API.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};

use roro_ai::agent_core::conversation::PLACEHOLDER_TEXT;
use roro_ai::agent_core::{
    AssistantError, Endpoint, Orchestrator, PreferenceRecord, Resolution, SessionEvent,
    SqlitePreferenceStore, UnresolvedReason,
};
use roro_ai::inference::config::{self, StaticConfig};
use roro_ai::inference::types::{ChatMessage, VisibleFile};
use roro_ai::inference::{AiMode, FileSystemContext, HttpBackend, ModelConfig, ModelProvider};

/// Command-line options.
#[derive(Parser)]
#[command(name = "roro-ai", version, about = "Chat with a local or remote language model")]
struct Cli {
    /// Path to an assistant.yaml config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat on stdin/stdout. Ctrl-C cancels a running response.
    Chat {
        #[arg(long, value_enum, default_value_t = ModeArg::Qa)]
        mode: ModeArg,
        /// Pin a model by catalog id or backend model id (persisted)
        #[arg(long)]
        model: Option<String>,
        /// Custom endpoint for the selected provider (persisted)
        #[arg(long)]
        endpoint: Option<String>,
        /// Directory offered to the model as file-system context
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// List discovered and configured models
    Models {
        /// Ollama endpoint to query
        #[arg(long)]
        endpoint: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Qa,
    Agent,
}

impl From<ModeArg> for AiMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Qa => AiMode::Qa,
            ModeArg::Agent => AiMode::Agent,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_path = roro_ai::init_tracing().context("failed to initialize logging")?;

    let static_config = match &cli.config {
        Some(path) => config::load_static_config(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => config::load_or_default(&std::env::current_dir().context("cwd")?),
    };
    let backend = Arc::new(HttpBackend::new().context("failed to build HTTP client")?);

    match cli.command {
        Command::Models { endpoint } => list_models(&backend, &static_config, endpoint).await,
        Command::Chat {
            mode,
            model,
            endpoint,
            dir,
        } => {
            eprintln!("logging to {}", log_path.display());
            let options = ChatOptions {
                mode: mode.into(),
                model,
                endpoint,
                dir,
            };
            chat(backend, static_config, options).await
        }
    }
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// Discovered Ollama models plus hand-configured ones.
async fn build_catalog(
    backend: &HttpBackend,
    static_config: &StaticConfig,
    ollama_endpoint: Option<&str>,
) -> Vec<ModelConfig> {
    let endpoint = ollama_endpoint.or_else(|| static_config.endpoint_for(ModelProvider::Ollama));
    let mut models = match backend
        .list_ollama_models(endpoint, &static_config.sampling)
        .await
    {
        Ok(models) => models,
        Err(e) => {
            tracing::warn!(error = %e, "Ollama model discovery failed");
            Vec::new()
        }
    };
    models.extend(static_config.configured_models());
    models
}

async fn list_models(
    backend: &HttpBackend,
    static_config: &StaticConfig,
    endpoint: Option<String>,
) -> anyhow::Result<()> {
    let ollama_endpoint =
        endpoint.or_else(|| static_config.endpoint_for(ModelProvider::Ollama).map(String::from));

    for provider in ModelProvider::ALL
        .into_iter()
        .filter(ModelProvider::is_network_backed)
    {
        let endpoint = match provider {
            ModelProvider::Ollama => ollama_endpoint.as_deref(),
            other => static_config.endpoint_for(other),
        };
        let status = backend
            .provider_status(
                provider,
                endpoint,
                static_config.api_key_for(provider),
                &static_config.sampling,
            )
            .await;
        let state = if status.is_available { "up" } else { "down" };
        let detail = status
            .version
            .map(|v| format!(" (v{v})"))
            .or(status.error.map(|e| format!(" ({e})")))
            .unwrap_or_default();
        println!("{provider:<18} {state}{detail}");
    }

    let models = build_catalog(backend, static_config, ollama_endpoint.as_deref()).await;
    if models.is_empty() {
        println!("\nno models found");
        return Ok(());
    }

    println!();
    for m in &models {
        let size = m
            .size_bytes
            .map(|b| format!("{:.1} GB", b as f64 / 1_073_741_824.0))
            .unwrap_or_else(|| "-".into());
        let modes: Vec<&str> = m.recommended_for.iter().map(AiMode::as_str).collect();
        println!("{:<40} {:<18} {:>8}  {}", m.id, m.provider, size, modes.join(","));
    }
    Ok(())
}

// ─── Chat ────────────────────────────────────────────────────────────────────

struct ChatOptions {
    mode: AiMode,
    model: Option<String>,
    endpoint: Option<String>,
    dir: Option<PathBuf>,
}

async fn chat(
    backend: Arc<HttpBackend>,
    static_config: StaticConfig,
    options: ChatOptions,
) -> anyhow::Result<()> {
    let db_path = roro_ai::preferences_db_path().context("failed to create data directory")?;
    let store = Arc::new(
        SqlitePreferenceStore::open(&db_path).context("failed to open preference store")?,
    );

    let persisted = PreferenceRecord::load(store.as_ref(), options.mode);
    let ollama_endpoint = options
        .endpoint
        .clone()
        .or_else(|| persisted.endpoint_for(ModelProvider::Ollama).map(String::from));
    let models = build_catalog(&backend, &static_config, ollama_endpoint.as_deref()).await;

    let orch = Arc::new(Orchestrator::new(
        backend,
        store,
        static_config,
        models,
        options.mode,
    ));

    if let Some(model) = &options.model {
        orch.select_model(model)?;
    }
    if let Some(url) = &options.endpoint {
        if let Some(provider) = orch.resolution().selection().map(|s| s.provider) {
            orch.set_provider_endpoint(provider, Some(url))?;
        }
    }
    describe(&orch.resolution(), orch.mode());

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                orch.clear_conversation()?;
                continue;
            }
            "/mode qa" | "/mode agent" => {
                let mode = if line.ends_with("agent") { AiMode::Agent } else { AiMode::Qa };
                describe(&orch.change_mode(mode), mode);
                continue;
            }
            _ => {}
        }

        let fs_context = match &options.dir {
            Some(dir) => Some(directory_context(dir)?),
            None => None,
        };
        run_turn(&orch, line.to_string(), fs_context).await?;
    }

    Ok(())
}

/// Send one message, streaming the reply to stdout.
async fn run_turn(
    orch: &Arc<Orchestrator>,
    text: String,
    fs_context: Option<FileSystemContext>,
) -> anyhow::Result<()> {
    let mut events = orch.subscribe();
    let mut send = tokio::spawn({
        let orch = orch.clone();
        async move { orch.send(&text, fs_context).await }
    });

    let mut printed = String::new();
    let mut tools_reported = 0;
    let result = loop {
        tokio::select! {
            joined = &mut send => break joined.context("send task failed")?,
            _ = tokio::signal::ctrl_c() => {
                orch.cancel().await;
            }
            event = events.recv() => {
                if let Ok(SessionEvent::MessageUpdated { message, .. }) = event {
                    print_preview(&mut printed, &message)?;
                    tools_reported = report_tools(tools_reported, &message);
                }
            }
        }
    };

    match result {
        Ok(message) => {
            if message.content != printed {
                if !printed.is_empty() {
                    println!("\n---");
                }
                print!("{}", message.content);
            }
            println!();
        }
        Err(e) if e.is_cancellation() => eprintln!("\n(cancelled)"),
        Err(e) => eprintln!("\n{}", e.user_summary()),
    }
    Ok(())
}

fn print_preview(printed: &mut String, message: &ChatMessage) -> std::io::Result<()> {
    if !message.is_streaming() || message.content == PLACEHOLDER_TEXT {
        return Ok(());
    }
    if let Some(delta) = message.content.strip_prefix(printed.as_str()) {
        print!("{delta}");
        std::io::stdout().flush()?;
        *printed = message.content.clone();
    }
    Ok(())
}

/// Report newly finished tools on stderr; returns how many have been reported.
fn report_tools(already: usize, message: &ChatMessage) -> usize {
    let finished: Vec<_> = message
        .tool_executions
        .iter()
        .flatten()
        .filter(|t| t.status.is_terminal())
        .collect();
    for tool in finished.iter().skip(already) {
        let elapsed = tool.execution_time_ms.unwrap_or_default();
        match AssistantError::from_tool(tool) {
            Some(failure) => eprintln!("\n[{} ({elapsed} ms)]", failure.user_summary()),
            None => eprintln!("\n[{} ok in {elapsed} ms]", tool.tool_name),
        }
    }
    finished.len().max(already)
}

fn describe(resolution: &Resolution, mode: AiMode) {
    match resolution {
        Resolution::Resolved(sel) => {
            let endpoint = match &sel.endpoint {
                Endpoint::NotRequired => "in-process".to_string(),
                Endpoint::Url { url, .. } => url.clone(),
                Endpoint::Unresolved => "no endpoint configured".to_string(),
            };
            eprintln!("{mode} mode: {} via {} ({endpoint})", sel.model.id, sel.provider);
        }
        Resolution::Unresolved(UnresolvedReason::EmptyCatalog) => {
            eprintln!("{mode} mode: no models available; start Ollama or configure a provider");
        }
        Resolution::Unresolved(UnresolvedReason::NoCandidate) => {
            eprintln!("{mode} mode: no usable model; pick one with --model");
        }
    }
}

/// Shallow listing of `dir` for the model's context.
fn directory_context(dir: &Path) -> anyhow::Result<FileSystemContext> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("cannot read {}", dir.display()))?;

    let mut visible = Vec::new();
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        visible.push(VisibleFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path().to_string_lossy().into_owned(),
            size: meta.len(),
            is_dir: meta.is_dir(),
            file_count: None,
        });
    }
    visible.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(FileSystemContext {
        current_path: dir.to_string_lossy().into_owned(),
        selected_paths: vec![],
        visible_files: Some(visible),
        scan_data: None,
    })
}
