pub mod agent_core;
pub mod config;
pub mod frontends;
pub mod inference;
pub mod tools;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use agent_core::{
    ConversationLoop, ConversationStore, LoopSettings, PromptAssembler, TokenBudgeter,
    ToolDispatcher,
};
use config::AppConfig;
use frontends::gateway::{run_json_lines, Gateway};
use inference::client::{GatedBackend, HttpBackend, ModelBackend};
use tools::ToolRegistry;

/// Command line.
#[derive(Debug, Parser)]
#[command(name = "toolchat", version, about = "Local-LLM chat bot with tools")]
pub struct Cli {
    /// YAML config file. A missing file means defaults.
    #[arg(long, env = "TOOLCHAT_CONFIG", default_value = "config/config.yaml")]
    pub config: PathBuf,

    /// Front-end to run. Overrides `gateway.enabled`.
    #[arg(long, value_enum)]
    pub interface: Option<Interface>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Interface {
    Console,
    Gateway,
}

/// Return the platform-standard data directory for toolchat.
///
/// - macOS: `~/Library/Application Support/toolchat/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolchat\`
/// - Linux: `$XDG_DATA_HOME/toolchat/` (fallback `~/.local/share/toolchat/`)
///
/// Falls back to `~/.toolchat/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolchat");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolchat")
}

/// Initialize the tracing subscriber, writing to `<log_dir>/toolchat.log`.
///
/// On each startup:
/// 1. Rotates existing logs (toolchat.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh toolchat.log with a line-flushing writer.
/// 3. Logs a startup banner with the paths in use.
///
/// Nothing is written to stdout; the console owns it.
fn init_tracing(log_dir: &Path, json: bool) -> anyhow::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;

    let log_path = log_dir.join("toolchat.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolchat=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir().display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolchat starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `toolchat.log` → `toolchat.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Wire the components from `config` into a ready conversation loop.
pub fn build_conversation_loop(
    config: &AppConfig,
    db_path: &Path,
) -> anyhow::Result<ConversationLoop> {
    let registry = Arc::new(
        ToolRegistry::from_config(&config.tools).context("failed to build the tool registry")?,
    );
    tracing::info!(
        tools = ?registry.names(),
        tools_enabled = config.tools.enabled,
        "tool registry ready"
    );

    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = ConversationStore::open(&db_path.to_string_lossy(), TokenBudgeter::default())
        .with_context(|| format!("failed to open history at {}", db_path.display()))?;

    let http = HttpBackend::from_config(&config.llm).context("invalid llm configuration")?;
    let backend: Arc<dyn ModelBackend> = Arc::new(GatedBackend::new(
        Arc::new(http),
        Duration::from_secs(config.llm.timeout_secs),
    ));

    let assembler = PromptAssembler::new(
        TokenBudgeter::default(),
        config.llm.context_limit,
        config.llm.reserved_for_response,
        &registry,
    )?;

    let chat = ConversationLoop::new(
        Arc::new(store),
        backend,
        ToolDispatcher::new(registry),
        assembler,
        LoopSettings {
            max_tool_iterations: config.agent.max_tool_iterations,
            tools_enabled: config.tools.enabled,
        },
    )?;
    Ok(chat)
}

/// Load config, initialize logging and run the selected front-end.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let loaded = config::load_config(&cli.config)?;
    let base_dir = loaded.base_dir().map(Path::to_path_buf);
    let mut config = loaded.config;
    if let Some(interface) = cli.interface {
        config.gateway.enabled = interface == Interface::Gateway;
    }
    config.validate()?;

    let data_dir = data_dir();
    let log_dir = config.log_dir(base_dir.as_deref(), &data_dir);
    init_tracing(&log_dir, config.logging.json)?;

    match &loaded.source {
        Some(path) => tracing::info!(path = %path.display(), "config loaded"),
        None => tracing::warn!(
            path = %cli.config.display(),
            "config file not found; using defaults"
        ),
    }

    let db_path = config.memory_path(base_dir.as_deref(), &data_dir);
    let chat = build_conversation_loop(&config, &db_path)?;
    tracing::info!(
        model = %chat.model_name(),
        db = %db_path.display(),
        gateway = config.gateway.enabled,
        "conversation loop ready"
    );

    if config.gateway.enabled {
        let gateway = Arc::new(Gateway::new(
            Arc::new(chat),
            &config.gateway,
            config.agent.gateway_preamble.clone(),
        ));
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        run_json_lines(gateway, stdin, tokio::io::stdout())
            .await
            .context("gateway bridge failed")?;
    } else {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        frontends::run_console(&chat, &config.agent.console_preamble, stdin, tokio::io::stdout())
            .await
            .context("console failed")?;
    }

    tracing::info!("toolchat shutting down");
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
