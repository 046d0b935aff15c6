use crate::agent::LlmSettings;
use clap::{Parser, ValueEnum};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Default system prompt of the LLM-backed assistant.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Address to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Seconds a suspended run may wait for an answer
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub runs: RunsConfig,
    pub agents: AgentsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8123,
            host: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunsConfig {
    /// Suspended runs unanswered this long are failed; terminal runs are
    /// forgotten after the same window.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Agent turns allowed per run before it completes.
    pub max_turns: usize,
    /// Envelopes buffered per stream before the driver waits for the reader.
    pub stream_buffer: usize,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
            max_turns: 12,
            stream_buffer: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentsConfig {
    /// A human answer containing this text ends a human-in-the-loop run.
    pub termination_phrase: String,
    /// `last_agent_message`, `agent_prompt`, or a fixed question.
    pub prompt_policy: String,
    /// When non-empty, answers must be one of these.
    pub approval_choices: Vec<String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            termination_phrase: "APPROVE".to_string(),
            prompt_policy: "last_agent_message".to_string(),
            approval_choices: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Layering, lowest to highest: defaults, config file, `HITL_` environment
    /// variables, command line.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 8123)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("runs.idle_timeout_secs", 1800)?
            .set_default("runs.sweep_interval_secs", 60)?
            .set_default("runs.max_turns", 12)?
            .set_default("runs.stream_buffer", 64)?
            .set_default("agents.termination_phrase", "APPROVE")?
            .set_default("agents.prompt_policy", "last_agent_message")?
            .set_default("log.format", LogFormat::Pretty.as_str())?;

        // An explicit file must exist; ./config.{yaml,toml,json} is optional.
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path).required(true)),
            None => builder.add_source(File::with_name("config").required(false)),
        };

        // E.g. HITL_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("HITL")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("agents.approval_choices")
                .try_parsing(true),
        );

        if let Some(host) = cli.host {
            builder = builder.set_override("server.host", host)?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(secs) = cli.idle_timeout_secs {
            builder = builder.set_override("runs.idle_timeout_secs", i64::try_from(secs).unwrap_or(i64::MAX))?;
        }
        if let Some(format) = cli.log_format {
            builder = builder.set_override("log.format", format.as_str())?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }
}

/// LLM settings from `LLM_*` environment variables.
///
/// `Ok(None)` when `LLM_BASE_URL` is unset; the LLM-backed selectors are then
/// not registered.
pub fn load_llm_settings() -> Result<Option<LlmSettings>, String> {
    let Some(base_url) = std::env::var("LLM_BASE_URL")
        .ok()
        .filter(|s| !s.trim().is_empty())
    else {
        return Ok(None);
    };

    let model = std::env::var("LLM_MODEL")
        .map_err(|_| "Missing required env var: LLM_MODEL".to_string())?;
    if model.trim().is_empty() {
        return Err("LLM_MODEL cannot be empty".to_string());
    }

    let api_key = std::env::var("LLM_API_KEY")
        .ok()
        .filter(|s| !s.trim().is_empty());

    let system_prompt = std::env::var("LLM_SYSTEM_PROMPT")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    Ok(Some(LlmSettings {
        base_url,
        api_key,
        model,
        system_prompt,
    }))
}
