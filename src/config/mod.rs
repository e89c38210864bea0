//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "ciak";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3001;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SCRATCH_DIR: &str = "temp";
const DEFAULT_OUTPUT_DIR: &str = "generated_videos";
const DEFAULT_ARTIFACT_EXTENSION: &str = "mp4";
const DEFAULT_RENDER_COMMAND: &str = "python";
const DEFAULT_RENDER_ARGS: &[&str] = &["-m", "manim"];
const DEFAULT_QUALITY_ARGS: &[&str] = &["-pql"];
const DEFAULT_CHECK_COMMAND: &str = "python";
const DEFAULT_CHECK_ARGS: &[&str] = &["-m", "py_compile"];
const DEFAULT_RENDER_TIMEOUT_SECS: u64 = 300;

/// Command-line arguments for the ciak binary.
#[derive(Debug, Parser)]
#[command(name = "ciak", version, about = "ciak render bridge")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CIAK_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the ciak HTTP service.
    Serve(Box<ServeArgs>),
    /// Repair and compile-check a scene file without rendering it.
    Check(CheckArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct CheckArgs {
    /// Scene file to repair and validate.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Write the repaired text back to the file.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub write: bool,

    #[command(flatten)]
    pub toolchain: ToolchainOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ToolchainOverrides {
    /// Override the render toolchain executable.
    #[arg(long = "toolchain-render-command", value_name = "COMMAND")]
    pub render_command: Option<String>,

    /// Override the compile-check executable.
    #[arg(long = "toolchain-check-command", value_name = "COMMAND")]
    pub check_command: Option<String>,

    /// Override the render timeout in seconds.
    #[arg(long = "toolchain-render-timeout-seconds", value_name = "SECONDS")]
    pub render_timeout_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub toolchain: ToolchainOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the public base URL used in artifact links.
    #[arg(long = "server-public-url", value_name = "URL")]
    pub public_url: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the scratch directory holding in-flight scene sources.
    #[arg(long = "workspace-scratch-dir", value_name = "PATH")]
    pub scratch_dir: Option<PathBuf>,

    /// Override the output directory the toolchain renders into.
    #[arg(long = "workspace-output-dir", value_name = "PATH")]
    pub output_dir: Option<PathBuf>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub toolchain: ToolchainSettings,
    pub workspace: WorkspaceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct ToolchainSettings {
    pub render_command: String,
    pub render_args: Vec<String>,
    pub quality_args: Vec<String>,
    pub check_command: String,
    pub check_args: Vec<String>,
    pub render_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub scratch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub artifact_extension: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse the command line and load settings with the configured precedence.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("CIAK").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Check(args)) => raw.apply_toolchain_overrides(&args.toolchain),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    toolchain: RawToolchainSettings,
    workspace: RawWorkspaceSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    public_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawToolchainSettings {
    render_command: Option<String>,
    render_args: Option<Vec<String>>,
    quality_args: Option<Vec<String>>,
    check_command: Option<String>,
    check_args: Option<Vec<String>>,
    render_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkspaceSettings {
    scratch_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    artifact_extension: Option<String>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(url) = overrides.public_url.as_ref() {
            self.server.public_url = Some(url.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(dir) = overrides.scratch_dir.as_ref() {
            self.workspace.scratch_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.output_dir.as_ref() {
            self.workspace.output_dir = Some(dir.clone());
        }

        self.apply_toolchain_overrides(&overrides.toolchain);
    }

    fn apply_toolchain_overrides(&mut self, overrides: &ToolchainOverrides) {
        if let Some(command) = overrides.render_command.as_ref() {
            self.toolchain.render_command = Some(command.clone());
        }
        if let Some(command) = overrides.check_command.as_ref() {
            self.toolchain.check_command = Some(command.clone());
        }
        if let Some(seconds) = overrides.render_timeout_seconds {
            self.toolchain.render_timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let host = raw.server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = raw.server.port.unwrap_or(DEFAULT_PORT);
        let addr = format!("{host}:{port}")
            .parse::<SocketAddr>()
            .map_err(|err| LoadError::invalid("server.host", err.to_string()))?;

        let level_text = raw
            .logging
            .level
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        let level = LevelFilter::from_str(&level_text)
            .map_err(|err| LoadError::invalid("logging.level", err.to_string()))?;
        let format = if raw.logging.json.unwrap_or(false) {
            LogFormat::Json
        } else {
            LogFormat::Compact
        };

        let timeout_seconds = raw
            .toolchain
            .render_timeout_seconds
            .unwrap_or(DEFAULT_RENDER_TIMEOUT_SECS);
        if timeout_seconds == 0 {
            return Err(LoadError::invalid(
                "toolchain.render_timeout_seconds",
                "timeout must be at least one second",
            ));
        }

        let artifact_extension = raw
            .workspace
            .artifact_extension
            .unwrap_or_else(|| DEFAULT_ARTIFACT_EXTENSION.to_string());
        let artifact_extension = artifact_extension.trim_start_matches('.').to_string();
        if artifact_extension.is_empty() {
            return Err(LoadError::invalid(
                "workspace.artifact_extension",
                "extension must not be empty",
            ));
        }

        Ok(Settings {
            server: ServerSettings {
                addr,
                public_url: raw.server.public_url,
            },
            logging: LoggingSettings { level, format },
            toolchain: ToolchainSettings {
                render_command: raw
                    .toolchain
                    .render_command
                    .unwrap_or_else(|| DEFAULT_RENDER_COMMAND.to_string()),
                render_args: raw
                    .toolchain
                    .render_args
                    .unwrap_or_else(|| to_owned_args(DEFAULT_RENDER_ARGS)),
                quality_args: raw
                    .toolchain
                    .quality_args
                    .unwrap_or_else(|| to_owned_args(DEFAULT_QUALITY_ARGS)),
                check_command: raw
                    .toolchain
                    .check_command
                    .unwrap_or_else(|| DEFAULT_CHECK_COMMAND.to_string()),
                check_args: raw
                    .toolchain
                    .check_args
                    .unwrap_or_else(|| to_owned_args(DEFAULT_CHECK_ARGS)),
                render_timeout: Duration::from_secs(timeout_seconds),
            },
            workspace: WorkspaceSettings {
                scratch_dir: raw
                    .workspace
                    .scratch_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRATCH_DIR)),
                output_dir: raw
                    .workspace
                    .output_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
                artifact_extension,
            },
        })
    }
}

fn to_owned_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| (*arg).to_string()).collect()
}
