//! Command-line front end: argument parsing and the `serve`, `timer`,
//! `caches` and `init-config` commands.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheStorage, DiskStorage, MemoryStorage};
use crate::config::{ShellConfig, TimerConfig};
use crate::error::{Error, Result};
use crate::messages::TimerCommand;
use crate::timer::spawn_timer;

/// What to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the host server.
    Serve,
    /// Run the timer over stdin/stdout.
    Timer,
    /// List caches in storage.
    Caches,
    /// Write a default config file.
    InitConfig,
    /// Print usage.
    Help,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// Command to run.
    pub command: Command,
    /// Config file; the default location when absent.
    pub config_path: Option<PathBuf>,
    /// Overrides `scope`.
    pub scope: Option<String>,
    /// Overrides `server.port`.
    pub port: Option<u16>,
    /// Overrides `cache_version`.
    pub cache_version: Option<u32>,
    /// Overrides `storage_dir`.
    pub storage_dir: Option<PathBuf>,
    /// Use the default on-disk storage directory.
    pub persist: bool,
}

/// Usage text.
pub const USAGE: &str = "\
Usage: appshell <COMMAND> [OPTIONS]

Commands:
  serve               Run the caching proxy in front of the app's origin
  timer               Run the background timer over stdin/stdout (JSON lines)
  caches              List cache generations in the storage directory
  init-config         Write a default config file

Options:
  -c, --config <PATH>     Config file (default: platform config dir)
  -s, --scope <URL>       App origin and base path
  -p, --port <PORT>       Server port
  -v, --version <N>       Cache version
  -d, --storage <DIR>     Keep caches on disk under DIR
      --persist           Keep caches on disk in the default directory
  -h, --help              Show this help

The timer keeps running after stdin closes until interrupted.";

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| Error::Config(format!("{flag} requires a value")))
}

fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Config(format!("{flag}: invalid number {raw}")))
}

/// Parses arguments (without the program name).
///
/// # Errors
///
/// Returns [`Error::Config`] for unknown options, unknown commands, or
/// options missing their value.
pub fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut parsed = CliArgs {
        command: Command::Help,
        config_path: None,
        scope: None,
        port: None,
        cache_version: None,
        storage_dir: None,
        persist: false,
    };
    let mut command = None;

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "-c" | "--config" => {
                i += 1;
                parsed.config_path = Some(PathBuf::from(value(args, i, flag)?));
            }
            "-s" | "--scope" => {
                i += 1;
                parsed.scope = Some(value(args, i, flag)?.to_string());
            }
            "-p" | "--port" => {
                i += 1;
                parsed.port = Some(number(value(args, i, flag)?, flag)?);
            }
            "-v" | "--version" => {
                i += 1;
                parsed.cache_version = Some(number(value(args, i, flag)?, flag)?);
            }
            "-d" | "--storage" => {
                i += 1;
                parsed.storage_dir = Some(PathBuf::from(value(args, i, flag)?));
            }
            "--persist" => parsed.persist = true,
            "-h" | "--help" => return Ok(parsed),
            arg if !arg.starts_with('-') && command.is_none() => {
                command = Some(match arg {
                    "serve" => Command::Serve,
                    "timer" => Command::Timer,
                    "caches" => Command::Caches,
                    "init-config" => Command::InitConfig,
                    other => return Err(Error::Config(format!("unknown command: {other}"))),
                });
            }
            other => return Err(Error::Config(format!("unknown option: {other}"))),
        }
        i += 1;
    }

    parsed.command = command.unwrap_or(Command::Help);
    Ok(parsed)
}

impl CliArgs {
    /// Config file location.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config_path.clone().unwrap_or_else(ShellConfig::default_path)
    }

    /// Applies command-line overrides on top of a loaded config.
    #[must_use]
    pub fn apply(&self, mut config: ShellConfig) -> ShellConfig {
        if let Some(scope) = &self.scope {
            config.scope.clone_from(scope);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(version) = self.cache_version {
            config.cache_version = version;
        }
        if let Some(dir) = &self.storage_dir {
            config.storage_dir = Some(dir.clone());
        } else if self.persist && config.storage_dir.is_none() {
            config.storage_dir = Some(ShellConfig::default_storage_dir());
        }
        config
    }
}

/// Opens the configured storage: on disk when a directory is set, otherwise in memory.
///
/// # Errors
///
/// Returns an error if the storage directory cannot be created.
pub async fn open_storage(config: &ShellConfig) -> Result<Arc<dyn CacheStorage>> {
    match &config.storage_dir {
        Some(dir) => {
            log::info!("Caches stored under {}", dir.display());
            Ok(Arc::new(DiskStorage::new(dir).await?))
        }
        None => {
            log::info!("Caches kept in memory");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

/// One line of the `caches` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSummary {
    /// Cache name.
    pub name: String,
    /// Number of stored responses.
    pub entries: usize,
    /// Whether this is the generation the current config owns.
    pub current: bool,
}

/// Summarises every cache in `storage`.
///
/// # Errors
///
/// Returns an error if the storage cannot be listed.
pub async fn list_caches(storage: &dyn CacheStorage, current: &str) -> Result<Vec<CacheSummary>> {
    let mut summaries = Vec::new();
    for name in storage.keys().await? {
        let entries = storage.entry_count(&name).await?;
        summaries.push(CacheSummary {
            current: name == current,
            name,
            entries,
        });
    }
    Ok(summaries)
}

/// Runs the timer over a line-oriented stream: [`TimerCommand`] JSON lines in,
/// event JSON lines out. Blank and malformed lines are skipped. Runs until
/// `shutdown` fires.
///
/// # Errors
///
/// Returns an error if reading input or writing output fails.
pub async fn run_timer_stdio<R, W>(
    config: TimerConfig,
    input: R,
    mut output: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (timer, mut events) = spawn_timer(config, shutdown.child_token());
    let mut lines = input.lines();
    let mut input_open = true;

    let outcome = loop {
        tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match TimerCommand::parse(&line) {
                    Some(command) => {
                        if let Err(e) = timer.send(command) {
                            break Err(e);
                        }
                    }
                    None => log::debug!("Ignoring malformed timer command: {line}"),
                },
                Ok(None) => {
                    log::debug!("Timer input closed");
                    input_open = false;
                }
                Err(e) => break Err(e.into()),
            },
            event = events.recv() => {
                let Some(event) = event else { break Ok(()) };
                let mut line = match serde_json::to_vec(&event) {
                    Ok(line) => line,
                    Err(e) => break Err(e.into()),
                };
                line.push(b'\n');
                if let Err(e) = output.write_all(&line).await {
                    break Err(e.into());
                }
                if let Err(e) = output.flush().await {
                    break Err(e.into());
                }
            }
        }
    };

    timer.shutdown().await;
    outcome
}

fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received SIGINT");
        }
        token.cancel();
    });
}

/// Runs the parsed command.
///
/// # Errors
///
/// Returns an error if the config cannot be loaded or the command fails.
pub async fn run(args: CliArgs) -> Result<()> {
    if args.command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let config_path = args.config_path();

    if args.command == Command::InitConfig {
        if config_path.exists() {
            println!("Config already exists at {}", config_path.display());
        } else {
            args.apply(ShellConfig::default()).save(&config_path)?;
            println!("Wrote default config to {}", config_path.display());
        }
        return Ok(());
    }

    let config = args.apply(ShellConfig::load_or_default(&config_path)?);
    config.validate()?;

    match args.command {
        Command::Serve => serve(config).await,
        Command::Timer => {
            let shutdown = CancellationToken::new();
            cancel_on_ctrl_c(&shutdown);
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            run_timer_stdio(config.timer, stdin, tokio::io::stdout(), shutdown).await
        }
        Command::Caches => {
            let mut config = config;
            if config.storage_dir.is_none() {
                config.storage_dir = Some(ShellConfig::default_storage_dir());
            }
            let storage = open_storage(&config).await?;
            let summaries = list_caches(storage.as_ref(), &config.cache_name()).await?;
            if summaries.is_empty() {
                println!("No caches.");
            }
            for summary in summaries {
                let marker = if summary.current { "*" } else { " " };
                println!("{marker} {:<32} {:>6} entries", summary.name, summary.entries);
            }
            Ok(())
        }
        Command::InitConfig | Command::Help => Ok(()),
    }
}

#[cfg(feature = "server")]
async fn serve(config: ShellConfig) -> Result<()> {
    let storage = open_storage(&config).await?;
    crate::server::serve(config, storage).await
}

#[cfg(not(feature = "server"))]
async fn serve(_config: ShellConfig) -> Result<()> {
    Err(Error::Config("server support not compiled in".to_string()))
}
