use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use mpv_supervisor::{init_logging, ConfigError, Supervisor, SupervisorConfig};

const DEFAULT_URL: &str = "http://vjs.zencdn.net/v/oceans.mp4";

/// Start MPV, play one URL over its IPC socket and log what happens.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Media file or URL to play
  #[arg(value_name = "URL", default_value = DEFAULT_URL)]
  url: String,

  /// Config file (defaults to <config dir>/mpv-supervisor/config.json if present)
  #[arg(short = 'c', long = "config", value_name = "FILE")]
  config: Option<PathBuf>,

  /// MPV executable (overrides config and auto-detection)
  #[arg(long = "mpv", value_name = "PATH")]
  mpv: Option<PathBuf>,

  /// IPC socket path (overrides config)
  #[arg(short = 's', long = "socket", value_name = "PATH")]
  socket: Option<PathBuf>,

  /// Seconds to keep watching after the play command
  #[arg(short = 'w', long = "watch", value_name = "SECS", default_value_t = 30)]
  watch: u64,
}

/// Apply command-line overrides, then validate the merged config.
fn apply_overrides(
  mut config: SupervisorConfig,
  args: &Args,
) -> Result<SupervisorConfig, ConfigError> {
  if let Some(mpv) = &args.mpv {
    config.mpv_path = Some(mpv.clone());
  }
  if let Some(socket) = &args.socket {
    config.socket_path = socket.clone();
  }
  config.validate()?;
  Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
  init_logging();
  let args = Args::parse();

  let config = match &args.config {
    Some(path) => SupervisorConfig::load(path),
    None => SupervisorConfig::load_or_default(),
  };
  let config = match config.and_then(|config| apply_overrides(config, &args)) {
    Ok(config) => config,
    Err(e) => {
      log::error!("{}", e);
      return ExitCode::FAILURE;
    }
  };

  let supervisor = Supervisor::new(config);
  if let Err(e) = supervisor.start() {
    log::error!("MPV failed to start: {}", e);
    return ExitCode::FAILURE;
  }

  // Give MPV time to create its socket
  if !supervisor.wait_connected(Duration::from_secs(3)).await {
    log::warn!("Still waiting for the IPC connection");
  }

  log::info!("Trying to play: {}", args.url);
  if let Err(e) = supervisor.play(&args.url).await {
    log::error!("Play command failed: {}", e);
  }

  tokio::select! {
    _ = tokio::time::sleep(Duration::from_secs(args.watch)) => {}
    _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
  }

  supervisor.stop().await;
  ExitCode::SUCCESS
}
