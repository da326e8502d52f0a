//! MPV process detection, spawning and output draining.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPV executable not found")]
  NotFound,
  #[error("Failed to spawn MPV: {0}")]
  SpawnFailed(#[from] std::io::Error),
}

/// Default IPC socket/pipe path for MPV.
pub fn default_ipc_path() -> PathBuf {
  #[cfg(windows)]
  {
    PathBuf::from(r"\\.\pipe\mpv_test_socket")
  }
  #[cfg(not(windows))]
  {
    PathBuf::from("/tmp/mpv_test_socket")
  }
}

/// Find MPV executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  #[cfg(windows)]
  let common_paths: &[&str] = &[
    r"C:\Program Files\mpv\mpv.exe",
    r"C:\Program Files (x86)\mpv\mpv.exe",
    r"C:\mpv\mpv.exe",
  ];
  #[cfg(target_os = "macos")]
  let common_paths: &[&str] = &[
    "/usr/local/bin/mpv",
    "/opt/homebrew/bin/mpv",
    "/Applications/mpv.app/Contents/MacOS/mpv",
  ];
  #[cfg(not(any(windows, target_os = "macos")))]
  let common_paths: &[&str] = &["/usr/bin/mpv", "/usr/local/bin/mpv"];

  common_paths
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

/// Arguments MPV is launched with, in order.
pub fn player_args(socket: &Path, extra_args: &[String]) -> Vec<String> {
  let mut args = vec![
    format!("--input-ipc-server={}", socket.display()),
    "--idle=yes".to_string(),
    "--msg-level=all=v".to_string(),
    "--hwdec=auto".to_string(),
  ];
  args.extend(extra_args.iter().cloned());
  args
}

/// Spawn MPV with its IPC server at `socket`.
///
/// stdout and stderr are piped so the caller can drain them; the child is
/// killed if its handle is dropped.
pub fn spawn_mpv(
  mpv_path: Option<&Path>,
  socket: &Path,
  extra_args: &[String],
) -> Result<Child, ProcessError> {
  let mpv_exe = mpv_path
    .map(Path::to_path_buf)
    .or_else(find_mpv)
    .ok_or(ProcessError::NotFound)?;

  let args = player_args(socket, extra_args);
  log::info!("Spawning MPV: {:?} with args: {:?}", mpv_exe, args);

  let child = Command::new(&mpv_exe)
    .args(&args)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()?;

  log::info!("MPV started (pid: {:?})", child.id());
  Ok(child)
}

/// Log every line of `reader` with `prefix` until end-of-stream.
///
/// Returns the number of lines seen.
pub async fn drain_output<R>(reader: R, prefix: &str) -> usize
where
  R: AsyncRead + Unpin,
{
  let mut lines = BufReader::new(reader).lines();
  let mut count = 0;
  loop {
    match lines.next_line().await {
      Ok(Some(line)) => {
        count += 1;
        log::info!("{}: {}", prefix, line.trim_end());
      }
      Ok(None) => break,
      Err(e) => {
        log::warn!("{}: read error: {}", prefix, e);
        break;
      }
    }
  }
  log::debug!("{}: closed after {} lines", prefix, count);
  count
}

/// Remove the socket at `path` unless something is still listening on it.
///
/// A live socket belongs to another player; it is left alone.
pub fn cleanup_stale_ipc(path: &Path) {
  #[cfg(unix)]
  {
    if !path.exists() {
      return;
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
      log::warn!(
        "IPC socket {} is in use by another process, leaving it",
        path.display()
      );
      return;
    }
  }
  cleanup_ipc(path);
}

/// Remove a stale socket file left behind by a previous MPV.
pub fn cleanup_ipc(path: &Path) {
  #[cfg(not(windows))]
  {
    match std::fs::remove_file(path) {
      Ok(()) => log::debug!("Removed stale IPC socket {}", path.display()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => log::warn!("Could not remove IPC socket {}: {}", path.display(), e),
    }
  }
  // Windows named pipes are cleaned up automatically
  #[cfg(windows)]
  let _ = path;
}
