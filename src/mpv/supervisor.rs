//! Player supervisor: owns the MPV process and keeps its control channel alive.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ipc::{self, IpcError, MpvIpc};
use super::process::{cleanup_ipc, cleanup_stale_ipc, drain_output, spawn_mpv, ProcessError};
use super::protocol::{MpvEvent, MpvRequest, MpvResponse, PlayerCommand, RequestIds};
use crate::config::SupervisorConfig;

/// Events buffered for subscribers before new ones are dropped.
const EVENT_QUEUE: usize = 64;

#[derive(Error, Debug)]
pub enum SupervisorError {
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),
  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),
  #[error("MPV command failed: {0}")]
  CommandFailed(String),
  #[error("Not connected")]
  NotConnected,
  #[error("Supervisor already started")]
  AlreadyStarted,
  #[error("Supervisor stopped")]
  Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
  Idle,
  Running,
  Stopped,
}

/// State shared with the IPC loop.
struct Shared {
  config: SupervisorConfig,
  ids: RequestIds,
  connection: Mutex<Option<Arc<MpvIpc>>>,
  connected: watch::Sender<bool>,
  cancel: CancellationToken,
  events: async_channel::Sender<MpvEvent>,
}

impl Shared {
  async fn send_command(&self, command: PlayerCommand) -> Result<u64, SupervisorError> {
    if self.cancel.is_cancelled() {
      return Err(SupervisorError::Stopped);
    }

    // Id allocation and queueing happen under one lock so ids hit the wire in order.
    let (request_id, ack) = {
      let guard = self.connection.lock();
      let ipc = guard.as_ref().ok_or(SupervisorError::NotConnected)?;
      let request = MpvRequest::new(command, self.ids.next());
      (request.request_id, ipc.queue(&request))
    };

    let written = match ack {
      Ok(ack) => ack.wait().await,
      Err(e) => Err(e),
    };
    match written {
      Ok(()) => Ok(request_id),
      Err(e) => {
        log::error!("Failed to send command {}: {}", request_id, e);
        Err(e.into())
      }
    }
  }

  async fn request(&self, command: PlayerCommand) -> Result<MpvResponse, SupervisorError> {
    if self.cancel.is_cancelled() {
      return Err(SupervisorError::Stopped);
    }

    let (ipc, pending) = {
      let guard = self.connection.lock();
      let ipc = guard.as_ref().ok_or(SupervisorError::NotConnected)?.clone();
      let request = MpvRequest::new(command, self.ids.next());
      let pending = ipc.begin_request(&request)?;
      (ipc, pending)
    };

    let response = ipc
      .finish_request(pending, self.config.response_timeout())
      .await?;
    if !response.is_success() {
      return Err(SupervisorError::CommandFailed(response.error));
    }
    Ok(response)
  }

  /// Drop `ipc` if it is still the live connection and mark us disconnected.
  async fn disconnect(&self, ipc: &Arc<MpvIpc>) {
    {
      let mut guard = self.connection.lock();
      if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, ipc)) {
        guard.take();
      }
    }
    self.connected.send_replace(false);
    ipc.shutdown().await;
  }
}

/// Keep a control connection to MPV open until cancelled.
///
/// Each cycle makes a bounded number of connect attempts; when they all fail
/// the loop ends for good. A closed or broken connection clears the
/// connected flag and starts a new cycle after one retry interval.
async fn ipc_loop(shared: Arc<Shared>) {
  let config = &shared.config;
  let interval = config.retry_interval();

  while !shared.cancel.is_cancelled() {
    let stream = match ipc::connect(
      &config.socket_path,
      config.connect_attempts,
      interval,
      &shared.cancel,
    )
    .await
    {
      Ok(stream) => stream,
      Err(IpcError::Cancelled) => break,
      Err(e) => {
        log::error!("IPC connection failed, giving up: {}", e);
        break;
      }
    };

    log::info!("IPC connected to {}", config.socket_path.display());
    let (reader, writer) = tokio::io::split(stream);
    let conn = Arc::new(MpvIpc::new(writer));
    // The volume request takes the first id of this connection; readiness is
    // published only once it is queued.
    let volume = {
      let mut guard = shared.connection.lock();
      *guard = Some(conn.clone());
      let command = PlayerCommand::set_property("volume", config.initial_volume);
      conn.queue(&MpvRequest::new(command, shared.ids.next()))
    };
    let written = match volume {
      Ok(ack) => ack.wait().await,
      Err(e) => Err(e),
    };
    if let Err(e) = written {
      log::warn!("Initial volume not set: {}", e);
    }
    shared.connected.send_replace(true);

    let outcome = tokio::select! {
      _ = shared.cancel.cancelled() => None,
      result = ipc::read_loop(reader, &conn, &shared.events) => Some(result),
    };
    shared.disconnect(&conn).await;

    match outcome {
      None => break,
      Some(Ok(())) => log::warn!("MPV closed the control connection"),
      Some(Err(e)) => log::error!("Control connection lost: {}", e),
    }

    tokio::select! {
      _ = shared.cancel.cancelled() => break,
      _ = tokio::time::sleep(interval) => {}
    }
  }

  shared.connected.send_replace(false);
  log::info!("IPC loop finished");
}

/// Launches MPV and drives it over its JSON IPC socket.
///
/// Must be used from within a Tokio runtime.
pub struct Supervisor {
  shared: Arc<Shared>,
  lifecycle: Mutex<Lifecycle>,
  process: Mutex<Option<Child>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
  event_rx: Receiver<MpvEvent>,
}

impl Supervisor {
  pub fn new(config: SupervisorConfig) -> Self {
    let (connected, _) = watch::channel(false);
    let (events, event_rx) = async_channel::bounded(EVENT_QUEUE);

    Self {
      shared: Arc::new(Shared {
        config,
        ids: RequestIds::new(),
        connection: Mutex::new(None),
        connected,
        cancel: CancellationToken::new(),
        events,
      }),
      lifecycle: Mutex::new(Lifecycle::Idle),
      process: Mutex::new(None),
      tasks: Mutex::new(Vec::new()),
      event_rx,
    }
  }

  /// Spawn MPV and start the output drains and the IPC loop.
  ///
  /// Returns as soon as the tasks are running; use [`Supervisor::wait_connected`]
  /// to wait for the control channel.
  pub fn start(&self) -> Result<(), SupervisorError> {
    let mut lifecycle = self.lifecycle.lock();
    match *lifecycle {
      Lifecycle::Running => return Err(SupervisorError::AlreadyStarted),
      Lifecycle::Stopped => return Err(SupervisorError::Stopped),
      Lifecycle::Idle => {}
    }

    let config = &self.shared.config;
    cleanup_stale_ipc(&config.socket_path);

    let mut child = match spawn_mpv(
      config.mpv_path.as_deref(),
      &config.socket_path,
      &config.extra_args,
    ) {
      Ok(child) => child,
      Err(e) => {
        log::error!("Failed to start MPV: {}", e);
        return Err(e.into());
      }
    };

    let mut tasks = Vec::with_capacity(3);
    if let Some(stdout) = child.stdout.take() {
      tasks.push(tokio::spawn(async move {
        drain_output(stdout, "mpv stdout").await;
      }));
    }
    if let Some(stderr) = child.stderr.take() {
      tasks.push(tokio::spawn(async move {
        drain_output(stderr, "mpv stderr").await;
      }));
    }
    tasks.push(tokio::spawn(ipc_loop(self.shared.clone())));

    *self.process.lock() = Some(child);
    *self.tasks.lock() = tasks;
    *lifecycle = Lifecycle::Running;
    Ok(())
  }

  /// Send a command without waiting for MPV's reply. Returns its request id.
  pub async fn send_command(
    &self,
    command: impl Into<PlayerCommand>,
  ) -> Result<u64, SupervisorError> {
    self.shared.send_command(command.into()).await
  }

  /// Send a command and wait for the reply with the matching request id.
  pub async fn request(
    &self,
    command: impl Into<PlayerCommand>,
  ) -> Result<MpvResponse, SupervisorError> {
    self.shared.request(command.into()).await
  }

  /// Load `url` for playback, waiting a few retry intervals for the connection.
  pub async fn play(&self, url: &str) -> Result<u64, SupervisorError> {
    if *self.lifecycle.lock() == Lifecycle::Stopped {
      return Err(SupervisorError::Stopped);
    }

    let config = &self.shared.config;
    let wait = config.retry_interval() * config.play_wait_attempts;
    if !self.wait_connected(wait).await {
      log::error!("Cannot play {}: IPC not connected", url);
      return Err(SupervisorError::NotConnected);
    }

    log::info!("Playing {}", url);
    self.send_command(PlayerCommand::loadfile(url)).await
  }

  /// Wait up to `timeout` for the control channel. False once stopped.
  pub async fn wait_connected(&self, timeout: Duration) -> bool {
    let mut rx = self.shared.connected.subscribe();
    tokio::select! {
      _ = self.shared.cancel.cancelled() => false,
      result = tokio::time::timeout(timeout, rx.wait_for(|connected| *connected)) => {
        matches!(result, Ok(Ok(_)))
      }
    }
  }

  pub fn is_connected(&self) -> bool {
    *self.shared.connected.borrow()
  }

  /// Receiver for MPV events (property changes, end-file, ...).
  pub fn events(&self) -> Receiver<MpvEvent> {
    self.event_rx.clone()
  }

  pub fn socket_path(&self) -> &Path {
    &self.shared.config.socket_path
  }

  /// Process id of the running player, if any.
  pub fn pid(&self) -> Option<u32> {
    self.process.lock().as_ref().and_then(Child::id)
  }

  /// Request id the next command will carry.
  pub fn next_request_id(&self) -> u64 {
    self.shared.ids.peek()
  }

  /// Stop MPV, close the control channel and wait for the background tasks.
  ///
  /// Idempotent. Tasks still running after the stop timeout are aborted.
  pub async fn stop(&self) {
    {
      let mut lifecycle = self.lifecycle.lock();
      if *lifecycle == Lifecycle::Stopped {
        return;
      }
      *lifecycle = Lifecycle::Stopped;
    }
    log::info!("Stopping MPV supervisor");

    self.shared.cancel.cancel();
    let conn = self.shared.connection.lock().take();
    if let Some(conn) = conn {
      log::info!("Closing IPC connection");
      conn.close();
    }
    self.shared.connected.send_replace(false);

    let timeout = self.shared.config.stop_timeout();
    let child = self.process.lock().take();
    if let Some(mut child) = child {
      log::info!("Killing MPV process (pid: {:?})", child.id());
      if let Err(e) = child.start_kill() {
        log::warn!("kill() failed: {}", e);
      }
      match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => log::info!("MPV process exited with: {}", status),
        Ok(Err(e)) => log::error!("wait() failed: {}", e),
        Err(_) => log::warn!("MPV did not exit within {:?}", timeout),
      }
    }

    let tasks = std::mem::take(&mut *self.tasks.lock());
    let deadline = tokio::time::Instant::now() + timeout;
    for mut task in tasks {
      match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Background task failed: {}", e),
        Err(_) => {
          log::warn!("Background task still running after {:?}, aborting", timeout);
          task.abort();
        }
      }
    }

    cleanup_ipc(&self.shared.config.socket_path);
    log::info!("MPV supervisor stopped");
  }
}

impl Drop for Supervisor {
  fn drop(&mut self) {
    self.shared.cancel.cancel();
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use serde_json::{json, Value};
  use std::path::PathBuf;
  use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
  use tokio::net::UnixListener;

  fn test_config(socket_path: PathBuf) -> SupervisorConfig {
    SupervisorConfig {
      // Ignores every argument and exits, standing in for MPV; the test
      // itself plays the IPC server.
      mpv_path: Some(PathBuf::from("true")),
      socket_path,
      retry_interval_ms: 50,
      play_wait_attempts: 5,
      response_timeout_ms: 1000,
      stop_timeout_ms: 1000,
      ..Default::default()
    }
  }

  async fn next_json<R: tokio::io::AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
      .await
      .expect("timed out waiting for a request")
      .unwrap()
      .expect("connection closed");
    serde_json::from_str(&line).unwrap()
  }

  /// Wait for the IPC loop, always the last task started, to return.
  async fn ipc_loop_finished(supervisor: &Supervisor) -> bool {
    for _ in 0..200 {
      if supervisor.tasks.lock().last().is_some_and(|task| task.is_finished()) {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  #[tokio::test]
  async fn test_missing_player_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path().join("mpv.sock"));
    config.mpv_path = Some(PathBuf::from("/nonexistent/bin/mpv"));
    let supervisor = Supervisor::new(config);

    let err = supervisor.start().unwrap_err();
    assert!(matches!(err, SupervisorError::Process(ProcessError::SpawnFailed(_))));
    assert!(supervisor.tasks.lock().is_empty());
    assert!(supervisor.pid().is_none());
    assert!(!supervisor.is_connected());
    assert!(!supervisor.wait_connected(Duration::from_millis(100)).await);
  }

  #[tokio::test]
  async fn test_play_without_connection_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path().join("mpv.sock"));
    config.retry_interval_ms = 10;
    let supervisor = Supervisor::new(config);
    supervisor.start().unwrap();

    let err = supervisor.play("http://example/video.mp4").await.unwrap_err();
    assert!(matches!(err, SupervisorError::NotConnected));
    assert_eq!(supervisor.next_request_id(), 0);

    supervisor.stop().await;
  }

  #[tokio::test]
  async fn test_play_sends_loadfile_after_volume() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mpv.sock");
    let supervisor = Supervisor::new(test_config(socket.clone()));
    supervisor.start().unwrap();

    let listener = UnixListener::bind(&socket).unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, _write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    assert_eq!(
      next_json(&mut lines).await,
      json!({"command": ["set_property", "volume", 100], "request_id": 0})
    );

    let id = supervisor.play("http://example/video.mp4").await.unwrap();
    assert_eq!(id, 1);
    assert_eq!(
      next_json(&mut lines).await,
      json!({"command": ["loadfile", "http://example/video.mp4"], "request_id": 1})
    );

    for expected in 2..5u64 {
      let id = supervisor
        .send_command(PlayerCommand::cycle("pause"))
        .await
        .unwrap();
      assert_eq!(id, expected);
      assert_eq!(next_json(&mut lines).await["request_id"], json!(expected));
    }

    supervisor.stop().await;
    // The writer shut its half down, so the peer sees end-of-stream.
    let tail = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
      .await
      .unwrap()
      .unwrap();
    assert!(tail.is_none());
    assert!(!socket.exists());
  }

  #[tokio::test]
  async fn test_early_play_follows_volume() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mpv.sock");
    let supervisor = Arc::new(Supervisor::new(test_config(socket.clone())));
    supervisor.start().unwrap();

    // play() is already waiting when the connection comes up.
    let play = {
      let supervisor = supervisor.clone();
      tokio::spawn(async move { supervisor.play("http://example/video.mp4").await })
    };

    let listener = UnixListener::bind(&socket).unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, _write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    assert_eq!(
      next_json(&mut lines).await,
      json!({"command": ["set_property", "volume", 100], "request_id": 0})
    );
    assert_eq!(
      next_json(&mut lines).await,
      json!({"command": ["loadfile", "http://example/video.mp4"], "request_id": 1})
    );
    assert_eq!(play.await.unwrap().unwrap(), 1);

    supervisor.stop().await;
  }

  #[tokio::test]
  async fn test_request_reports_player_error() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mpv.sock");
    let supervisor = Arc::new(Supervisor::new(test_config(socket.clone())));
    supervisor.start().unwrap();

    let listener = UnixListener::bind(&socket).unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    next_json(&mut lines).await;

    let pending = {
      let supervisor = supervisor.clone();
      tokio::spawn(async move { supervisor.request(PlayerCommand::get_property("nope")).await })
    };
    let request = next_json(&mut lines).await;
    assert_eq!(request["request_id"], json!(1));
    write_half
      .write_all(b"{\"error\":\"property not found\",\"request_id\":1}\n")
      .await
      .unwrap();

    match pending.await.unwrap() {
      Err(SupervisorError::CommandFailed(msg)) => assert_eq!(msg, "property not found"),
      other => panic!("Expected CommandFailed, got {:?}", other),
    }

    supervisor.stop().await;
  }

  #[tokio::test]
  async fn test_peer_close_clears_connected() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mpv.sock");
    let supervisor = Supervisor::new(test_config(socket.clone()));
    supervisor.start().unwrap();

    let listener = UnixListener::bind(&socket).unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    assert!(supervisor.wait_connected(Duration::from_secs(2)).await);
    drop(stream);

    let mut rx = supervisor.shared.connected.subscribe();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|c| !*c))
      .await
      .unwrap()
      .unwrap();
    drop(rx);

    // The next cycle reconnects to the same listener.
    let (_stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
      .await
      .unwrap()
      .unwrap();
    assert!(supervisor.wait_connected(Duration::from_secs(2)).await);

    supervisor.stop().await;
  }

  #[tokio::test]
  async fn test_failed_connect_ends_ipc_loop() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mpv.sock");
    let mut config = test_config(socket.clone());
    config.retry_interval_ms = 10;
    let supervisor = Supervisor::new(config);
    supervisor.start().unwrap();

    assert!(ipc_loop_finished(&supervisor).await);

    // A player showing up late is never picked up.
    let listener = UnixListener::bind(&socket).unwrap();
    assert!(
      tokio::time::timeout(Duration::from_millis(200), listener.accept())
        .await
        .is_err()
    );
    assert!(!supervisor.is_connected());

    supervisor.stop().await;
  }

  #[tokio::test]
  async fn test_failed_reconnect_ends_ipc_loop() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mpv.sock");
    let supervisor = Supervisor::new(test_config(socket.clone()));
    supervisor.start().unwrap();

    let listener = UnixListener::bind(&socket).unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    assert!(supervisor.wait_connected(Duration::from_secs(2)).await);

    // Peer goes away for good; the reconnect cycle is refused.
    drop(listener);
    drop(stream);
    assert!(ipc_loop_finished(&supervisor).await);
    assert!(!supervisor.is_connected());

    std::fs::remove_file(&socket).unwrap();
    let listener = UnixListener::bind(&socket).unwrap();
    assert!(
      tokio::time::timeout(Duration::from_millis(200), listener.accept())
        .await
        .is_err()
    );
    assert!(!supervisor.is_connected());
    assert!(matches!(
      supervisor.play("http://example/video.mp4").await,
      Err(SupervisorError::NotConnected)
    ));

    supervisor.stop().await;
  }

  #[tokio::test]
  async fn test_start_keeps_live_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mpv.sock");
    let _other = UnixListener::bind(&socket).unwrap();

    let mut config = test_config(socket.clone());
    config.mpv_path = Some(PathBuf::from("/nonexistent/bin/mpv"));
    let supervisor = Supervisor::new(config);
    assert!(supervisor.start().is_err());
    assert!(socket.exists());
  }

  #[tokio::test]
  async fn test_stop_is_final() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(test_config(dir.path().join("mpv.sock")));
    supervisor.start().unwrap();
    assert!(matches!(supervisor.start(), Err(SupervisorError::AlreadyStarted)));

    supervisor.stop().await;
    supervisor.stop().await;

    assert!(supervisor.tasks.lock().is_empty());
    assert!(matches!(supervisor.start(), Err(SupervisorError::Stopped)));
    assert!(matches!(supervisor.play("a.mkv").await, Err(SupervisorError::Stopped)));
    assert!(matches!(
      supervisor.send_command(PlayerCommand::quit()).await,
      Err(SupervisorError::Stopped)
    ));
    assert!(!supervisor.is_connected());
  }
}
