//! Async IPC connection to MPV.
//!
//! Handles platform-specific socket/pipe connections. Writes go through a
//! single writer task; reading is driven by the caller via [`read_loop`] so
//! the owner decides what a closed connection means.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_channel::Sender;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::{inspect_error, MpvEvent, MpvMessage, MpvRequest, MpvResponse};

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Write failed: {0}")]
  WriteFailed(#[from] std::io::Error),
  #[error("Read failed: {0}")]
  ReadFailed(std::io::Error),
  #[error("Failed to encode command: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("Command timeout")]
  Timeout,
  #[error("Disconnected")]
  Disconnected,
  #[error("Cancelled")]
  Cancelled,
}

#[cfg(not(windows))]
pub type IpcStream = tokio::net::UnixStream;
#[cfg(windows)]
pub type IpcStream = tokio::net::windows::named_pipe::NamedPipeClient;

#[cfg(not(windows))]
async fn try_connect(path: &Path) -> Result<IpcStream, IpcError> {
  IpcStream::connect(path)
    .await
    .map_err(|e| IpcError::ConnectionFailed(e.to_string()))
}

#[cfg(windows)]
async fn try_connect(path: &Path) -> Result<IpcStream, IpcError> {
  use tokio::net::windows::named_pipe::ClientOptions;

  ClientOptions::new()
    .open(path)
    .map_err(|e| IpcError::ConnectionFailed(format!("Failed to open pipe: {}", e)))
}

/// Connect to the MPV IPC socket/pipe.
///
/// Makes up to `attempts` tries with `interval` between failures. Pauses are
/// cut short by `cancel`.
pub async fn connect(
  path: &Path,
  attempts: u32,
  interval: Duration,
  cancel: &CancellationToken,
) -> Result<IpcStream, IpcError> {
  let mut last_error = None;

  for attempt in 1..=attempts {
    if cancel.is_cancelled() {
      return Err(IpcError::Cancelled);
    }
    log::info!("Connecting to MPV socket {} ({}/{})", path.display(), attempt, attempts);

    match try_connect(path).await {
      Ok(stream) => return Ok(stream),
      Err(e) => {
        log::warn!("IPC connect attempt {}/{} failed: {}", attempt, attempts, e);
        last_error = Some(e);
      }
    }

    tokio::select! {
      _ = cancel.cancelled() => return Err(IpcError::Cancelled),
      _ = tokio::time::sleep(interval) => {}
    }
  }

  Err(last_error.unwrap_or_else(|| IpcError::ConnectionFailed("no attempts made".into())))
}

/// Pending request waiting for response.
type PendingRequest = oneshot::Sender<Result<MpvResponse, IpcError>>;

/// Writer channel message.
enum WriteMessage {
  Line(Vec<u8>, oneshot::Sender<std::io::Result<()>>),
  Close,
}

/// Resolves once the writer task has flushed (or failed to write) a line.
pub struct WriteAck(oneshot::Receiver<std::io::Result<()>>);

impl WriteAck {
  pub async fn wait(self) -> Result<(), IpcError> {
    match self.0.await {
      Ok(result) => result.map_err(IpcError::from),
      Err(_) => Err(IpcError::Disconnected),
    }
  }
}

/// A request that has been queued and is waiting for its reply.
pub struct PendingReply {
  request_id: u64,
  ack: WriteAck,
  reply: oneshot::Receiver<Result<MpvResponse, IpcError>>,
}

/// Write half of an MPV IPC connection plus the replies it is waiting on.
pub struct MpvIpc {
  pending: Mutex<HashMap<u64, PendingRequest>>,
  write_tx: async_channel::Sender<WriteMessage>,
  writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MpvIpc {
  /// Take ownership of `writer` and start the writer task.
  pub fn new<W>(writer: W) -> Self
  where
    W: AsyncWrite + Send + Unpin + 'static,
  {
    let (write_tx, write_rx) = async_channel::unbounded::<WriteMessage>();
    let writer_handle = tokio::spawn(async move {
      Self::writer_loop(writer, write_rx).await;
    });

    Self {
      pending: Mutex::new(HashMap::new()),
      write_tx,
      writer_handle: Mutex::new(Some(writer_handle)),
    }
  }

  async fn writer_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    write_rx: async_channel::Receiver<WriteMessage>,
  ) {
    log::debug!("MPV IPC writer loop started");

    while let Ok(msg) = write_rx.recv().await {
      match msg {
        WriteMessage::Line(data, ack) => {
          let result = async {
            writer.write_all(&data).await?;
            writer.flush().await
          }
          .await;
          let failed = result.is_err();
          if let Err(e) = &result {
            log::error!("MPV IPC write error: {}", e);
          }
          let _ = ack.send(result);
          if failed {
            break;
          }
        }
        WriteMessage::Close => break,
      }
    }

    write_rx.close();
    let _ = writer.shutdown().await;
    log::debug!("MPV IPC writer closed");
  }

  /// Queue one request line for the writer task.
  ///
  /// Lines reach the socket in the order they were queued.
  pub fn queue(&self, request: &MpvRequest) -> Result<WriteAck, IpcError> {
    let line = request.to_line()?;
    log::info!("Sending MPV command: {}", line.trim_end());

    let (ack_tx, ack_rx) = oneshot::channel();
    self
      .write_tx
      .try_send(WriteMessage::Line(line.into_bytes(), ack_tx))
      .map_err(|_| IpcError::Disconnected)?;
    Ok(WriteAck(ack_rx))
  }

  /// Register a waiter for `request`'s reply, then queue it.
  pub fn begin_request(&self, request: &MpvRequest) -> Result<PendingReply, IpcError> {
    let request_id = request.request_id;
    let (tx, rx) = oneshot::channel();
    self.pending.lock().insert(request_id, tx);

    match self.queue(request) {
      Ok(ack) => Ok(PendingReply {
        request_id,
        ack,
        reply: rx,
      }),
      Err(e) => {
        self.pending.lock().remove(&request_id);
        Err(e)
      }
    }
  }

  /// Wait for the write to land and for MPV to answer, bounded by `timeout`.
  pub async fn finish_request(
    &self,
    pending: PendingReply,
    timeout: Duration,
  ) -> Result<MpvResponse, IpcError> {
    let PendingReply {
      request_id,
      ack,
      reply,
    } = pending;

    if let Err(e) = ack.wait().await {
      self.pending.lock().remove(&request_id);
      return Err(e);
    }

    match tokio::time::timeout(timeout, reply).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(IpcError::Disconnected),
      Err(_) => {
        log::error!(
          "MPV command timeout after {:?}, request_id={}",
          timeout,
          request_id
        );
        self.pending.lock().remove(&request_id);
        Err(IpcError::Timeout)
      }
    }
  }

  /// Write a request and wait for the reply carrying the same request id.
  pub async fn request(
    &self,
    request: &MpvRequest,
    timeout: Duration,
  ) -> Result<MpvResponse, IpcError> {
    let pending = self.begin_request(request)?;
    self.finish_request(pending, timeout).await
  }

  /// Hand a reply to whoever is waiting on its request id.
  fn complete(&self, response: MpvResponse) {
    let waiter = self.pending.lock().remove(&response.request_id);
    match waiter {
      Some(tx) => {
        let _ = tx.send(Ok(response));
      }
      None => log::debug!("No waiter for request_id={}", response.request_id),
    }
  }

  /// Fail every outstanding request with `Disconnected`.
  pub fn fail_pending(&self) {
    let drained: Vec<_> = self.pending.lock().drain().collect();
    for (_, tx) in drained {
      let _ = tx.send(Err(IpcError::Disconnected));
    }
  }

  /// Stop accepting writes and shut the write half down.
  pub fn close(&self) {
    let _ = self.write_tx.try_send(WriteMessage::Close);
    self.write_tx.close();
    self.fail_pending();
  }

  /// Close and wait for the writer task to finish.
  pub async fn shutdown(&self) {
    self.close();
    let handle = self.writer_handle.lock().take();
    if let Some(handle) = handle {
      let _ = handle.await;
    }
  }
}

impl Drop for MpvIpc {
  fn drop(&mut self) {
    self.write_tx.close();
  }
}

/// Read newline-delimited messages until the peer closes or a read fails.
///
/// Every line is logged. Lines carrying an `error` other than "success" are
/// logged again at error level. Replies complete pending requests on `ipc`,
/// events go to `events` (dropped when nobody keeps up).
pub async fn read_loop<R>(
  reader: R,
  ipc: &MpvIpc,
  events: &Sender<MpvEvent>,
) -> Result<(), IpcError>
where
  R: AsyncRead + Unpin,
{
  log::debug!("MPV IPC reader loop started");
  let mut buf_reader = BufReader::new(reader);
  let mut line = String::new();

  loop {
    line.clear();
    match buf_reader.read_line(&mut line).await {
      Ok(0) => {
        log::info!("MPV IPC connection closed");
        return Ok(());
      }
      Ok(_) => {
        let trimmed = line.trim();
        if trimmed.is_empty() {
          continue;
        }
        log::info!("MPV message: {}", trimmed);

        if let Some(error) = inspect_error(trimmed) {
          log::error!("MPV returned error: {}", error);
        }

        match MpvMessage::parse(trimmed) {
          Ok(MpvMessage::Response(response)) => ipc.complete(response),
          Ok(MpvMessage::Event(event)) => {
            if let Err(async_channel::TrySendError::Full(event)) = events.try_send(event) {
              log::debug!("Event queue full, dropping {:?}", event.event);
            }
          }
          Ok(MpvMessage::Other(_)) | Err(_) => {}
        }
      }
      Err(e) => {
        log::error!("MPV IPC read error: {}", e);
        return Err(IpcError::ReadFailed(e));
      }
    }
  }
}
