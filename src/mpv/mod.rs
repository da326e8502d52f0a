//! MPV supervision - spawns an external MPV player and drives it via JSON IPC.
//!
//! Architecture:
//! - `process.rs` - MPV binary detection, process spawning and output draining
//! - `ipc.rs` - Async IPC connection (Named Pipes on Windows, Unix Sockets on Linux/macOS)
//! - `protocol.rs` - JSON command/response types and serialization
//! - `supervisor.rs` - Process lifecycle and the connection-maintaining IPC loop

pub mod ipc;
pub mod process;
pub mod protocol;
mod supervisor;

pub use ipc::IpcError;
pub use process::{default_ipc_path, find_mpv, ProcessError};
pub use protocol::{MpvEvent, MpvResponse, PlayerCommand};
pub use supervisor::{Supervisor, SupervisorError};
