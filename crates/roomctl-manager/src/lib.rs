//! Room-keyed lifecycle management for peer-connection client processes.

pub mod config;
mod console_log;
pub mod error;
pub mod process_manager;
pub mod registry;

pub use config::ManagerConfig;
pub use error::{ErrorKind, ManagerError};
pub use process_manager::{ProcessManager, StartRequest, StopOutcome};
pub use roomctl_process::{RoomId, RoomState, RoomStatus};
