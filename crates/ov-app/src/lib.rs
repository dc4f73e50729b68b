//! Socket-oriented server/client supervisor.

pub mod app;
pub mod connection;
pub mod error;

pub use app::{App, AppEvent, AppHandle, OutboundData, SocketId};
pub use connection::{Connection, Listener, ParserKind, Role, SocketConfig};
pub use error::AppError;
