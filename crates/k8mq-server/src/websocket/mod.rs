//! WebSocket que endpoint.

pub mod handler;
pub mod transport;

pub use handler::{is_normal_close, que_handler};
pub use transport::SocketTransport;
