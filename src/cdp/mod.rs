//! Chrome DevTools Protocol client.
//!
//! One concrete transport (WebSocket) behind a narrow client surface:
//! `send`, `subscribe`, `close`, `is_active`. Per-target sessions share the
//! browser connection and route through a `sessionId`.

mod client;
mod error;
mod transport;
mod types;

pub use client::{CdpClient, CdpConfig, CdpSession};
pub use error::CdpError;
pub use transport::ConnectedWatch;
pub use types::{CdpCommand, CdpEvent, CdpProtocolError};
