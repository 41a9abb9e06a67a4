//! Remote framebuffer (VNC) client.
//!
//! Speaks the RFB 3.8 subset QEMU's built-in server needs: no authentication,
//! raw encoding only, client-chosen pixel format. Decoded pixels land in a
//! shared [`Framebuffer`](crate::framebuffer::Framebuffer).

pub mod client;
pub mod protocol;

use thiserror::Error;

pub use client::{run_session, VncConnection, DEFAULT_FRAME_RATE};

#[derive(Error, Debug)]
pub enum RfbError {
    #[error("vnc i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid protocol banner: {0:?}")]
    BadBanner(String),

    #[error("unsupported RFB version {major}.{minor}, need 3.8 or later")]
    UnsupportedVersion { major: u32, minor: u32 },

    #[error("server refused connection: {0}")]
    ServerRefused(String),

    #[error("server requires authentication (offered security types {0:?})")]
    AuthRequired(Vec<u8>),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unsupported server message type {0}")]
    UnsupportedMessage(u8),

    #[error("unsupported rectangle encoding {0}")]
    UnsupportedEncoding(i32),

    #[error("server string of {0} bytes exceeds limit")]
    StringTooLong(u32),
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RfbEvent {
    Connected { name: String },
    Resized { width: u16, height: u16 },
    /// A FramebufferUpdate was applied.
    Updated { rectangles: u16 },
    /// The client loop ended. `reason` is `None` after a requested shutdown
    /// or a clean close by the server.
    Disconnected { reason: Option<String> },
}
