//! Wire message definitions for shellbridge.
//!
//! Every message exchanged over a session's WebSocket is an [`Envelope`]:
//! a JSON record with a `type` discriminator and a `data` payload. The
//! connection itself scopes the session, so no session identifier travels
//! on the wire.

use serde::{Deserialize, Serialize};

/// The message unit exchanged between a client and its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Envelope {
    /// Text captured from the pseudo-terminal (server → client).
    ///
    /// ANSI escape sequences are carried verbatim.
    Output(String),
    /// Keystrokes or text to feed to the shell (client → server).
    Input(String),
    /// New terminal geometry (client → server).
    Resize(ResizeData),
}

impl Envelope {
    /// Returns the wire name of the envelope's `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Output(_) => "output",
            Envelope::Input(_) => "input",
            Envelope::Resize(_) => "resize",
        }
    }

    /// Returns true if a client is allowed to send this envelope.
    pub fn is_client_message(&self) -> bool {
        matches!(self, Envelope::Input(_) | Envelope::Resize(_))
    }
}

/// Terminal dimensions carried by a `resize` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeData {
    /// Column count.
    pub cols: u16,
    /// Row count.
    pub rows: u16,
}

impl ResizeData {
    /// Creates a new resize payload.
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Both dimensions must be positive for the pty to accept them.
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

/// Resize as sent by older browser clients, with the geometry next to
/// `type` instead of inside `data`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum FlatResize {
    Resize { cols: u16, rows: u16 },
}

impl From<FlatResize> for Envelope {
    fn from(flat: FlatResize) -> Self {
        match flat {
            FlatResize::Resize { cols, rows } => Envelope::Resize(ResizeData { cols, rows }),
        }
    }
}
