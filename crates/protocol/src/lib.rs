//! # shellbridge protocol
//!
//! Wire definitions shared by the shellbridge daemon and its clients.
//!
//! A session's WebSocket carries JSON [`Envelope`]s in both directions:
//!
//! ```text
//! client ── input / resize ──▶ daemon ──▶ pty
//! client ◀──── output ──────── daemon ◀── pty
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode, encode, Envelope, ResizeData};
//!
//! let bytes = encode(&Envelope::Resize(ResizeData::new(80, 24))).unwrap();
//! assert_eq!(decode(&bytes).unwrap(), Envelope::Resize(ResizeData::new(80, 24)));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Envelope definitions
//! - [`framing`]: JSON codec and streaming UTF-8 decoding
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{DecodeError, EncodeError};
pub use framing::{decode, encode, encode_text, Utf8Stream};
pub use messages::{Envelope, ResizeData};
