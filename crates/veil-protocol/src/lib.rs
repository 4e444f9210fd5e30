//! # veil-protocol
//!
//! Wire protocol definitions for the Veil room chat service.
//!
//! Clients and servers exchange JSON text frames tagged by `type`. Server
//! instances exchange [`Envelope`]s over the shared pub/sub channel of a
//! room. Message payloads are opaque ciphertext throughout.
//!
//! ## Frame Types
//!
//! - `join` / `leave` - Room membership
//! - `message` / `ack` - Encrypted messages and their receipts
//! - `ping` / `pong` - Keepalive
//! - `joined`, `user_joined`, `user_left`, `error` - Server notifications
//!
//! ## Example
//!
//! ```rust
//! use veil_protocol::{codec, ClientFrame};
//!
//! let frame = ClientFrame::message("METEOR-7291", "b64-ciphertext");
//! let text = codec::encode(&frame).unwrap();
//! let decoded = codec::decode_client(&text).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;

pub use codec::{decode_client, decode_envelope, decode_server, encode, ProtocolError};
pub use envelope::{Envelope, EnvelopeKind, EXTERNAL_SENDER};
pub use frames::{ClientFrame, ErrorCode, ServerFrame};
