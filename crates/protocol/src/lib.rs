//! PocketRAG Protocol
//!
//! Wire types shared by the host and its collaborators:
//! the kernel envelope spoken over stdio, its line codec,
//! and the messages exchanged with windows over WebSocket.

pub mod codec;
pub mod envelope;
pub mod window;

pub use codec::{encode_line, CodecError, EnvelopeDecoder};
pub use envelope::{
    CallbackId, Envelope, Message, MessageKind, SessionId, Status, GLOBAL_SESSION_ID,
    STATUS_SUCCESS,
};
pub use window::{DialogLevel, WindowEvent, WindowKind, WindowRequest};
