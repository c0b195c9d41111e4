//! facematch-transport — Message plumbing between pipeline stages.
//!
//! Typed message schema, a spool-directory queue used for the inbox topic
//! and the request/response queues, and the base64 codec for image payloads.

pub mod codec;
pub mod message;
pub mod spool;

pub use message::{FaceRequest, ImageRequest, MatchResponse, MessageError, Verdict};
pub use spool::{Delivery, SpoolQueue, TransportError};
