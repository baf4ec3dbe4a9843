//! Wire protocol shared by agents and the cloud.

mod envelope;
pub mod payloads;

pub use envelope::{Envelope, EnvelopeType, PROTOCOL_VERSION, close_code};
