//! Real-time, turn-based voice conversation pipeline.
//!
//! The server side (`gateway`, `voice`) relays a client's utterances to an
//! upstream realtime inference session and streams the synthesized reply
//! back; the client side (`client`) segments microphone input with an
//! energy VAD and plays replies in order.

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod reliability;
pub mod util;
pub mod voice;

pub use config::Config;
pub use error::{RejectReason, VoiceError};
