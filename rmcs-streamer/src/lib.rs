//! Remote-robot H.264/WebRTC streaming core, signaled over MQTT.
//! See `spec.md` for the full system design.

pub mod config;
pub mod error;
pub mod ffi;
pub mod h264;
pub mod logging;
pub mod producer;
pub mod registry;
pub mod signaling;
pub mod source;

pub use error::{AppError, ErrorKind, Result};
