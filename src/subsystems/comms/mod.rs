//! Comms subsystem: external surfaces over the knowledge base and the tutor.
//!
//! The only channel is the axum HTTP channel, compiled with the
//! `channel-axum` feature (on by default).

#[cfg(feature = "channel-axum")]
pub mod axum_channel;
