//! Subsystem modules for lite-tutor.

pub mod comms;
pub mod knowledge;
pub mod tutor;
