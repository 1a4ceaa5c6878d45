// Library root: the binary in src/main.rs and the integration tests in tests/
// both build on it.

pub mod config;
pub mod error;
pub mod logger;
pub mod subsystems;
