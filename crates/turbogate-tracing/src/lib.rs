//! Logging and OTLP tracing setup for the TurboGate API gateway.

pub mod config;
pub mod otlp;
pub mod spans;

pub use config::{LogFormat, OtlpProtocol, TracingConfig};
pub use otlp::{init_tracing, TracingGuard};
