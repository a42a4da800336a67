//! device-agent: periodic device telemetry over a persistent MQTT session.
//!
//! The binary loads one TOML file, initializes logging, and hands the
//! `[transport]` section to [`device_mqtt`], which owns the connection,
//! acknowledgement tracking, reconnects and the last-will lifecycle. This
//! crate only decides what to publish and when.
//!
//! ## Modules
//!
//! * `config`: configuration loading and validation, plus the `print_*`
//!   macros used before logging is up.
//! * `logger`: `tracing` subscriber setup with console and journald layers.
//! * `telemetry`: the publish loop and the status/command logging tasks.

pub mod config;
pub mod logger;
pub mod telemetry;
