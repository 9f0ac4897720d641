//! Warden core library: supervises a local gateway process and bridges calls and push events
//! between it and the desktop app.

pub mod config;
pub mod error;
pub mod gateway;
pub mod outcome;
pub mod secrets;
pub mod token;

pub use error::BridgeError;
pub use outcome::Outcome;
