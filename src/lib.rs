//! # WebSQ Control Library
//!
//! Client for the WebSQ superconducting nanowire single-photon detector
//! (SNSPD) system. The device exposes two TCP endpoints: a JSON control
//! channel that pushes labelled state updates and accepts commands, and a
//! counts channel that streams one CSV line of per-detector counts each
//! measurement period.
//!
//! ## Crate Structure
//!
//! - **`network`**: The two channel clients, the `0x17` frame decoder and
//!   the label table merge rule.
//! - **`websq`**: The `WebSq` facade translating detector operations
//!   (bias current, trigger level, auto calibration, counts acquisition)
//!   into channel traffic.
//! - **`instrument`**: Set/get contract for external bench instruments
//!   (attenuator, laser, power meter).
//! - **`analysis`**: Helpers over acquired counts.
//! - **`config`**: Figment-based configuration (TOML + `WEBSQ_` environment).
//! - **`error`**: The `WebSqError` enum shared by every module.
//! - **`logging`**: `tracing-subscriber` setup.

pub mod analysis;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod network;
pub mod websq;

pub use config::WebSqConfig;
pub use error::{AppResult, WebSqError};
pub use network::{ChannelHealth, ControlChannel, CountsChannel, DeviceError, Sample};
pub use websq::{WebSq, WebSqHealth};
