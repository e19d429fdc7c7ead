//! TCP plumbing for the two WebSQ sockets.
//!
//! - [`control`]: JSON label/command channel (default port 12000)
//! - [`counts`]: newline-delimited counts stream (default port 12345)
//! - [`framing`]: `0x17` frame decoding and `}{` resplitting
//! - [`protocol`]: message envelopes, label names, the label table
//! - [`link`]: socket ownership and channel health shared by both channels

pub mod control;
pub mod counts;
pub mod framing;
pub mod link;
pub mod protocol;

pub use control::{ControlChannel, ControlOptions, DeviceError, ErrorCallback};
pub use counts::{CountsChannel, CountsOptions, Sample, SampleRing};
pub use link::ChannelHealth;
