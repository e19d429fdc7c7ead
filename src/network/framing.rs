//! Control-channel framing.
//!
//! The WebSQ control stream is UTF-8 JSON where each message ends with the
//! byte `0x17` (ETB), which cannot occur inside valid JSON text. The server
//! sometimes writes several objects back to back inside one frame
//! (`{...}{...}`), so each frame is split again on the literal `}{`.
//!
//! Decoding runs as a small pipeline:
//!
//! ```text
//! bytes ──► accumulate ──► split on 0x17 ──► split on "}{" ──► serde_json
//!           (FrameDecoder)   (complete groups)  (split_concatenated)  (parse_fragments)
//! ```
//!
//! Fragments that fail to parse are dropped and logged at debug level.

use bytes::{Buf, BytesMut};
use serde_json::Value;

/// Reserved byte terminating one control message.
pub const FRAME_TERMINATOR: u8 = 0x17;

const OBJECT_BOUNDARY: &str = "}{";

/// Pending bytes without a terminator above which the decoder warns.
pub const PENDING_WARN_BYTES: usize = 1024 * 1024;

/// Accumulates raw socket bytes and yields complete frames.
///
/// Bytes after the last terminator stay buffered until a later read
/// completes the frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    // Prefix of `buffer` already known to hold no terminator.
    scanned: usize,
    warned: bool,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet terminated by `0x17`.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Remove and return every complete frame, in arrival order.
    ///
    /// Empty frames (two adjacent terminators) are skipped. A frame that is
    /// not valid UTF-8 is dropped.
    ///
    /// Bytes already searched on an earlier call are not searched again.
    pub fn next_frames(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == FRAME_TERMINATOR)
        {
            let raw = self.buffer.split_to(self.scanned + offset);
            self.buffer.advance(1);
            self.scanned = 0;
            self.warned = false;
            if raw.is_empty() {
                continue;
            }
            match String::from_utf8(raw.to_vec()) {
                Ok(frame) => frames.push(frame),
                Err(e) => tracing::debug!(error = %e, "dropping control frame with invalid UTF-8"),
            }
        }
        self.scanned = self.buffer.len();

        if self.scanned > PENDING_WARN_BYTES && !self.warned {
            self.warned = true;
            tracing::warn!(
                pending = self.scanned,
                "control stream has sent no frame terminator for a long time"
            );
        }
        frames
    }

    /// Remove every complete frame and parse it into JSON messages.
    pub fn next_messages(&mut self) -> Vec<Value> {
        self.next_frames()
            .iter()
            .flat_map(|frame| parse_fragments(frame))
            .collect()
    }
}

/// Split a frame holding concatenated JSON objects into standalone objects.
///
/// `{"a":1}{"b":2}{"c":3}` becomes `{"a":1}`, `{"b":2}`, `{"c":3}`: the first
/// fragment regains its trailing brace, the last its leading brace, and
/// interior fragments both. A frame without `}{` is returned unchanged.
pub fn split_concatenated(frame: &str) -> Vec<String> {
    let parts: Vec<&str> = frame.split(OBJECT_BOUNDARY).collect();
    let last = parts.len() - 1;
    if last == 0 {
        return vec![frame.to_string()];
    }

    parts
        .iter()
        .enumerate()
        .map(|(i, part)| match i {
            0 => format!("{part}}}"),
            i if i == last => format!("{{{part}"),
            _ => format!("{{{part}}}"),
        })
        .collect()
}

/// Split a frame and parse every fragment, dropping the ones that are not JSON.
pub fn parse_fragments(frame: &str) -> Vec<Value> {
    split_concatenated(frame)
        .into_iter()
        .filter_map(|fragment| match serde_json::from_str::<Value>(&fragment) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(error = %e, fragment = %fragment, "dropping malformed control fragment");
                None
            }
        })
        .collect()
}
