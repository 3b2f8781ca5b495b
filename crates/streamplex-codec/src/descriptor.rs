use serde::{Deserialize, Serialize};

/// Default high-water mark for byte-mode streams, in bytes.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Default high-water mark for object-mode streams, in chunks.
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

/// Construction options shared by both ends of a stream.
///
/// Only options that were explicitly set are carried on the wire, so the
/// remote side rebuilds a stream with exactly the options the sender chose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_water_mark: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_half_open: Option<bool>,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = Some(high_water_mark);
        self
    }

    pub fn with_object_mode(mut self, object_mode: bool) -> Self {
        self.object_mode = Some(object_mode);
        self
    }

    pub fn with_allow_half_open(mut self, allow_half_open: bool) -> Self {
        self.allow_half_open = Some(allow_half_open);
        self
    }

    pub fn is_object_mode(&self) -> bool {
        self.object_mode.unwrap_or(false)
    }

    pub fn is_half_open(&self) -> bool {
        self.allow_half_open.unwrap_or(false)
    }

    /// High-water mark in effect: bytes in byte mode, chunks in object mode.
    pub fn effective_high_water_mark(&self) -> usize {
        self.high_water_mark.unwrap_or(if self.is_object_mode() {
            DEFAULT_OBJECT_HIGH_WATER_MARK
        } else {
            DEFAULT_HIGH_WATER_MARK
        })
    }
}

/// Wire placeholder substituted for a live stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: String,
    pub options: StreamOptions,
}

impl StreamDescriptor {
    pub fn new(id: impl Into<String>, options: StreamOptions) -> Self {
        Self {
            id: id.into(),
            options,
        }
    }
}

/// Which endpoint created a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Created by this endpoint's application code.
    Local,
    /// Materialized from a descriptor received from the peer.
    Remote,
}
