use streamplex_channel::is_lifecycle_event;
use streamplex_codec::MUX_EVENT;

use crate::error::{MuxError, Result};

/// Configuration for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Base64-encode binary DATA payloads even on binary-capable channels.
    pub force_base64: bool,
    /// Event name carrying stream frames. Both peers must agree on it.
    pub reserved_event: String,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            force_base64: false,
            reserved_event: MUX_EVENT.to_string(),
        }
    }
}

impl MuxConfig {
    pub fn with_force_base64(mut self, force_base64: bool) -> Self {
        self.force_base64 = force_base64;
        self
    }

    pub fn with_reserved_event(mut self, reserved_event: impl Into<String>) -> Self {
        self.reserved_event = reserved_event.into();
        self
    }

    /// Reject reserved event names that collide with channel lifecycle events.
    pub fn validate(&self) -> Result<()> {
        if self.reserved_event.is_empty() {
            return Err(MuxError::Config(
                "reserved event name must not be empty".to_string(),
            ));
        }
        if is_lifecycle_event(&self.reserved_event) {
            return Err(MuxError::Config(format!(
                "reserved event name '{}' collides with a lifecycle event",
                self.reserved_event
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_stream_event() {
        let config = MuxConfig::default();
        assert_eq!(config.reserved_event, "$stream");
        assert!(!config.force_base64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lifecycle_names_are_rejected() {
        for name in ["disconnect", "connect-error", "error", ""] {
            let config = MuxConfig::default().with_reserved_event(name);
            assert!(matches!(config.validate(), Err(MuxError::Config(_))));
        }
    }
}
