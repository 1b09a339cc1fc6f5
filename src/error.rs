/// Errors reported by the decoder, the ingest loop and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The payload is shorter than the layout selected by the frame offset.
    #[error("short frame for module {module_id} offset 0x{offset:03X}: expected {expected} bytes, got {actual}")]
    ShortFrame {
        module_id: u32,
        offset: u16,
        expected: usize,
        actual: usize,
    },
    /// The frame offset is outside every recognized range.
    #[error("unknown offset 0x{offset:03X} for module {module_id}")]
    UnknownOffset { module_id: u32, offset: u16 },
    /// No frame arrived within the receive bound.
    #[error("no frame received within timeout")]
    TransportTimeout,
    /// The frame source failed and cannot continue.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("cannot serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    /// Only transport failures stop the ingest loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Error::ShortFrame { .. } | Error::UnknownOffset { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_fatal() {
        assert!(Error::Transport("bus down".into()).is_fatal());
        assert!(!Error::TransportTimeout.is_fatal());
        assert!(!Error::UnknownOffset {
            module_id: 1,
            offset: 0x300
        }
        .is_fatal());
        assert!(!Error::Publish("broker gone".into()).is_fatal());
    }

    #[test]
    fn test_short_frame_message_has_context() {
        let err = Error::ShortFrame {
            module_id: 3,
            offset: 0x105,
            expected: 2,
            actual: 1,
        };
        assert!(err.is_decode_failure());
        assert_eq!(
            err.to_string(),
            "short frame for module 3 offset 0x105: expected 2 bytes, got 1"
        );
    }
}
