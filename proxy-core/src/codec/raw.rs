use super::{Boundary, Codec, FrameQueue};

/// Codec-less tunnel: every read is one message, bytes pass unchanged
#[derive(Debug, Default)]
pub struct RawCodec {
    frames: FrameQueue,
}

impl RawCodec {
    pub const NAME: &'static str = "Sample";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Codec for RawCodec {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn check_delimiter(&self, data: &[u8]) -> Boundary {
        // Slices never exceed isize::MAX bytes
        Boundary::from_len(data.len() as isize)
    }

    fn frames(&self) -> &FrameQueue {
        &self.frames
    }

    fn lossless(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_common::Direction;

    #[test]
    fn test_accepts_everything() {
        let codec = RawCodec::new();
        assert_eq!(codec.check_request_delimiter(b"abc"), Boundary::Complete(3));
        assert_eq!(codec.check_response_delimiter(b"z"), Boundary::Complete(1));
        assert!(codec.use_new_connection_for_resend());
    }

    #[test]
    fn test_empty_read_needs_more() {
        let codec = RawCodec::new();
        assert_eq!(codec.check_request_delimiter(b""), Boundary::Incomplete);
    }

    #[test]
    fn test_chunk_hooks_reassemble() {
        let codec = RawCodec::new();
        codec.chunk_arrived(Direction::Server, b"he").unwrap();
        codec.chunk_arrived(Direction::Server, b"llo").unwrap();
        assert_eq!(codec.pass_through(Direction::Server).unwrap(), None);
        assert_eq!(
            codec.available(Direction::Server).unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(codec.available(Direction::Server).unwrap(), None);
    }
}
