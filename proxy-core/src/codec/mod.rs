//! Protocol codec contract
//!
//! A codec tells the stream engine where one message ends, turns wire bytes
//! into an editable form and back, and may buffer several transport frames
//! before one logical message is ready. Codecs are created per session, so
//! any buffering state they hold belongs to a single connection.

pub mod http1;
pub mod plugin;
pub mod raw;
pub mod registry;

use parking_lot::Mutex;
use proxy_common::{Direction, Exchange};

use crate::Result;

pub use http1::Http1Codec;
pub use raw::RawCodec;
pub use registry::{CodecFactory, CodecRegistry};

/// Result of a delimiter check over the not-yet-consumed bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// The first `n` bytes form one message
    Complete(usize),
    /// More input is needed
    Incomplete,
}

impl Boundary {
    /// Map a `length | negative` delimiter result. Zero means "need more".
    pub fn from_len(len: isize) -> Self {
        if len > 0 {
            Boundary::Complete(len as usize)
        } else {
            Boundary::Incomplete
        }
    }

    /// Accepted length when it fits inside `available` buffered bytes
    pub fn accepted(self, available: usize) -> Option<usize> {
        match self {
            Boundary::Complete(n) if n > 0 && n <= available => Some(n),
            _ => None,
        }
    }
}

/// Per-direction fragment buffer backing the default chunk hooks
#[derive(Debug, Default)]
pub struct FrameQueue {
    client: Mutex<Vec<u8>>,
    server: Mutex<Vec<u8>>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, direction: Direction) -> &Mutex<Vec<u8>> {
        match direction {
            Direction::Client => &self.client,
            Direction::Server => &self.server,
        }
    }

    pub fn push(&self, direction: Direction, data: &[u8]) {
        self.slot(direction).lock().extend_from_slice(data);
    }

    /// Drain everything buffered for `direction`, `None` when empty
    pub fn take(&self, direction: Direction) -> Option<Vec<u8>> {
        let mut slot = self.slot(direction).lock();
        if slot.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *slot))
        }
    }
}

/// Note written over redacted response bodies
pub const REDACTED_BODY_NOTE: &str =
    "[Info] body data were deleted by the proxy to save storage space.";

/// One protocol's delimit / decode / encode implementation
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    /// Delimiter shared by both directions unless overridden
    fn check_delimiter(&self, data: &[u8]) -> Boundary;

    /// Fragment buffer used by the default chunk hooks
    fn frames(&self) -> &FrameQueue;

    fn check_request_delimiter(&self, data: &[u8]) -> Boundary {
        self.check_delimiter(data)
    }

    fn check_response_delimiter(&self, data: &[u8]) -> Boundary {
        self.check_delimiter(data)
    }

    fn decode_client_request(&self, request: &Exchange) -> Result<Vec<u8>> {
        Ok(request.received.clone())
    }

    fn encode_client_request(&self, request: &Exchange) -> Result<Vec<u8>> {
        Ok(request.modified_data.clone())
    }

    fn decode_server_response(
        &self,
        _request: Option<&Exchange>,
        response: &Exchange,
    ) -> Result<Vec<u8>> {
        Ok(response.received.clone())
    }

    fn encode_server_response(
        &self,
        _request: Option<&Exchange>,
        response: &Exchange,
    ) -> Result<Vec<u8>> {
        Ok(response.modified_data.clone())
    }

    fn content_type(&self, _request: Option<&Exchange>, _response: &Exchange) -> String {
        String::new()
    }

    /// Re-assign the exchange's group after decode (multiplexed protocols)
    fn assign_group(&self, _exchange: &mut Exchange) {}

    fn use_new_connection_for_resend(&self) -> bool {
        true
    }

    fn use_new_codec_for_resend(&self) -> bool {
        true
    }

    /// Fix-ups applied to a request payload before it is resent
    fn before_resend_client_request(&self, request: &Exchange) -> Result<Vec<u8>> {
        Ok(request.modified_data.clone())
    }

    fn before_resend_server_response(&self, response: &Exchange) -> Result<Vec<u8>> {
        Ok(response.modified_data.clone())
    }

    fn chunk_arrived(&self, direction: Direction, data: &[u8]) -> Result<()> {
        self.frames().push(direction, data);
        Ok(())
    }

    /// Control frames forwarded immediately, bypassing interception
    fn pass_through(&self, _direction: Direction) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Next fully reassembled logical message
    fn available(&self, direction: Direction) -> Result<Option<Vec<u8>>> {
        Ok(self.frames().take(direction))
    }

    /// Rewrite bytes on their way out of the flow-control channel
    fn flow_control(&self, _direction: Direction, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    /// A provisional response that is followed by the real one
    fn is_interim_response(&self, _response: &[u8]) -> bool {
        false
    }

    /// Replace a message body with `note`, keeping protocol framing intact
    fn redact_body(&self, _message: &[u8], note: &str) -> Vec<u8> {
        note.as_bytes().to_vec()
    }

    /// Whether encode(decode(x)) == x for unmodified messages
    fn lossless(&self) -> bool {
        false
    }
}
