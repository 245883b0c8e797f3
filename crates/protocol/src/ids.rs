//! Envelope id allocation.
//!
//! One parity test separates the two id spaces: request ids (and the
//! responses that echo them) are even, stream ids are odd. Zero is reserved
//! for messages that expect no answer.

use rand::Rng;

/// The id carried by fire-and-forget messages.
pub const NO_ID: i32 = 0;

/// Largest value the random half of an id may take.
const ID_HALF_MAX: i32 = i32::MAX >> 1;

/// Which id space an envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    /// Id 0: no correlation.
    None,
    /// Even id: a request or its response.
    Request,
    /// Odd id: a stream message.
    Stream,
}

/// Classify an id by parity.
#[inline]
pub fn classify(id: i32) -> IdKind {
    if id == NO_ID {
        IdKind::None
    } else if id & 1 == 0 {
        IdKind::Request
    } else {
        IdKind::Stream
    }
}

/// Whether `id` lives in the stream space.
#[inline]
pub fn is_stream_id(id: i32) -> bool {
    classify(id) == IdKind::Stream
}

/// Whether `id` lives in the request space.
#[inline]
pub fn is_request_id(id: i32) -> bool {
    classify(id) == IdKind::Request
}

/// A fresh random, even, non-zero request id.
pub fn next_request_id() -> i32 {
    rand::thread_rng().gen_range(1..=ID_HALF_MAX) << 1
}

/// A fresh random, odd stream id.
pub fn next_stream_id() -> i32 {
    (rand::thread_rng().gen_range(0..=ID_HALF_MAX) << 1) | 1
}
