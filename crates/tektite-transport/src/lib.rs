//! # tektite-transport: Transport interfaces for `Tektite`
//!
//! The consensus module consumes a reliable ordered log-streaming transport
//! and a stream-recording archive. Both are external collaborators; this
//! crate pins down their interfaces and ships in-memory implementations
//! ([`memory`]) that the test suite drives in-process.
//!
//! The transport model is the publication/subscription pair: a
//! [`Publication`] appends framed messages to a channel and reports the
//! resulting stream position or a back-pressure sentinel; a [`Subscription`]
//! polls a bounded number of fragments in order. Channels are URIs
//! ([`ChannelUri`]) carrying endpoint and tuning parameters.

mod archive;
mod channel;
mod counters;
pub mod memory;

pub use archive::*;
pub use channel::*;
pub use counters::*;

use bytes::Bytes;
use tektite_types::LogPosition;

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid channel: {0}")]
    InvalidChannel(#[from] ChannelParseError),

    #[error("transport is closed")]
    Closed,

    #[error("{0}")]
    Media(String),
}

// ============================================================================
// Offer Outcome
// ============================================================================

/// Result of offering a message to a [`Publication`].
///
/// Back-pressure and disconnection are values, not errors: the caller
/// retries on a later tick without reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Appended; the stream position after the frame.
    Position(LogPosition),
    /// Flow control window exhausted; retry later.
    BackPressured,
    /// No subscriber is connected yet.
    NotConnected,
    /// The publication has been closed.
    Closed,
}

impl Offer {
    /// True if the offer was accepted.
    pub fn is_granted(self) -> bool {
        matches!(self, Offer::Position(_))
    }

    /// The resulting position, if accepted.
    pub fn position(self) -> Option<LogPosition> {
        match self {
            Offer::Position(p) => Some(p),
            _ => None,
        }
    }
}

// ============================================================================
// Fragments
// ============================================================================

/// One framed message polled from a [`Subscription`].
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Session id of the originating publication's image.
    pub session_id: i32,
    /// Stream position after this fragment's frame.
    pub position: LogPosition,
    pub payload: Bytes,
}

// ============================================================================
// Transport Traits
// ============================================================================

/// An append endpoint for one `(channel, stream_id)` flow.
pub trait Publication {
    /// Offers one framed message; never blocks.
    fn offer(&mut self, payload: &[u8]) -> Offer;

    /// Stream position after everything offered so far.
    fn position(&self) -> LogPosition;

    /// True once at least one subscriber has the image.
    fn is_connected(&self) -> bool;

    /// Transport-assigned session id identifying this publication's image.
    fn session_id(&self) -> i32;

    fn channel(&self) -> &str;

    fn stream_id(&self) -> i32;

    fn close(&mut self);
}

/// A polling endpoint for one `(channel, stream_id)` flow.
pub trait Subscription {
    /// Polls up to `limit` fragments, in order; never blocks.
    fn poll(&mut self, limit: usize) -> Vec<Fragment>;

    /// Number of publication images currently connected.
    fn image_count(&self) -> usize;

    /// Stream position consumed so far on the primary image.
    fn position(&self) -> LogPosition;

    fn channel(&self) -> &str;

    fn stream_id(&self) -> i32;

    fn close(&mut self);
}

/// Factory handle onto the media driver.
///
/// The process-wide transport client is threaded into the module as an
/// explicit value; there is no global.
pub trait Media {
    fn add_publication(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Box<dyn Publication>, TransportError>;

    /// A publication guaranteed to be the only writer of its image.
    fn add_exclusive_publication(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Box<dyn Publication>, TransportError>;

    fn add_subscription(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Next process-unique correlation id.
    fn next_correlation_id(&mut self) -> i64;

    /// Performs pending transport duty; returns units of work done.
    ///
    /// Long-running waits must keep invoking this so the transport stays
    /// alive while the caller idles.
    fn do_work(&mut self) -> usize;
}
