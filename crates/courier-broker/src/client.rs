use std::time::Instant;

use indexmap::IndexSet;
use mio::Token;

/// One client session.
///
/// A session outlives any single TCP connection: it is created by the first
/// accepted `CONNECT` and destroyed by `DISCONNECT`, eviction, or expiry of
/// the lost window. In between it is either *connected* (bound to a live
/// connection token) or *lost* (socket gone, subscriptions and queued bytes
/// retained while a reconnect by the same name is awaited).
#[derive(Debug)]
pub struct ClientRecord {
    name: String,
    token: Option<Token>,
    lost_at: Option<Instant>,
    outbound: Vec<u8>,
    topics: IndexSet<String>,
}

impl ClientRecord {
    /// Outbound bytes queued per client are capped; writes past the cap are
    /// dropped for that recipient only.
    pub const MAX_STREAM_SIZE: usize = 10 * 1024;

    pub fn new(name: &str, token: Token) -> Self {
        Self {
            name: name.to_owned(),
            token: Some(token),
            lost_at: None,
            outbound: Vec::new(),
            topics: IndexSet::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.token.is_some()
    }

    #[inline]
    pub fn lost_at(&self) -> Option<Instant> {
        self.lost_at
    }

    /// The connection went away; keep subscriptions and queued bytes.
    pub fn mark_lost(&mut self) {
        self.token = None;
        self.lost_at = Some(Instant::now());
    }

    /// Rebind a lost session to a fresh connection.
    pub fn restore(&mut self, token: Token) {
        self.token = Some(token);
        self.lost_at = None;
    }

    pub fn topics(&self) -> &IndexSet<String> {
        &self.topics
    }

    /// Returns true if the topic was newly added.
    pub fn subscribe(&mut self, topic: &str) -> bool {
        self.topics.insert(topic.to_owned())
    }

    /// Returns true if the topic was removed.
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        self.topics.swap_remove(topic)
    }

    /// Queue bytes for delivery and return the new queue length.
    ///
    /// If accepting the bytes would reach [`Self::MAX_STREAM_SIZE`] the write
    /// is a no-op and the returned length is unchanged; callers detect the
    /// empty-to-nonempty transition by comparing against the length they saw
    /// before the call.
    pub fn enqueue(&mut self, bytes: &[u8]) -> usize {
        if self.outbound.len() + bytes.len() < Self::MAX_STREAM_SIZE {
            self.outbound.extend_from_slice(bytes);
        }
        self.outbound.len()
    }

    /// Slice up to `max` bytes off the front of the queue.
    pub fn dequeue_chunk(&mut self, max: usize) -> (Vec<u8>, usize) {
        let take = self.outbound.len().min(max);
        let chunk: Vec<u8> = self.outbound.drain(..take).collect();
        (chunk, self.outbound.len())
    }

    /// Reinstate bytes at the front of the queue.
    ///
    /// Used for the unwritten tail of a partial send and for blocked reply
    /// remainders; bypasses the cap so a reply is never silently dropped.
    pub fn requeue_front(&mut self, bytes: &[u8]) {
        self.outbound.splice(..0, bytes.iter().copied());
    }

    #[inline]
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    #[inline]
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }
}
