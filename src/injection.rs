//! Injection engine (C6): a per-session FIFO of synthesized queries the
//! session state machine interposes in place of, or ahead of, the client's
//! own traffic.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// A synthesized query to run on a session, standing in for (or ahead of)
/// whatever the client itself sent.
#[derive(Debug, Clone)]
pub struct Injection {
    pub id: u32,
    pub query: Bytes,
    pub resultset_is_needed: bool,
    /// Microseconds since the epoch at the moment the *original* client
    /// query that triggered this injection was read. Used to compute
    /// end-to-end injection latency, not when the injection itself runs.
    pub ts_read_query: u64,
}

impl Injection {
    pub fn new(id: u32, query: impl Into<Bytes>) -> Self {
        Self {
            id,
            query: query.into(),
            resultset_is_needed: false,
            ts_read_query: now_micros(),
        }
    }

    pub fn with_resultset_needed(mut self, needed: bool) -> Self {
        self.resultset_is_needed = needed;
        self
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// FIFO of pending injections for one session.
#[derive(Debug, Default)]
pub struct InjectionQueue {
    queue: VecDeque<Injection>,
}

impl InjectionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, injection: Injection) {
        self.queue.push_back(injection);
    }

    pub fn prepend(&mut self, injection: Injection) {
        self.queue.push_front(injection);
    }

    pub fn pop_front(&mut self) -> Option<Injection> {
        self.queue.pop_front()
    }

    pub fn reset(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_swap_scenario() {
        // Spec scenario 7: client sends SELECT 1; one injection SELECT 2 is
        // queued ahead of it. Upstream should see SELECT 2 first, then
        // SELECT 1; the client only ever sees SELECT 1's results.
        let mut queue = InjectionQueue::new();
        let client_query: Bytes = Bytes::from_static(b"SELECT 1");

        queue.append(Injection::new(1, Bytes::from_static(b"SELECT 2")).with_resultset_needed(false));

        let mut upstream_sent = Vec::new();
        if let Some(injected) = queue.pop_front() {
            assert!(!injected.resultset_is_needed);
            upstream_sent.push(injected.query);
        }
        assert!(queue.is_empty());
        upstream_sent.push(client_query.clone());

        assert_eq!(upstream_sent, vec![Bytes::from_static(b"SELECT 2"), client_query]);
    }

    #[test]
    fn append_is_fifo_prepend_jumps_the_line() {
        let mut queue = InjectionQueue::new();
        queue.append(Injection::new(1, Bytes::from_static(b"A")));
        queue.append(Injection::new(2, Bytes::from_static(b"B")));
        queue.prepend(Injection::new(3, Bytes::from_static(b"C")));

        assert_eq!(queue.pop_front().unwrap().id, 3);
        assert_eq!(queue.pop_front().unwrap().id, 1);
        assert_eq!(queue.pop_front().unwrap().id, 2);
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn reset_drains_queue() {
        let mut queue = InjectionQueue::new();
        queue.append(Injection::new(1, Bytes::from_static(b"A")));
        queue.append(Injection::new(2, Bytes::from_static(b"B")));
        queue.reset();
        assert_eq!(queue.len(), 0);
        assert!(queue.pop_front().is_none());
    }
}
