//! Connection pool (C5): idle, already-authenticated upstream sockets keyed
//! by username, lent out to incoming sessions under concurrency.
//!
//! A pool entry never outlives a single owner: a socket is either sitting in
//! exactly one queue, held by a caller through a [`PoolGuard`], or closed.
//! The guard's `Drop` returns the socket to the pool unless the caller
//! explicitly takes it out via [`PoolGuard::into_socket_without_pooling`],
//! which is how the session state machine implements "do not pool a socket
//! that saw a fatal protocol error or was mid-response at cancellation".

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use tokio::net::TcpStream;

struct Entry {
    socket: TcpStream,
    added_at: Instant,
}

struct PoolInner {
    queues: HashMap<String, VecDeque<Entry>>,
    min_idle_connections: u32,
}

/// Mapping from username to an insertion-ordered queue of idle sockets.
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    pub fn new(min_idle_connections: u32) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                queues: HashMap::new(),
                min_idle_connections,
            }),
        }
    }

    /// Returns an idle socket for `username`, or `None` if the pool has
    /// nothing usable. Step 1 is an exact-identity match; step 2 reassigns
    /// an idle socket from whichever user has more than `min_idle_connections`
    /// idle, on the theory that it can be re-authenticated to the new
    /// identity. The caller owns removing any I/O readiness registration the
    /// socket had while it sat idle — the pool itself performs no I/O.
    pub fn get(&self, username: &str) -> Option<PoolGuard<'_>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(queue) = inner.queues.get_mut(username) {
            if let Some(entry) = queue.pop_front() {
                if queue.is_empty() {
                    inner.queues.remove(username);
                }
                return Some(PoolGuard {
                    pool: self,
                    socket: Some(entry.socket),
                    username: username.to_string(),
                });
            }
        }

        let min_idle = inner.min_idle_connections;
        let reassign_from = inner
            .queues
            .iter()
            .find(|(_, q)| q.len() as u32 > min_idle)
            .map(|(k, _)| k.clone());

        if let Some(owner) = reassign_from {
            let queue = inner.queues.get_mut(&owner).unwrap();
            let entry = queue.pop_front().unwrap();
            if queue.is_empty() {
                inner.queues.remove(&owner);
            }
            return Some(PoolGuard {
                pool: self,
                socket: Some(entry.socket),
                username: username.to_string(),
            });
        }

        None
    }

    /// Adds a socket authenticated as `username` to the pool.
    pub fn add(&self, socket: TcpStream, username: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .queues
            .entry(username.into())
            .or_default()
            .push_back(Entry {
                socket,
                added_at: Instant::now(),
            });
    }

    /// Closes every idle socket and drops every queue.
    pub fn free(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queues.clear();
    }

    /// Number of idle sockets currently queued for `username`.
    pub fn idle_count(&self, username: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .queues
            .get(username)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// The reassignment threshold this pool was constructed with.
    pub fn min_idle_connections(&self) -> u32 {
        self.inner.lock().unwrap().min_idle_connections
    }

    /// Total idle sockets across every identity.
    pub fn total_idle(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .queues
            .values()
            .map(VecDeque::len)
            .sum()
    }
}

/// Scoped handle to a socket checked out of the pool. Returns the socket to
/// the pool on drop unless explicitly released without pooling.
pub struct PoolGuard<'a> {
    pool: &'a ConnectionPool,
    socket: Option<TcpStream>,
    username: String,
}

impl<'a> PoolGuard<'a> {
    pub fn socket(&mut self) -> &mut TcpStream {
        self.socket.as_mut().expect("socket taken from guard")
    }

    /// Takes the socket out without returning it to the pool — used when the
    /// socket must be closed instead (fatal protocol error, session
    /// cancelled mid-response).
    pub fn into_socket_without_pooling(mut self) -> TcpStream {
        self.socket.take().expect("socket taken from guard")
    }
}

impl<'a> Drop for PoolGuard<'a> {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.pool.add(socket, self.username.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn pool_reuse_under_pressure_reassigns_oldest() {
        let pool = ConnectionPool::new(1);

        let (a, _a_peer) = connected_pair().await;
        let (b, _b_peer) = connected_pair().await;
        let (c, _c_peer) = connected_pair().await;

        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        let c_addr = c.local_addr().unwrap();

        pool.add(a, "alice");
        pool.add(b, "alice");
        pool.add(c, "alice");

        // bob has no queue of his own; alice has 3 > min_idle_connections(1),
        // so bob gets alice's oldest (head) socket.
        let guard = pool.get("bob").unwrap();
        assert_eq!(guard.pool.idle_count("alice"), 2);
        let reassigned = guard.into_socket_without_pooling();
        assert_eq!(reassigned.local_addr().unwrap(), a_addr);

        assert_eq!(pool.idle_count("alice"), 2);

        let first = pool.get("alice").unwrap().into_socket_without_pooling();
        assert_eq!(first.local_addr().unwrap(), b_addr);
        let second = pool.get("alice").unwrap().into_socket_without_pooling();
        assert_eq!(second.local_addr().unwrap(), c_addr);
    }

    #[tokio::test]
    async fn empty_queue_is_removed_from_mapping() {
        let pool = ConnectionPool::new(0);
        let (a, _peer) = connected_pair().await;
        pool.add(a, "alice");
        assert_eq!(pool.idle_count("alice"), 1);

        let _ = pool.get("alice").unwrap().into_socket_without_pooling();
        assert_eq!(pool.idle_count("alice"), 0);
        assert_eq!(pool.total_idle(), 0);
    }

    #[tokio::test]
    async fn guard_drop_returns_socket_to_pool() {
        let pool = ConnectionPool::new(0);
        let (a, _peer) = connected_pair().await;
        pool.add(a, "alice");

        {
            let _guard = pool.get("alice").unwrap();
            assert_eq!(pool.total_idle(), 0);
        }
        assert_eq!(pool.total_idle(), 1);
    }

    #[tokio::test]
    async fn get_on_empty_pool_returns_none() {
        let pool = ConnectionPool::new(5);
        assert!(pool.get("nobody").is_none());
    }

    #[tokio::test]
    async fn free_closes_every_socket() {
        let pool = ConnectionPool::new(0);
        let (a, _) = connected_pair().await;
        let (b, _) = connected_pair().await;
        pool.add(a, "alice");
        pool.add(b, "bob");
        pool.free();
        assert_eq!(pool.total_idle(), 0);
    }
}
