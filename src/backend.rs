//! Backend registry (C4): tracks upstream servers, their role, and liveness,
//! with a time-throttled recovery sweep so a flapping or overloaded backend
//! is not hammered with retry traffic.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

use crate::error::{BackendError, Result};
use crate::pool::ConnectionPool;

const HEALTH_CHECK_THROTTLE: Duration = Duration::from_secs(1);
const DOWN_DWELL_BEFORE_RETRY: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Up,
    Down,
    Unknown,
    Offline,
}

/// One upstream server: its address, role, liveness, and its own idle
/// connection pool.
pub struct Backend {
    pub address: String,
    pub role: Role,
    pub state: BackendState,
    pub state_since: Instant,
    pub pool: ConnectionPool,
}

impl Backend {
    fn new(address: String, role: Role, min_idle_connections: u32) -> Self {
        let now = Instant::now();
        Self {
            address,
            role,
            state: BackendState::Unknown,
            state_since: now,
            pool: ConnectionPool::new(min_idle_connections),
        }
    }
}

/// Set of upstream descriptors. Ordering is stable: index identifies the
/// backend to routing policy, so backends are only ever appended, never
/// reordered or removed.
pub struct BackendRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    backends: Vec<Backend>,
    last_check: Option<Instant>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                backends: Vec::new(),
                last_check: None,
            }),
        }
    }

    /// Registers a new backend. Rejects a duplicate `address` without
    /// mutating the registry. `min_idle_connections` governs this backend's
    /// own pool's cross-identity reassignment threshold (§4.5 step 2).
    pub fn add(
        &self,
        address: impl Into<String>,
        role: Role,
        min_idle_connections: u32,
    ) -> Result<usize> {
        let address = address.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.backends.iter().any(|b| b.address == address) {
            return Err(BackendError::Duplicate(address).into());
        }
        inner
            .backends
            .push(Backend::new(address, role, min_idle_connections));
        Ok(inner.backends.len() - 1)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().backends.len()
    }

    /// Runs `f` with mutable access to the backend at `index`, under the
    /// registry mutex. The closure must be O(1) and must never block on I/O.
    pub fn with_backend<R>(&self, index: usize, f: impl FnOnce(&mut Backend) -> R) -> Result<R> {
        let mut inner = self.inner.lock().unwrap();
        let backend = inner
            .backends
            .get_mut(index)
            .ok_or(BackendError::NotFound(index))?;
        Ok(f(backend))
    }

    /// Returns the index of the first backend matching `role` whose state is
    /// `up` or `unknown` — candidates worth attempting a connection to.
    pub fn pick(&self, role: Role) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        inner.backends.iter().position(|b| {
            b.role == role && matches!(b.state, BackendState::Up | BackendState::Unknown)
        })
    }

    /// Throttled health-recovery sweep. Returns 0 (doing no work) unless at
    /// least [`HEALTH_CHECK_THROTTLE`] has elapsed since the last sweep. Any
    /// `down` backend older than [`DOWN_DWELL_BEFORE_RETRY`] flips to
    /// `unknown`, admitting retry traffic without hammering it.
    pub fn check(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        if let Some(last_check) = inner.last_check {
            if now < last_check {
                // Clock went backwards; reset rather than wedge the throttle open forever.
                info!("monotonic clock moved backwards, resetting health-check throttle");
                inner.last_check = None;
            } else if now.duration_since(last_check) < HEALTH_CHECK_THROTTLE {
                return 0;
            }
        }
        inner.last_check = Some(now);

        let mut awakened = 0;
        for backend in inner.backends.iter_mut() {
            if backend.state == BackendState::Down
                && now.duration_since(backend.state_since) > DOWN_DWELL_BEFORE_RETRY
            {
                backend.state = BackendState::Unknown;
                backend.state_since = now;
                awakened += 1;
            }
        }
        awakened
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_address_is_rejected() {
        let registry = BackendRegistry::new();
        registry.add("10.0.0.1:3306", Role::ReadWrite, 0).unwrap();
        let err = registry.add("10.0.0.1:3306", Role::ReadOnly, 0);
        assert!(err.is_err());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn health_throttle_skips_rapid_successive_checks() {
        let registry = BackendRegistry::new();
        let idx = registry.add("10.0.0.1:3306", Role::ReadWrite, 0).unwrap();
        registry
            .with_backend(idx, |b| {
                b.state = BackendState::Down;
                b.state_since = Instant::now() - Duration::from_secs(10);
            })
            .unwrap();

        let first = registry.check();
        assert_eq!(first, 1);

        let state_since_after_first = registry.with_backend(idx, |b| b.state_since).unwrap();
        let second = registry.check();
        assert_eq!(second, 0);
        let state_since_after_second = registry.with_backend(idx, |b| b.state_since).unwrap();
        assert_eq!(state_since_after_first, state_since_after_second);
    }

    #[test]
    fn down_backend_within_dwell_time_stays_down() {
        let registry = BackendRegistry::new();
        let idx = registry.add("10.0.0.1:3306", Role::ReadWrite, 0).unwrap();
        registry
            .with_backend(idx, |b| b.state = BackendState::Down)
            .unwrap();

        // state_since defaults to "now" at construction, well under the dwell time.
        let awakened = registry.check();
        assert_eq!(awakened, 0);
        let state = registry.with_backend(idx, |b| b.state).unwrap();
        assert_eq!(state, BackendState::Down);
    }

    #[test]
    fn pick_prefers_role_match_among_up_or_unknown() {
        let registry = BackendRegistry::new();
        let ro = registry.add("10.0.0.1:3306", Role::ReadOnly, 0).unwrap();
        registry
            .with_backend(ro, |b| b.state = BackendState::Offline)
            .unwrap();
        let rw = registry.add("10.0.0.2:3306", Role::ReadWrite, 0).unwrap();

        assert_eq!(registry.pick(Role::ReadWrite), Some(rw));
        assert_eq!(registry.pick(Role::ReadOnly), None);
    }

    #[test]
    fn min_idle_connections_is_threaded_into_the_backends_own_pool() {
        let registry = BackendRegistry::new();
        let idx = registry.add("10.0.0.1:3306", Role::ReadWrite, 3).unwrap();
        let min_idle = registry
            .with_backend(idx, |b| b.pool.min_idle_connections())
            .unwrap();
        assert_eq!(min_idle, 3);
    }
}
