//! Redis-backed counter store (shared across worker processes).
//!
//! - **Locks**: `SET key holder NX PX ttl`; released with a holder-checked
//!   Lua delete so an expired-then-reacquired slot is never freed by a stale
//!   holder
//! - **Counters**: Lua `INCR` + `PEXPIRE` on the first increment, so the
//!   window is fixed from the first hit and never extended
//!
//! Connections are reused through a small idle pool; a connection that saw
//! an error is dropped instead of returned. Connection and IO failures map to
//! [`StoreError::Unavailable`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument};

use jobthrottle_core::HolderId;

use super::{CounterStore, LockHandle, StoreError, StoreResult, to_chrono};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return count
"#;

/// Idle connections kept for reuse.
const MAX_IDLE_CONNECTIONS: usize = 16;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct RedisCounterStore {
    client: Arc<redis::Client>,
    idle: Arc<Mutex<Vec<redis::Connection>>>,
    release: Arc<redis::Script>,
    increment: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("client", &self.client)
            .field("idle", &self.idle_connections())
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Create a store for the given connection URL (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_redis_error)?;
        Ok(Self {
            client: Arc::new(client),
            idle: Arc::new(Mutex::new(Vec::new())),
            release: Arc::new(redis::Script::new(RELEASE_SCRIPT)),
            increment: Arc::new(redis::Script::new(INCREMENT_SCRIPT)),
        })
    }

    /// Connections currently parked in the pool.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Run `op` on a pooled connection, opening one if none is idle.
    fn with_connection<T>(&self, op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>) -> StoreResult<T> {
        let pooled = self.idle.lock().map_err(|_| StoreError::Poisoned)?.pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => {
                debug!("opening redis connection");
                self.client
                    .get_connection_with_timeout(CONNECT_TIMEOUT)
                    .map_err(map_redis_error)?
            }
        };

        let result = op(&mut conn).map_err(map_redis_error)?;

        let mut idle = self.idle.lock().map_err(|_| StoreError::Poisoned)?;
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
        Ok(result)
    }
}

fn map_redis_error(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else if e.kind() == redis::ErrorKind::TypeError {
        StoreError::WrongType(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

fn millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

impl CounterStore for RedisCounterStore {
    #[instrument(skip(self), level = "trace", err)]
    fn try_acquire_lock(&self, key: &str, holder: HolderId, ttl: Duration) -> StoreResult<Option<LockHandle>> {
        let reply: Option<String> = self.with_connection(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(holder.to_string())
                .arg("NX")
                .arg("PX")
                .arg(millis(ttl))
                .query(conn)
        })?;

        Ok(reply.map(|_| {
            let acquired_at = Utc::now();
            LockHandle {
                key: key.to_string(),
                holder,
                acquired_at,
                expires_at: acquired_at + to_chrono(ttl),
            }
        }))
    }

    #[instrument(skip(self, handle), fields(key = %handle.key), level = "trace", err)]
    fn release_lock(&self, handle: &LockHandle) -> StoreResult<bool> {
        let deleted: i64 = self.with_connection(|conn| {
            self.release
                .key(&handle.key)
                .arg(handle.holder.to_string())
                .invoke(conn)
        })?;

        Ok(deleted == 1)
    }

    #[instrument(skip(self), level = "trace", err)]
    fn increment_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let count: u64 =
            self.with_connection(|conn| self.increment.key(key).arg(millis(window)).invoke(conn))?;

        Ok(count)
    }

    #[instrument(skip(self), level = "trace", err)]
    fn peek(&self, key: &str) -> StoreResult<u64> {
        let value: Option<u64> = self.with_connection(|conn| redis::cmd("GET").arg(key).query(conn))?;

        Ok(value.unwrap_or(0))
    }
}

// The ignored tests need a running Redis (`REDIS_URL`, default localhost):
// `cargo test -p jobthrottle-infra --features redis -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RedisCounterStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisCounterStore::new(url).unwrap()
    }

    fn unique_key(name: &str) -> String {
        format!("jobthrottle:test:{name}:{}", HolderId::new())
    }

    #[test]
    #[ignore = "needs a running redis"]
    fn lock_is_exclusive_and_released_only_by_holder() {
        let store = store();
        let key = unique_key("lock");
        let ttl = Duration::from_secs(30);

        let handle = store.try_acquire_lock(&key, HolderId::new(), ttl).unwrap().unwrap();
        assert!(store.try_acquire_lock(&key, HolderId::new(), ttl).unwrap().is_none());

        let stale = LockHandle {
            holder: HolderId::new(),
            ..handle.clone()
        };
        assert!(!store.release_lock(&stale).unwrap());
        assert!(store.release_lock(&handle).unwrap());
        assert!(store.try_acquire_lock(&key, HolderId::new(), ttl).unwrap().is_some());
    }

    #[test]
    #[ignore = "needs a running redis"]
    fn counter_window_is_fixed_from_first_increment() {
        let store = store();
        let key = unique_key("counter");

        assert_eq!(store.increment_with_expiry(&key, Duration::from_millis(300)).unwrap(), 1);
        assert_eq!(store.increment_with_expiry(&key, Duration::from_secs(60)).unwrap(), 2);
        assert_eq!(store.peek(&key).unwrap(), 2);

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(store.peek(&key).unwrap(), 0);
        assert_eq!(store.increment_with_expiry(&key, Duration::from_millis(300)).unwrap(), 1);
    }

    #[test]
    #[ignore = "needs a running redis"]
    fn connections_are_reused() {
        let store = store();
        let key = unique_key("reuse");

        for _ in 0..5 {
            store.increment_with_expiry(&key, Duration::from_secs(5)).unwrap();
        }
        assert_eq!(store.idle_connections(), 1);
    }

    #[test]
    fn unreachable_server_is_unavailable() {
        let store = RedisCounterStore::new("redis://127.0.0.1:1").unwrap();

        assert!(matches!(store.peek("k"), Err(StoreError::Unavailable(_))));
        assert_eq!(store.idle_connections(), 0);
    }
}
