//! TTL-bounded turn ownership across processes.
//!
//! A [`TurnManager`] hands out at most one live claim per room. Claims expire
//! after their TTL; there is no renewal, so a turn that outlives its TTL is
//! indistinguishable from an abandoned one and may be taken by the next
//! [`try_acquire`](TurnManager::try_acquire).
//!
//! Two backends are provided:
//!
//! - [`InMemoryTurnManager`]: a mutex-guarded map with expiry checked on read,
//!   for single-process deployments and tests.
//! - [`ExternalTurnManager`]: keys `turnlock:<room>` in an [`AtomicStore`].
//!   Acquisition is a single set-if-absent-with-expiry and release a single
//!   compare-and-delete, so no other acquirer can slip in between a read and
//!   a delete. [`RedisStore`] (feature `redis`) implements the store with
//!   `SET NX PX` and a Lua script.
//!
//! # Example
//!
//! ```rust
//! use voicepanel::turn_manager::{InMemoryTurnManager, TurnManager};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let turns = InMemoryTurnManager::new();
//! assert!(turns.try_acquire("pitch", "Mark", Duration::from_secs(30)).await?);
//! assert!(!turns.try_acquire("pitch", "Kevin", Duration::from_secs(30)).await?);
//! assert_eq!(turns.get_current("pitch").await?.as_deref(), Some("Mark"));
//! assert!(!turns.release("pitch", "Kevin").await?);
//! assert!(turns.release("pitch", "Mark").await?);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Errors raised by turn managers. A refused acquisition is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnManagerError {
    /// The requested backend cannot be used (not compiled in, bad URL, unreachable).
    BackendUnavailable(String),
    /// Claims need a TTL of at least one millisecond.
    InvalidTtl(Duration),
    /// A round-trip to the external store failed.
    Store(String),
}

impl fmt::Display for TurnManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnManagerError::BackendUnavailable(msg) => {
                write!(f, "Turn manager backend unavailable: {}", msg)
            }
            TurnManagerError::InvalidTtl(ttl) => write!(f, "Invalid turn TTL: {:?}", ttl),
            TurnManagerError::Store(msg) => write!(f, "Turn store error: {}", msg),
        }
    }
}

impl Error for TurnManagerError {}

/// Mutual exclusion over a room's turn.
#[async_trait]
pub trait TurnManager: Send + Sync {
    /// Claim `room` for `agent` if no live claim exists. Returns `false` without side effects otherwise.
    async fn try_acquire(&self, room: &str, agent: &str, ttl: Duration) -> Result<bool, TurnManagerError>;

    /// The agent holding a live claim on `room`, if any.
    async fn get_current(&self, room: &str) -> Result<Option<String>, TurnManagerError>;

    /// Clear the claim if `agent` holds it. Returns whether a claim was cleared.
    async fn release(&self, room: &str, agent: &str) -> Result<bool, TurnManagerError>;

    fn backend_name(&self) -> &str;
}

fn validate_ttl(ttl: Duration) -> Result<(), TurnManagerError> {
    if ttl.as_millis() == 0 {
        return Err(TurnManagerError::InvalidTtl(ttl));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct TurnClaim {
    agent: String,
    expires_at: Instant,
}

impl TurnClaim {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local turn manager.
#[derive(Debug, Default)]
pub struct InMemoryTurnManager {
    turns: Mutex<HashMap<String, TurnClaim>>,
}

impl InMemoryTurnManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TurnManager for InMemoryTurnManager {
    async fn try_acquire(&self, room: &str, agent: &str, ttl: Duration) -> Result<bool, TurnManagerError> {
        validate_ttl(ttl)?;
        let now = Instant::now();
        let mut turns = self.turns.lock().await;
        if let Some(current) = turns.get(room) {
            if current.is_live(now) {
                log::debug!(
                    "turn-lock refused room={} agent={} owner={}",
                    room,
                    agent,
                    current.agent
                );
                return Ok(false);
            }
        }
        turns.insert(
            room.to_string(),
            TurnClaim {
                agent: agent.to_string(),
                expires_at: now + ttl,
            },
        );
        log::debug!("turn-lock acquired room={} agent={} ttl={:?}", room, agent, ttl);
        Ok(true)
    }

    async fn get_current(&self, room: &str) -> Result<Option<String>, TurnManagerError> {
        let now = Instant::now();
        let mut turns = self.turns.lock().await;
        match turns.get(room) {
            Some(claim) if claim.is_live(now) => Ok(Some(claim.agent.clone())),
            Some(_) => {
                turns.remove(room);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn release(&self, room: &str, agent: &str) -> Result<bool, TurnManagerError> {
        let now = Instant::now();
        let mut turns = self.turns.lock().await;
        let Some(claim) = turns.get(room) else {
            return Ok(false);
        };
        if !claim.is_live(now) {
            turns.remove(room);
            return Ok(false);
        }
        if claim.agent != agent {
            return Ok(false);
        }
        turns.remove(room);
        Ok(true)
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

/// Key-value store offering the two atomic primitives the external backend needs.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Set `key` to `value` with expiry `ttl` only if `key` is absent. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, TurnManagerError>;

    async fn get(&self, key: &str) -> Result<Option<String>, TurnManagerError>;

    /// Atomically delete `key` if its value equals `expected`. Returns whether it was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, TurnManagerError>;
}

/// Turn manager backed by an external [`AtomicStore`].
pub struct ExternalTurnManager<S: AtomicStore> {
    store: S,
}

impl<S: AtomicStore> ExternalTurnManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Store key holding `room`'s claim.
    pub fn turn_key(room: &str) -> String {
        format!("turnlock:{}", room)
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: AtomicStore> TurnManager for ExternalTurnManager<S> {
    async fn try_acquire(&self, room: &str, agent: &str, ttl: Duration) -> Result<bool, TurnManagerError> {
        validate_ttl(ttl)?;
        let acquired = self
            .store
            .set_if_absent(&Self::turn_key(room), agent, ttl)
            .await?;
        log::debug!(
            "turn-lock {} room={} agent={} ttl={:?}",
            if acquired { "acquired" } else { "refused" },
            room,
            agent,
            ttl
        );
        Ok(acquired)
    }

    async fn get_current(&self, room: &str) -> Result<Option<String>, TurnManagerError> {
        self.store.get(&Self::turn_key(room)).await
    }

    async fn release(&self, room: &str, agent: &str) -> Result<bool, TurnManagerError> {
        self.store
            .delete_if_equals(&Self::turn_key(room), agent)
            .await
    }

    fn backend_name(&self) -> &str {
        "external"
    }
}

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::{AtomicStore, TurnManagerError};
    use async_trait::async_trait;
    use redis::aio::MultiplexedConnection;
    use std::time::Duration;

    const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

    impl From<redis::RedisError> for TurnManagerError {
        fn from(err: redis::RedisError) -> Self {
            TurnManagerError::Store(err.to_string())
        }
    }

    /// [`AtomicStore`] over a Redis server.
    #[derive(Clone)]
    pub struct RedisStore {
        connection: MultiplexedConnection,
    }

    impl RedisStore {
        /// Connect to `url`, failing fast if the URL is invalid or the server is unreachable.
        pub async fn connect(url: &str) -> Result<Self, TurnManagerError> {
            let client = redis::Client::open(url)
                .map_err(|err| TurnManagerError::BackendUnavailable(err.to_string()))?;
            let connection = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|err| TurnManagerError::BackendUnavailable(err.to_string()))?;
            Ok(Self { connection })
        }
    }

    #[async_trait]
    impl AtomicStore for RedisStore {
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, TurnManagerError> {
            let mut connection = self.connection.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut connection)
                .await?;
            Ok(reply.is_some())
        }

        async fn get(&self, key: &str) -> Result<Option<String>, TurnManagerError> {
            let mut connection = self.connection.clone();
            let value: Option<String> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut connection)
                .await?;
            Ok(value)
        }

        async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, TurnManagerError> {
            let mut connection = self.connection.clone();
            let deleted: i64 = redis::Script::new(COMPARE_AND_DELETE)
                .key(key)
                .arg(expected)
                .invoke_async(&mut connection)
                .await?;
            Ok(deleted > 0)
        }
    }
}

/// Build the turn manager selected by `redis_url`.
///
/// `None` yields an [`InMemoryTurnManager`]. A URL yields an
/// [`ExternalTurnManager`] over Redis, or
/// [`TurnManagerError::BackendUnavailable`] when the crate was built without
/// the `redis` feature or the server cannot be reached.
pub async fn create_turn_manager(
    redis_url: Option<&str>,
) -> Result<Arc<dyn TurnManager>, TurnManagerError> {
    match redis_url {
        None => Ok(Arc::new(InMemoryTurnManager::new())),
        Some(url) => connect_external(url).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_external(url: &str) -> Result<Arc<dyn TurnManager>, TurnManagerError> {
    let store = RedisStore::connect(url).await?;
    log::info!("turn-lock backend=redis");
    Ok(Arc::new(ExternalTurnManager::new(store)))
}

#[cfg(not(feature = "redis"))]
async fn connect_external(_url: &str) -> Result<Arc<dyn TurnManager>, TurnManagerError> {
    Err(TurnManagerError::BackendUnavailable(
        "built without the `redis` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Store with the same atomicity guarantees as Redis, backed by a map.
    #[derive(Default)]
    struct MapStore {
        entries: Mutex<HashMap<String, (String, Instant)>>,
    }

    #[async_trait]
    impl AtomicStore for MapStore {
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, TurnManagerError> {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            if matches!(entries.get(key), Some((_, expires)) if *expires > now) {
                return Ok(false);
            }
            entries.insert(key.to_string(), (value.to_string(), now + ttl));
            Ok(true)
        }

        async fn get(&self, key: &str) -> Result<Option<String>, TurnManagerError> {
            let now = Instant::now();
            Ok(self
                .entries
                .lock()
                .await
                .get(key)
                .filter(|(_, expires)| *expires > now)
                .map(|(value, _)| value.clone()))
        }

        async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, TurnManagerError> {
            let now = Instant::now();
            let mut entries = self.entries.lock().await;
            match entries.get(key) {
                Some((value, expires)) if *expires > now && value == expected => {
                    entries.remove(key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    async fn exercise_mutual_exclusion(turns: &dyn TurnManager) {
        let ttl = Duration::from_secs(10);
        assert!(turns.try_acquire("pitch", "Mark", ttl).await.unwrap());
        assert!(!turns.try_acquire("pitch", "Kevin", ttl).await.unwrap());
        assert!(!turns.try_acquire("pitch", "Mark", ttl).await.unwrap());
        assert!(turns.try_acquire("other-room", "Kevin", ttl).await.unwrap());
        assert_eq!(turns.get_current("pitch").await.unwrap().as_deref(), Some("Mark"));

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(turns.get_current("pitch").await.unwrap(), None);
        assert!(turns.try_acquire("pitch", "Kevin", ttl).await.unwrap());
        assert_eq!(turns.get_current("pitch").await.unwrap().as_deref(), Some("Kevin"));
    }

    async fn exercise_owner_only_release(turns: &dyn TurnManager) {
        let ttl = Duration::from_secs(5);
        assert!(!turns.release("pitch", "Mark").await.unwrap());
        assert!(turns.try_acquire("pitch", "Mark", ttl).await.unwrap());
        assert!(!turns.release("pitch", "Lori").await.unwrap());
        assert_eq!(turns.get_current("pitch").await.unwrap().as_deref(), Some("Mark"));
        assert!(turns.release("pitch", "Mark").await.unwrap());
        assert_eq!(turns.get_current("pitch").await.unwrap(), None);
        assert!(turns.try_acquire("pitch", "Lori", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!turns.release("pitch", "Lori").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn memory_backend_excludes_until_ttl_elapses() {
        exercise_mutual_exclusion(&InMemoryTurnManager::new()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn memory_backend_release_requires_ownership() {
        exercise_owner_only_release(&InMemoryTurnManager::new()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn external_backend_excludes_until_ttl_elapses() {
        exercise_mutual_exclusion(&ExternalTurnManager::new(MapStore::default())).await;
    }

    #[tokio::test(start_paused = true)]
    async fn external_backend_release_requires_ownership() {
        exercise_owner_only_release(&ExternalTurnManager::new(MapStore::default())).await;
    }

    #[tokio::test]
    async fn external_backend_namespaces_keys_per_room() {
        let turns = ExternalTurnManager::new(MapStore::default());
        turns
            .try_acquire("pitch", "Mark", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            turns.store().get("turnlock:pitch").await.unwrap().as_deref(),
            Some("Mark")
        );
        assert_eq!(turns.backend_name(), "external");
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let turns = InMemoryTurnManager::new();
        let err = turns
            .try_acquire("pitch", "Mark", Duration::from_micros(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnManagerError::InvalidTtl(_)));
        assert_eq!(turns.get_current("pitch").await.unwrap(), None);
    }

    #[tokio::test]
    async fn factory_defaults_to_memory() {
        let turns = create_turn_manager(None).await.unwrap();
        assert_eq!(turns.backend_name(), "memory");
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn factory_fails_fast_without_redis_support() {
        let err = create_turn_manager(Some("redis://127.0.0.1/"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TurnManagerError::BackendUnavailable(_)));
    }
}
