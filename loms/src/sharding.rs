//! Shard routing with read-replica fallback.
//!
//! A [`ShardRouter`] owns one [`Shard`] per physical partition. Each shard has
//! a primary and an optional replica, both exposed through the
//! [`ConnectionSource`] trait so the router works over sqlx pools and the
//! in-memory backend alike.
//!
//! Routing keys are hashed with 32-bit MurmurHash3 over their decimal string
//! form. Order ids carry their shard in the low digits and are routed with
//! [`OrderId::shard`] instead.

use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::errors::StorageError;
use crate::types::{OrderId, ShardIndex, UserId, MAX_SHARDS};

/// MurmurHash3, x86 32-bit variant.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mix = |k: u32| k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);

    let mut hash = seed;
    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        hash ^= mix(k);
        hash = hash.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let k = tail
            .iter()
            .rev()
            .fold(0_u32, |acc, byte| (acc << 8) | u32::from(*byte));
        hash ^= mix(k);
    }

    // length is mixed in modulo 2^32
    #[allow(clippy::cast_possible_truncation)]
    let length = data.len() as u32;
    hash ^= length;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    hash
}

/// Whether a unit of work only reads or may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// May be served by a replica.
    Read,
    /// Must be served by the primary.
    Write,
}

/// Something that hands out connections to one physical database.
///
/// Connections are RAII guards: dropping one returns it to its pool.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Connection handed to callers.
    type Connection: Send;

    /// Acquires a connection, waiting up to the source's own timeout.
    async fn acquire(&self) -> Result<Self::Connection, StorageError>;
}

/// Primary and optional replica for one partition.
#[derive(Debug, Clone)]
pub struct Shard<S> {
    primary: S,
    replica: Option<S>,
}

impl<S> Shard<S> {
    /// A shard without a replica.
    pub const fn new(primary: S) -> Self {
        Self {
            primary,
            replica: None,
        }
    }

    /// A shard whose reads prefer `replica`.
    pub const fn with_replica(primary: S, replica: S) -> Self {
        Self {
            primary,
            replica: Some(replica),
        }
    }

    /// The primary source.
    pub const fn primary(&self) -> &S {
        &self.primary
    }

    /// The replica source, if configured.
    pub const fn replica(&self) -> Option<&S> {
        self.replica.as_ref()
    }
}

/// Connection bound to a shard, with the primary held back for one retry
/// when the bound connection is a replica.
pub struct FallbackConnection<C> {
    shard: ShardIndex,
    current: C,
    fallback: Option<C>,
}

impl<C> fmt::Debug for FallbackConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackConnection")
            .field("shard", &self.shard)
            .field("on_replica", &self.fallback.is_some())
            .finish()
    }
}

impl<C: Send> FallbackConnection<C> {
    /// Connection with no fallback.
    pub const fn direct(shard: ShardIndex, connection: C) -> Self {
        Self {
            shard,
            current: connection,
            fallback: None,
        }
    }

    /// Replica connection that falls back to `primary` on error.
    pub const fn with_fallback(shard: ShardIndex, replica: C, primary: C) -> Self {
        Self {
            shard,
            current: replica,
            fallback: Some(primary),
        }
    }

    /// Shard this connection belongs to.
    pub const fn shard(&self) -> ShardIndex {
        self.shard
    }

    /// True when operations first run on a replica.
    pub const fn on_replica(&self) -> bool {
        self.fallback.is_some()
    }

    /// The primary connection, for work that must not touch a replica.
    pub fn primary_mut(&mut self) -> &mut C {
        match self.fallback {
            Some(ref mut primary) => primary,
            None => &mut self.current,
        }
    }

    /// Runs `op` on the bound connection; if that fails and the bound
    /// connection is a replica, runs it once more on the primary.
    ///
    /// Every error triggers the retry, including ones the primary will
    /// reproduce, such as a malformed query.
    pub async fn run<T, E, F>(&mut self, mut op: F) -> Result<T, E>
    where
        F: for<'c> FnMut(&'c mut C) -> BoxFuture<'c, Result<T, E>> + Send,
        T: Send,
        E: fmt::Display + Send,
    {
        match op(&mut self.current).await {
            Ok(value) => Ok(value),
            Err(error) => match self.fallback.as_mut() {
                Some(primary) => {
                    warn!(
                        shard = %self.shard,
                        error = %error,
                        "[router.fallback] replica operation failed, retrying on primary"
                    );
                    op(primary).await
                }
                None => Err(error),
            },
        }
    }
}

/// Routes keys to shards and binds connections for the requested intent.
#[derive(Debug, Clone)]
pub struct ShardRouter<S> {
    shards: Vec<Shard<S>>,
}

impl<S: ConnectionSource> ShardRouter<S> {
    /// Builds a router over `shards`; index `i` of the vector is shard `i`.
    pub fn new(shards: Vec<Shard<S>>) -> Result<Self, StorageError> {
        if shards.is_empty() {
            return Err(StorageError::InvalidTopology(
                "at least one shard is required".to_owned(),
            ));
        }
        if shards.len() > MAX_SHARDS {
            return Err(StorageError::InvalidTopology(format!(
                "{} shards configured, at most {MAX_SHARDS} supported",
                shards.len()
            )));
        }
        Ok(Self { shards })
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Every shard index, in order.
    pub fn indices(&self) -> impl Iterator<Item = ShardIndex> {
        (0..self.shards.len()).map(ShardIndex::new)
    }

    /// Shard at `index`.
    pub fn shard(&self, index: ShardIndex) -> Result<&Shard<S>, StorageError> {
        self.shards
            .get(index.into_inner())
            .ok_or(StorageError::UnknownShard {
                index: index.into_inner(),
                shard_count: self.shards.len(),
            })
    }

    /// Shard owning `key`: murmur3 of its decimal form, modulo shard count.
    pub fn shard_for_key(&self, key: impl fmt::Display) -> ShardIndex {
        let hash = murmur3_32(key.to_string().as_bytes(), 0);
        // a u32 always fits in usize on supported targets
        let hash = usize::try_from(hash).unwrap_or(usize::MAX);
        ShardIndex::new(hash % self.shards.len())
    }

    /// Shard that stores `user`'s orders.
    pub fn shard_for_user(&self, user: UserId) -> ShardIndex {
        self.shard_for_key(user)
    }

    /// Shard encoded in `order`.
    pub fn shard_for_order(&self, order: OrderId) -> Result<ShardIndex, StorageError> {
        let index = order.shard();
        self.shard(index).map(|_| index)
    }

    /// Connection for the shard owning `key`.
    pub async fn pick(
        &self,
        key: impl fmt::Display + Send,
        intent: Intent,
    ) -> Result<FallbackConnection<S::Connection>, StorageError> {
        let index = self.shard_for_key(key);
        self.pick_shard(index, intent).await
    }

    /// Connection for the shard encoded in `order`.
    pub async fn pick_order(
        &self,
        order: OrderId,
        intent: Intent,
    ) -> Result<FallbackConnection<S::Connection>, StorageError> {
        let index = self.shard_for_order(order)?;
        self.pick_shard(index, intent).await
    }

    /// Connection for shard 0, which holds inventory.
    pub async fn pick_default(
        &self,
        intent: Intent,
    ) -> Result<FallbackConnection<S::Connection>, StorageError> {
        self.pick_shard(ShardIndex::default_shard(), intent).await
    }

    /// One connection per shard, in index order.
    pub async fn pick_all(
        &self,
        intent: Intent,
    ) -> Result<Vec<FallbackConnection<S::Connection>>, StorageError> {
        let mut connections = Vec::with_capacity(self.shards.len());
        for index in self.indices() {
            connections.push(self.pick_shard(index, intent).await?);
        }
        Ok(connections)
    }

    /// Connection for shard `index`.
    ///
    /// The primary is always acquired. Read intent additionally tries the
    /// replica; if that cannot be acquired the primary serves the read alone.
    pub async fn pick_shard(
        &self,
        index: ShardIndex,
        intent: Intent,
    ) -> Result<FallbackConnection<S::Connection>, StorageError> {
        let shard = self.shard(index)?;
        let primary = shard.primary.acquire().await?;

        let Some(replica) = shard.replica.as_ref().filter(|_| intent == Intent::Read) else {
            return Ok(FallbackConnection::direct(index, primary));
        };

        match replica.acquire().await {
            Ok(connection) => Ok(FallbackConnection::with_fallback(index, connection, primary)),
            Err(error) => {
                debug!(
                    shard = %index,
                    error = %error,
                    "[router.pick] replica unavailable, reading from primary"
                );
                Ok(FallbackConnection::direct(index, primary))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Operation;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Role {
        Primary,
        Replica,
    }

    #[derive(Clone)]
    struct FakeSource {
        role: Role,
        down: Arc<AtomicBool>,
        acquired: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn new(role: Role) -> Self {
            Self {
                role,
                down: Arc::new(AtomicBool::new(false)),
                acquired: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ConnectionSource for FakeSource {
        type Connection = Role;

        async fn acquire(&self) -> Result<Role, StorageError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StorageError::failure(Operation::Acquire, "down"));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(self.role)
        }
    }

    fn router(shards: usize, with_replica: bool) -> ShardRouter<FakeSource> {
        let shards = (0..shards)
            .map(|_| {
                if with_replica {
                    Shard::with_replica(FakeSource::new(Role::Primary), FakeSource::new(Role::Replica))
                } else {
                    Shard::new(FakeSource::new(Role::Primary))
                }
            })
            .collect();
        ShardRouter::new(shards).expect("valid topology")
    }

    #[test]
    fn murmur3_matches_reference_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(murmur3_32(b"Hello, world!", 0), 0xc036_3e43);
        assert_eq!(
            murmur3_32(b"The quick brown fox jumps over the lazy dog", 0),
            0x2e4f_f723
        );
    }

    #[test]
    fn keys_hash_their_decimal_form() {
        let router = router(3, false);
        // murmur3("42") = 0xbc58a436, murmur3("1001") = 0x167208d3
        assert_eq!(router.shard_for_key(42), ShardIndex::new(2));
        assert_eq!(router.shard_for_key("1001"), ShardIndex::new(1));
        assert_eq!(
            router.shard_for_user(UserId::try_new(42).expect("positive")),
            ShardIndex::new(2)
        );
    }

    #[test]
    fn single_shard_routes_everything_to_zero() {
        let router = router(1, false);
        for key in 0..100 {
            assert_eq!(router.shard_for_key(key), ShardIndex::new(0));
        }
    }

    #[test]
    fn empty_topology_is_rejected() {
        let result = ShardRouter::<FakeSource>::new(Vec::new());
        assert!(matches!(result, Err(StorageError::InvalidTopology(_))));
    }

    #[test]
    fn order_outside_topology_is_unknown_shard() {
        let router = router(2, false);
        let order = OrderId::try_new(5_005).expect("positive");
        assert_eq!(
            router.shard_for_order(order),
            Err(StorageError::UnknownShard {
                index: 5,
                shard_count: 2
            })
        );
    }

    #[tokio::test]
    async fn write_intent_binds_primary() {
        let router = router(1, true);
        let mut connection = router.pick_default(Intent::Write).await.expect("acquired");
        assert!(!connection.on_replica());
        assert_eq!(*connection.primary_mut(), Role::Primary);
    }

    #[tokio::test]
    async fn read_intent_prefers_replica() {
        let router = router(1, true);
        let mut connection = router.pick_default(Intent::Read).await.expect("acquired");
        let served_by = connection
            .run(|role| Box::pin(async move { Ok::<_, StorageError>(*role) }))
            .await
            .expect("succeeds");
        assert_eq!(served_by, Role::Replica);
    }

    #[tokio::test]
    async fn read_falls_back_to_primary_when_replica_cannot_be_acquired() {
        let router = router(1, true);
        let shard = router.shard(ShardIndex::new(0)).expect("exists");
        shard.replica().expect("configured").down.store(true, Ordering::SeqCst);

        let connection = router.pick_default(Intent::Read).await.expect("acquired");
        assert!(!connection.on_replica());
    }

    #[tokio::test]
    async fn failed_replica_operation_is_retried_once_on_primary() {
        let router = router(1, true);
        let mut connection = router.pick_default(Intent::Read).await.expect("acquired");
        let attempts = AtomicUsize::new(0);

        let served_by = connection
            .run(|role| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let role = *role;
                Box::pin(async move {
                    match role {
                        Role::Replica => Err(StorageError::failure(Operation::ReadOrder, "stale")),
                        Role::Primary => Ok(role),
                    }
                })
            })
            .await
            .expect("primary succeeds");

        assert_eq!(served_by, Role::Primary);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn primary_error_is_not_retried() {
        let router = router(1, true);
        let mut connection = router.pick_default(Intent::Write).await.expect("acquired");
        let attempts = AtomicUsize::new(0);

        let result = connection
            .run(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err::<(), _>(StorageError::failure(Operation::InsertOrder, "boom")) })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pick_all_returns_one_connection_per_shard() {
        let router = router(4, false);
        let connections = router.pick_all(Intent::Read).await.expect("acquired");
        let shards: Vec<ShardIndex> = connections.iter().map(FallbackConnection::shard).collect();
        assert_eq!(shards, router.indices().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unavailable_primary_fails_the_pick() {
        let router = router(1, true);
        let shard = router.shard(ShardIndex::new(0)).expect("exists");
        shard.primary().down.store(true, Ordering::SeqCst);

        let result = router.pick_default(Intent::Read).await;
        assert!(matches!(result, Err(StorageError::Failure { operation: Operation::Acquire, .. })));
        assert_eq!(shard.replica().expect("configured").acquired.load(Ordering::SeqCst), 0);
    }
}
