//! The pooled connection wrapper and its retry interceptor.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::events::{ConnectionEvent, FailureEvent, Level};
use crate::pool::{checkin, checkout, replenish_one, SharedPool};
use crate::transport::{
    CassandraTransport, CfDef, ColumnOrSuperColumn, ColumnParent, ColumnPath, ConsistencyLevel,
    IndexClause, KeyRange, KeySlice, KsDef, ManageTransport, MutationMap, ServerAddress,
    SlicePredicate, TransportError,
};

/// Where a wrapper currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrapperState {
    /// Sitting in a pool's idle queue.
    InQueue,
    /// Held by a caller (or by the pool mid-transition).
    CheckedOut,
    /// Closed; will never serve another request.
    Disposed,
}

/// The swappable guts of a wrapper. Failover moves a whole core from a
/// donor wrapper into the one the caller is holding, so everything that
/// must travel with the transport lives here.
pub(crate) struct WrapperCore<M: ManageTransport> {
    pub(crate) transport: Option<M::Transport>,
    pub(crate) state: WrapperState,
    pub(crate) op_count: u64,
    pub(crate) start_time: SystemTime,
    pub(crate) server: ServerAddress,
    pub(crate) info: HashMap<String, String>,
}

/// A pooled connection to one Cassandra server.
///
/// Wrappers are only obtained through [`QueuePool::get`] and expose the
/// retriable RPC surface of the underlying transport. When a retriable
/// call hits a transient wire error the wrapper closes its transport,
/// checks a fresh connection out of the pool, splices that connection's
/// state into itself, and retries; the handle the caller holds keeps
/// working across the failover.
///
/// [`QueuePool::get`]: crate::QueuePool::get
pub struct ConnectionWrapper<M: ManageTransport> {
    weak_self: Weak<ConnectionWrapper<M>>,
    pool: Weak<SharedPool<M>>,
    // Consecutive failovers since the last checkin. Lives outside the
    // core so a splice does not reset the caller's retry budget.
    retry_count: AtomicU32,
    core: Mutex<WrapperCore<M>>,
}

impl<M: ManageTransport> ConnectionWrapper<M> {
    /// Opens a transport to `server` and wraps it. The new wrapper is
    /// `CHECKED_OUT` and owned by the caller.
    pub(crate) fn open(
        pool: &Arc<SharedPool<M>>,
        server: ServerAddress,
    ) -> Result<Arc<ConnectionWrapper<M>>, TransportError> {
        let transport = pool.manager.open(&server, &pool.config.transport)?;
        let wrapper = Arc::new_cyclic(|weak_self| ConnectionWrapper {
            weak_self: weak_self.clone(),
            pool: Arc::downgrade(pool),
            retry_count: AtomicU32::new(0),
            core: Mutex::new(WrapperCore {
                transport: Some(transport),
                state: WrapperState::CheckedOut,
                op_count: 0,
                start_time: SystemTime::now(),
                server,
                info: HashMap::new(),
            }),
        });
        pool.notifier.connection_created(|| ConnectionEvent {
            base: pool.base(Level::Debug),
            connection: wrapper.clone(),
            message: None,
            error: None,
        });
        Ok(wrapper)
    }

    /// A strong handle to this wrapper, for event payloads and queue
    /// hand-offs. Callable only while a caller holds the wrapper, which
    /// is every context the pool invokes it from.
    fn handle(&self) -> Arc<ConnectionWrapper<M>> {
        self.weak_self
            .upgrade()
            .expect("wrapper outlives the call that borrowed it")
    }

    /// The server this wrapper is currently bound to. Changes when a
    /// failover retargets the wrapper.
    pub fn server(&self) -> ServerAddress {
        self.core.lock().unwrap().server.clone()
    }

    /// Retriable RPCs attempted on this transport since it was opened.
    pub fn operation_count(&self) -> u64 {
        self.core.lock().unwrap().op_count
    }

    /// When the current transport was opened.
    pub fn start_time(&self) -> SystemTime {
        self.core.lock().unwrap().start_time
    }

    /// The wrapper's lifecycle state.
    pub fn state(&self) -> WrapperState {
        self.core.lock().unwrap().state
    }

    /// Consecutive failovers since the last checkin.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Reads a caller scratch entry.
    pub fn info(&self, key: &str) -> Option<String> {
        self.core.lock().unwrap().info.get(key).cloned()
    }

    /// Stores a caller scratch entry.
    pub fn set_info(&self, key: impl Into<String>, value: impl Into<String>) {
        self.core
            .lock()
            .unwrap()
            .info
            .insert(key.into(), value.into());
    }

    /// Returns this wrapper to its pool, equivalent to calling
    /// [`QueuePool::return_conn`] on it.
    ///
    /// [`QueuePool::return_conn`]: crate::QueuePool::return_conn
    pub fn return_to_pool(&self) -> Result<()> {
        let pool = self.pool.upgrade().ok_or_else(pool_dropped)?;
        checkin(&pool, self.handle())
    }

    /// Closes the underlying transport. Idempotent; the wrapper itself
    /// stays in its current lifecycle state.
    pub fn close(&self) {
        let transport = self.core.lock().unwrap().transport.take();
        if let Some(mut transport) = transport {
            transport.close();
        }
    }

    pub(crate) fn reset_retry_count(&self) {
        self.retry_count.store(0, Ordering::Relaxed);
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<SharedPool<M>>) -> bool {
        self.pool.as_ptr() == Arc::as_ptr(pool)
    }

    /// `CHECKED_OUT -> IN_QUEUE`, performed right before a wrapper is
    /// pushed into the idle queue.
    pub(crate) fn transition_in_queue(&self) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.state != WrapperState::CheckedOut {
            return Err(Error::InvalidRequest(
                "a connection has been returned to the connection pool twice".into(),
            ));
        }
        core.state = WrapperState::InQueue;
        Ok(())
    }

    /// `IN_QUEUE -> CHECKED_OUT`, performed right after a wrapper is
    /// popped from the idle queue.
    pub(crate) fn transition_checked_out(&self) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.state != WrapperState::InQueue {
            return Err(Error::InvalidRequest(
                "a connection has been checked out twice".into(),
            ));
        }
        core.state = WrapperState::CheckedOut;
        Ok(())
    }

    /// Terminal transition: closes the transport exactly once and emits
    /// `connection_disposed`.
    pub(crate) fn dispose(&self, reason: &str, error: Option<TransportError>) -> Result<()> {
        let transport = {
            let mut core = self.core.lock().unwrap();
            if core.state == WrapperState::Disposed {
                return Err(Error::InvalidRequest(
                    "a connection has been disposed twice".into(),
                ));
            }
            core.state = WrapperState::Disposed;
            core.transport.take()
        };
        if let Some(mut transport) = transport {
            transport.close();
        }
        if let Some(pool) = self.pool.upgrade() {
            let level = if error.is_some() {
                Level::Warn
            } else {
                Level::Debug
            };
            pool.notifier.connection_disposed(|| ConnectionEvent {
                base: pool.base(level),
                connection: self.handle(),
                message: Some(reason.to_string()),
                error,
            });
        }
        Ok(())
    }

    /// Takes over `donor`'s core. The handle the caller holds is
    /// retargeted to the donor's server and transport; the donor husk is
    /// left disposed, holding the already closed transport slot.
    fn adopt(&self, donor: &ConnectionWrapper<M>) {
        debug_assert!(!std::ptr::eq(self, donor));
        let mut mine = self.core.lock().unwrap();
        let mut theirs = donor.core.lock().unwrap();
        mem::swap(&mut *mine, &mut *theirs);
        mine.state = WrapperState::CheckedOut;
        theirs.state = WrapperState::Disposed;
    }

    /// The interceptor around every retriable RPC.
    ///
    /// Transient errors trigger failover: notify listeners, charge the
    /// retry budget, close the broken transport, ask the pool to enqueue
    /// an eager replacement, check out a fresh wrapper, splice it into
    /// `self`, and run the same operation again. Fatal errors propagate.
    fn with_retry<T>(
        &self,
        op: impl Fn(&mut M::Transport) -> Result<T, TransportError>,
    ) -> Result<T> {
        loop {
            let attempt = {
                let mut core = self.core.lock().unwrap();
                core.op_count += 1;
                match core.transport.as_mut() {
                    Some(transport) => op(transport),
                    None => Err(TransportError::Transport("transport is closed".into())),
                }
            };
            let error = match attempt {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() => error,
                Err(error) => return Err(Error::Transport(error)),
            };

            let pool = self.pool.upgrade().ok_or_else(pool_dropped)?;
            let server = self.server();
            pool.notifier.connection_failed(|| FailureEvent {
                base: pool.base(Level::Info),
                error,
                server,
                connection: Some(self.handle()),
            });

            let retries = self.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
            if pool.config.max_retries >= 0 && retries > pool.config.max_retries as u32 {
                return Err(Error::MaximumRetry { retries });
            }

            self.close();
            // The thread slot must not keep handing back this wrapper
            // while its transport is gone.
            if pool.config.use_threadlocal {
                pool.clear_thread_slot();
            }
            replenish_one(&pool);
            let fresh = checkout(&pool)?;
            self.adopt(&fresh);
            // After the splice, self is the thread's live wrapper again.
            if pool.config.use_threadlocal {
                pool.cache_in_thread_slot(&self.handle());
            }
        }
    }

    /// Reads selected columns of a single row, failing over on transient
    /// wire errors.
    pub fn get_slice(
        &self,
        key: &[u8],
        parent: &ColumnParent,
        predicate: &SlicePredicate,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<ColumnOrSuperColumn>> {
        self.with_retry(|transport| transport.get_slice(key, parent, predicate, consistency))
    }

    /// Reads a contiguous range of rows, failing over on transient wire
    /// errors.
    pub fn get_range_slices(
        &self,
        parent: &ColumnParent,
        predicate: &SlicePredicate,
        range: &KeyRange,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<KeySlice>> {
        self.with_retry(|transport| {
            transport.get_range_slices(parent, predicate, range, consistency)
        })
    }

    /// Reads rows matching a secondary index clause, failing over on
    /// transient wire errors.
    pub fn get_indexed_slices(
        &self,
        parent: &ColumnParent,
        clause: &IndexClause,
        predicate: &SlicePredicate,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<KeySlice>> {
        self.with_retry(|transport| {
            transport.get_indexed_slices(parent, clause, predicate, consistency)
        })
    }

    /// Applies a batch of mutations, failing over on transient wire
    /// errors. The batch is re-sent as-is after a failover.
    pub fn batch_mutate(
        &self,
        mutations: &MutationMap,
        consistency: ConsistencyLevel,
    ) -> Result<()> {
        self.with_retry(|transport| transport.batch_mutate(mutations, consistency))
    }

    /// Deletes the addressed column or row, failing over on transient
    /// wire errors.
    pub fn remove(
        &self,
        key: &[u8],
        path: &ColumnPath,
        timestamp: i64,
        consistency: ConsistencyLevel,
    ) -> Result<()> {
        self.with_retry(|transport| transport.remove(key, path, timestamp, consistency))
    }

    /// Drops every row of a column family, failing over on transient
    /// wire errors.
    pub fn truncate(&self, column_family: &str) -> Result<()> {
        self.with_retry(|transport| transport.truncate(column_family))
    }

    /// Fetches the schema of `keyspace`. Not retried: errors of any kind
    /// propagate and the operation count is not charged.
    pub fn describe_keyspace(&self, keyspace: &str) -> Result<KsDef> {
        let mut core = self.core.lock().unwrap();
        match core.transport.as_mut() {
            Some(transport) => transport.describe_keyspace(keyspace).map_err(Error::from),
            None => Err(Error::Transport(TransportError::Transport(
                "transport is closed".into(),
            ))),
        }
    }

    /// Describes a keyspace as a map from column family name to its
    /// definition. Defaults to the pool's configured keyspace.
    pub fn keyspace_description(&self, keyspace: Option<&str>) -> Result<HashMap<String, CfDef>> {
        let ks_def = match keyspace {
            Some(keyspace) => self.describe_keyspace(keyspace)?,
            None => {
                let pool = self.pool.upgrade().ok_or_else(pool_dropped)?;
                let keyspace = pool.config.transport.keyspace.clone();
                self.describe_keyspace(&keyspace)?
            }
        };
        Ok(ks_def
            .cf_defs
            .into_iter()
            .map(|cf_def| (cf_def.name.clone(), cf_def))
            .collect())
    }
}

fn pool_dropped() -> Error {
    Error::InvalidRequest("the owning connection pool has been dropped".into())
}

impl<M: ManageTransport> fmt::Debug for ConnectionWrapper<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.core.try_lock() {
            Ok(core) => write!(f, "ConnectionWrapper({}, {:?})", core.server, core.state),
            Err(_) => write!(f, "ConnectionWrapper(<busy>)"),
        }
    }
}

impl<M: ManageTransport> Drop for ConnectionWrapper<M> {
    fn drop(&mut self) {
        // A wrapper abandoned without a checkin still must not leak its
        // socket. No events: the pool may already be gone.
        if let Ok(core) = self.core.get_mut() {
            if let Some(mut transport) = core.transport.take() {
                transport.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportConfig;

    struct NullTransport;

    impl CassandraTransport for NullTransport {
        fn get_slice(
            &mut self,
            _key: &[u8],
            _parent: &ColumnParent,
            _predicate: &SlicePredicate,
            _consistency: ConsistencyLevel,
        ) -> Result<Vec<ColumnOrSuperColumn>, TransportError> {
            Ok(Vec::new())
        }

        fn get_range_slices(
            &mut self,
            _parent: &ColumnParent,
            _predicate: &SlicePredicate,
            _range: &KeyRange,
            _consistency: ConsistencyLevel,
        ) -> Result<Vec<KeySlice>, TransportError> {
            Ok(Vec::new())
        }

        fn get_indexed_slices(
            &mut self,
            _parent: &ColumnParent,
            _clause: &IndexClause,
            _predicate: &SlicePredicate,
            _consistency: ConsistencyLevel,
        ) -> Result<Vec<KeySlice>, TransportError> {
            Ok(Vec::new())
        }

        fn batch_mutate(
            &mut self,
            _mutations: &MutationMap,
            _consistency: ConsistencyLevel,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        fn remove(
            &mut self,
            _key: &[u8],
            _path: &ColumnPath,
            _timestamp: i64,
            _consistency: ConsistencyLevel,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        fn truncate(&mut self, _column_family: &str) -> Result<(), TransportError> {
            Ok(())
        }

        fn describe_keyspace(&mut self, keyspace: &str) -> Result<KsDef, TransportError> {
            Ok(KsDef {
                name: keyspace.to_string(),
                strategy_class: "SimpleStrategy".into(),
                replication_factor: 1,
                cf_defs: Vec::new(),
            })
        }

        fn close(&mut self) {}
    }

    struct NullManager;

    impl ManageTransport for NullManager {
        type Transport = NullTransport;

        fn open(
            &self,
            _server: &ServerAddress,
            _config: &TransportConfig,
        ) -> Result<NullTransport, TransportError> {
            Ok(NullTransport)
        }
    }

    fn orphan_wrapper() -> Arc<ConnectionWrapper<NullManager>> {
        Arc::new_cyclic(|weak_self| ConnectionWrapper {
            weak_self: weak_self.clone(),
            pool: Weak::new(),
            retry_count: AtomicU32::new(0),
            core: Mutex::new(WrapperCore {
                transport: Some(NullTransport),
                state: WrapperState::CheckedOut,
                op_count: 0,
                start_time: SystemTime::now(),
                server: ServerAddress::new("localhost", 9160),
                info: HashMap::new(),
            }),
        })
    }

    #[test]
    fn legal_transition_cycle() {
        let wrapper = orphan_wrapper();
        wrapper.transition_in_queue().unwrap();
        assert_eq!(wrapper.state(), WrapperState::InQueue);
        wrapper.transition_checked_out().unwrap();
        assert_eq!(wrapper.state(), WrapperState::CheckedOut);
        wrapper.dispose("done", None).unwrap();
        assert_eq!(wrapper.state(), WrapperState::Disposed);
    }

    #[test]
    fn double_checkin_is_rejected() {
        let wrapper = orphan_wrapper();
        wrapper.transition_in_queue().unwrap();
        assert!(matches!(
            wrapper.transition_in_queue(),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn double_checkout_is_rejected() {
        let wrapper = orphan_wrapper();
        assert!(matches!(
            wrapper.transition_checked_out(),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn double_dispose_is_rejected() {
        let wrapper = orphan_wrapper();
        wrapper.dispose("first", None).unwrap();
        assert!(matches!(
            wrapper.dispose("second", None),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn dispose_from_queue_is_legal() {
        let wrapper = orphan_wrapper();
        wrapper.transition_in_queue().unwrap();
        wrapper.dispose("draining", None).unwrap();
        assert_eq!(wrapper.state(), WrapperState::Disposed);
    }

    #[test]
    fn info_round_trip() {
        let wrapper = orphan_wrapper();
        assert_eq!(wrapper.info("origin"), None);
        wrapper.set_info("origin", "unit-test");
        assert_eq!(wrapper.info("origin").as_deref(), Some("unit-test"));
    }
}
