//! The bounded-queue connection pool.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::connection::{ConnectionWrapper, WrapperState};
use crate::error::{Error, Result};
use crate::events::{
    AtMaxEvent, ConnectionEvent, EventBase, FailureEvent, Level, LogListener, Notifier, PoolEvent,
    PoolListener, RecycleEvent, ServerListEvent,
};
use crate::rotor::ServerRotor;
use crate::transport::{Credentials, ManageTransport, ServerAddress, TransportConfig};

const POOL_TYPE: &str = "QueuePool";

/// Where the pool gets its `host:port` entries from.
///
/// A producer is re-invoked on every [`QueuePool::set_server_list`]
/// install, which allows feeding the pool from service discovery.
#[derive(Clone)]
pub enum ServerSource {
    /// A fixed sequence of `host:port` strings.
    List(Vec<String>),
    /// A zero-argument producer of `host:port` strings.
    Producer(Arc<dyn Fn() -> Vec<String> + Send + Sync>),
}

impl ServerSource {
    /// Wraps a closure as a server list producer.
    pub fn producer(produce: impl Fn() -> Vec<String> + Send + Sync + 'static) -> ServerSource {
        ServerSource::Producer(Arc::new(produce))
    }

    fn materialize(&self) -> Vec<String> {
        match self {
            ServerSource::List(servers) => servers.clone(),
            ServerSource::Producer(produce) => produce(),
        }
    }
}

impl fmt::Debug for ServerSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerSource::List(servers) => f.debug_tuple("List").field(servers).finish(),
            ServerSource::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

impl From<Vec<String>> for ServerSource {
    fn from(servers: Vec<String>) -> ServerSource {
        ServerSource::List(servers)
    }
}

impl From<Vec<&str>> for ServerSource {
    fn from(servers: Vec<&str>) -> ServerSource {
        ServerSource::List(servers.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for ServerSource {
    fn from(servers: &[&str]) -> ServerSource {
        ServerSource::List(servers.iter().map(|s| s.to_string()).collect())
    }
}

/// Construction parameters, kept around verbatim so `recreate` can mint
/// an identical pool.
#[derive(Clone, Debug)]
pub(crate) struct PoolConfig {
    pub(crate) transport: TransportConfig,
    pub(crate) logging_name: Option<String>,
    pub(crate) use_threadlocal: bool,
    pub(crate) pool_size: usize,
    pub(crate) max_overflow: i64,
    pub(crate) pool_timeout: Duration,
    pub(crate) recycle: i64,
    pub(crate) max_retries: i32,
    pub(crate) prefill: bool,
}

/// A builder for a [`QueuePool`].
pub struct Builder<M: ManageTransport> {
    keyspace: String,
    server_source: ServerSource,
    credentials: Option<Credentials>,
    timeout: Duration,
    logging_name: Option<String>,
    use_threadlocal: bool,
    framed_transport: bool,
    listeners: Vec<Arc<dyn PoolListener<M>>>,
    pool_size: usize,
    max_overflow: i64,
    pool_timeout: Duration,
    recycle: i64,
    max_retries: i32,
    prefill: bool,
}

impl<M: ManageTransport> Default for Builder<M> {
    fn default() -> Self {
        Builder {
            keyspace: String::new(),
            server_source: ServerSource::List(vec!["localhost:9160".to_string()]),
            credentials: None,
            timeout: Duration::from_millis(500),
            logging_name: None,
            use_threadlocal: true,
            framed_transport: true,
            listeners: Vec::new(),
            pool_size: 5,
            max_overflow: 10,
            pool_timeout: Duration::from_secs(30),
            recycle: 10_000,
            max_retries: 5,
            prefill: true,
        }
    }
}

impl<M: ManageTransport> Builder<M> {
    /// Constructs a new `Builder` with every parameter at its default.
    pub fn new() -> Builder<M> {
        Default::default()
    }

    /// The keyspace every connection is bound to. Required.
    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Builder<M> {
        self.keyspace = keyspace.into();
        self
    }

    /// The servers the pool connects to, as `host:port` strings or a
    /// producer of them. The list is randomly permuted before use.
    ///
    /// Defaults to `["localhost:9160"]`.
    pub fn server_list(mut self, source: impl Into<ServerSource>) -> Builder<M> {
        self.server_source = source.into();
        self
    }

    /// Login credentials presented on every new connection.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Builder<M> {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Socket timeout for individual RPCs.
    ///
    /// Defaults to half a second.
    pub fn timeout(mut self, timeout: Duration) -> Builder<M> {
        self.timeout = timeout;
        self
    }

    /// Identifier used as `pool_id` in event payloads. Defaults to the
    /// pool's pointer identity.
    pub fn logging_name(mut self, logging_name: impl Into<String>) -> Builder<M> {
        self.logging_name = Some(logging_name.into());
        self
    }

    /// When true, repeated `get` calls from one thread return the same
    /// wrapper until it is returned.
    ///
    /// Defaults to true.
    pub fn use_threadlocal(mut self, use_threadlocal: bool) -> Builder<M> {
        self.use_threadlocal = use_threadlocal;
        self
    }

    /// Framed versus unframed Thrift transport.
    ///
    /// Defaults to framed.
    pub fn framed_transport(mut self, framed_transport: bool) -> Builder<M> {
        self.framed_transport = framed_transport;
        self
    }

    /// Registers a listener on the new pool. May be called repeatedly.
    pub fn listener(mut self, listener: Arc<dyn PoolListener<M>>) -> Builder<M> {
        self.listeners.push(listener);
        self
    }

    /// The number of connections kept open in the idle queue.
    ///
    /// Defaults to 5.
    pub fn pool_size(mut self, pool_size: usize) -> Builder<M> {
        self.pool_size = pool_size;
        self
    }

    /// Extra connections the pool may hand out beyond `pool_size`; they
    /// are closed instead of re-queued on return. `0` disables overflow
    /// and `-1` removes the limit.
    ///
    /// Defaults to 10.
    pub fn max_overflow(mut self, max_overflow: i64) -> Builder<M> {
        assert!(
            max_overflow >= -1,
            "max_overflow must be -1 (unlimited) or non-negative!"
        );
        self.max_overflow = max_overflow;
        self
    }

    /// How long a checkout may wait on the idle queue before giving up.
    ///
    /// Defaults to 30 seconds.
    pub fn pool_timeout(mut self, pool_timeout: Duration) -> Builder<M> {
        self.pool_timeout = pool_timeout;
        self
    }

    /// Number of operations after which a connection is closed and
    /// replaced upon checkin. `-1` disables recycling.
    ///
    /// Defaults to 10000.
    pub fn recycle(mut self, recycle: i64) -> Builder<M> {
        assert!(
            recycle == -1 || recycle > 0,
            "recycle must be -1 (disabled) or positive!"
        );
        self.recycle = recycle;
        self
    }

    /// How many times one call may fail over before it gives up with
    /// `MaximumRetry`. `0` disables retries, `-1` removes the limit.
    ///
    /// Defaults to 5.
    pub fn max_retries(mut self, max_retries: i32) -> Builder<M> {
        assert!(
            max_retries >= -1,
            "max_retries must be -1 (unlimited) or non-negative!"
        );
        self.max_retries = max_retries;
        self
    }

    /// Whether to open `pool_size` connections eagerly at build time.
    ///
    /// Defaults to true.
    pub fn prefill(mut self, prefill: bool) -> Builder<M> {
        self.prefill = prefill;
        self
    }

    /// Consumes the builder, returning an initialized pool.
    ///
    /// With `prefill` enabled this opens `pool_size` connections before
    /// returning and fails with `AllServersUnavailable` if the cluster
    /// cannot be reached.
    pub fn build(self, manager: M) -> Result<QueuePool<M>> {
        assert!(!self.keyspace.is_empty(), "keyspace must be set!");
        let config = PoolConfig {
            transport: TransportConfig {
                keyspace: self.keyspace,
                credentials: self.credentials,
                timeout: self.timeout,
                framed: self.framed_transport,
            },
            logging_name: self.logging_name,
            use_threadlocal: self.use_threadlocal,
            pool_size: self.pool_size,
            max_overflow: self.max_overflow,
            pool_timeout: self.pool_timeout,
            recycle: self.recycle,
            max_retries: self.max_retries,
            prefill: self.prefill,
        };
        build_pool(
            config,
            self.server_source,
            self.listeners,
            Arc::new(manager),
        )
    }
}

impl<M: ManageTransport> fmt::Debug for Builder<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Builder")
            .field("keyspace", &self.keyspace)
            .field("server_source", &self.server_source)
            .field("timeout", &self.timeout)
            .field("use_threadlocal", &self.use_threadlocal)
            .field("framed_transport", &self.framed_transport)
            .field("listeners", &self.listeners.len())
            .field("pool_size", &self.pool_size)
            .field("max_overflow", &self.max_overflow)
            .field("pool_timeout", &self.pool_timeout)
            .field("recycle", &self.recycle)
            .field("max_retries", &self.max_retries)
            .field("prefill", &self.prefill)
            .finish()
    }
}

/// The guts of a `QueuePool`, shared by every clone and weakly referenced
/// by every wrapper it creates.
pub(crate) struct SharedPool<M: ManageTransport> {
    pub(crate) config: PoolConfig,
    pub(crate) manager: Arc<M>,
    pub(crate) notifier: Notifier<M>,
    pool_id: String,
    rotor: ServerRotor,
    idle_tx: Sender<Arc<ConnectionWrapper<M>>>,
    idle_rx: Receiver<Arc<ConnectionWrapper<M>>>,
    overflow: AtomicI64,
    // Present iff max_overflow > 0. Held across the block-or-mint
    // decision of checkout and the decrement of an overflow return.
    overflow_lock: Option<Mutex<()>>,
    thread_slots: Option<Mutex<HashMap<ThreadId, Weak<ConnectionWrapper<M>>>>>,
    user_listeners: Mutex<Vec<Arc<dyn PoolListener<M>>>>,
}

fn build_pool<M: ManageTransport>(
    config: PoolConfig,
    source: ServerSource,
    listeners: Vec<Arc<dyn PoolListener<M>>>,
    manager: Arc<M>,
) -> Result<QueuePool<M>> {
    let (idle_tx, idle_rx) = bounded(config.pool_size);
    let overflow = if config.prefill {
        0
    } else {
        -(config.pool_size as i64)
    };
    let shared = Arc::new_cyclic(|weak: &Weak<SharedPool<M>>| SharedPool {
        pool_id: config
            .logging_name
            .clone()
            .unwrap_or_else(|| format!("{:p}", weak.as_ptr())),
        overflow: AtomicI64::new(overflow),
        overflow_lock: (config.max_overflow > 0).then(|| Mutex::new(())),
        thread_slots: config.use_threadlocal.then(|| Mutex::new(HashMap::new())),
        user_listeners: Mutex::new(listeners.clone()),
        notifier: Notifier::new(),
        rotor: ServerRotor::new(),
        idle_tx,
        idle_rx,
        manager,
        config,
    });

    shared.notifier.add(Arc::new(LogListener));
    for listener in listeners {
        shared.notifier.add(listener);
    }

    shared.install_servers(&source)?;

    if shared.config.prefill {
        for _ in 0..shared.config.pool_size {
            let wrapper = create_connection(&shared)?;
            wrapper.transition_in_queue()?;
            shared
                .idle_tx
                .try_send(wrapper)
                .expect("idle queue cannot be full while prefilling");
        }
    }

    Ok(QueuePool { inner: shared })
}

// The checkout, checkin, and creation paths live outside the impl block
// because they hand the pool Arc itself to the wrappers they make.

/// Opens a wrapper against the next servers in rotation, trying each
/// server at most twice before giving up.
pub(crate) fn create_connection<M: ManageTransport>(
    pool: &Arc<SharedPool<M>>,
) -> Result<Arc<ConnectionWrapper<M>>> {
    let budget = 2 * pool.rotor.len();
    let mut failures = 0;
    while failures < budget {
        let server = pool.rotor.next();
        match ConnectionWrapper::open(pool, server.clone()) {
            Ok(wrapper) => return Ok(wrapper),
            Err(error) => {
                pool.notifier.connection_failed(|| FailureEvent {
                    base: pool.base(Level::Info),
                    error,
                    server,
                    connection: None,
                });
                failures += 1;
            }
        }
    }
    Err(Error::AllServersUnavailable)
}

/// Best-effort eager replacement after a failover: open a fresh
/// connection and enqueue it, dropping it if the queue is full or the
/// cluster cannot be reached.
pub(crate) fn replenish_one<M: ManageTransport>(pool: &Arc<SharedPool<M>>) {
    if pool.idle_tx.is_full() {
        return;
    }
    let Ok(wrapper) = create_connection(pool) else {
        return;
    };
    if wrapper.transition_in_queue().is_err() {
        return;
    }
    if let Err(send_error) = pool.idle_tx.try_send(wrapper) {
        let rejected = send_error.into_inner();
        if rejected.transition_checked_out().is_ok() {
            let _ = rejected.dispose("pool is already full", None);
        }
    }
}

pub(crate) fn checkout<M: ManageTransport>(
    pool: &Arc<SharedPool<M>>,
) -> Result<Arc<ConnectionWrapper<M>>> {
    if let Some(slots) = &pool.thread_slots {
        let mut slots = slots.lock().unwrap();
        let id = thread::current().id();
        match slots.get(&id).and_then(|weak| weak.upgrade()) {
            Some(conn) => return Ok(conn),
            None => {
                // A dead weak reference means the thread dropped its
                // wrapper without returning it.
                slots.remove(&id);
            }
        }
    }

    let mut fresh = false;
    let conn = {
        let _overflow_guard = pool.overflow_lock.as_ref().map(|lock| lock.lock().unwrap());
        let at_ceiling = || {
            pool.config.max_overflow >= 0
                && pool.overflow.load(Ordering::Relaxed) >= pool.config.max_overflow
        };
        // Blocking is only worthwhile once every creatable connection
        // has been handed out; otherwise fail the pop fast and mint.
        let block = pool.config.max_overflow > 0 && at_ceiling();
        let popped = if block {
            pool.idle_rx.recv_timeout(pool.config.pool_timeout).ok()
        } else {
            pool.idle_rx.try_recv().ok()
        };
        match popped {
            Some(conn) => conn,
            None if at_ceiling() => {
                let overflow = pool.overflow.load(Ordering::Relaxed);
                pool.notifier.pool_at_max(|| AtMaxEvent {
                    base: pool.base(Level::Info),
                    pool_max: pool.config.pool_size as i64 + overflow,
                });
                return Err(Error::NoConnectionAvailable {
                    size: pool.config.pool_size,
                    overflow,
                    timeout: pool.config.pool_timeout,
                });
            }
            None => {
                fresh = true;
                let created = create_connection(pool)?;
                pool.overflow.fetch_add(1, Ordering::Relaxed);
                created
            }
        }
    };

    if !fresh {
        conn.transition_checked_out()?;
    }
    if pool.config.use_threadlocal {
        pool.cache_in_thread_slot(&conn);
    }
    pool.notifier.connection_checked_out(|| ConnectionEvent {
        base: pool.base(Level::Debug),
        connection: conn.clone(),
        message: None,
        error: None,
    });
    Ok(conn)
}

pub(crate) fn checkin<M: ManageTransport>(
    pool: &Arc<SharedPool<M>>,
    conn: Arc<ConnectionWrapper<M>>,
) -> Result<()> {
    if !conn.belongs_to(pool) {
        return Err(Error::InvalidRequest(
            "a connection was returned to a pool that does not own it".into(),
        ));
    }

    let conn = match &pool.thread_slots {
        Some(slots) => {
            let cached = slots.lock().unwrap().remove(&thread::current().id());
            match cached.and_then(|weak| weak.upgrade()) {
                Some(owned) => owned,
                // This thread holds nothing: a repeated return, or a
                // return from a thread that never checked out.
                None => return Ok(()),
            }
        }
        None => conn,
    };

    if conn.state() != WrapperState::CheckedOut {
        return Err(Error::InvalidRequest(
            "a connection has been returned to the connection pool twice".into(),
        ));
    }
    conn.reset_retry_count();

    let over_budget =
        pool.config.recycle > -1 && conn.operation_count() as i64 > pool.config.recycle;
    let candidate = if over_budget {
        let replacement = create_connection(pool)?;
        {
            let old_conn = conn.clone();
            let new_conn = replacement.clone();
            pool.notifier.connection_recycled(|| RecycleEvent {
                base: pool.base(Level::Debug),
                old_conn,
                new_conn,
            });
        }
        conn.dispose("recycling connection", None)?;
        replacement
    } else {
        conn
    };

    candidate.transition_in_queue()?;
    if let Err(send_error) = pool.idle_tx.try_send(candidate.clone()) {
        // The queue is full, so this connection came from overflow:
        // close it instead of re-queueing.
        let rejected = send_error.into_inner();
        rejected.transition_checked_out()?;
        rejected.dispose("pool is already full", None)?;
        let _overflow_guard = pool.overflow_lock.as_ref().map(|lock| lock.lock().unwrap());
        pool.overflow.fetch_sub(1, Ordering::Relaxed);
    }

    pool.notifier.connection_checked_in(|| ConnectionEvent {
        base: pool.base(Level::Debug),
        connection: candidate,
        message: None,
        error: None,
    });
    Ok(())
}

impl<M: ManageTransport> SharedPool<M> {
    pub(crate) fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub(crate) fn base(&self, level: Level) -> EventBase {
        EventBase {
            pool_type: POOL_TYPE,
            pool_id: self.pool_id.clone(),
            level,
        }
    }

    fn install_servers(&self, source: &ServerSource) -> Result<()> {
        let raw = source.materialize();
        let mut servers = Vec::with_capacity(raw.len());
        for entry in &raw {
            servers.push(entry.parse::<ServerAddress>()?);
        }
        let installed = self.rotor.install(servers)?;
        self.notifier.server_list_obtained(|| ServerListEvent {
            base: self.base(Level::Debug),
            server_list: installed.to_vec(),
        });
        Ok(())
    }

    pub(crate) fn clear_thread_slot(&self) {
        if let Some(slots) = &self.thread_slots {
            slots.lock().unwrap().remove(&thread::current().id());
        }
    }

    pub(crate) fn cache_in_thread_slot(&self, conn: &Arc<ConnectionWrapper<M>>) {
        if let Some(slots) = &self.thread_slots {
            slots
                .lock()
                .unwrap()
                .insert(thread::current().id(), Arc::downgrade(conn));
        }
    }

    fn dispose(&self) {
        let reason = format!("pool {} is being disposed", self.pool_id());
        while let Ok(conn) = self.idle_rx.try_recv() {
            // Queue members are IN_QUEUE, so dispose cannot be rejected.
            let _ = conn.dispose(&reason, None);
        }
        self.overflow
            .store(-(self.config.pool_size as i64), Ordering::Relaxed);
        self.notifier.pool_disposed(|| PoolEvent {
            base: self.base(Level::Info),
        });
    }
}

/// A snapshot of a pool's counters.
pub struct PoolStatus {
    /// Configured steady-state size.
    pub size: usize,
    /// Connections currently idle in the queue.
    pub checkedin: usize,
    /// Connections currently held by callers.
    pub checkedout: i64,
    /// Signed overflow counter; negative until `pool_size` connections
    /// exist when the pool was built without prefill.
    pub overflow: i64,
    _p: (),
}

impl fmt::Debug for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PoolStatus")
            .field("size", &self.size)
            .field("checkedin", &self.checkedin)
            .field("checkedout", &self.checkedout)
            .field("overflow", &self.overflow)
            .finish()
    }
}

/// A connection pool that keeps a bounded queue of open connections.
///
/// Cloning is cheap and every clone drives the same pool.
pub struct QueuePool<M: ManageTransport> {
    inner: Arc<SharedPool<M>>,
}

impl<M: ManageTransport> Clone for QueuePool<M> {
    fn clone(&self) -> Self {
        QueuePool {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ManageTransport> fmt::Debug for QueuePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("QueuePool({:p})", self.inner))
    }
}

impl<M: ManageTransport> QueuePool<M> {
    /// Returns a `Builder` instance to configure a new pool.
    pub fn builder() -> Builder<M> {
        Builder::new()
    }

    /// Checks a connection out of the pool.
    ///
    /// Pops an idle connection when one is available, otherwise opens a
    /// new one subject to the overflow limit. Once every creatable
    /// connection is handed out the call blocks up to `pool_timeout` and
    /// then fails with [`Error::NoConnectionAvailable`].
    ///
    /// In thread-affinity mode a thread that already holds a wrapper
    /// gets that same wrapper back.
    pub fn get(&self) -> Result<Arc<ConnectionWrapper<M>>> {
        checkout(&self.inner)
    }

    /// Returns a connection to the pool.
    ///
    /// The connection is re-queued, or closed when it came from overflow
    /// or exceeded its recycle budget. Returning a connection twice
    /// fails with [`Error::InvalidRequest`]; in thread-affinity mode a
    /// repeated return from the owning thread is a no-op instead.
    pub fn return_conn(&self, conn: Arc<ConnectionWrapper<M>>) -> Result<()> {
        checkin(&self.inner, conn)
    }

    /// Installs a new server list, shuffling it before use.
    pub fn set_server_list(&self, source: impl Into<ServerSource>) -> Result<()> {
        self.inner.install_servers(&source.into())
    }

    /// Registers a listener. Events it subscribed to start flowing
    /// immediately.
    pub fn add_listener(&self, listener: Arc<dyn PoolListener<M>>) {
        self.inner
            .user_listeners
            .lock()
            .unwrap()
            .push(listener.clone());
        self.inner.notifier.add(listener);
    }

    /// Closes every idle connection and resets the overflow counter.
    ///
    /// Checked-out connections are left alone; returning one afterwards
    /// goes through the usual checkin paths. The pool should not be
    /// reused once disposed; build a successor with [`recreate`] instead.
    ///
    /// [`recreate`]: QueuePool::recreate
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Builds a fresh pool with identical construction parameters, the
    /// same listeners, and the current server list. The receiver is left
    /// untouched; dispose it when its checked-out connections are back.
    pub fn recreate(&self) -> Result<QueuePool<M>> {
        self.inner.notifier.pool_recreated(|| PoolEvent {
            base: self.inner.base(Level::Info),
        });
        let servers: Vec<String> = self
            .inner
            .rotor
            .snapshot()
            .iter()
            .map(|server| server.to_string())
            .collect();
        let listeners = self.inner.user_listeners.lock().unwrap().clone();
        build_pool(
            self.inner.config.clone(),
            ServerSource::List(servers),
            listeners,
            Arc::clone(&self.inner.manager),
        )
    }

    /// Configured steady-state size.
    pub fn size(&self) -> usize {
        self.inner.config.pool_size
    }

    /// Connections currently idle in the queue.
    pub fn checkedin(&self) -> usize {
        self.inner.idle_rx.len()
    }

    /// The raw signed overflow counter.
    pub fn overflow(&self) -> i64 {
        self.inner.overflow.load(Ordering::Relaxed)
    }

    /// Connections currently held by callers.
    pub fn checkedout(&self) -> i64 {
        self.size() as i64 - self.checkedin() as i64 + self.overflow()
    }

    /// A point-in-time snapshot of the counters above.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.size(),
            checkedin: self.checkedin(),
            checkedout: self.checkedout(),
            overflow: self.overflow(),
            _p: (),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionWrapper;
    use crate::transport::{
        CassandraTransport, ColumnOrSuperColumn, ColumnParent, ColumnPath, ConsistencyLevel,
        IndexClause, KeyRange, KeySlice, KsDef, MutationMap, SlicePredicate, TransportError,
    };

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

    #[test]
    fn builder_defaults_match_documentation() {
        let builder = Builder::<NullManager>::new();
        assert_eq!(builder.pool_size, 5);
        assert_eq!(builder.max_overflow, 10);
        assert_eq!(builder.pool_timeout, Duration::from_secs(30));
        assert_eq!(builder.recycle, 10_000);
        assert_eq!(builder.max_retries, 5);
        assert_eq!(builder.timeout, Duration::from_millis(500));
        assert!(builder.use_threadlocal);
        assert!(builder.framed_transport);
        assert!(builder.prefill);
    }

    #[test]
    #[should_panic(expected = "recycle")]
    fn zero_recycle_is_rejected() {
        let _ = Builder::<NullManager>::new().recycle(0);
    }

    #[test]
    #[should_panic(expected = "max_overflow")]
    fn underflowing_max_overflow_is_rejected() {
        let _ = Builder::<NullManager>::new().max_overflow(-2);
    }

    #[test]
    #[should_panic(expected = "keyspace")]
    fn building_without_keyspace_is_rejected() {
        let _ = Builder::new().build(NullManager);
    }

    #[test]
    fn server_source_producer_materializes_each_time() {
        let source = ServerSource::producer(|| vec!["a:1".to_string(), "b:1".to_string()]);
        assert_eq!(source.materialize().len(), 2);
        assert_eq!(source.materialize().len(), 2);
    }

    #[test]
    fn wrappers_are_bound_to_their_pool() {
        let pool = QueuePool::builder()
            .keyspace("Keyspace1")
            .server_list(vec!["a:9160"])
            .build(NullManager)
            .unwrap();
        let other = QueuePool::builder()
            .keyspace("Keyspace1")
            .server_list(vec!["a:9160"])
            .build(NullManager)
            .unwrap();
        let conn: Arc<ConnectionWrapper<NullManager>> = pool.get().unwrap();
        assert!(matches!(
            other.return_conn(conn.clone()),
            Err(Error::InvalidRequest(_))
        ));
        pool.return_conn(conn).unwrap();
    }
}
