//! Lifecycle events and listener fan-out.
//!
//! Pools emit ten kinds of events. A listener declares up front which of
//! them it consumes via [`PoolListener::subscriptions`]; the notifier
//! keeps one subscription list per kind and delivers synchronously on the
//! thread that produced the event. Listeners should therefore return
//! quickly and never block indefinitely.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::connection::ConnectionWrapper;
use crate::transport::{ManageTransport, ServerAddress, TransportError};

/// Prescribed logging level of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    /// Routine lifecycle traffic.
    Debug,
    /// Noteworthy but expected.
    Info,
    /// Something failed but was handled.
    Warn,
    /// Something failed and was not handled.
    Error,
    /// The pool is unusable.
    Critical,
}

/// The ten event kinds a pool can emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new connection was opened.
    ConnectionCreated,
    /// A connection was handed to a caller.
    ConnectionCheckedOut,
    /// A connection was returned by a caller.
    ConnectionCheckedIn,
    /// A connection was closed and removed from the pool.
    ConnectionDisposed,
    /// A connection exceeded its operation budget and was replaced.
    ConnectionRecycled,
    /// A connection attempt or RPC failed against one server.
    ConnectionFailed,
    /// The pool installed a (shuffled) server list.
    ServerListObtained,
    /// `recreate` produced a successor pool.
    PoolRecreated,
    /// The pool was disposed.
    PoolDisposed,
    /// A checkout found every creatable connection handed out.
    PoolAtMax,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 10] = [
        EventKind::ConnectionCreated,
        EventKind::ConnectionCheckedOut,
        EventKind::ConnectionCheckedIn,
        EventKind::ConnectionDisposed,
        EventKind::ConnectionRecycled,
        EventKind::ConnectionFailed,
        EventKind::ServerListObtained,
        EventKind::PoolRecreated,
        EventKind::PoolDisposed,
        EventKind::PoolAtMax,
    ];

    fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// The capability record of a listener: which events it consumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventSet(u16);

impl EventSet {
    /// Consumes nothing.
    pub const fn empty() -> EventSet {
        EventSet(0)
    }

    /// Consumes every kind.
    pub const fn all() -> EventSet {
        EventSet((1 << EventKind::ALL.len()) - 1)
    }

    /// Builds a set from an explicit list of kinds.
    pub fn of(kinds: &[EventKind]) -> EventSet {
        kinds.iter().fold(EventSet::empty(), |set, k| set.with(*k))
    }

    /// Returns this set with one more kind added.
    #[must_use]
    pub fn with(self, kind: EventKind) -> EventSet {
        EventSet(self.0 | kind.bit())
    }

    /// Whether `kind` is in the set.
    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

/// Fields common to every event payload.
#[derive(Clone, Debug)]
pub struct EventBase {
    /// The emitting pool's type name, e.g. `"QueuePool"`.
    pub pool_type: &'static str,
    /// The pool's `logging_name`, or its pointer identity by default.
    pub pool_id: String,
    /// Prescribed logging level.
    pub level: Level,
}

/// Payload of the connection-scoped events: created, checked out,
/// checked in, and disposed.
pub struct ConnectionEvent<M: ManageTransport> {
    /// Common fields.
    pub base: EventBase,
    /// The connection the event is about.
    pub connection: Arc<ConnectionWrapper<M>>,
    /// A human-readable reason, when there is one.
    pub message: Option<String>,
    /// The error that triggered the event, when there is one.
    pub error: Option<TransportError>,
}

impl<M: ManageTransport> fmt::Debug for ConnectionEvent<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionEvent")
            .field("base", &self.base)
            .field("connection", &self.connection)
            .field("message", &self.message)
            .field("error", &self.error)
            .finish()
    }
}

/// Payload of `connection_recycled`.
pub struct RecycleEvent<M: ManageTransport> {
    /// Common fields.
    pub base: EventBase,
    /// The connection that exceeded its operation budget.
    pub old_conn: Arc<ConnectionWrapper<M>>,
    /// The freshly opened replacement.
    pub new_conn: Arc<ConnectionWrapper<M>>,
}

impl<M: ManageTransport> fmt::Debug for RecycleEvent<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RecycleEvent")
            .field("base", &self.base)
            .field("old_conn", &self.old_conn)
            .field("new_conn", &self.new_conn)
            .finish()
    }
}

/// Payload of `connection_failed`.
pub struct FailureEvent<M: ManageTransport> {
    /// Common fields.
    pub base: EventBase,
    /// The wire error.
    pub error: TransportError,
    /// The server the failure was observed against.
    pub server: ServerAddress,
    /// The affected connection; absent for failures while opening.
    pub connection: Option<Arc<ConnectionWrapper<M>>>,
}

impl<M: ManageTransport> fmt::Debug for FailureEvent<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FailureEvent")
            .field("base", &self.base)
            .field("error", &self.error)
            .field("server", &self.server)
            .field("connection", &self.connection)
            .finish()
    }
}

/// Payload of `server_list_obtained`.
#[derive(Debug)]
pub struct ServerListEvent {
    /// Common fields.
    pub base: EventBase,
    /// The permuted server list the pool will rotate over.
    pub server_list: Vec<ServerAddress>,
}

/// Payload of `pool_recreated` and `pool_disposed`.
#[derive(Debug)]
pub struct PoolEvent {
    /// Common fields.
    pub base: EventBase,
}

/// Payload of `pool_at_max`.
#[derive(Debug)]
pub struct AtMaxEvent {
    /// Common fields.
    pub base: EventBase,
    /// The ceiling that was hit: `pool_size` plus current overflow.
    pub pool_max: i64,
}

/// Hooks into the lifecycle of connections in a pool.
///
/// Implement the methods you care about and report them from
/// [`subscriptions`](PoolListener::subscriptions); the pool only invokes
/// hooks you subscribed to. A listener subscribing to nothing is kept on
/// the roster but never called.
pub trait PoolListener<M: ManageTransport>: Send + Sync {
    /// Which events this listener consumes.
    fn subscriptions(&self) -> EventSet;

    /// A new connection was opened.
    fn connection_created(&self, _event: &ConnectionEvent<M>) {}

    /// A connection was handed to a caller.
    fn connection_checked_out(&self, _event: &ConnectionEvent<M>) {}

    /// A connection was returned by a caller.
    fn connection_checked_in(&self, _event: &ConnectionEvent<M>) {}

    /// A connection was closed and removed from the pool.
    fn connection_disposed(&self, _event: &ConnectionEvent<M>) {}

    /// A connection exceeded its operation budget and was replaced.
    fn connection_recycled(&self, _event: &RecycleEvent<M>) {}

    /// A connection attempt or RPC failed against one server.
    fn connection_failed(&self, _event: &FailureEvent<M>) {}

    /// The pool installed a (shuffled) server list.
    fn server_list_obtained(&self, _event: &ServerListEvent) {}

    /// `recreate` produced a successor pool.
    fn pool_recreated(&self, _event: &PoolEvent) {}

    /// The pool was disposed.
    fn pool_disposed(&self, _event: &PoolEvent) {}

    /// A checkout found every creatable connection handed out.
    fn pool_at_max(&self, _event: &AtMaxEvent) {}
}

struct Slots<M: ManageTransport> {
    by_kind: [Vec<Arc<dyn PoolListener<M>>>; 10],
}

/// Registration and fan-out of events to listeners.
pub(crate) struct Notifier<M: ManageTransport> {
    inner: Mutex<Slots<M>>,
}

impl<M: ManageTransport> Notifier<M> {
    pub(crate) fn new() -> Notifier<M> {
        Notifier {
            inner: Mutex::new(Slots {
                by_kind: std::array::from_fn(|_| Vec::new()),
            }),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn PoolListener<M>>) {
        let subscriptions = listener.subscriptions();
        let mut slots = self.inner.lock().unwrap();
        for kind in EventKind::ALL {
            if subscriptions.contains(kind) {
                slots.by_kind[kind as usize].push(listener.clone());
            }
        }
    }

    /// Snapshots the subscribers of one kind so delivery happens without
    /// holding the registration lock.
    fn slot(&self, kind: EventKind) -> Vec<Arc<dyn PoolListener<M>>> {
        self.inner.lock().unwrap().by_kind[kind as usize].clone()
    }

    pub(crate) fn connection_created(&self, event: impl FnOnce() -> ConnectionEvent<M>) {
        let slot = self.slot(EventKind::ConnectionCreated);
        if slot.is_empty() {
            return;
        }
        let event = event();
        for listener in &slot {
            listener.connection_created(&event);
        }
    }

    pub(crate) fn connection_checked_out(&self, event: impl FnOnce() -> ConnectionEvent<M>) {
        let slot = self.slot(EventKind::ConnectionCheckedOut);
        if slot.is_empty() {
            return;
        }
        let event = event();
        for listener in &slot {
            listener.connection_checked_out(&event);
        }
    }

    pub(crate) fn connection_checked_in(&self, event: impl FnOnce() -> ConnectionEvent<M>) {
        let slot = self.slot(EventKind::ConnectionCheckedIn);
        if slot.is_empty() {
            return;
        }
        let event = event();
        for listener in &slot {
            listener.connection_checked_in(&event);
        }
    }

    pub(crate) fn connection_disposed(&self, event: impl FnOnce() -> ConnectionEvent<M>) {
        let slot = self.slot(EventKind::ConnectionDisposed);
        if slot.is_empty() {
            return;
        }
        let event = event();
        for listener in &slot {
            listener.connection_disposed(&event);
        }
    }

    pub(crate) fn connection_recycled(&self, event: impl FnOnce() -> RecycleEvent<M>) {
        let slot = self.slot(EventKind::ConnectionRecycled);
        if slot.is_empty() {
            return;
        }
        let event = event();
        for listener in &slot {
            listener.connection_recycled(&event);
        }
    }

    pub(crate) fn connection_failed(&self, event: impl FnOnce() -> FailureEvent<M>) {
        let slot = self.slot(EventKind::ConnectionFailed);
        if slot.is_empty() {
            return;
        }
        let event = event();
        for listener in &slot {
            listener.connection_failed(&event);
        }
    }

    pub(crate) fn server_list_obtained(&self, event: impl FnOnce() -> ServerListEvent) {
        let slot = self.slot(EventKind::ServerListObtained);
        if slot.is_empty() {
            return;
        }
        let event = event();
        for listener in &slot {
            listener.server_list_obtained(&event);
        }
    }

    pub(crate) fn pool_recreated(&self, event: impl FnOnce() -> PoolEvent) {
        let slot = self.slot(EventKind::PoolRecreated);
        if slot.is_empty() {
            return;
        }
        let event = event();
        for listener in &slot {
            listener.pool_recreated(&event);
        }
    }

    pub(crate) fn pool_disposed(&self, event: impl FnOnce() -> PoolEvent) {
        let slot = self.slot(EventKind::PoolDisposed);
        if slot.is_empty() {
            return;
        }
        let event = event();
        for listener in &slot {
            listener.pool_disposed(&event);
        }
    }

    pub(crate) fn pool_at_max(&self, event: impl FnOnce() -> AtMaxEvent) {
        let slot = self.slot(EventKind::PoolAtMax);
        if slot.is_empty() {
            return;
        }
        let event = event();
        for listener in &slot {
            listener.pool_at_max(&event);
        }
    }

}

/// A listener that renders every event through [`tracing`].
///
/// One of these is registered automatically by the builder, so a pool
/// logs its lifecycle out of the box under the `cassandra_pool::events`
/// target.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogListener;

fn log(base: &EventBase, message: &str) {
    let pool_type = base.pool_type;
    let pool_id = base.pool_id.as_str();
    match base.level {
        Level::Debug => {
            debug!(target: "cassandra_pool::events", pool_type, pool_id, "{message}");
        }
        Level::Info => {
            info!(target: "cassandra_pool::events", pool_type, pool_id, "{message}");
        }
        Level::Warn => {
            warn!(target: "cassandra_pool::events", pool_type, pool_id, "{message}");
        }
        Level::Error | Level::Critical => {
            error!(target: "cassandra_pool::events", pool_type, pool_id, "{message}");
        }
    }
}

impl<M: ManageTransport> PoolListener<M> for LogListener {
    fn subscriptions(&self) -> EventSet {
        EventSet::all()
    }

    fn connection_created(&self, event: &ConnectionEvent<M>) {
        match &event.error {
            Some(error) => log(
                &event.base,
                &format!(
                    "error opening connection to {}: {error}",
                    event.connection.server()
                ),
            ),
            None => log(
                &event.base,
                &format!("opened connection to {}", event.connection.server()),
            ),
        }
    }

    fn connection_checked_out(&self, event: &ConnectionEvent<M>) {
        log(
            &event.base,
            &format!("checked out connection to {}", event.connection.server()),
        );
    }

    fn connection_checked_in(&self, event: &ConnectionEvent<M>) {
        log(
            &event.base,
            &format!("checked in connection to {}", event.connection.server()),
        );
    }

    fn connection_disposed(&self, event: &ConnectionEvent<M>) {
        let mut message = format!("disposed connection to {}", event.connection.server());
        if let Some(reason) = &event.message {
            message.push_str(": ");
            message.push_str(reason);
        }
        if let Some(error) = &event.error {
            message.push_str(&format!(" ({error})"));
        }
        log(&event.base, &message);
    }

    fn connection_recycled(&self, event: &RecycleEvent<M>) {
        log(
            &event.base,
            &format!(
                "recycled connection to {} into a new connection to {}",
                event.old_conn.server(),
                event.new_conn.server()
            ),
        );
    }

    fn connection_failed(&self, event: &FailureEvent<M>) {
        log(
            &event.base,
            &format!("connection to {} failed: {}", event.server, event.error),
        );
    }

    fn server_list_obtained(&self, event: &ServerListEvent) {
        let servers: Vec<String> = event.server_list.iter().map(|s| s.to_string()).collect();
        log(
            &event.base,
            &format!("obtained server list [{}]", servers.join(", ")),
        );
    }

    fn pool_recreated(&self, event: &PoolEvent) {
        log(&event.base, "pool recreated");
    }

    fn pool_disposed(&self, event: &PoolEvent) {
        log(&event.base, "pool disposed");
    }

    fn pool_at_max(&self, event: &AtMaxEvent) {
        log(
            &event.base,
            &format!("pool at maximum size {}, checkout failed", event.pool_max),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_set_membership() {
        let set = EventSet::of(&[EventKind::ConnectionCreated, EventKind::PoolAtMax]);
        assert!(set.contains(EventKind::ConnectionCreated));
        assert!(set.contains(EventKind::PoolAtMax));
        assert!(!set.contains(EventKind::ConnectionFailed));
    }

    #[test]
    fn all_covers_every_kind() {
        let all = EventSet::all();
        for kind in EventKind::ALL {
            assert!(all.contains(kind));
        }
        for kind in EventKind::ALL {
            assert!(!EventSet::empty().contains(kind));
        }
    }
}
