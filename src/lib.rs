//! A client-side connection pool for Cassandra's Thrift interface.
//!
//! Opening a new connection to a Cassandra server for every request is
//! both slow and a good way to exhaust file descriptors under load. A
//! connection pool keeps a bounded set of open connections, hands them
//! out for repeated use, balances them across a randomly permuted server
//! list, and transparently fails an operation over to another server
//! when the wire times out or reports the cluster unavailable.
//!
//! cassandra-pool is agnostic to the wire implementation it is managing.
//! Implementors of the [`ManageTransport`] trait provide the logic to
//! open a framed or unframed transport to a single server; everything
//! above that - checkout and checkin, overflow, recycling, retry with
//! failover, and lifecycle events - lives here.
//!
//! # Example
//!
//! Using an imaginary Thrift binding.
//!
//! ```ignore
//! use cassandra_pool::{ConsistencyLevel, QueuePool};
//!
//! let manager = my_thrift::SocketManager::new();
//! let pool = QueuePool::builder()
//!     .keyspace("Keyspace1")
//!     .server_list(vec!["10.0.0.4:9160", "10.0.0.5:9160"])
//!     .build(manager)?;
//!
//! let conn = pool.get()?;
//! conn.batch_mutate(&mutations, ConsistencyLevel::Quorum)?;
//! pool.return_conn(conn)?;
//! ```
#![deny(missing_docs, missing_debug_implementations)]

mod connection;
mod error;
mod events;
mod pool;
mod rotor;
mod transport;

pub use connection::{ConnectionWrapper, WrapperState};
pub use error::{Error, Result};
pub use events::{
    AtMaxEvent, ConnectionEvent, EventBase, EventKind, EventSet, FailureEvent, Level, LogListener,
    PoolEvent, PoolListener, RecycleEvent, ServerListEvent,
};
pub use pool::{Builder, PoolStatus, QueuePool, ServerSource};
pub use transport::{
    CassandraTransport, CfDef, Column, ColumnDef, ColumnOrSuperColumn, ColumnParent, ColumnPath,
    ConsistencyLevel, Credentials, Deletion, IndexClause, IndexExpression, IndexOperator,
    IndexType, KeyRange, KeySlice, KsDef, ManageTransport, Mutation, MutationMap, ServerAddress,
    SlicePredicate, SliceRange, SuperColumn, TransportConfig, TransportError, DEFAULT_PORT,
};
