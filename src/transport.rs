//! The transport façade: everything the pool needs to know about the
//! Thrift wire layer without implementing it.
//!
//! The pool never opens sockets itself. Implementors of [`ManageTransport`]
//! provide the Cassandra-specific logic to open a framed or unframed
//! transport to a single server, and the resulting [`CassandraTransport`]
//! exposes the blocking RPC surface the pool wraps with retry and
//! failover.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// The Thrift port Cassandra listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 9160;

/// A `(host, port)` pair identifying one Cassandra server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    /// Hostname or IP literal.
    pub host: String,
    /// Thrift RPC port.
    pub port: u16,
}

impl ServerAddress {
    /// Builds an address from explicit parts.
    pub fn new(host: impl Into<String>, port: u16) -> ServerAddress {
        ServerAddress {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    /// Parses `"host:port"`; a bare `"host"` gets [`DEFAULT_PORT`].
    fn from_str(s: &str) -> Result<ServerAddress, Error> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidRequest(
                "server address must not be empty".into(),
            ));
        }
        match s.rsplit_once(':') {
            None => Ok(ServerAddress::new(s, DEFAULT_PORT)),
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::InvalidRequest(format!("malformed server address '{s}'"))
                })?;
                if host.is_empty() {
                    return Err(Error::InvalidRequest(format!(
                        "malformed server address '{s}'"
                    )));
                }
                Ok(ServerAddress::new(host, port))
            }
        }
    }
}

/// Username and password presented during login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Login secret.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-connection settings handed to [`ManageTransport::open`].
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Keyspace every connection is bound to after the handshake.
    pub keyspace: String,
    /// Optional login credentials.
    pub credentials: Option<Credentials>,
    /// Socket timeout for individual RPCs.
    pub timeout: Duration,
    /// Framed (`TFramedTransport`) versus unframed wire format.
    pub framed: bool,
}

/// An error raised by the wire layer.
///
/// [`TimedOut`](TransportError::TimedOut) and
/// [`Unavailable`](TransportError::Unavailable) are transient: the pool
/// absorbs them and fails the operation over to another connection. The
/// remaining kinds are fatal and surface to the caller unchanged.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    /// The coordinator did not answer within the socket timeout.
    #[error("request timed out: {0}")]
    TimedOut(String),
    /// Not enough live replicas to satisfy the requested consistency.
    #[error("not enough replicas available: {0}")]
    Unavailable(String),
    /// The socket failed, closed, or could not be opened.
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer violated the Thrift protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The request was rejected by the server application layer.
    #[error("application error: {0}")]
    Application(String),
}

impl TransportError {
    /// Whether the pool may transparently retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::TimedOut(_) | TransportError::Unavailable(_)
        )
    }
}

/// How many replicas must acknowledge an operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConsistencyLevel {
    /// A single replica.
    #[default]
    One,
    /// Two replicas.
    Two,
    /// Three replicas.
    Three,
    /// A majority of replicas.
    Quorum,
    /// A majority within the local datacenter.
    LocalQuorum,
    /// A majority within every datacenter.
    EachQuorum,
    /// Every replica.
    All,
    /// Any node, including hinted handoff.
    Any,
}

/// A single named column value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Column {
    /// Column name bytes.
    pub name: Vec<u8>,
    /// Column value bytes.
    pub value: Vec<u8>,
    /// Write timestamp in microseconds.
    pub timestamp: i64,
    /// Optional expiry in seconds.
    pub ttl: Option<i32>,
}

/// A super column: a named group of subcolumns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SuperColumn {
    /// Super column name bytes.
    pub name: Vec<u8>,
    /// The contained subcolumns.
    pub columns: Vec<Column>,
}

/// Either a plain column or a super column, as returned by reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnOrSuperColumn {
    /// A plain column.
    Column(Column),
    /// A super column.
    SuperColumn(SuperColumn),
}

/// Addresses a column family and optionally a super column within it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnParent {
    /// Target column family.
    pub column_family: String,
    /// Restrict to one super column, if set.
    pub super_column: Option<Vec<u8>>,
}

/// Addresses a column family and optionally a single (super)column.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnPath {
    /// Target column family.
    pub column_family: String,
    /// Super column name, if any.
    pub super_column: Option<Vec<u8>>,
    /// Column name, if any.
    pub column: Option<Vec<u8>>,
}

/// A contiguous range of column names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceRange {
    /// First column name, empty for unbounded.
    pub start: Vec<u8>,
    /// Last column name, empty for unbounded.
    pub finish: Vec<u8>,
    /// Reverse comparator order.
    pub reversed: bool,
    /// Maximum number of columns returned.
    pub count: i32,
}

/// Selects columns either by explicit names or by range.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlicePredicate {
    /// Explicit column names, mutually exclusive with `slice_range`.
    pub column_names: Option<Vec<Vec<u8>>>,
    /// Range selection, mutually exclusive with `column_names`.
    pub slice_range: Option<SliceRange>,
}

/// A range of row keys or tokens for sequential scans.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyRange {
    /// Inclusive start key.
    pub start_key: Option<Vec<u8>>,
    /// Inclusive end key.
    pub end_key: Option<Vec<u8>>,
    /// Start token, mutually exclusive with keys.
    pub start_token: Option<String>,
    /// End token, mutually exclusive with keys.
    pub end_token: Option<String>,
    /// Maximum number of rows returned.
    pub count: i32,
}

/// One row of a range or index scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySlice {
    /// Row key.
    pub key: Vec<u8>,
    /// The selected columns of that row.
    pub columns: Vec<ColumnOrSuperColumn>,
}

/// Comparison operator of an [`IndexExpression`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOperator {
    /// Equal.
    Eq,
    /// Greater than or equal.
    Gte,
    /// Greater than.
    Gt,
    /// Less than or equal.
    Lte,
    /// Less than.
    Lt,
}

/// One predicate of a secondary index query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexExpression {
    /// Indexed column name.
    pub column_name: Vec<u8>,
    /// Comparison operator.
    pub op: IndexOperator,
    /// Comparison value.
    pub value: Vec<u8>,
}

/// A conjunction of index expressions plus paging state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexClause {
    /// Expressions combined with logical AND.
    pub expressions: Vec<IndexExpression>,
    /// First row key of the page.
    pub start_key: Vec<u8>,
    /// Maximum number of rows returned.
    pub count: i32,
}

/// Removes columns selected by a predicate, or a whole row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Deletion {
    /// Tombstone timestamp in microseconds.
    pub timestamp: i64,
    /// Super column to delete within, if any.
    pub super_column: Option<Vec<u8>>,
    /// Columns to delete; `None` deletes everything addressed.
    pub predicate: Option<SlicePredicate>,
}

/// A single insert or delete inside a batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mutation {
    /// Insert or update, if set.
    pub column_or_supercolumn: Option<ColumnOrSuperColumn>,
    /// Delete, if set.
    pub deletion: Option<Deletion>,
}

/// Batch payload: row key to column family to mutation list.
pub type MutationMap = HashMap<Vec<u8>, HashMap<String, Vec<Mutation>>>;

/// Secondary index kind of a [`ColumnDef`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    /// A hash index on column values.
    Keys,
}

/// Schema of one column within a column family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name bytes.
    pub name: Vec<u8>,
    /// Value validation class.
    pub validation_class: String,
    /// Secondary index kind, if indexed.
    pub index_type: Option<IndexType>,
    /// Secondary index name, if indexed.
    pub index_name: Option<String>,
}

/// Schema of one column family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CfDef {
    /// Owning keyspace.
    pub keyspace: String,
    /// Column family name.
    pub name: String,
    /// `"Standard"` or `"Super"`.
    pub column_type: String,
    /// Column name comparator class.
    pub comparator_type: String,
    /// Per-column schema entries.
    pub column_metadata: Vec<ColumnDef>,
}

/// Schema of one keyspace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KsDef {
    /// Keyspace name.
    pub name: String,
    /// Replication strategy class.
    pub strategy_class: String,
    /// Replica count for simple strategies.
    pub replication_factor: i32,
    /// The column families defined in this keyspace.
    pub cf_defs: Vec<CfDef>,
}

/// The blocking RPC surface of one open connection.
///
/// Every method either returns a value, raises a transient error that the
/// pool will absorb and retry elsewhere, or raises a fatal error that
/// propagates to the caller. Implementations do not need to be reentrant;
/// the pool serializes access to each transport.
pub trait CassandraTransport: Send + 'static {
    /// Reads selected columns of a single row.
    fn get_slice(
        &mut self,
        key: &[u8],
        parent: &ColumnParent,
        predicate: &SlicePredicate,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<ColumnOrSuperColumn>, TransportError>;

    /// Reads selected columns of a contiguous range of rows.
    fn get_range_slices(
        &mut self,
        parent: &ColumnParent,
        predicate: &SlicePredicate,
        range: &KeyRange,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<KeySlice>, TransportError>;

    /// Reads rows matching a secondary index clause.
    fn get_indexed_slices(
        &mut self,
        parent: &ColumnParent,
        clause: &IndexClause,
        predicate: &SlicePredicate,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<KeySlice>, TransportError>;

    /// Applies a batch of mutations atomically per row.
    fn batch_mutate(
        &mut self,
        mutations: &MutationMap,
        consistency: ConsistencyLevel,
    ) -> Result<(), TransportError>;

    /// Deletes the addressed column, super column, or row.
    fn remove(
        &mut self,
        key: &[u8],
        path: &ColumnPath,
        timestamp: i64,
        consistency: ConsistencyLevel,
    ) -> Result<(), TransportError>;

    /// Drops every row of a column family.
    fn truncate(&mut self, column_family: &str) -> Result<(), TransportError>;

    /// Fetches the schema of a keyspace.
    fn describe_keyspace(&mut self, keyspace: &str) -> Result<KsDef, TransportError>;

    /// Closes the underlying socket. Must be idempotent.
    fn close(&mut self);
}

/// A factory which opens transports to individual servers.
///
/// This is the seam between the pool and the wire: the pool decides which
/// server to dial and when, the manager knows how.
pub trait ManageTransport: Send + Sync + 'static {
    /// The transport type this manager opens.
    type Transport: CassandraTransport;

    /// Opens a transport to `server`, performs the framed or unframed
    /// handshake, authenticates, and selects the configured keyspace.
    fn open(
        &self,
        server: &ServerAddress,
        config: &TransportConfig,
    ) -> Result<Self::Transport, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let addr: ServerAddress = "cass1.example.com:9161".parse().unwrap();
        assert_eq!(addr.host, "cass1.example.com");
        assert_eq!(addr.port, 9161);
    }

    #[test]
    fn bare_host_gets_default_port() {
        let addr: ServerAddress = "localhost".parse().unwrap();
        assert_eq!(addr, ServerAddress::new("localhost", DEFAULT_PORT));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!("".parse::<ServerAddress>().is_err());
        assert!(":9160".parse::<ServerAddress>().is_err());
        assert!("host:notaport".parse::<ServerAddress>().is_err());
    }

    #[test]
    fn transient_classification() {
        assert!(TransportError::TimedOut("t".into()).is_transient());
        assert!(TransportError::Unavailable("u".into()).is_transient());
        assert!(!TransportError::Transport("closed".into()).is_transient());
        assert!(!TransportError::Protocol("bad frame".into()).is_transient());
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "cassandra".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("cassandra"));
        assert!(!rendered.contains("hunter2"));
    }
}
