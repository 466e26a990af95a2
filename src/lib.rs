//! raftsql is an embeddable, replicated SQLite store. Client SQL is
//! proposed through a Raft consensus log, applied in commit order by a
//! single apply thread on every node, and read back at a caller-chosen
//! consistency level (`None`, `Weak` or `Strong`).
//!
//! The [`Store`] is the façade: open one per node, share a
//! [`ClusterRouter`] between the nodes of a cluster, bootstrap the first
//! node and join the rest. Network transport, authentication and the
//! outer API surface are left to the embedding application.

pub mod actor;
pub mod command;
pub mod config;
pub mod error;
pub mod raft;
pub mod snapshot;
pub mod store;

mod dump;

pub use actor::BackupFormat;
pub use command::{
    Command, CommandResult, Consistency, ExecuteRequest, ExecuteResult, QueryRequest, QueryResult,
    Statement, Value,
};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use raft::network::ClusterRouter;
pub use raft::types::Node;
pub use snapshot::StoreSnapshot;
pub use store::{State, Store};
