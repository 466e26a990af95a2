//! Core type configuration binding the consensus engine to this store's
//! command schema.

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandResult};

/// Internal consensus node id. Derived from the public string id, which is
/// what the API and the metadata map speak.
pub type NodeId = u64;

/// Cluster member identity: the public id plus the advertised endpoint.
/// Carried inside the membership config so every node can map raft ids
/// back to public identities.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub addr: String,
}

impl Node {
    pub fn new(id: &str, addr: &str) -> Self {
        Self {
            id: id.to_string(),
            addr: addr.to_string(),
        }
    }
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Command,
        R = CommandResult,
        NodeId = NodeId,
        Node = Node,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = std::io::Cursor<Vec<u8>>,
        Responder = openraft::impls::OneshotResponder<TypeConfig>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// Maps a public node id onto the consensus id space with FNV-1a, so every
/// node derives the same mapping without coordination.
pub fn raft_node_id(id: &str) -> NodeId {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
