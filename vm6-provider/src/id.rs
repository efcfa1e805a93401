//! Composite resource identifiers.
//!
//! Two encodings are in use:
//! - hierarchical `<node>/<kind>/<vmid>` for per-node resources (VMs)
//! - flat `<kind>/<id>` for cluster-scoped resources (networks, pools, accounts, VxLANs)
//!
//! Decoding is strict: no trimming, no case folding, and the numeric VM id must be
//! written in canonical decimal form, so `decode(encode(x)) == x` always holds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Resource kinds managed by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Qemu,
    Network,
    Pool,
    Account,
    Vxlan,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Qemu,
        ResourceKind::Network,
        ResourceKind::Pool,
        ResourceKind::Account,
        ResourceKind::Vxlan,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Qemu => "qemu",
            ResourceKind::Network => "network",
            ResourceKind::Pool => "pool",
            ResourceKind::Account => "account",
            ResourceKind::Vxlan => "vxlan",
        }
    }

    /// Whether identifiers of this kind use the hierarchical `node/kind/id` form.
    pub const fn is_node_scoped(self) -> bool {
        matches!(self, ResourceKind::Qemu)
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a resource addressed per node: `<node>/<kind>/<vmid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeResourceId {
    pub node: String,
    pub kind: ResourceKind,
    pub vmid: u64,
}

impl NodeResourceId {
    pub fn new(node: impl Into<String>, kind: ResourceKind, vmid: u64) -> Self {
        Self {
            node: node.into(),
            kind,
            vmid,
        }
    }
}

impl fmt::Display for NodeResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.kind, self.vmid)
    }
}

impl FromStr for NodeResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let [node, kind, vmid] = parts.as_slice() else {
            return Err(malformed(s, "must be node/type/vmId"));
        };
        if node.is_empty() {
            return Err(malformed(s, "node segment is empty"));
        }
        let kind = parse_kind(s, kind)?;
        let vmid = parse_numeric(s, vmid)?;
        Ok(Self {
            node: node.to_string(),
            kind,
            vmid,
        })
    }
}

/// Identifier of a cluster-scoped resource: `<kind>/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterResourceId {
    pub kind: ResourceKind,
    pub id: String,
}

impl ClusterResourceId {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ClusterResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl FromStr for ClusterResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let [kind, id] = parts.as_slice() else {
            return Err(malformed(s, "must be type/resId"));
        };
        let kind = parse_kind(s, kind)?;
        if id.is_empty() {
            return Err(malformed(s, "id segment is empty"));
        }
        Ok(Self {
            kind,
            id: id.to_string(),
        })
    }
}

/// Either identifier form, selected by segment count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Node(NodeResourceId),
    Cluster(ClusterResourceId),
}

impl ResourceId {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceId::Node(id) => id.kind,
            ResourceId::Cluster(id) => id.kind,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Node(id) => id.fmt(f),
            ResourceId::Cluster(id) => id.fmt(f),
        }
    }
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split('/').count() {
            3 => s.parse().map(ResourceId::Node),
            2 => s.parse().map(ResourceId::Cluster),
            _ => Err(malformed(s, "must be node/type/vmId or type/resId")),
        }
    }
}

fn parse_kind(id: &str, segment: &str) -> Result<ResourceKind> {
    ResourceKind::parse(segment)
        .ok_or_else(|| malformed(id, &format!("unknown resource type {:?}", segment)))
}

/// Accepts only canonical non-negative decimals ("0", "101"); rejects signs,
/// leading zeros and anything `u64` cannot hold.
fn parse_numeric(id: &str, segment: &str) -> Result<u64> {
    let canonical = !segment.is_empty()
        && segment.bytes().all(|b| b.is_ascii_digit())
        && (segment == "0" || !segment.starts_with('0'));
    if !canonical {
        return Err(malformed(
            id,
            &format!("{:?} is not a non-negative integer", segment),
        ));
    }
    segment
        .parse()
        .map_err(|_| malformed(id, &format!("{} is out of range", segment)))
}

fn malformed(id: &str, reason: &str) -> Error {
    Error::MalformedIdentifier {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}
