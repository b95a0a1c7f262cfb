//! Network paths
//!
//! A `NetworkPath` lists the node identifiers a message has traversed or
//! still has to traverse. Paths are immutable: relaying produces a new path
//! by appending this node (upward) or consuming the next planned hop
//! (source-routed, downward).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::types::NodeId;

/// Errors building or extending a path
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("network path must contain at least one hop")]
    Empty,

    #[error("hop {0} already present in network path")]
    Loop(NodeId),
}

/// Ordered, immutable, non-empty list of hops
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NetworkPath {
    hops: Arc<[NodeId]>,
}

impl NetworkPath {
    /// Build a path from hops, rejecting an empty list
    pub fn new<I, S>(hops: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let hops: Vec<NodeId> = hops.into_iter().map(Into::into).collect();
        if hops.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(Self { hops: hops.into() })
    }

    /// Path of a message originating at `node`
    pub fn from_source(node: impl Into<NodeId>) -> Self {
        Self {
            hops: vec![node.into()].into(),
        }
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn source(&self) -> &NodeId {
        &self.hops[0]
    }

    pub fn last(&self) -> &NodeId {
        &self.hops[self.hops.len() - 1]
    }

    pub fn contains(&self, node: &str) -> bool {
        self.hops.iter().any(|h| h == node)
    }

    /// New path with `hop` recorded at the end
    pub fn append(&self, hop: impl Into<NodeId>) -> NetworkPath {
        let mut hops = self.hops.to_vec();
        hops.push(hop.into());
        Self { hops: hops.into() }
    }

    /// Like `append`, but refuses to record a hop twice
    pub fn try_append(&self, hop: impl Into<NodeId>) -> Result<NetworkPath, PathError> {
        let hop = hop.into();
        if self.contains(&hop) {
            return Err(PathError::Loop(hop));
        }
        Ok(self.append(hop))
    }

    /// Consume the first planned hop.
    ///
    /// Returns the hop and the remaining path, or `None` when the hop was
    /// the final destination.
    pub fn pop_hop(&self) -> (NodeId, Option<NetworkPath>) {
        let first = self.hops[0].clone();
        let rest = if self.hops.len() > 1 {
            Some(Self {
                hops: self.hops[1..].to_vec().into(),
            })
        } else {
            None
        };
        (first, rest)
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hops.join(" -> "))
    }
}

impl fmt::Debug for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkPath({})", self)
    }
}

impl Serialize for NetworkPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.hops[..].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NetworkPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hops = Vec::<NodeId>::deserialize(deserializer)?;
        NetworkPath::new(hops).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_path_rejected() {
        assert_eq!(NetworkPath::new(Vec::<String>::new()), Err(PathError::Empty));
    }

    #[test]
    fn test_append_leaves_original_untouched() {
        let path = NetworkPath::from_source("CS001");
        let relayed = path.append("NN1");

        assert_eq!(path.hops(), &["CS001".to_string()]);
        assert_eq!(relayed.hops(), &["CS001".to_string(), "NN1".to_string()]);
        assert_eq!(relayed.source(), "CS001");
        assert_eq!(relayed.last(), "NN1");
        assert_eq!(relayed.to_string(), "CS001 -> NN1");
    }

    #[test]
    fn test_try_append_detects_loop() {
        let path = NetworkPath::new(["CS001", "NN1"]).unwrap();
        assert_eq!(path.try_append("NN1"), Err(PathError::Loop("NN1".into())));
        assert!(path.try_append("CSMS").is_ok());
    }

    #[test]
    fn test_pop_hop() {
        let path = NetworkPath::new(["NN1", "CS001"]).unwrap();
        let (hop, rest) = path.pop_hop();
        assert_eq!(hop, "NN1");

        let rest = rest.unwrap();
        assert_eq!(rest.hops(), &["CS001".to_string()]);

        let (hop, rest) = rest.pop_hop();
        assert_eq!(hop, "CS001");
        assert!(rest.is_none());
    }

    #[test]
    fn test_serde_roundtrip_rejects_empty() {
        let path = NetworkPath::new(["CS001", "NN1"]).unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, r#"["CS001","NN1"]"#);

        let parsed: NetworkPath = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, path);

        assert!(serde_json::from_str::<NetworkPath>("[]").is_err());
    }
}
