//! The overlay's tree topology: front-end root, relay nodes, back-end
//! leaves (spec.md §4.4, §6).
//!
//! A topology can come from a text descriptor (`parent:0 => child1:0
//! child2:0 … ;` per line, one node per host) or be computed by
//! partitioning a flat host list into a branching-factor-k tree.

use std::collections::HashMap;
use std::fmt;

/// A node address: `host:idx` where `idx` disambiguates multiple overlay
/// processes on the same host (normally `0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(host: impl Into<String>, idx: u32) -> Self {
        NodeId(format!("{}:{}", host.into(), idx))
    }

    pub fn host(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyError(pub String);

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid topology: {}", self.0)
    }
}
impl std::error::Error for TopologyError {}

/// The realized tree: an edge list from every relay (including the root)
/// to its children, plus the set of leaves (back-end hosts).
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub root: NodeId,
    edges: HashMap<NodeId, Vec<NodeId>>,
    leaves: Vec<NodeId>,
}

impl Topology {
    /// Parses the text descriptor format: one `parent => child child … ;`
    /// statement per non-empty line. The first parent encountered that
    /// never appears as a child is taken as the root.
    pub fn parse(text: &str) -> Result<Self, TopologyError> {
        let mut edges: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut all_children: Vec<NodeId> = Vec::new();
        let mut all_parents: Vec<NodeId> = Vec::new();

        for line in text.lines() {
            let line = line.trim().trim_end_matches(';').trim();
            if line.is_empty() {
                continue;
            }
            let (parent_text, children_text) = line
                .split_once("=>")
                .ok_or_else(|| TopologyError(format!("missing '=>' in line: {line}")))?;
            let parent = parse_node(parent_text.trim())?;
            let children: Vec<NodeId> =
                children_text.split_whitespace().map(parse_node).collect::<Result<_, _>>()?;
            if children.is_empty() {
                return Err(TopologyError(format!("no children declared for {parent}")));
            }
            all_parents.push(parent.clone());
            all_children.extend(children.iter().cloned());
            edges.entry(parent).or_default().extend(children);
        }

        if edges.is_empty() {
            return Err(TopologyError("descriptor declares no nodes".into()));
        }

        let children_set: std::collections::HashSet<&NodeId> = all_children.iter().collect();
        let mut roots: Vec<&NodeId> = all_parents.iter().filter(|p| !children_set.contains(p)).collect();
        roots.sort();
        roots.dedup();
        let root = match roots.as_slice() {
            [only] => (*only).clone(),
            [] => return Err(TopologyError("every declared parent is also a child (cycle?)".into())),
            _ => return Err(TopologyError("descriptor has more than one root".into())),
        };

        let leaves: Vec<NodeId> =
            all_children.into_iter().filter(|c| !edges.contains_key(c)).collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();

        let topo = Topology { root, edges, leaves };
        topo.validate()?;
        Ok(topo)
    }

    /// Builds a balanced k-ary relay tree over `backend_hosts`, rooted at
    /// `frontend_host`. The minimum relay count is `ceil(hosts/k)`; relays
    /// beyond the first tier are added only as needed to keep every
    /// relay's fan-out ≤ `k`.
    pub fn build(
        frontend_host: impl Into<String>,
        backend_hosts: &[String],
        k: usize,
    ) -> Result<Self, TopologyError> {
        if k == 0 {
            return Err(TopologyError("branching factor must be at least 1".into()));
        }
        let root = NodeId::new(frontend_host, 0);
        let leaves: Vec<NodeId> = backend_hosts.iter().map(|h| NodeId::new(h.clone(), 0)).collect();

        let mut edges: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        if leaves.is_empty() {
            let topo = Topology { root, edges, leaves };
            topo.validate()?;
            return Ok(topo);
        }

        let relay_count = leaves.len().div_ceil(k);
        let relays: Vec<NodeId> = (0..relay_count).map(|i| NodeId::new(format!("relay-{i}"), 0)).collect();

        for (i, relay) in relays.iter().enumerate() {
            let start = i * k;
            let end = (start + k).min(leaves.len());
            edges.insert(relay.clone(), leaves[start..end].to_vec());
        }
        edges.insert(root.clone(), relays);

        let topo = Topology { root, edges, leaves };
        topo.validate()?;
        Ok(topo)
    }

    /// Number of internal relay nodes (root excluded, leaves excluded).
    pub fn relay_count(&self) -> usize {
        self.edges.keys().filter(|n| **n != self.root).count()
    }

    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    pub fn children_of(&self, node: &NodeId) -> &[NodeId] {
        self.edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The direct parent of `node`, if any.
    pub fn parent_of(&self, node: &NodeId) -> Option<&NodeId> {
        self.edges.iter().find(|(_, children)| children.contains(node)).map(|(p, _)| p)
    }

    /// No host may be both the front-end and a back-end; every declared
    /// leaf must actually have no children of its own.
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.leaves.iter().any(|l| l.host() == self.root.host()) {
            return Err(TopologyError(format!(
                "host {} is both the front-end and a back-end",
                self.root.host()
            )));
        }
        for leaf in &self.leaves {
            if self.edges.contains_key(leaf) {
                return Err(TopologyError(format!("{leaf} declared as both leaf and relay")));
            }
        }
        Ok(())
    }
}

fn parse_node(text: &str) -> Result<NodeId, TopologyError> {
    if text.is_empty() {
        return Err(TopologyError("empty node token".into()));
    }
    match text.split_once(':') {
        Some((host, idx)) => {
            let idx: u32 =
                idx.parse().map_err(|_| TopologyError(format!("invalid node index in '{text}'")))?;
            Ok(NodeId::new(host, idx))
        }
        None => Ok(NodeId::new(text, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_two_level_descriptor() {
        let text = "fe:0 => relay0:0 relay1:0 ;\nrelay0:0 => be0:0 be1:0 ;\nrelay1:0 => be2:0 be3:0 ;\n";
        let topo = Topology::parse(text).unwrap();
        assert_eq!(topo.root, NodeId::new("fe", 0));
        assert_eq!(topo.relay_count(), 2);
        assert_eq!(topo.leaves().len(), 4);
    }

    #[test]
    fn rejects_a_host_serving_as_both_frontend_and_backend() {
        let text = "fe:0 => fe:0 ;\n";
        assert!(Topology::parse(text).is_err());
    }

    #[test]
    fn rejects_a_descriptor_with_two_roots() {
        let text = "a:0 => b:0 ;\nc:0 => d:0 ;\n";
        assert!(Topology::parse(text).is_err());
    }

    #[test]
    fn build_computes_minimum_relay_count() {
        let hosts: Vec<String> = (0..10).map(|i| format!("host{i}")).collect();
        let topo = Topology::build("fe", &hosts, 4).unwrap();
        assert_eq!(topo.relay_count(), 3); // ceil(10/4)
        assert_eq!(topo.leaves().len(), 10);
    }

    #[test]
    fn build_refuses_a_frontend_host_reused_as_backend() {
        let hosts = vec!["fe".to_string(), "host1".to_string()];
        assert!(Topology::build("fe", &hosts, 2).is_err());
    }

    #[test]
    fn parent_of_finds_the_owning_relay() {
        let hosts: Vec<String> = (0..6).map(|i| format!("host{i}")).collect();
        let topo = Topology::build("fe", &hosts, 3).unwrap();
        let leaf = NodeId::new("host4", 0);
        let parent = topo.parent_of(&leaf).unwrap();
        assert!(topo.children_of(parent).contains(&leaf));
    }
}
