//! Undirected topology graph over switches and hosts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use petgraph::algo::astar;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableUnGraph};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ParseError, TopologyError};
use crate::mac::{Dpid, MacAddr};
use crate::ofp_controller::Datapath;

/// Identifier of a graph node: a switch by datapath id, a host by MAC address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeId {
    Switch(Dpid),
    Host(MacAddr),
}

impl NodeId {
    pub fn as_switch(&self) -> Option<Dpid> {
        match *self {
            NodeId::Switch(dpid) => Some(dpid),
            NodeId::Host(_) => None,
        }
    }

    pub fn as_host(&self) -> Option<MacAddr> {
        match *self {
            NodeId::Host(mac) => Some(mac),
            NodeId::Switch(_) => None,
        }
    }
}

impl From<Dpid> for NodeId {
    fn from(dpid: Dpid) -> Self {
        NodeId::Switch(dpid)
    }
}

impl From<MacAddr> for NodeId {
    fn from(mac: MacAddr) -> Self {
        NodeId::Host(mac)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NodeId::Switch(ref dpid) => fmt::Display::fmt(dpid, f),
            NodeId::Host(ref mac) => fmt::Display::fmt(mac, f),
        }
    }
}

impl FromStr for NodeId {
    type Err = ParseError;

    /// MAC addresses contain separators, datapath ids are bare hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = if s.contains(|c| c == ':' || c == '-') {
            s.parse().map(NodeId::Host)
        } else {
            s.parse().map(NodeId::Switch)
        };
        parsed.map_err(|_| ParseError::Node(s.to_string()))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Switch,
    Vm,
    Hypervisor,
}

/// Node attributes. Switch nodes carry the session used to program them.
#[derive(Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub datapath: Option<Arc<dyn Datapath>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("datapath", &self.datapath.as_ref().map(|dp| dp.dpid()))
            .finish()
    }
}

/// One side of a link: the node and the port it uses, if wired.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkEnd {
    pub node: NodeId,
    pub port: Option<u16>,
}

/// An edge between two nodes, either switch to switch or host attachment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub src: LinkEnd,
    pub dst: LinkEnd,
}

impl Link {
    pub fn new(src: NodeId, src_port: Option<u16>, dst: NodeId, dst_port: Option<u16>) -> Link {
        Link {
            src: LinkEnd {
                node: src,
                port: src_port,
            },
            dst: LinkEnd {
                node: dst,
                port: dst_port,
            },
        }
    }

    /// The endpoint record belonging to `node`.
    pub fn end_of(&self, node: &NodeId) -> Option<&LinkEnd> {
        if self.src.node == *node {
            Some(&self.src)
        } else if self.dst.node == *node {
            Some(&self.dst)
        } else {
            None
        }
    }

    /// The port `node` uses on this link.
    pub fn port_of(&self, node: &NodeId) -> Option<u16> {
        self.end_of(node).and_then(|end| end.port)
    }
}

/// Hop metrics of the shortest path between two nodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCost {
    /// Intermediate nodes.
    pub switches: usize,
    pub links: usize,
    pub max_cost: u64,
    /// `max_cost * (max_cost + 1)`, grows faster than the hop count.
    pub total_cost: u64,
}

impl PathCost {
    pub fn of_path(path: &[NodeId]) -> PathCost {
        let links = path.len().saturating_sub(1);
        let max_cost = (links / 2) as u64;
        PathCost {
            switches: path.len().saturating_sub(2),
            links,
            max_cost,
            total_cost: max_cost * (max_cost + 1),
        }
    }
}

/// Switches and hosts as an undirected `petgraph`, indexed by node id.
#[derive(Clone, Debug, Default)]
pub struct TopologyGraph {
    graph: StableUnGraph<(NodeId, Node), Link>,
    index: BTreeMap<NodeId, NodeIndex>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        TopologyGraph::default()
    }

    /// Insert a node, or update the attributes of an existing one keeping its edges.
    pub fn add_node(&mut self, id: NodeId, node: Node) {
        match self.index.get(&id).copied() {
            Some(idx) => self.graph[idx] = (id, node),
            None => {
                let idx = self.graph.add_node((id, node));
                self.index.insert(id, idx);
            }
        }
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let idx = self.index.remove(id)?;
        self.graph.remove_node(idx).map(|(_, node)| node)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&idx| &self.graph[idx].1)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &Node)> {
        self.index.iter().map(move |(id, &idx)| (id, &self.graph[idx].1))
    }

    fn find_edge(&self, a: &NodeId, b: &NodeId) -> Option<EdgeIndex> {
        self.graph.find_edge(*self.index.get(a)?, *self.index.get(b)?)
    }

    /// Add an edge between the link's endpoints, replacing any edge between the same pair.
    /// Both endpoints must already be nodes of the graph.
    pub fn add_edge(&mut self, link: Link) -> Result<(), TopologyError> {
        let lookup = |id: NodeId| self.index.get(&id).copied().ok_or(TopologyError::UnknownNode(id));
        let a = lookup(link.src.node)?;
        let b = lookup(link.dst.node)?;
        self.graph.update_edge(a, b, link);
        Ok(())
    }

    pub fn remove_edge(&mut self, a: &NodeId, b: &NodeId) -> Option<Link> {
        let edge = self.find_edge(a, b)?;
        self.graph.remove_edge(edge)
    }

    pub fn edge(&self, a: &NodeId, b: &NodeId) -> Option<&Link> {
        self.find_edge(a, b).and_then(|edge| self.graph.edge_weight(edge))
    }

    pub fn neighbors<'a>(&'a self, id: &NodeId) -> impl Iterator<Item = (&'a NodeId, &'a Link)> + 'a {
        let idx = self.index.get(id).copied();
        idx.into_iter().flat_map(move |idx| {
            self.graph.neighbors(idx).filter_map(move |next| {
                let link = self.graph.find_edge(idx, next).and_then(|e| self.graph.edge_weight(e))?;
                Some((&self.graph[next].0, link))
            })
        })
    }

    /// Unweighted shortest path, both endpoints included.
    pub fn shortest_path(&self, src: &NodeId, dst: &NodeId) -> Result<Vec<NodeId>, TopologyError> {
        let no_path = || TopologyError::NoPath {
            src: *src,
            dst: *dst,
        };
        let (start, goal) = match (self.index.get(src), self.index.get(dst)) {
            (Some(&start), Some(&goal)) => (start, goal),
            _ => return Err(no_path()),
        };
        let (_, hops) = astar(&self.graph, start, |n| n == goal, |_| 1usize, |_| 0)
            .ok_or_else(no_path)?;
        Ok(hops.into_iter().map(|idx| self.graph[idx].0).collect())
    }

    pub fn path_cost(&self, src: &NodeId, dst: &NodeId) -> Result<PathCost, TopologyError> {
        for id in [src, dst] {
            if !self.contains(id) {
                return Err(TopologyError::UnknownNode(*id));
            }
        }
        self.shortest_path(src, dst).map(|path| PathCost::of_path(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sw(n: u64) -> NodeId {
        NodeId::Switch(Dpid(n))
    }

    fn host(n: u8) -> NodeId {
        NodeId::Host(MacAddr([0x52, 0x54, 0, 0, 0, n]))
    }

    fn plain(kind: NodeKind) -> Node {
        Node {
            kind,
            datapath: None,
        }
    }

    /// h1 - s1 - s2 - s3 - h3, plus s4 disconnected.
    fn line() -> TopologyGraph {
        let mut g = TopologyGraph::new();
        for n in 1..=4 {
            g.add_node(sw(n), plain(NodeKind::Switch));
        }
        g.add_node(host(1), plain(NodeKind::Vm));
        g.add_node(host(3), plain(NodeKind::Vm));
        g.add_edge(Link::new(sw(1), Some(2), sw(2), Some(1))).unwrap();
        g.add_edge(Link::new(sw(2), Some(2), sw(3), Some(1))).unwrap();
        g.add_edge(Link::new(host(1), None, sw(1), Some(5))).unwrap();
        g.add_edge(Link::new(host(3), None, sw(3), Some(5))).unwrap();
        g
    }

    #[test]
    fn shortest_path_endpoints() {
        let g = line();
        let path = g.shortest_path(&host(1), &host(3)).unwrap();
        assert_eq!(path, vec![host(1), sw(1), sw(2), sw(3), host(3)]);
        assert_eq!(g.shortest_path(&sw(2), &sw(2)).unwrap(), vec![sw(2)]);
        assert_eq!(
            g.shortest_path(&host(1), &sw(4)),
            Err(TopologyError::NoPath {
                src: host(1),
                dst: sw(4)
            })
        );
        assert!(g.shortest_path(&host(1), &host(9)).is_err());
    }

    #[test]
    fn shortest_path_prefers_fewer_hops() {
        let mut g = line();
        g.add_edge(Link::new(sw(1), Some(3), sw(3), Some(3))).unwrap();
        let path = g.shortest_path(&host(1), &host(3)).unwrap();
        assert_eq!(path, vec![host(1), sw(1), sw(3), host(3)]);
    }

    #[test]
    fn path_cost_is_convex_and_symmetric() {
        let g = line();
        let cost = g.path_cost(&host(1), &host(3)).unwrap();
        assert_eq!(
            cost,
            PathCost {
                switches: 3,
                links: 4,
                max_cost: 2,
                total_cost: 6
            }
        );
        assert_eq!(g.path_cost(&host(3), &host(1)).unwrap().total_cost, 6);
        assert_eq!(g.path_cost(&sw(1), &sw(1)).unwrap().total_cost, 0);
        assert_eq!(
            g.path_cost(&sw(9), &sw(1)),
            Err(TopologyError::UnknownNode(sw(9)))
        );
    }

    #[test]
    fn edges_are_replaced_and_removed_both_ways() {
        let mut g = line();
        g.add_edge(Link::new(sw(2), Some(7), sw(1), Some(8))).unwrap();
        assert_eq!(g.edge(&sw(1), &sw(2)).unwrap().port_of(&sw(1)), Some(8));
        assert_eq!(g.edge(&sw(2), &sw(1)).unwrap().port_of(&sw(2)), Some(7));
        assert!(g.remove_edge(&sw(2), &sw(1)).is_some());
        assert!(g.edge(&sw(1), &sw(2)).is_none());
        assert!(g.add_edge(Link::new(sw(1), None, sw(42), None)).is_err());
    }

    #[test]
    fn removing_a_node_drops_its_edges() {
        let mut g = line();
        g.remove_node(&sw(2));
        assert_eq!(g.neighbors(&sw(1)).count(), 1);
        assert!(g.shortest_path(&host(1), &host(3)).is_err());
    }

    #[test]
    fn node_ids_parse_by_shape() {
        assert_eq!("0000000000000004".parse::<NodeId>().unwrap(), sw(4));
        assert_eq!("52:54:00:00:00:03".parse::<NodeId>().unwrap(), host(3));
        assert!("52:54".parse::<NodeId>().is_err());
        assert_eq!(serde_json::to_string(&sw(10)).unwrap(), "\"000000000000000a\"");
    }
}
