//! Topology and path engine.
//!
//! Owns the switch/host graph, the MAC learning tables and the cache of installed paths.
//! Forwarding state is programmed reactively: an ARP reply between two hosts installs the
//! shortest path between them, one rule per direction at every switch on the way.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::TopologyError;
use crate::mac::{Dpid, MacAddr};
use crate::ofp_controller::{Datapath, FlowMatch, OutPort, CONTROLLER_PORT, LOCAL_PORT};
use crate::packet::{Arp, EthTyp, Nw, Packet};

pub mod graph;
pub mod pair;

pub use self::graph::{Link, LinkEnd, Node, NodeId, NodeKind, PathCost, TopologyGraph};
pub use self::pair::{DirectedMacPair, MacPair};

/// Priority of the per-pair forwarding rules.
pub const PATH_PRIORITY: u16 = 0;
/// Priority of the rule punting ARP to the controller. Above path rules so that ARP is
/// always seen by the controller.
pub const ARP_PRIORITY: u16 = 1;
/// Priority of the rule flooding the controller's own ARP probes.
pub const CONTROLLER_ARP_PRIORITY: u16 = 2;

/// Whether two handles belong to the same switch session.
fn same_session(a: &Arc<dyn Datapath>, b: &Arc<dyn Datapath>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Ingress and egress port of one switch on a path.
struct Hop {
    datapath: Arc<dyn Datapath>,
    ingress: u16,
    egress: u16,
}

pub struct Topology {
    graph: TopologyGraph,
    controller_mac: MacAddr,
    mac_to_ip: BTreeMap<MacAddr, Ipv4Addr>,
    ip_to_mac: BTreeMap<Ipv4Addr, MacAddr>,
    hypervisor_mac_to_dpid: BTreeMap<MacAddr, Dpid>,
    hypervisor_dpid_to_mac: BTreeMap<Dpid, MacAddr>,
    /// Configured hypervisors, kept across switch restarts.
    seeded_hypervisors: BTreeMap<MacAddr, Dpid>,
    installed_paths: HashMap<DirectedMacPair, Vec<NodeId>>,
}

impl Topology {
    /// `hypervisors` seeds the hypervisor maps before any host is observed.
    pub fn new(controller_mac: MacAddr, hypervisors: BTreeMap<MacAddr, Dpid>) -> Topology {
        let hypervisor_dpid_to_mac = hypervisors.iter().map(|(mac, dpid)| (*dpid, *mac)).collect();
        Topology {
            graph: TopologyGraph::new(),
            controller_mac,
            mac_to_ip: BTreeMap::new(),
            ip_to_mac: BTreeMap::new(),
            hypervisor_mac_to_dpid: hypervisors.clone(),
            hypervisor_dpid_to_mac,
            seeded_hypervisors: hypervisors,
            installed_paths: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &TopologyGraph {
        &self.graph
    }

    pub fn controller_mac(&self) -> MacAddr {
        self.controller_mac
    }

    pub fn mac_to_ip(&self) -> &BTreeMap<MacAddr, Ipv4Addr> {
        &self.mac_to_ip
    }

    pub fn ip_to_mac(&self) -> &BTreeMap<Ipv4Addr, MacAddr> {
        &self.ip_to_mac
    }

    pub fn hypervisors(&self) -> &BTreeMap<MacAddr, Dpid> {
        &self.hypervisor_mac_to_dpid
    }

    pub fn hypervisor_mac(&self, dpid: Dpid) -> Option<MacAddr> {
        self.hypervisor_dpid_to_mac.get(&dpid).copied()
    }

    pub fn datapath(&self, dpid: Dpid) -> Option<Arc<dyn Datapath>> {
        self.graph
            .node(&NodeId::Switch(dpid))
            .and_then(|node| node.datapath.clone())
    }

    /// Add a switch and install the rules every switch needs before any path exists.
    pub fn on_switch_connect(&mut self, dpid: Dpid, datapath: Arc<dyn Datapath>) {
        info!("switch {} entered", dpid);
        self.graph.add_node(
            NodeId::Switch(dpid),
            Node {
                kind: NodeKind::Switch,
                datapath: Some(datapath.clone()),
            },
        );

        let arp = EthTyp::EthTypARP as u16;
        let from_controller = FlowMatch {
            eth_src: Some(self.controller_mac),
            ..FlowMatch::eth_type(arp)
        };
        let bootstrap = [
            (ARP_PRIORITY, FlowMatch::eth_type(arp), OutPort::Controller),
            (CONTROLLER_ARP_PRIORITY, from_controller, OutPort::Flood),
            (ARP_PRIORITY, FlowMatch::eth_type(EthTyp::EthTypLLDP as u16), OutPort::Controller),
        ];
        for (priority, pattern, out) in bootstrap {
            if let Err(e) = datapath.install_flow(priority, pattern, out) {
                warn!("cannot install bootstrap flow on {}: {}", dpid, e);
            }
        }
    }

    /// Remove a switch when the session `datapath` ends. Installed paths through it are
    /// retracted from the other switches, and the hosts behind it are forgotten so that their
    /// next ARP attaches them again. A session replaced by a newer one for the same dpid
    /// leaves the switch alone.
    pub fn on_switch_disconnect(&mut self, dpid: Dpid, datapath: &Arc<dyn Datapath>) {
        let node = NodeId::Switch(dpid);
        match self.graph.node(&node).and_then(|n| n.datapath.as_ref()) {
            Some(current) if same_session(current, datapath) => {}
            Some(_) => {
                debug!("stale session of {} ended, switch kept", dpid);
                return;
            }
            None => return,
        }
        info!("switch {} left", dpid);
        let mut stale: Vec<DirectedMacPair> = self
            .installed_paths
            .iter()
            .filter(|(_, path)| path.contains(&node))
            .map(|(pair, _)| *pair)
            .collect();
        stale.sort();
        for pair in stale {
            if let Some(path) = self.installed_paths.get(&pair).cloned() {
                info!("retracting path {} through {}", pair, dpid);
                self.retract_path(pair, &path, Some(dpid));
            }
        }

        let hosts: Vec<MacAddr> = self
            .graph
            .neighbors(&node)
            .filter_map(|(neighbor, _)| neighbor.as_host())
            .collect();
        for mac in hosts {
            debug!("{} lost its switch {}", mac, dpid);
            self.forget_host(mac);
        }
        if let Some(mac) = self.hypervisor_dpid_to_mac.get(&dpid).copied() {
            if self.seeded_hypervisors.get(&mac) != Some(&dpid) {
                self.hypervisor_dpid_to_mac.remove(&dpid);
                self.hypervisor_mac_to_dpid.remove(&mac);
            }
        }
        self.graph.remove_node(&node);
    }

    pub fn on_link_discovered(&mut self, src_dpid: Dpid, src_port: u16, dst_dpid: Dpid, dst_port: u16) {
        let (src, dst) = (NodeId::Switch(src_dpid), NodeId::Switch(dst_dpid));
        let link = Link::new(src, Some(src_port), dst, Some(dst_port));
        let known = self
            .graph
            .edge(&src, &dst)
            .map_or(false, |l| l.port_of(&src) == Some(src_port) && l.port_of(&dst) == Some(dst_port));
        if known {
            return;
        }
        match self.graph.add_edge(link) {
            Ok(()) => info!("link {}:{} <-> {}:{}", src_dpid, src_port, dst_dpid, dst_port),
            Err(e) => debug!("ignoring link {}:{} -> {}:{}: {}", src_dpid, src_port, dst_dpid, dst_port, e),
        }
    }

    /// Accepted but not acted upon: the edge and the paths crossing it stay until the
    /// switch itself disconnects.
    pub fn on_link_removed(&mut self, dpid: Dpid, port: u16) {
        info!("link delete on {}:{} not implemented", dpid, port);
    }

    /// Register `mac` as attached to `dpid` at `in_port`. Returns whether a new mapping was
    /// created. Hosts seen on the switch's local port are hypervisors.
    pub fn learn_host(&mut self, dpid: Dpid, in_port: u16, mac: MacAddr, ip: Ipv4Addr) -> bool {
        if self.mac_to_ip.contains_key(&mac) || mac == self.controller_mac || ip.is_unspecified() {
            return false;
        }
        let switch = NodeId::Switch(dpid);
        if !self.graph.contains(&switch) {
            warn!("{} seen on unknown switch {}", mac, dpid);
            return false;
        }
        self.mac_to_ip.insert(mac, ip);
        self.ip_to_mac.insert(ip, mac);

        let kind = if in_port == LOCAL_PORT {
            info!("{} ({}) is the hypervisor of {}", mac, ip, dpid);
            self.hypervisor_mac_to_dpid.insert(mac, dpid);
            self.hypervisor_dpid_to_mac.insert(dpid, mac);
            NodeKind::Hypervisor
        } else if self.hypervisor_mac_to_dpid.contains_key(&mac) {
            NodeKind::Hypervisor
        } else {
            info!("VM {} ({}) at {}:{}", mac, ip, dpid, in_port);
            NodeKind::Vm
        };

        let host = NodeId::Host(mac);
        let previous: Vec<NodeId> = self.graph.neighbors(&host).map(|(n, _)| *n).collect();
        for neighbor in previous {
            self.graph.remove_edge(&host, &neighbor);
        }
        self.graph.add_node(
            host,
            Node {
                kind,
                datapath: None,
            },
        );
        if let Err(e) = self.graph.add_edge(Link::new(host, None, switch, Some(in_port))) {
            warn!("cannot attach {}: {}", mac, e);
        }
        true
    }

    /// Drop the address mappings of `mac`. The graph node stays.
    pub fn forget_host(&mut self, mac: MacAddr) {
        if let Some(ip) = self.mac_to_ip.remove(&mac) {
            self.ip_to_mac.remove(&ip);
        }
    }

    pub fn shortest_path(&self, src: &NodeId, dst: &NodeId) -> Result<Vec<NodeId>, TopologyError> {
        self.graph.shortest_path(src, dst)
    }

    pub fn path_cost(&self, src: &NodeId, dst: &NodeId) -> Result<PathCost, TopologyError> {
        self.graph.path_cost(src, dst)
    }

    pub fn installed_path(&self, src: MacAddr, dst: MacAddr) -> Option<&[NodeId]> {
        self.installed_paths
            .get(&DirectedMacPair::new(src, dst))
            .map(|path| path.as_slice())
    }

    pub fn installed_paths(&self) -> impl Iterator<Item = (&DirectedMacPair, &Vec<NodeId>)> {
        self.installed_paths.iter()
    }

    fn hop(&self, path: &[NodeId], i: usize) -> Option<Hop> {
        let switch = &path[i];
        let datapath = self.graph.node(switch)?.datapath.clone()?;
        let ingress = self.graph.edge(switch, &path[i - 1])?.port_of(switch)?;
        let egress = self.graph.edge(switch, &path[i + 1])?.port_of(switch)?;
        Some(Hop {
            datapath,
            ingress,
            egress,
        })
    }

    fn hops(&self, path: &[NodeId]) -> Vec<(NodeId, Option<Hop>)> {
        (1..path.len().saturating_sub(1))
            .map(|i| (path[i], self.hop(path, i)))
            .collect()
    }

    /// Install the shortest path from `src` to `dst` and cache it in both directions.
    /// A pair already installed is left untouched: reprogramming would reset the counters.
    pub fn install_path(&mut self, src: MacAddr, dst: MacAddr) -> Result<Vec<NodeId>, TopologyError> {
        let key = DirectedMacPair::new(src, dst);
        if let Some(path) = self.installed_paths.get(&key) {
            return Ok(path.clone());
        }
        let path = self.graph.shortest_path(&NodeId::Host(src), &NodeId::Host(dst))?;
        for (switch, hop) in self.hops(&path) {
            let Some(hop) = hop else {
                warn!("no ports known for {} on the path {} -> {}", switch, src, dst);
                continue;
            };
            let forward = hop.datapath.install_flow(
                PATH_PRIORITY,
                FlowMatch::pair(hop.ingress, src, dst),
                OutPort::Physical(hop.egress),
            );
            let reverse = hop.datapath.install_flow(
                PATH_PRIORITY,
                FlowMatch::pair(hop.egress, dst, src),
                OutPort::Physical(hop.ingress),
            );
            if let Err(e) = forward.and(reverse) {
                warn!("cannot program {} for {} <-> {}: {}", switch, src, dst, e);
            }
        }
        let mut reversed = path.clone();
        reversed.reverse();
        self.installed_paths.insert(key, path.clone());
        self.installed_paths.insert(key.reversed(), reversed);
        info!("path installed from {} to {}: {}", src, dst, PathDisplay(&path));
        Ok(path)
    }

    /// Remove the rules of the cached path between `src` and `dst` and evict both directions.
    pub fn uninstall_path(&mut self, src: MacAddr, dst: MacAddr) -> Result<Vec<NodeId>, TopologyError> {
        let key = DirectedMacPair::new(src, dst);
        let path = self
            .installed_paths
            .get(&key)
            .cloned()
            .ok_or(TopologyError::NotInstalled { src, dst })?;
        self.retract_path(key, &path, None);
        info!("path uninstalled from {} to {}", src, dst);
        Ok(path)
    }

    fn retract_path(&mut self, key: DirectedMacPair, path: &[NodeId], skip: Option<Dpid>) {
        for (switch, hop) in self.hops(path) {
            if switch.as_switch() == skip {
                continue;
            }
            let Some(hop) = hop else {
                debug!("no ports known for {}, rules left in place", switch);
                continue;
            };
            let forward = hop.datapath.delete_flow(FlowMatch::pair(hop.ingress, key.src, key.dst));
            let reverse = hop.datapath.delete_flow(FlowMatch::pair(hop.egress, key.dst, key.src));
            if let Err(e) = forward.and(reverse) {
                warn!("cannot remove rules of {} from {}: {}", key, switch, e);
            }
        }
        self.installed_paths.remove(&key);
        self.installed_paths.remove(&key.reversed());
    }

    /// The switch a host is attached to.
    pub fn hypervisor_of(&self, mac: MacAddr) -> Option<Dpid> {
        self.graph
            .neighbors(&NodeId::Host(mac))
            .find_map(|(neighbor, _)| neighbor.as_switch())
    }

    /// Current hypervisor of every VM in the graph, `None` while a VM is detached.
    pub fn vm_placement(&self) -> BTreeMap<MacAddr, Option<Dpid>> {
        self.graph
            .nodes()
            .filter(|(_, node)| node.kind == NodeKind::Vm)
            .filter_map(|(id, _)| id.as_host())
            .map(|mac| (mac, self.hypervisor_of(mac)))
            .collect()
    }

    /// Detach `mac` ahead of a move: forget its addresses, retract every path to or from it
    /// and drop its attachment. The new attachment is learned from its next ARP.
    pub fn migrate(&mut self, mac: MacAddr) -> Result<Dpid, TopologyError> {
        let current = self.hypervisor_of(mac).ok_or(TopologyError::NotAttached(mac))?;
        self.forget_host(mac);
        let mut touching: Vec<DirectedMacPair> = self
            .installed_paths
            .keys()
            .filter(|pair| pair.involves(mac))
            .copied()
            .collect();
        touching.sort();
        for pair in touching {
            if let Some(path) = self.installed_paths.get(&pair).cloned() {
                self.retract_path(pair, &path, None);
            }
        }
        self.graph.remove_edge(&NodeId::Switch(current), &NodeId::Host(mac));
        info!("{} detached from {}", mac, current);
        Ok(current)
    }

    /// Handle a frame punted by switch `dpid`. ARP teaches hosts and drives path installation.
    pub fn handle_packet_in(&mut self, dpid: Dpid, in_port: u16, frame: &[u8], buffer_id: Option<u32>) {
        let pkt = match Packet::parse(frame) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!("unparsable frame from {}:{}: {}", dpid, in_port, e);
                return;
            }
        };
        let arp = match pkt.nw {
            Nw::Arp(arp) => arp,
            _ => return,
        };
        let Some(datapath) = self.datapath(dpid) else {
            debug!("packet-in from unknown switch {}", dpid);
            return;
        };
        self.learn_host(dpid, in_port, arp.sender_mac(), arp.sender_ip());

        match arp {
            Arp::Query { .. } => {
                if let Err(e) = datapath.send_packet(Some(in_port), OutPort::Flood, buffer_id, frame) {
                    warn!("cannot flood ARP request on {}: {}", dpid, e);
                }
            }
            Arp::Reply { sha, tha, .. } => {
                if tha == self.controller_mac || sha == self.controller_mac {
                    return;
                }
                let path = match self.install_path(sha, tha) {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("ARP reply {} -> {} dropped: {}", sha, tha, e);
                        return;
                    }
                };
                let here = NodeId::Switch(dpid);
                let next_port = path
                    .iter()
                    .position(|n| *n == here)
                    .and_then(|idx| path.get(idx + 1))
                    .and_then(|next| self.graph.edge(&here, next))
                    .and_then(|link| link.port_of(&here));
                match next_port {
                    Some(port) => {
                        let out = OutPort::Physical(port);
                        if let Err(e) = datapath.send_packet(Some(in_port), out, buffer_id, frame) {
                            warn!("cannot forward ARP reply on {}: {}", dpid, e);
                        }
                    }
                    None => warn!(
                        "ARP reply {} -> {} at {} which is not on the path {}",
                        sha,
                        tha,
                        dpid,
                        PathDisplay(&path)
                    ),
                }
            }
        }
    }

    /// Flood a broadcast ARP request for `ip` from the controller's address, so that the
    /// owner answers and gets learned.
    pub fn discover_host(&self, ip: Ipv4Addr) -> Result<(), TopologyError> {
        let datapath = self
            .graph
            .nodes()
            .find_map(|(_, node)| node.datapath.clone())
            .ok_or(TopologyError::NoSwitches)?;
        debug!("discovering {} from {}", ip, datapath.dpid());
        let frame = Packet::arp_request(self.controller_mac, Ipv4Addr::UNSPECIFIED, ip).marshal();
        if let Err(e) = datapath.send_packet(Some(CONTROLLER_PORT), OutPort::Flood, None, &frame) {
            warn!("cannot send discovery for {}: {}", ip, e);
        }
        Ok(())
    }

    /// Ask every hypervisor switch for its flow counters. Returns how many were asked.
    pub fn request_flow_stats(&self) -> usize {
        let mut dpids: Vec<Dpid> = self.hypervisor_mac_to_dpid.values().copied().collect();
        dpids.sort();
        dpids.dedup();
        dpids
            .into_iter()
            .filter_map(|dpid| self.datapath(dpid))
            .filter(|dp| match dp.request_flow_stats() {
                Ok(()) => true,
                Err(e) => {
                    warn!("cannot query {}: {}", dp.dpid(), e);
                    false
                }
            })
            .count()
    }
}

struct PathDisplay<'a>(&'a [NodeId]);

impl std::fmt::Display for PathDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, node) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", node)?;
        }
        Ok(())
    }
}
