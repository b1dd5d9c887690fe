//! The controller's shared state and its event entry points.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::TopologyError;
use crate::mac::{Dpid, MacAddr};
use crate::ofp_controller::{Datapath, FlowStatsEntry, PacketSink, StatsSink, TopologyEventSink};
use crate::orchestrator::ControlPlane;
use crate::telemetry::Telemetry;
use crate::topology::{MacPair, NodeId, PathCost, Topology};

pub struct ControllerState {
    pub topology: Topology,
    pub telemetry: Telemetry,
}

/// Topology and telemetry behind a single lock. Switch sessions, the HTTP API and the
/// orchestrator all go through it, one operation at a time.
pub struct Controller {
    state: Mutex<ControllerState>,
}

impl Controller {
    pub fn new(config: &Config) -> Controller {
        Controller::with_hypervisors(config.controller.controller_mac, config.hypervisors.clone())
    }

    pub fn with_hypervisors(controller_mac: MacAddr, hypervisors: BTreeMap<MacAddr, Dpid>) -> Controller {
        Controller {
            state: Mutex::new(ControllerState {
                topology: Topology::new(controller_mac, hypervisors),
                telemetry: Telemetry::new(),
            }),
        }
    }

    /// Run `f` with exclusive access to the state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut ControllerState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn with_topology<R>(&self, f: impl FnOnce(&mut Topology) -> R) -> R {
        f(&mut self.state.lock().topology)
    }

    pub fn with_telemetry<R>(&self, f: impl FnOnce(&mut Telemetry) -> R) -> R {
        f(&mut self.state.lock().telemetry)
    }
}

impl TopologyEventSink for Controller {
    fn switch_connected(&self, dpid: Dpid, datapath: Arc<dyn Datapath>) {
        self.with_topology(|topo| topo.on_switch_connect(dpid, datapath));
    }

    fn switch_disconnected(&self, dpid: Dpid, datapath: &Arc<dyn Datapath>) {
        self.with_topology(|topo| topo.on_switch_disconnect(dpid, datapath));
    }

    fn link_discovered(&self, src_dpid: Dpid, src_port: u16, dst_dpid: Dpid, dst_port: u16) {
        self.with_topology(|topo| topo.on_link_discovered(src_dpid, src_port, dst_dpid, dst_port));
    }

    fn link_removed(&self, dpid: Dpid, port: u16) {
        self.with_topology(|topo| topo.on_link_removed(dpid, port));
    }
}

impl PacketSink for Controller {
    fn packet_in(&self, dpid: Dpid, in_port: u16, frame: &[u8], buffer_id: Option<u32>) {
        self.with_topology(|topo| topo.handle_packet_in(dpid, in_port, frame, buffer_id));
    }
}

impl StatsSink for Controller {
    fn flow_stats_reply(&self, dpid: Dpid, entries: Vec<FlowStatsEntry>) {
        let summary = self.with_telemetry(|tele| tele.on_flow_stats_reply(dpid, &entries));
        debug!(
            "stats from {}: {} entries, {} pairs updated",
            dpid,
            entries.len(),
            summary.updated
        );
        if summary.anomalies > 0 {
            warn!("stats from {}: {} pairs with unexpected flow counts", dpid, summary.anomalies);
        }
        if summary.foreign > 0 || summary.stalled > 0 {
            info!(
                "stats from {}: {} pairs owned elsewhere, {} without elapsed time",
                dpid, summary.foreign, summary.stalled
            );
        }
    }
}

impl ControlPlane for Controller {
    fn request_flow_stats(&self) -> usize {
        self.with_topology(|topo| topo.request_flow_stats())
    }

    fn traffic_rates(&self) -> Vec<(MacPair, f64)> {
        self.with_telemetry(|tele| tele.rates())
    }

    fn placement(&self) -> BTreeMap<MacAddr, Option<Dpid>> {
        self.with_topology(|topo| topo.vm_placement())
    }

    fn hypervisors(&self) -> BTreeMap<MacAddr, Dpid> {
        self.with_topology(|topo| topo.hypervisors().clone())
    }

    fn path_cost(&self, src: &NodeId, dst: &NodeId) -> Result<PathCost, TopologyError> {
        self.with_topology(|topo| topo.path_cost(src, dst))
    }

    fn migrate(&self, vm: MacAddr) -> Result<Dpid, TopologyError> {
        self.with_topology(|topo| topo.migrate(vm))
    }

    fn discover_host(&self, ip: Ipv4Addr) -> Result<(), TopologyError> {
        self.with_topology(|topo| topo.discover_host(ip))
    }
}
