mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rust_sdnmgmt::config::OrchestratorConfig;
use rust_sdnmgmt::controller::Controller;
use rust_sdnmgmt::error::MigrationError;
use rust_sdnmgmt::mac::{Dpid, MacAddr};
use rust_sdnmgmt::ofp_controller::{FlowStatsEntry, PacketSink, StatsSink};
use rust_sdnmgmt::orchestrator::{ControlPlane, Decision, Migrator, Orchestrator};
use rust_sdnmgmt::topology::MacPair;
use test_log::test;

fn entry(src: MacAddr, dst: MacAddr, byte_count: u64, duration_sec: u32) -> FlowStatsEntry {
    FlowStatsEntry {
        eth_src: src,
        eth_dst: dst,
        byte_count,
        duration_sec,
        duration_nsec: 0,
    }
}

#[test]
fn rates_follow_the_owning_switch() {
    let ctl = Controller::with_hypervisors(CONTROLLER_MAC, BTreeMap::new());
    let (a, b) = (vm(1), vm(2));
    ctl.flow_stats_reply(Dpid(1), vec![entry(a, b, 100, 10), entry(b, a, 150, 10)]);
    ctl.flow_stats_reply(Dpid(1), vec![entry(a, b, 140, 14), entry(b, a, 210, 14)]);
    let snap = ctl.with_telemetry(|tele| *tele.snapshot(&MacPair::new(a, b)).unwrap());
    assert_eq!(snap.delta_bytes, 100);
    assert_eq!(snap.delta_duration, 4.0);

    ctl.flow_stats_reply(Dpid(3), vec![entry(a, b, 900, 30), entry(b, a, 900, 30)]);
    let after = ctl.with_telemetry(|tele| *tele.snapshot(&MacPair::new(a, b)).unwrap());
    assert_eq!(after, snap);
    assert_eq!(ctl.traffic_rates(), vec![(MacPair::new(a, b), 25.0)]);
}

struct Recorder(Arc<Mutex<Vec<(MacAddr, Dpid, Dpid)>>>);

impl Migrator for Recorder {
    fn live_migrate(&self, vm: MacAddr, source: Dpid, destination: Dpid) -> Result<(), MigrationError> {
        self.0.lock().push((vm, source, destination));
        Ok(())
    }
}

#[test]
fn steady_traffic_moves_a_vm_after_three_cycles() {
    let seed = BTreeMap::from([
        (hypervisor(1), Dpid(1)),
        (hypervisor(2), Dpid(2)),
        (hypervisor(3), Dpid(3)),
    ]);
    let ctl = Arc::new(Controller::with_hypervisors(CONTROLLER_MAC, seed));
    let switches = line(&ctl);
    ctl.packet_in(Dpid(1), 5, &arp_request(vm(1), vm(2)), None);
    ctl.packet_in(Dpid(3), 5, &arp_reply(vm(2), vm(1)), None);

    let calls = Arc::new(Mutex::new(vec![]));
    let mut orch = Orchestrator::new(
        ctl.clone(),
        Box::new(Recorder(calls.clone())),
        OrchestratorConfig {
            stats_wait_ms: 0,
            ..OrchestratorConfig::default()
        },
        CONTROLLER_MAC,
    );

    let mut decisions = vec![];
    for cycle in 1..=3u32 {
        let bytes = 100 * cycle as u64;
        ctl.flow_stats_reply(
            Dpid(1),
            vec![entry(vm(1), vm(2), bytes, 10 * cycle), entry(vm(2), vm(1), bytes, 10 * cycle)],
        );
        decisions.push(orch.run_cycle());
    }
    assert!(switches.iter().all(|sw| sw.take().contains(&Op::Stats)));

    assert!(matches!(decisions[0], Decision::Unstable { samples: 1, .. }));
    assert!(matches!(decisions[1], Decision::Unstable { samples: 2, .. }));
    assert_eq!(
        decisions[2],
        Decision::Migrate {
            vm: vm(1),
            from: Dpid(1),
            to: Dpid(2),
            rsd: 0.0
        }
    );
    assert_eq!(*calls.lock(), vec![(vm(1), Dpid(1), Dpid(2))]);
    assert_eq!(ctl.placement().get(&vm(1)), Some(&None));
    ctl.with_topology(|topo| assert!(topo.installed_path(vm(1), vm(2)).is_none()));
    assert!(orch.window().is_empty());
}

#[test]
fn idle_network_does_nothing() {
    let ctl = Arc::new(Controller::with_hypervisors(CONTROLLER_MAC, BTreeMap::new()));
    line(&ctl);
    let calls = Arc::new(Mutex::new(vec![]));
    let mut orch = Orchestrator::new(
        ctl,
        Box::new(Recorder(calls.clone())),
        OrchestratorConfig {
            stats_wait_ms: 0,
            ..OrchestratorConfig::default()
        },
        CONTROLLER_MAC,
    );
    assert_eq!(orch.run_cycle(), Decision::NoTraffic);
    assert!(calls.lock().is_empty());
}
