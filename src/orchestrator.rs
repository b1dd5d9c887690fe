//! Periodic placement optimisation.
//!
//! Each cycle polls the hypervisor switches for counters, evaluates the current placement and
//! proposes moving the costliest VM to the hypervisor that lowers the total cost most. A
//! proposal is only carried out once the same VM has been proposed for a full window of
//! cycles and the total cost has been steady over that window.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};

use crate::config::{MigrationConfig, OrchestratorConfig};
use crate::cost::{traffic_matrix, CostModel, Placement, TrafficMatrix, WeightMatrix};
use crate::error::{MigrationError, TopologyError};
use crate::mac::{Dpid, MacAddr};
use crate::topology::{MacPair, NodeId, PathCost};

/// What the orchestrator needs from the rest of the controller.
pub trait ControlPlane: Send + Sync {
    /// Ask the hypervisor switches for flow counters. Returns how many were asked.
    fn request_flow_stats(&self) -> usize;
    fn traffic_rates(&self) -> Vec<(MacPair, f64)>;
    fn placement(&self) -> BTreeMap<MacAddr, Option<Dpid>>;
    fn hypervisors(&self) -> BTreeMap<MacAddr, Dpid>;
    fn path_cost(&self, src: &NodeId, dst: &NodeId) -> Result<PathCost, TopologyError>;
    /// Detach `vm` from its hypervisor, returning the one it left.
    fn migrate(&self, vm: MacAddr) -> Result<Dpid, TopologyError>;
    fn discover_host(&self, ip: Ipv4Addr) -> Result<(), TopologyError>;
}

/// Moves a running VM between hypervisors.
pub trait Migrator: Send {
    fn live_migrate(&self, vm: MacAddr, source: Dpid, destination: Dpid) -> Result<(), MigrationError>;
}

/// Live migration through libvirt's `virsh`.
#[derive(Clone, Debug)]
pub struct VirshMigrator {
    uri_template: String,
    hypervisor_hosts: BTreeMap<Dpid, String>,
    vm_names: BTreeMap<MacAddr, String>,
}

impl VirshMigrator {
    pub fn new(config: &MigrationConfig) -> VirshMigrator {
        VirshMigrator {
            uri_template: config.uri_template.clone(),
            hypervisor_hosts: config.hypervisor_hosts.clone(),
            vm_names: config.vm_names.clone(),
        }
    }

    fn uri(&self, hypervisor: Dpid) -> Result<String, MigrationError> {
        let host = self
            .hypervisor_hosts
            .get(&hypervisor)
            .ok_or(MigrationError::UnknownHost(hypervisor))?;
        Ok(self.uri_template.replace("{host}", host))
    }

    /// `virsh -c <source> migrate --live --persistent --copy-storage-all <domain> <destination>`
    pub fn command(&self, vm: MacAddr, source: Dpid, destination: Dpid) -> Result<Command, MigrationError> {
        let domain = self.vm_names.get(&vm).ok_or(MigrationError::UnknownVm(vm))?;
        let mut cmd = Command::new("virsh");
        cmd.arg("-c")
            .arg(self.uri(source)?)
            .arg("migrate")
            .arg("--live")
            .arg("--persistent")
            .arg("--copy-storage-all")
            .arg(domain)
            .arg(self.uri(destination)?);
        Ok(cmd)
    }
}

impl Migrator for VirshMigrator {
    fn live_migrate(&self, vm: MacAddr, source: Dpid, destination: Dpid) -> Result<(), MigrationError> {
        let output = self.command(vm, source, destination)?.output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(MigrationError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Logs the migrations it is asked for.
#[derive(Copy, Clone, Debug, Default)]
pub struct DryRunMigrator;

impl Migrator for DryRunMigrator {
    fn live_migrate(&self, vm: MacAddr, source: Dpid, destination: Dpid) -> Result<(), MigrationError> {
        info!("dry run: would migrate {} from {} to {}", vm, source, destination);
        Ok(())
    }
}

/// One cycle's proposal.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sample {
    pub total_cost: f64,
    pub candidate_cost: f64,
    pub vm: MacAddr,
    pub target: Dpid,
}

/// The last few proposals, oldest first.
#[derive(Clone, Debug)]
pub struct StabilityWindow {
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl StabilityWindow {
    pub fn new(capacity: usize) -> StabilityWindow {
        StabilityWindow {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// Full, and every sample proposes `vm`.
    pub fn is_stable_for(&self, vm: MacAddr) -> bool {
        self.is_full() && self.samples.iter().all(|s| s.vm == vm)
    }

    /// Relative standard deviation of the recorded total costs, in percent.
    pub fn rsd(&self) -> f64 {
        let costs: Vec<f64> = self.samples.iter().map(|s| s.total_cost).collect();
        relative_std_dev(&costs)
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Population standard deviation over the mean, in percent. Zero for no values.
pub fn relative_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean * 100.0
}

/// Inputs of one decision.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub traffic: TrafficMatrix,
    pub placement: Placement,
    /// Hypervisors a VM may be moved to.
    pub hypervisors: Vec<Dpid>,
    pub weights: WeightMatrix,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// No placed VM exchanges traffic.
    NoTraffic,
    /// No other hypervisor lowers the total cost.
    NoImprovement { vm: MacAddr, total_cost: f64 },
    /// An improvement exists but the window does not agree on it yet.
    Unstable { vm: MacAddr, target: Dpid, samples: usize },
    /// The window agrees, but the total cost moved too much over it.
    HighVariance { vm: MacAddr, rsd: f64 },
    Migrate { vm: MacAddr, from: Dpid, to: Dpid, rsd: f64 },
}

pub struct Orchestrator<C: ControlPlane> {
    control: Arc<C>,
    migrator: Box<dyn Migrator>,
    model: CostModel,
    window: StabilityWindow,
    config: OrchestratorConfig,
}

impl<C: ControlPlane> Orchestrator<C> {
    /// The controller's own address never counts as a traffic end.
    pub fn new(
        control: Arc<C>,
        migrator: Box<dyn Migrator>,
        config: OrchestratorConfig,
        controller_mac: MacAddr,
    ) -> Orchestrator<C> {
        let excluded = config.excluded_hosts.iter().copied().chain([controller_mac]);
        Orchestrator {
            control,
            migrator,
            model: CostModel::new(excluded),
            window: StabilityWindow::new(config.window_capacity),
            config,
        }
    }

    pub fn window(&self) -> &StabilityWindow {
        &self.window
    }

    /// Gather placement, traffic and hypervisor weights from the control plane.
    pub fn snapshot(&self) -> Snapshot {
        let traffic = traffic_matrix(self.control.traffic_rates());
        let placement: Placement = self
            .control
            .placement()
            .into_iter()
            .filter_map(|(vm, hv)| hv.map(|hv| (vm, hv)))
            .collect();
        let hypervisors: BTreeSet<Dpid> = self
            .control
            .hypervisors()
            .into_iter()
            .filter(|(mac, _)| !self.model.is_excluded(mac))
            .map(|(_, dpid)| dpid)
            .collect();

        let weighted: BTreeSet<Dpid> = hypervisors.iter().chain(placement.values()).copied().collect();
        let mut weights = WeightMatrix::new();
        for h1 in &weighted {
            for h2 in &weighted {
                let weight = if h1 == h2 {
                    0
                } else {
                    match self.control.path_cost(&NodeId::Switch(*h1), &NodeId::Switch(*h2)) {
                        Ok(cost) => cost.total_cost,
                        Err(e) => {
                            debug!("no weight between {} and {}: {}", h1, h2, e);
                            continue;
                        }
                    }
                };
                weights.entry(*h1).or_default().insert(*h2, weight);
            }
        }

        Snapshot {
            traffic,
            placement,
            hypervisors: hypervisors.into_iter().collect(),
            weights,
        }
    }

    /// Evaluate `snap` and feed the stability window.
    pub fn decide(&mut self, snap: &Snapshot) -> Decision {
        let current = self.model.evaluate(&snap.traffic, &snap.placement, &snap.weights);
        let Some((vm, vm_cost)) = current.ranking().into_iter().next() else {
            debug!("no traffic between placed VMs");
            return Decision::NoTraffic;
        };
        let Some(&from) = snap.placement.get(&vm) else {
            return Decision::NoTraffic;
        };
        info!(
            "total cost {:.2}, highest is {} on {} with {:.2}",
            current.total_cost, vm, from, vm_cost
        );

        let mut candidates: Vec<(Dpid, f64)> = snap
            .hypervisors
            .iter()
            .filter(|hv| **hv != from)
            .map(|hv| {
                let cost = self
                    .model
                    .relocated_cost(&snap.traffic, &snap.placement, &snap.weights, vm, *hv);
                debug!("{} on {} would cost {:.2}", vm, hv, cost);
                (*hv, cost)
            })
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let total_cost = current.total_cost;
        let Some(&(target, candidate_cost)) = candidates.first() else {
            return Decision::NoImprovement { vm, total_cost };
        };
        if candidate_cost >= total_cost {
            debug!("best move of {} to {} does not improve {:.2}", vm, target, total_cost);
            return Decision::NoImprovement { vm, total_cost };
        }

        self.window.push(Sample {
            total_cost,
            candidate_cost,
            vm,
            target,
        });
        if !self.window.is_stable_for(vm) {
            info!(
                "moving {} to {} would cost {:.2}, unstable after {} samples",
                vm,
                target,
                candidate_cost,
                self.window.len()
            );
            return Decision::Unstable {
                vm,
                target,
                samples: self.window.len(),
            };
        }

        let rsd = self.window.rsd();
        if rsd >= self.config.rsd_threshold_percent {
            warn!("cost of {} is unstable, rsd {:.2}%", vm, rsd);
            return Decision::HighVariance { vm, rsd };
        }
        Decision::Migrate {
            vm,
            from,
            to: target,
            rsd,
        }
    }

    /// Carry out a migration decision. Anything else is a no-op.
    pub fn execute(&mut self, decision: &Decision) {
        let Decision::Migrate { vm, from, to, rsd } = *decision else {
            return;
        };
        info!("migrating {} from {} to {} (rsd {:.2}%)", vm, from, to, rsd);
        if let Err(e) = self.migrator.live_migrate(vm, from, to) {
            error!("migration of {} failed: {}", vm, e);
        }
        match self.control.migrate(vm) {
            Ok(left) => debug!("{} detached from {}", vm, left),
            Err(e) => warn!("cannot detach {}: {}", vm, e),
        }
        self.window.clear();
    }

    pub fn run_cycle(&mut self) -> Decision {
        let asked = self.control.request_flow_stats();
        debug!("flow stats requested from {} switches", asked);
        thread::sleep(self.config.stats_wait());
        let snap = self.snapshot();
        let decision = self.decide(&snap);
        self.execute(&decision);
        decision
    }

    /// Probe the configured hypervisor addresses until as many hypervisors are known.
    pub fn bootstrap(&self, running: &AtomicBool) {
        let wanted = self.config.hypervisor_ips.len();
        while running.load(Ordering::Relaxed) {
            let known = self.control.hypervisors().len();
            if known >= wanted {
                info!("{} hypervisors known", known);
                return;
            }
            debug!("{} of {} hypervisors known, probing", known, wanted);
            for ip in &self.config.hypervisor_ips {
                if let Err(e) = self.control.discover_host(*ip) {
                    debug!("cannot probe {}: {}", ip, e);
                }
            }
            thread::sleep(self.config.discovery_interval());
        }
    }

    pub fn run(&mut self, running: &AtomicBool) {
        self.bootstrap(running);
        while running.load(Ordering::Relaxed) {
            self.run_cycle();
            thread::sleep(self.config.cycle_interval());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn mac(n: u8) -> MacAddr {
        MacAddr([0x52, 0x54, 0, 0, 0, n])
    }

    /// Hypervisor switches 1, 2 and 3 in a line.
    #[derive(Default)]
    struct FakeControl {
        rate: Mutex<f64>,
        excluded_hv: Option<MacAddr>,
        detached: Mutex<Vec<MacAddr>>,
        probes: Mutex<Vec<Ipv4Addr>>,
    }

    impl ControlPlane for FakeControl {
        fn request_flow_stats(&self) -> usize {
            3
        }

        fn traffic_rates(&self) -> Vec<(MacPair, f64)> {
            vec![(MacPair::new(mac(1), mac(2)), *self.rate.lock())]
        }

        fn placement(&self) -> BTreeMap<MacAddr, Option<Dpid>> {
            btreemap! { mac(1) => Some(Dpid(1)), mac(2) => Some(Dpid(3)), mac(5) => None }
        }

        fn hypervisors(&self) -> BTreeMap<MacAddr, Dpid> {
            let mut hvs = btreemap! { mac(101) => Dpid(1), mac(102) => Dpid(2), mac(103) => Dpid(3) };
            if let Some(mac) = self.excluded_hv {
                hvs.insert(mac, Dpid(4));
            }
            hvs
        }

        fn path_cost(&self, src: &NodeId, dst: &NodeId) -> Result<PathCost, TopologyError> {
            let (a, b) = (src.as_switch().unwrap().0, dst.as_switch().unwrap().0);
            let links = a.abs_diff(b) as usize;
            Ok(PathCost {
                switches: links.saturating_sub(1),
                links,
                max_cost: links as u64,
                total_cost: links as u64,
            })
        }

        fn migrate(&self, vm: MacAddr) -> Result<Dpid, TopologyError> {
            self.detached.lock().push(vm);
            Ok(Dpid(1))
        }

        fn discover_host(&self, ip: Ipv4Addr) -> Result<(), TopologyError> {
            self.probes.lock().push(ip);
            Ok(())
        }
    }

    struct Recorder(Arc<Mutex<Vec<(MacAddr, Dpid, Dpid)>>>);

    impl Migrator for Recorder {
        fn live_migrate(&self, vm: MacAddr, source: Dpid, destination: Dpid) -> Result<(), MigrationError> {
            self.0.lock().push((vm, source, destination));
            Err(MigrationError::UnknownVm(vm))
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            stats_wait_ms: 0,
            cycle_interval_ms: 0,
            discovery_interval_ms: 0,
            ..OrchestratorConfig::default()
        }
    }

    fn orchestrator(
        control: FakeControl,
    ) -> (Orchestrator<FakeControl>, Arc<FakeControl>, Arc<Mutex<Vec<(MacAddr, Dpid, Dpid)>>>) {
        let control = Arc::new(control);
        let calls = Arc::new(Mutex::new(vec![]));
        let orch = Orchestrator::new(
            control.clone(),
            Box::new(Recorder(calls.clone())),
            config(),
            MacAddr([2, 2, 2, 2, 2, 2]),
        );
        (orch, control, calls)
    }

    /// mac(1) on 1 and mac(2) on 3 exchanging `rate`, so the total cost is `4 * rate`.
    fn snapshot(rate: f64) -> Snapshot {
        let row = |a: u64, b: u64, c: u64| btreemap! { Dpid(1) => a, Dpid(2) => b, Dpid(3) => c };
        Snapshot {
            traffic: traffic_matrix(vec![(MacPair::new(mac(1), mac(2)), rate)]),
            placement: btreemap! { mac(1) => Dpid(1), mac(2) => Dpid(3) },
            hypervisors: vec![Dpid(1), Dpid(2), Dpid(3)],
            weights: btreemap! {
                Dpid(1) => row(0, 1, 2),
                Dpid(2) => row(1, 0, 1),
                Dpid(3) => row(2, 1, 0),
            },
        }
    }

    #[test]
    fn rsd_of_known_series() {
        assert!((relative_std_dev(&[100.0, 97.0, 103.0]) - 2.449).abs() < 0.01);
        assert!(relative_std_dev(&[100.0, 80.0, 130.0]) > 5.0);
        assert_eq!(relative_std_dev(&[]), 0.0);
        assert_eq!(relative_std_dev(&[7.0, 7.0, 7.0]), 0.0);
    }

    #[test]
    fn window_slides_and_requires_one_vm() {
        let sample = |vm: u8, total_cost: f64| Sample {
            total_cost,
            candidate_cost: 0.0,
            vm: mac(vm),
            target: Dpid(2),
        };
        let mut window = StabilityWindow::new(3);
        window.push(sample(1, 100.0));
        window.push(sample(2, 100.0));
        window.push(sample(1, 100.0));
        assert!(window.is_full());
        assert!(!window.is_stable_for(mac(1)));
        window.push(sample(1, 100.0));
        assert!(!window.is_stable_for(mac(1)));
        window.push(sample(1, 100.0));
        assert!(window.is_stable_for(mac(1)));
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn steady_costs_migrate() {
        let (mut orch, _, _) = orchestrator(FakeControl::default());
        assert_eq!(
            orch.decide(&snapshot(25.0)),
            Decision::Unstable {
                vm: mac(1),
                target: Dpid(3),
                samples: 1
            }
        );
        assert!(matches!(orch.decide(&snapshot(24.25)), Decision::Unstable { samples: 2, .. }));
        match orch.decide(&snapshot(25.75)) {
            Decision::Migrate { vm, from, to, rsd } => {
                assert_eq!((vm, from, to), (mac(1), Dpid(1), Dpid(3)));
                assert!((rsd - 2.449).abs() < 0.01);
            }
            other => panic!("expected a migration, got {:?}", other),
        }
        let totals: Vec<f64> = orch.window().samples().map(|s| s.total_cost).collect();
        assert_eq!(totals, vec![100.0, 97.0, 103.0]);
    }

    #[test]
    fn volatile_costs_do_not_migrate() {
        let (mut orch, _, _) = orchestrator(FakeControl::default());
        orch.decide(&snapshot(25.0));
        orch.decide(&snapshot(20.0));
        match orch.decide(&snapshot(32.5)) {
            Decision::HighVariance { vm, rsd } => {
                assert_eq!(vm, mac(1));
                assert!(rsd > 5.0);
            }
            other => panic!("expected high variance, got {:?}", other),
        }
        // the window keeps sliding
        assert_eq!(orch.window().len(), 3);
    }

    #[test]
    fn no_traffic_and_no_improvement() {
        let (mut orch, _, _) = orchestrator(FakeControl::default());
        assert_eq!(orch.decide(&Snapshot::default()), Decision::NoTraffic);

        let mut colocated = snapshot(10.0);
        colocated.placement.insert(mac(2), Dpid(1));
        assert_eq!(
            orch.decide(&colocated),
            Decision::NoImprovement {
                vm: mac(1),
                total_cost: 0.0
            }
        );

        let mut alone = snapshot(10.0);
        alone.hypervisors = vec![Dpid(1)];
        assert_eq!(
            orch.decide(&alone),
            Decision::NoImprovement {
                vm: mac(1),
                total_cost: 40.0
            }
        );
        assert!(orch.window().is_empty());
    }

    #[test]
    fn snapshot_from_control_plane() {
        let control = FakeControl {
            rate: Mutex::new(10.0),
            excluded_hv: Some(mac(104)),
            ..FakeControl::default()
        };
        let control = Arc::new(control);
        let orch = Orchestrator::new(
            control.clone(),
            Box::new(DryRunMigrator),
            OrchestratorConfig {
                excluded_hosts: vec![mac(104)],
                ..config()
            },
            MacAddr([2, 2, 2, 2, 2, 2]),
        );
        let snap = orch.snapshot();
        assert_eq!(snap.hypervisors, vec![Dpid(1), Dpid(2), Dpid(3)]);
        assert_eq!(snap.placement, btreemap! { mac(1) => Dpid(1), mac(2) => Dpid(3) });
        assert_eq!(snap.weights[&Dpid(1)][&Dpid(3)], 2);
        assert_eq!(snap.weights[&Dpid(2)][&Dpid(2)], 0);
        assert!(!snap.weights.contains_key(&Dpid(4)));
        assert_eq!(snap.traffic[&mac(2)][&mac(1)], 10.0);
    }

    #[test]
    fn cycles_migrate_even_if_the_tool_fails() {
        let (mut orch, control, calls) = orchestrator(FakeControl {
            rate: Mutex::new(10.0),
            ..FakeControl::default()
        });
        orch.run_cycle();
        orch.run_cycle();
        assert!(calls.lock().is_empty());
        assert!(matches!(orch.run_cycle(), Decision::Migrate { .. }));
        assert_eq!(*calls.lock(), vec![(mac(1), Dpid(1), Dpid(3))]);
        assert_eq!(*control.detached.lock(), vec![mac(1)]);
        assert!(orch.window().is_empty());
    }

    #[test]
    fn bootstrap_stops_once_hypervisors_are_known() {
        let (mut orch, control, _) = orchestrator(FakeControl::default());
        orch.config.hypervisor_ips = vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)];
        orch.bootstrap(&AtomicBool::new(true));
        assert!(control.probes.lock().is_empty());

        orch.config.hypervisor_ips = (1..=4).map(|n| Ipv4Addr::new(10, 0, 0, n)).collect();
        orch.bootstrap(&AtomicBool::new(false));
        assert!(control.probes.lock().is_empty());
    }

    #[test]
    fn virsh_command_line() {
        let migrator = VirshMigrator::new(&MigrationConfig {
            hypervisor_hosts: btreemap! { Dpid(1) => "node1".to_string(), Dpid(3) => "node3".to_string() },
            vm_names: btreemap! { mac(1) => "web".to_string() },
            ..MigrationConfig::default()
        });
        let cmd = migrator.command(mac(1), Dpid(1), Dpid(3)).unwrap();
        assert_eq!(cmd.get_program(), "virsh");
        let args: Vec<&str> = cmd.get_args().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            vec![
                "-c",
                "qemu+ssh://node1/system",
                "migrate",
                "--live",
                "--persistent",
                "--copy-storage-all",
                "web",
                "qemu+ssh://node3/system",
            ]
        );
        assert!(matches!(
            migrator.command(mac(2), Dpid(1), Dpid(3)),
            Err(MigrationError::UnknownVm(_))
        ));
        assert!(matches!(
            migrator.command(mac(1), Dpid(1), Dpid(9)),
            Err(MigrationError::UnknownHost(Dpid(9)))
        ));
    }
}
