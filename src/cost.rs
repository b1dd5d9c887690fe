//! Locality-aware network cost of a VM placement.
//!
//! The cost of a conversation is its traffic rate weighted by the path cost between the
//! hypervisors of its two ends. A placement's total cost sums that over all conversations,
//! counted from both ends.

use std::collections::{BTreeMap, BTreeSet};

use crate::mac::{Dpid, MacAddr};
use crate::topology::MacPair;

/// `traffic[src][peer]` in bytes per second, symmetric.
pub type TrafficMatrix = BTreeMap<MacAddr, BTreeMap<MacAddr, f64>>;
/// Hypervisor switch of every placed VM.
pub type Placement = BTreeMap<MacAddr, Dpid>;
/// `weights[h1][h2]`, the total path cost between two hypervisor switches.
pub type WeightMatrix = BTreeMap<Dpid, BTreeMap<Dpid, u64>>;

/// Build the traffic matrix from per-pair rates. Idle pairs are left out.
pub fn traffic_matrix<I: IntoIterator<Item = (MacPair, f64)>>(rates: I) -> TrafficMatrix {
    let mut traffic = TrafficMatrix::new();
    for (pair, rate) in rates {
        if rate > 0.0 {
            traffic.entry(pair.mac1()).or_default().insert(pair.mac2(), rate);
            traffic.entry(pair.mac2()).or_default().insert(pair.mac1(), rate);
        }
    }
    traffic
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CostEvaluation {
    pub cost_matrix: BTreeMap<MacAddr, BTreeMap<MacAddr, f64>>,
    /// Cost of each VM's conversations.
    pub overall_cost: BTreeMap<MacAddr, f64>,
    pub total_cost: f64,
}

impl CostEvaluation {
    /// VMs by decreasing overall cost.
    pub fn ranking(&self) -> Vec<(MacAddr, f64)> {
        let mut ranked: Vec<(MacAddr, f64)> = self.overall_cost.iter().map(|(m, c)| (*m, *c)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
    }
}

/// Evaluates placements, ignoring the given hosts.
#[derive(Clone, Debug, Default)]
pub struct CostModel {
    excluded: BTreeSet<MacAddr>,
}

impl CostModel {
    /// `excluded` should contain at least the controller's own address.
    pub fn new<I: IntoIterator<Item = MacAddr>>(excluded: I) -> Self {
        CostModel {
            excluded: excluded.into_iter().collect(),
        }
    }

    pub fn is_excluded(&self, mac: &MacAddr) -> bool {
        self.excluded.contains(mac)
    }

    /// Conversations with an unplaced or excluded end, or between hypervisors without a
    /// known weight, do not count.
    pub fn evaluate(
        &self,
        traffic: &TrafficMatrix,
        placement: &Placement,
        weights: &WeightMatrix,
    ) -> CostEvaluation {
        let mut eval = CostEvaluation::default();
        for (source, peers) in traffic {
            let Some(source_hv) = placement.get(source) else {
                continue;
            };
            if self.is_excluded(source) {
                continue;
            }
            for (peer, rate) in peers {
                let Some(peer_hv) = placement.get(peer) else {
                    continue;
                };
                if self.is_excluded(peer) {
                    continue;
                }
                let Some(weight) = weights.get(source_hv).and_then(|w| w.get(peer_hv)) else {
                    continue;
                };
                eval.cost_matrix
                    .entry(*source)
                    .or_default()
                    .insert(*peer, rate * *weight as f64);
            }
            if let Some(costs) = eval.cost_matrix.get(source) {
                eval.overall_cost.insert(*source, costs.values().sum());
            }
        }
        eval.total_cost = eval.overall_cost.values().sum();
        eval
    }

    /// Total cost if `vm` ran on `hypervisor` instead.
    pub fn relocated_cost(
        &self,
        traffic: &TrafficMatrix,
        placement: &Placement,
        weights: &WeightMatrix,
        vm: MacAddr,
        hypervisor: Dpid,
    ) -> f64 {
        let mut hypothetical = placement.clone();
        hypothetical.insert(vm, hypervisor);
        self.evaluate(traffic, &hypothetical, weights).total_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn mac(n: u8) -> MacAddr {
        MacAddr([0x52, 0x54, 0, 0, 0, n])
    }

    /// Three hypervisors in a line: 1 - 2 - 3.
    fn weights() -> WeightMatrix {
        let row = |a: u64, b: u64, c: u64| btreemap! { Dpid(1) => a, Dpid(2) => b, Dpid(3) => c };
        btreemap! {
            Dpid(1) => row(0, 2, 6),
            Dpid(2) => row(2, 0, 2),
            Dpid(3) => row(6, 2, 0),
        }
    }

    #[test]
    fn traffic_matrix_is_symmetric_and_positive() {
        let traffic = traffic_matrix(vec![
            (MacPair::new(mac(1), mac(2)), 10.0),
            (MacPair::new(mac(3), mac(4)), 0.0),
        ]);
        assert_eq!(
            traffic,
            btreemap! {
                mac(1) => btreemap! { mac(2) => 10.0 },
                mac(2) => btreemap! { mac(1) => 10.0 },
            }
        );
    }

    #[test]
    fn cost_counts_both_ends() {
        let traffic = traffic_matrix(vec![(MacPair::new(mac(1), mac(2)), 10.0)]);
        let placement = btreemap! { mac(1) => Dpid(1), mac(2) => Dpid(3) };
        let eval = CostModel::default().evaluate(&traffic, &placement, &weights());
        assert_eq!(eval.overall_cost, btreemap! { mac(1) => 60.0, mac(2) => 60.0 });
        assert_eq!(eval.total_cost, 120.0);
        assert_eq!(
            CostModel::default().relocated_cost(&traffic, &placement, &weights(), mac(1), Dpid(3)),
            0.0
        );
    }

    #[test]
    fn unknown_and_excluded_hosts_are_skipped() {
        let traffic = traffic_matrix(vec![
            (MacPair::new(mac(1), mac(2)), 10.0),
            (MacPair::new(mac(1), mac(9)), 50.0),
            (MacPair::new(mac(1), mac(7)), 50.0),
        ]);
        let placement = btreemap! { mac(1) => Dpid(1), mac(2) => Dpid(2), mac(7) => Dpid(3) };
        let eval = CostModel::new([mac(7)]).evaluate(&traffic, &placement, &weights());
        assert_eq!(eval.total_cost, 40.0);
        assert!(!eval.overall_cost.contains_key(&mac(9)));
        assert!(!eval.overall_cost.contains_key(&mac(7)));
    }

    #[test]
    fn ranking_is_descending() {
        let traffic = traffic_matrix(vec![
            (MacPair::new(mac(1), mac(2)), 10.0),
            (MacPair::new(mac(2), mac(3)), 30.0),
        ]);
        let placement = btreemap! { mac(1) => Dpid(1), mac(2) => Dpid(2), mac(3) => Dpid(3) };
        let eval = CostModel::default().evaluate(&traffic, &placement, &weights());
        let ranking: Vec<MacAddr> = eval.ranking().into_iter().map(|(m, _)| m).collect();
        assert_eq!(ranking, vec![mac(2), mac(3), mac(1)]);
    }
}
