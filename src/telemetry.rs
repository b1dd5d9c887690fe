//! Traffic rates from flow counters.
//!
//! Every path installs one rule per direction at each hop, so a hypervisor switch reports two
//! entries per conversation. Their byte counters are summed and differenced against the
//! previous poll of the same switch to get a rate in bytes per second.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};
use serde::Serialize;

use crate::mac::Dpid;
use crate::ofp_controller::FlowStatsEntry;
use crate::topology::MacPair;

/// Last observation of a conversation.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct FlowSnapshot {
    pub delta_bytes: u64,
    pub delta_duration: f64,
    /// Bytes per second over the last interval.
    pub traffic_rate: f64,
    /// Switch whose counters this snapshot follows.
    pub dpid: Dpid,
    pub last_byte_count: u64,
    pub last_duration: f64,
}

/// What happened to the pairs of one stats reply.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSummary {
    pub updated: usize,
    /// Pairs with other than two entries.
    pub anomalies: usize,
    /// Pairs followed through another switch.
    pub foreign: usize,
    /// Pairs polled twice within the same duration tick.
    pub stalled: usize,
}

#[derive(Debug, Default)]
pub struct Telemetry {
    stats: HashMap<MacPair, FlowSnapshot>,
}

impl Telemetry {
    pub fn new() -> Self {
        Telemetry::default()
    }

    pub fn on_flow_stats_reply(&mut self, dpid: Dpid, entries: &[FlowStatsEntry]) -> StatsSummary {
        let mut grouped: BTreeMap<MacPair, Vec<&FlowStatsEntry>> = BTreeMap::new();
        for entry in entries {
            grouped
                .entry(MacPair::new(entry.eth_src, entry.eth_dst))
                .or_default()
                .push(entry);
        }

        let mut summary = StatsSummary::default();
        for (pair, flows) in grouped {
            if flows.len() != 2 {
                warn!(
                    "{} reported {} flows for {}, expected one per direction",
                    dpid,
                    flows.len(),
                    pair
                );
                summary.anomalies += 1;
                continue;
            }
            let byte_count = flows[0].byte_count.wrapping_add(flows[1].byte_count);
            let duration = flows[0].duration();

            let (last_byte_count, last_duration) = match self.stats.get(&pair) {
                Some(prev) if prev.dpid != dpid => {
                    debug!("{} is not responsible for {}, {} is", dpid, pair, prev.dpid);
                    summary.foreign += 1;
                    continue;
                }
                // the rules were reinstalled since the last poll
                Some(prev) if duration < prev.last_duration => (0, 0.0),
                Some(prev) => (prev.last_byte_count, prev.last_duration),
                None => (0, 0.0),
            };

            let delta_duration = duration - last_duration;
            if delta_duration <= 0.0 {
                debug!("no time elapsed for {} on {}", pair, dpid);
                summary.stalled += 1;
                continue;
            }
            // counters are 64 bits wide and wrap
            let delta_bytes = byte_count.wrapping_sub(last_byte_count);
            self.stats.insert(
                pair,
                FlowSnapshot {
                    delta_bytes,
                    delta_duration,
                    traffic_rate: delta_bytes as f64 / delta_duration,
                    dpid,
                    last_byte_count: byte_count,
                    last_duration: duration,
                },
            );
            summary.updated += 1;
        }
        summary
    }

    pub fn snapshot(&self, pair: &MacPair) -> Option<&FlowSnapshot> {
        self.stats.get(pair)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = (&MacPair, &FlowSnapshot)> {
        self.stats.iter()
    }

    /// Current rate of every conversation.
    pub fn rates(&self) -> Vec<(MacPair, f64)> {
        let mut rates: Vec<(MacPair, f64)> = self
            .stats
            .iter()
            .map(|(pair, snap)| (*pair, snap.traffic_rate))
            .collect();
        rates.sort_by(|a, b| a.0.cmp(&b.0));
        rates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::MacAddr;

    fn mac(n: u8) -> MacAddr {
        MacAddr([0x52, 0x54, 0, 0, 0, n])
    }

    fn entry(src: u8, dst: u8, byte_count: u64, duration_sec: u32) -> FlowStatsEntry {
        FlowStatsEntry {
            eth_src: mac(src),
            eth_dst: mac(dst),
            byte_count,
            duration_sec,
            duration_nsec: 0,
        }
    }

    fn pair() -> MacPair {
        MacPair::new(mac(1), mac(2))
    }

    #[test]
    fn rate_over_successive_polls() {
        let mut tele = Telemetry::new();
        let first = tele.on_flow_stats_reply(Dpid(1), &[entry(1, 2, 100, 10), entry(2, 1, 150, 10)]);
        assert_eq!(first.updated, 1);
        let snap = *tele.snapshot(&pair()).unwrap();
        assert_eq!(snap.last_byte_count, 250);
        assert_eq!(snap.traffic_rate, 25.0);

        tele.on_flow_stats_reply(Dpid(1), &[entry(1, 2, 140, 14), entry(2, 1, 210, 14)]);
        let snap = *tele.snapshot(&pair()).unwrap();
        assert_eq!(snap.delta_bytes, 100);
        assert_eq!(snap.delta_duration, 4.0);
        assert_eq!(snap.traffic_rate, 25.0);
        assert_eq!(tele.rates(), vec![(pair(), 25.0)]);
    }

    #[test]
    fn other_switch_is_skipped() {
        let mut tele = Telemetry::new();
        tele.on_flow_stats_reply(Dpid(1), &[entry(1, 2, 100, 10), entry(2, 1, 150, 10)]);
        let before = *tele.snapshot(&pair()).unwrap();
        let summary = tele.on_flow_stats_reply(Dpid(2), &[entry(1, 2, 900, 20), entry(2, 1, 900, 20)]);
        assert_eq!(summary.foreign, 1);
        assert_eq!(*tele.snapshot(&pair()).unwrap(), before);
    }

    #[test]
    fn odd_entry_counts_are_anomalies() {
        let mut tele = Telemetry::new();
        let summary = tele.on_flow_stats_reply(
            Dpid(1),
            &[
                entry(1, 2, 100, 10),
                entry(3, 4, 1, 10),
                entry(4, 3, 1, 10),
                entry(3, 4, 1, 10),
            ],
        );
        assert_eq!(summary.anomalies, 2);
        assert_eq!(summary.updated, 0);
        assert!(tele.snapshot(&pair()).is_none());
    }

    #[test]
    fn same_tick_poll_is_skipped() {
        let mut tele = Telemetry::new();
        tele.on_flow_stats_reply(Dpid(1), &[entry(1, 2, 100, 10), entry(2, 1, 150, 10)]);
        let summary = tele.on_flow_stats_reply(Dpid(1), &[entry(1, 2, 120, 10), entry(2, 1, 150, 10)]);
        assert_eq!(summary.stalled, 1);
        assert_eq!(tele.snapshot(&pair()).unwrap().last_byte_count, 250);
        // a brand new flow has no elapsed time yet
        let summary = tele.on_flow_stats_reply(Dpid(1), &[entry(5, 6, 0, 0), entry(6, 5, 0, 0)]);
        assert_eq!(summary.stalled, 1);
    }

    #[test]
    fn reinstalled_flow_restarts_from_zero() {
        let mut tele = Telemetry::new();
        tele.on_flow_stats_reply(Dpid(1), &[entry(1, 2, 1000, 100), entry(2, 1, 1000, 100)]);
        tele.on_flow_stats_reply(Dpid(1), &[entry(1, 2, 30, 2), entry(2, 1, 10, 2)]);
        let snap = tele.snapshot(&pair()).unwrap();
        assert_eq!(snap.delta_bytes, 40);
        assert_eq!(snap.traffic_rate, 20.0);
    }

    #[test]
    fn wrapped_counter_gives_a_positive_delta() {
        let mut tele = Telemetry::new();
        tele.on_flow_stats_reply(Dpid(1), &[entry(1, 2, u64::MAX - 9, 10), entry(2, 1, 0, 10)]);
        tele.on_flow_stats_reply(Dpid(1), &[entry(1, 2, 10, 20), entry(2, 1, 0, 20)]);
        let snap = tele.snapshot(&pair()).unwrap();
        assert_eq!(snap.delta_bytes, 20);
        assert_eq!(snap.traffic_rate, 2.0);
    }
}
