#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_sdnmgmt::controller::Controller;
use rust_sdnmgmt::error::DatapathError;
use rust_sdnmgmt::mac::{Dpid, MacAddr};
use rust_sdnmgmt::ofp_controller::{Datapath, FlowMatch, OutPort, TopologyEventSink};
use rust_sdnmgmt::packet::{Arp, Nw, Packet};

pub const CONTROLLER_MAC: MacAddr = MacAddr([2, 2, 2, 2, 2, 2]);

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Install(u16, FlowMatch, OutPort),
    Delete(FlowMatch),
    Packet(Option<u16>, OutPort, Option<u32>),
    Stats,
}

/// Records everything the controller asks a switch to do.
pub struct FakeSwitch {
    pub dpid: Dpid,
    ops: Mutex<Vec<Op>>,
}

impl FakeSwitch {
    pub fn new(n: u64) -> Arc<FakeSwitch> {
        Arc::new(FakeSwitch {
            dpid: Dpid(n),
            ops: Mutex::new(vec![]),
        })
    }

    pub fn take(&self) -> Vec<Op> {
        std::mem::take(&mut *self.ops.lock())
    }

    pub fn installs(&self) -> Vec<FlowMatch> {
        self.take()
            .into_iter()
            .filter_map(|op| match op {
                Op::Install(_, m, _) => Some(m),
                _ => None,
            })
            .collect()
    }
}

impl Datapath for FakeSwitch {
    fn dpid(&self) -> Dpid {
        self.dpid
    }

    fn install_flow(&self, priority: u16, pattern: FlowMatch, out: OutPort) -> Result<(), DatapathError> {
        self.ops.lock().push(Op::Install(priority, pattern, out));
        Ok(())
    }

    fn delete_flow(&self, pattern: FlowMatch) -> Result<(), DatapathError> {
        self.ops.lock().push(Op::Delete(pattern));
        Ok(())
    }

    fn send_packet(
        &self,
        in_port: Option<u16>,
        out: OutPort,
        buffer_id: Option<u32>,
        _frame: &[u8],
    ) -> Result<(), DatapathError> {
        self.ops.lock().push(Op::Packet(in_port, out, buffer_id));
        Ok(())
    }

    fn request_flow_stats(&self) -> Result<(), DatapathError> {
        self.ops.lock().push(Op::Stats);
        Ok(())
    }
}

pub fn vm(n: u8) -> MacAddr {
    MacAddr([0x52, 0x54, 0, 0, 0, n])
}

pub fn hypervisor(n: u8) -> MacAddr {
    MacAddr([0x90, 0xb1, 0x1c, 0, 0, n])
}

pub fn ip(mac: MacAddr) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, mac.0[0] & 0x0f, mac.0[5])
}

pub fn arp_request(from: MacAddr, to: MacAddr) -> Vec<u8> {
    Packet::arp_request(from, ip(from), ip(to)).marshal()
}

pub fn arp_reply(from: MacAddr, to: MacAddr) -> Vec<u8> {
    Packet {
        dl_src: from,
        dl_dst: to,
        dl_vlan: None,
        nw: Nw::Arp(Arp::Reply {
            sha: from,
            spa: ip(from),
            tha: to,
            tpa: ip(to),
        }),
    }
    .marshal()
}

/// S1 - S2 - S3 in a line: port 2 leads to the next switch, port 1 to the previous one.
pub fn line(ctl: &Controller) -> Vec<Arc<FakeSwitch>> {
    let switches: Vec<Arc<FakeSwitch>> = (1..=3).map(FakeSwitch::new).collect();
    for sw in &switches {
        ctl.switch_connected(sw.dpid, sw.clone());
    }
    ctl.link_discovered(Dpid(1), 2, Dpid(2), 1);
    ctl.link_discovered(Dpid(2), 2, Dpid(3), 1);
    for sw in &switches {
        sw.take();
    }
    switches
}
