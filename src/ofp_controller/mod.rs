use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;

use crate::error::{DatapathError, OfpError};
use crate::mac::{Dpid, MacAddr};
use crate::ofp_message::OfpMessage;

pub mod openflow0x01;

/// The switch's own network stack, where its hypervisor's traffic enters.
pub const LOCAL_PORT: u16 = 0xfffe;
/// Ingress port of frames originated by the controller.
pub const CONTROLLER_PORT: u16 = 0xfffd;

/// OpenFlow Controller
///
/// Version-agnostic API for implementing an OpenFlow controller.
pub trait OfpController {
    /// OpenFlow message type supporting the same protocol version as the controller.
    type Message: OfpMessage;

    /// Send a message to the node associated with the given writer.
    fn send_message<W: Write>(xid: u32, msg: Self::Message, writer: &mut W) -> Result<(), OfpError> {
        let raw_msg = Self::Message::marshal(xid, msg);
        writer.write_all(&raw_msg)?;
        Ok(())
    }

    /// Perform handshake and begin loop reading incoming messages from client stream.
    fn handle_client_connected(&self, stream: TcpStream) -> Result<(), OfpError>;
}

/// Header fields a forwarding rule matches on. `None` fields are wildcarded.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    pub eth_type: Option<u16>,
    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
    pub in_port: Option<u16>,
}

impl FlowMatch {
    /// Match one direction of a MAC pair entering through `in_port`.
    pub fn pair(in_port: u16, eth_src: MacAddr, eth_dst: MacAddr) -> FlowMatch {
        FlowMatch {
            eth_type: None,
            eth_src: Some(eth_src),
            eth_dst: Some(eth_dst),
            in_port: Some(in_port),
        }
    }

    pub fn eth_type(eth_type: u16) -> FlowMatch {
        FlowMatch {
            eth_type: Some(eth_type),
            ..FlowMatch::default()
        }
    }
}

/// Where a rule or a packet-out sends traffic.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OutPort {
    Physical(u16),
    Flood,
    Controller,
    InPort,
}

/// One flow entry of a stats reply, reduced to what traffic aggregation needs.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FlowStatsEntry {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub byte_count: u64,
    pub duration_sec: u32,
    pub duration_nsec: u32,
}

impl FlowStatsEntry {
    /// Lifetime of the flow in seconds.
    pub fn duration(&self) -> f64 {
        self.duration_sec as f64 + self.duration_nsec as f64 / 1e9
    }
}

/// Output side of a switch session.
pub trait Datapath: Send + Sync {
    fn dpid(&self) -> Dpid;
    fn install_flow(&self, priority: u16, pattern: FlowMatch, out: OutPort) -> Result<(), DatapathError>;
    /// Delete every rule matching `pattern` exactly on the listed fields.
    fn delete_flow(&self, pattern: FlowMatch) -> Result<(), DatapathError>;
    /// Emit `frame` (or the switch-buffered packet `buffer_id`) through `out`.
    fn send_packet(
        &self,
        in_port: Option<u16>,
        out: OutPort,
        buffer_id: Option<u32>,
        frame: &[u8],
    ) -> Result<(), DatapathError>;
    fn request_flow_stats(&self) -> Result<(), DatapathError>;
}

/// Switch and link lifecycle events.
pub trait TopologyEventSink: Send + Sync {
    fn switch_connected(&self, dpid: Dpid, datapath: Arc<dyn Datapath>);
    /// The session `datapath` of `dpid` ended. A newer session may already serve `dpid`.
    fn switch_disconnected(&self, dpid: Dpid, datapath: &Arc<dyn Datapath>);
    fn link_discovered(&self, src_dpid: Dpid, src_port: u16, dst_dpid: Dpid, dst_port: u16);
    fn link_removed(&self, dpid: Dpid, port: u16);
}

/// Frames punted to the controller, LLDP excluded.
pub trait PacketSink: Send + Sync {
    fn packet_in(&self, dpid: Dpid, in_port: u16, frame: &[u8], buffer_id: Option<u32>);
}

/// Complete (all parts of a multipart reply) flow statistics of one switch.
pub trait StatsSink: Send + Sync {
    fn flow_stats_reply(&self, dpid: Dpid, entries: Vec<FlowStatsEntry>);
}

/// Everything a switch session reports to.
pub trait ControllerSink: TopologyEventSink + PacketSink + StatsSink {}

impl<T: TopologyEventSink + PacketSink + StatsSink> ControllerSink for T {}
