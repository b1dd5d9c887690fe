//! OpenFlow 1.0 switch sessions.
//!
//! One session runs per accepted TCP connection. It performs the handshake, answers echo
//! requests, reassembles multipart flow statistics and discovers inter-switch links by sending
//! LLDP probes out of every physical port. Everything it learns is reported to a
//! [`ControllerSink`]; everything the core wants to emit goes through the [`OfpSwitch`] handle.

use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::{ControllerSink, Datapath, FlowMatch, FlowStatsEntry, OfpController, OutPort};
use crate::error::{DatapathError, OfpError};
use crate::mac::Dpid;
use crate::ofp_header::OfpHeader;
use crate::ofp_message::OfpMessage;
use crate::openflow0x01::message::{add_flow, delete_flow, flow_stats_request, parse_payload, Message};
use crate::openflow0x01::{
    Action, FlowStats, OfpPort, PacketIn, PacketOut, Pattern, Payload, PortDesc, PortReason,
    PseudoPort, StatsResp, StatsRespBody,
};
use crate::packet::Nw;

/// Output port used for frames sent to the controller: the whole frame.
const CONTROLLER_MAX_LEN: u16 = 0xffff;

fn pattern_of(m: FlowMatch) -> Pattern {
    Pattern {
        dl_src: m.eth_src,
        dl_dst: m.eth_dst,
        dl_typ: m.eth_type,
        in_port: m.in_port,
    }
}

fn action_of(out: OutPort) -> Action {
    Action::Output(match out {
        OutPort::Physical(port) => PseudoPort::PhysicalPort(port),
        OutPort::Flood => PseudoPort::Flood,
        OutPort::Controller => PseudoPort::Controller(CONTROLLER_MAX_LEN),
        OutPort::InPort => PseudoPort::InPort,
    })
}

fn entry_of(fs: &FlowStats) -> Option<FlowStatsEntry> {
    Some(FlowStatsEntry {
        eth_src: fs.pattern.dl_src?,
        eth_dst: fs.pattern.dl_dst?,
        byte_count: fs.byte_count,
        duration_sec: fs.duration_sec,
        duration_nsec: fs.duration_nsec,
    })
}

/// Write handle of a connected switch.
pub struct OfpSwitch {
    dpid: Dpid,
    stream: Mutex<TcpStream>,
    xid: AtomicU32,
    connected: AtomicBool,
}

impl OfpSwitch {
    fn new(dpid: Dpid, stream: TcpStream) -> OfpSwitch {
        OfpSwitch {
            dpid,
            stream: Mutex::new(stream),
            xid: AtomicU32::new(1),
            connected: AtomicBool::new(true),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, msg: Message) -> Result<(), DatapathError> {
        if !self.is_connected() {
            return Err(DatapathError::Disconnected(self.dpid));
        }
        let xid = self.xid.fetch_add(1, Ordering::Relaxed);
        self.send_xid(xid, msg)
    }

    fn send_xid(&self, xid: u32, msg: Message) -> Result<(), DatapathError> {
        let raw_msg = Message::marshal(xid, msg);
        self.stream.lock().write_all(&raw_msg)?;
        Ok(())
    }

    fn send_lldp_probes(&self, ports: &[PortDesc]) -> Result<(), DatapathError> {
        for port in ports {
            let probe = crate::packet::Packet::lldp_probe(self.dpid, port.port_no, port.hw_addr);
            self.send(Message::PacketOut(PacketOut {
                output_payload: Payload::NotBuffered(probe.marshal()),
                port_id: None,
                apply_actions: vec![Action::Output(PseudoPort::PhysicalPort(port.port_no))],
            }))?;
        }
        Ok(())
    }
}

impl Datapath for OfpSwitch {
    fn dpid(&self) -> Dpid {
        self.dpid
    }

    fn install_flow(&self, priority: u16, pattern: FlowMatch, out: OutPort) -> Result<(), DatapathError> {
        self.send(Message::FlowMod(add_flow(
            priority,
            pattern_of(pattern),
            vec![action_of(out)],
        )))
    }

    fn delete_flow(&self, pattern: FlowMatch) -> Result<(), DatapathError> {
        self.send(Message::FlowMod(delete_flow(pattern_of(pattern))))
    }

    fn send_packet(
        &self,
        in_port: Option<u16>,
        out: OutPort,
        buffer_id: Option<u32>,
        frame: &[u8],
    ) -> Result<(), DatapathError> {
        let output_payload = match buffer_id {
            Some(id) => Payload::Buffered(id, vec![]),
            None => Payload::NotBuffered(frame.to_vec()),
        };
        self.send(Message::PacketOut(PacketOut {
            output_payload,
            port_id: in_port,
            apply_actions: vec![action_of(out)],
        }))
    }

    fn request_flow_stats(&self) -> Result<(), DatapathError> {
        self.send(Message::StatsRequest(flow_stats_request()))
    }
}

/// Per-connection state of the read loop.
#[derive(Default)]
struct Session {
    switch: Option<Arc<OfpSwitch>>,
    pending_stats: Vec<FlowStatsEntry>,
}

/// OpenFlow 1.0 controller driving a [`ControllerSink`].
pub struct OF0x01Controller<S> {
    sink: Arc<S>,
    lldp_interval: Duration,
}

impl<S> Clone for OF0x01Controller<S> {
    fn clone(&self) -> Self {
        OF0x01Controller {
            sink: self.sink.clone(),
            lldp_interval: self.lldp_interval,
        }
    }
}

impl<S: ControllerSink + 'static> OF0x01Controller<S> {
    pub fn new(sink: Arc<S>, lldp_interval: Duration) -> Self {
        OF0x01Controller {
            sink,
            lldp_interval,
        }
    }

    fn read_loop(&self, stream: &mut TcpStream, session: &mut Session) -> Result<(), OfpError> {
        let mut buf = [0u8; 8];
        loop {
            match stream.read_exact(&mut buf) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return match session.switch {
                        Some(_) => Ok(()),
                        None => Err(OfpError::Handshake),
                    };
                }
                Err(e) => return Err(e.into()),
            }
            let header = OfpHeader::parse(buf)?;
            let mut body = vec![0; header.length() - OfpHeader::size()];
            stream.read_exact(&mut body)?;
            let (xid, msg) = match Message::parse(&header, &body) {
                Ok(parsed) => parsed,
                Err(OfpError::Version(v)) => return Err(OfpError::Version(v)),
                Err(e) => {
                    warn!("dropping malformed message: {}", e);
                    continue;
                }
            };
            self.dispatch(stream, session, xid, msg)?;
        }
    }

    fn dispatch(
        &self,
        stream: &mut TcpStream,
        session: &mut Session,
        xid: u32,
        msg: Message,
    ) -> Result<(), OfpError> {
        match msg {
            Message::Hello => debug!("hello received"),
            Message::EchoRequest(payload) => match session.switch {
                // writes share the handle's lock once the switch is up
                Some(ref switch) => {
                    if let Err(e) = switch.send_xid(xid, Message::EchoReply(payload)) {
                        warn!("cannot answer echo of {}: {}", switch.dpid, e);
                    }
                }
                None => Self::send_message(xid, Message::EchoReply(payload), stream)?,
            },
            Message::FeaturesReply(feats) => {
                let switch = Arc::new(OfpSwitch::new(feats.datapath_id, stream.try_clone()?));
                let ports: Vec<PortDesc> = feats
                    .ports
                    .into_iter()
                    .filter(|p| p.port_no < OfpPort::OFPPMax as u16)
                    .collect();
                info!(
                    "switch {} connected with {} physical ports",
                    switch.dpid,
                    ports.len()
                );
                self.sink.switch_connected(switch.dpid, switch.clone());
                if let Err(e) = switch.send_lldp_probes(&ports) {
                    warn!("cannot probe links of {}: {}", switch.dpid, e);
                }
                self.spawn_prober(switch.clone(), ports);
                session.switch = Some(switch);
            }
            Message::PacketIn(pkt) => match session.switch {
                Some(ref switch) => self.packet_in(switch.dpid, pkt),
                None => debug!("packet-in before features reply, dropped"),
            },
            Message::StatsReply(resp) => match session.switch {
                Some(ref switch) => {
                    let dpid = switch.dpid;
                    self.stats_reply(dpid, &mut session.pending_stats, resp)
                }
                None => debug!("stats reply before features reply, dropped"),
            },
            Message::PortStatus(sts) => {
                if let Some(ref switch) = session.switch {
                    let gone = sts.reason == PortReason::PortDelete || sts.desc.down;
                    if gone {
                        self.sink.link_removed(switch.dpid, sts.desc.port_no);
                    }
                }
            }
            Message::Error(err) => warn!(
                "switch reported error type {} code {} for xid {}",
                err.typ, err.code, xid
            ),
            other => debug!("ignoring {:?}", other),
        }
        Ok(())
    }

    fn packet_in(&self, dpid: Dpid, pkt: PacketIn) {
        match parse_payload(&pkt.input_payload) {
            Ok(frame) => match frame.nw {
                Nw::Lldp(lldp) => {
                    debug!("{}:{} sees {}:{}", dpid, pkt.port, lldp.dpid, lldp.port);
                    self.sink.link_discovered(lldp.dpid, lldp.port, dpid, pkt.port);
                    return;
                }
                _ if frame.is_lldp() => return,
                _ => {}
            },
            Err(e) => debug!("unparsable packet-in on {}: {}", dpid, e),
        }
        self.sink.packet_in(
            dpid,
            pkt.port,
            pkt.input_payload.bytes(),
            pkt.input_payload.buffer_id(),
        );
    }

    fn stats_reply(&self, dpid: Dpid, pending: &mut Vec<FlowStatsEntry>, resp: StatsResp) {
        let more = resp.more();
        if let StatsRespBody::FlowStatsBody { ref flow_stats } = resp.body {
            pending.extend(flow_stats.iter().filter_map(entry_of));
        }
        if !more {
            self.sink.flow_stats_reply(dpid, mem::take(pending));
        }
    }

    fn spawn_prober(&self, switch: Arc<OfpSwitch>, ports: Vec<PortDesc>) {
        let interval = self.lldp_interval;
        let spawned = thread::Builder::new()
            .name(format!("lldp-{}", switch.dpid))
            .spawn(move || loop {
                thread::sleep(interval);
                if !switch.is_connected() {
                    break;
                }
                if let Err(e) = switch.send_lldp_probes(&ports) {
                    debug!("stopping link probes of {}: {}", switch.dpid, e);
                    break;
                }
            });
        if let Err(e) = spawned {
            warn!("cannot start link prober: {}", e);
        }
    }
}

impl<S: ControllerSink + 'static> OfpController for OF0x01Controller<S> {
    type Message = Message;

    fn handle_client_connected(&self, mut stream: TcpStream) -> Result<(), OfpError> {
        Self::send_message(0, Message::Hello, &mut stream)?;
        Self::send_message(0, Message::FeaturesReq, &mut stream)?;
        let mut session = Session::default();
        let result = self.read_loop(&mut stream, &mut session);
        if let Some(switch) = session.switch {
            switch.connected.store(false, Ordering::Release);
            info!("switch {} disconnected", switch.dpid);
            let datapath: Arc<dyn Datapath> = switch.clone();
            self.sink.switch_disconnected(switch.dpid, &datapath);
        }
        result
    }
}
