use std::io::{BufRead, Cursor, Read};
use std::mem::size_of;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::OfpError;
use crate::mac::{Dpid, MacAddr};

pub const OFP_VERSION: u8 = 0x01;

/// OpenFlow 1.0 message type codes, used by headers to identify meaning of the rest of a message.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MsgCode {
    Hello,
    Error,
    EchoReq,
    EchoResp,
    Vendor,
    FeaturesReq,
    FeaturesResp,
    GetConfigReq,
    GetConfigResp,
    SetConfig,
    PacketIn,
    FlowRemoved,
    PortStatus,
    PacketOut,
    FlowMod,
    PortMod,
    StatsReq,
    StatsResp,
    BarrierReq,
    BarrierResp,
    QueueGetConfigReq,
    QueueGetConfigResp,
}

impl TryFrom<u8> for MsgCode {
    type Error = OfpError;

    fn try_from(code: u8) -> Result<Self, OfpError> {
        use MsgCode::*;
        const CODES: [MsgCode; 22] = [
            Hello,
            Error,
            EchoReq,
            EchoResp,
            Vendor,
            FeaturesReq,
            FeaturesResp,
            GetConfigReq,
            GetConfigResp,
            SetConfig,
            PacketIn,
            FlowRemoved,
            PortStatus,
            PacketOut,
            FlowMod,
            PortMod,
            StatsReq,
            StatsResp,
            BarrierReq,
            BarrierResp,
            QueueGetConfigReq,
            QueueGetConfigResp,
        ];
        CODES
            .get(code as usize)
            .copied()
            .ok_or(OfpError::UnknownType(code))
    }
}

/// Common API for message types implementing OpenFlow Message Codes (see `MsgCode` enum).
pub trait MessageType: Sized {
    /// Return the byte-size of a message.
    fn size_of(msg: &Self) -> usize;
    /// Parse a buffer into a message.
    fn parse(buf: &[u8]) -> Result<Self, OfpError>;
    /// Marshal a message into a `u8` buffer.
    fn marshal(msg: Self, bytes: &mut Vec<u8>);
}

fn test_bit(bit: u64, x: u64) -> bool {
    (x >> bit) & 1 == 1
}

fn read_mac(bytes: &mut Cursor<Vec<u8>>) -> Result<MacAddr, OfpError> {
    let mut arr = [0; 6];
    bytes.read_exact(&mut arr)?;
    Ok(MacAddr(arr))
}

fn rest(bytes: Cursor<Vec<u8>>) -> Vec<u8> {
    let pos = bytes.position() as usize;
    let mut buf = bytes.into_inner();
    buf.split_off(pos.min(buf.len()))
}

/// Wildcard bits of `ofp_match`.
mod wildcards {
    pub const IN_PORT: u32 = 1 << 0;
    pub const DL_SRC: u32 = 1 << 2;
    pub const DL_DST: u32 = 1 << 3;
    pub const DL_TYPE: u32 = 1 << 4;
    pub const ALL: u32 = (1 << 22) - 1;
}

/// Fields to match against flows. Fields set to `None` are wildcarded.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Pattern {
    pub dl_src: Option<MacAddr>,
    pub dl_dst: Option<MacAddr>,
    pub dl_typ: Option<u16>,
    pub in_port: Option<u16>,
}

#[repr(packed)]
struct OfpMatch(u32, u16, [u8; 6], [u8; 6], u16, u8, u8, u16, u8, u8, u16, u32, u32, u16, u16);

impl Pattern {
    pub fn match_all() -> Pattern {
        Pattern::default()
    }

    fn wildcards_of(p: &Pattern) -> u32 {
        let mut w = wildcards::ALL;
        if p.in_port.is_some() {
            w &= !wildcards::IN_PORT;
        }
        if p.dl_src.is_some() {
            w &= !wildcards::DL_SRC;
        }
        if p.dl_dst.is_some() {
            w &= !wildcards::DL_DST;
        }
        if p.dl_typ.is_some() {
            w &= !wildcards::DL_TYPE;
        }
        w
    }

    fn size_of() -> usize {
        size_of::<OfpMatch>()
    }

    fn marshal(p: Pattern, bytes: &mut Vec<u8>) {
        bytes.write_u32::<BigEndian>(Self::wildcards_of(&p)).unwrap();
        bytes.write_u16::<BigEndian>(p.in_port.unwrap_or(0)).unwrap();
        bytes.extend_from_slice(&p.dl_src.unwrap_or_default().octets());
        bytes.extend_from_slice(&p.dl_dst.unwrap_or_default().octets());
        // dl_vlan, dl_vlan_pcp, pad
        bytes.extend_from_slice(&[0; 4]);
        bytes.write_u16::<BigEndian>(p.dl_typ.unwrap_or(0)).unwrap();
        // nw_tos, nw_proto, pad, nw_src, nw_dst, tp_src, tp_dst
        bytes.extend_from_slice(&[0; 16]);
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Result<Pattern, OfpError> {
        let w = bytes.read_u32::<BigEndian>()?;
        let in_port = bytes.read_u16::<BigEndian>()?;
        let dl_src = read_mac(bytes)?;
        let dl_dst = read_mac(bytes)?;
        bytes.consume(4);
        let dl_typ = bytes.read_u16::<BigEndian>()?;
        let mut tail = [0; 16];
        bytes.read_exact(&mut tail)?;
        let unless = |bit: u32| w & bit == 0;
        Ok(Pattern {
            dl_src: Some(dl_src).filter(|_| unless(wildcards::DL_SRC)),
            dl_dst: Some(dl_dst).filter(|_| unless(wildcards::DL_DST)),
            dl_typ: Some(dl_typ).filter(|_| unless(wildcards::DL_TYPE)),
            in_port: Some(in_port).filter(|_| unless(wildcards::IN_PORT)),
        })
    }
}

/// Port behavior.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PseudoPort {
    PhysicalPort(u16),
    InPort,
    Table,
    Normal,
    Flood,
    AllPorts,
    Controller(u16),
    Local,
}

#[repr(u16)]
pub enum OfpPort {
    OFPPMax = 0xff00,
    OFPPInPort = 0xfff8,
    OFPPTable = 0xfff9,
    OFPPNormal = 0xfffa,
    OFPPFlood = 0xfffb,
    OFPPAll = 0xfffc,
    OFPPController = 0xfffd,
    OFPPLocal = 0xfffe,
    OFPPNone = 0xffff,
}

impl PseudoPort {
    fn of_int(p: u16) -> Option<PseudoPort> {
        if (OfpPort::OFPPNone as u16) == p {
            None
        } else {
            Some(PseudoPort::make(p, 0))
        }
    }

    fn make(p: u16, len: u16) -> PseudoPort {
        match p {
            p if p == (OfpPort::OFPPInPort as u16) => PseudoPort::InPort,
            p if p == (OfpPort::OFPPTable as u16) => PseudoPort::Table,
            p if p == (OfpPort::OFPPNormal as u16) => PseudoPort::Normal,
            p if p == (OfpPort::OFPPFlood as u16) => PseudoPort::Flood,
            p if p == (OfpPort::OFPPAll as u16) => PseudoPort::AllPorts,
            p if p == (OfpPort::OFPPController as u16) => PseudoPort::Controller(len),
            p if p == (OfpPort::OFPPLocal as u16) => PseudoPort::Local,
            _ => PseudoPort::PhysicalPort(p),
        }
    }

    fn to_int(pp: PseudoPort) -> u16 {
        match pp {
            PseudoPort::PhysicalPort(p) => p,
            PseudoPort::InPort => OfpPort::OFPPInPort as u16,
            PseudoPort::Table => OfpPort::OFPPTable as u16,
            PseudoPort::Normal => OfpPort::OFPPNormal as u16,
            PseudoPort::Flood => OfpPort::OFPPFlood as u16,
            PseudoPort::AllPorts => OfpPort::OFPPAll as u16,
            PseudoPort::Controller(_) => OfpPort::OFPPController as u16,
            PseudoPort::Local => OfpPort::OFPPLocal as u16,
        }
    }

    fn marshal(pp: PseudoPort, bytes: &mut Vec<u8>) {
        bytes.write_u16::<BigEndian>(PseudoPort::to_int(pp)).unwrap()
    }

    fn marshal_opt(pp: Option<PseudoPort>, bytes: &mut Vec<u8>) {
        match pp {
            None => bytes.write_u16::<BigEndian>(OfpPort::OFPPNone as u16).unwrap(),
            Some(x) => PseudoPort::marshal(x, bytes),
        }
    }
}

/// Actions associated with flows and packets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Output(PseudoPort),
}

#[repr(packed)]
struct OfpActionOutput(u16, u16, u16, u16);

#[repr(u16)]
enum OfpActionType {
    OFPATOutput,
}

impl Action {
    fn type_code(a: &Action) -> OfpActionType {
        match *a {
            Action::Output(_) => OfpActionType::OFPATOutput,
        }
    }

    fn size_of(a: &Action) -> usize {
        match *a {
            Action::Output(_) => size_of::<OfpActionOutput>(),
        }
    }

    fn size_of_sequence(actions: &[Action]) -> usize {
        actions.iter().map(Action::size_of).sum()
    }

    /// Parse one action. Actions other than output are skipped and yield `None`.
    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Result<Option<Action>, OfpError> {
        let action_code = bytes.read_u16::<BigEndian>()?;
        let len = bytes.read_u16::<BigEndian>()? as usize;
        if len < 4 {
            return Err(OfpError::Length(len));
        }
        if action_code == OfpActionType::OFPATOutput as u16 {
            let port_code = bytes.read_u16::<BigEndian>()?;
            let max_len = bytes.read_u16::<BigEndian>()?;
            Ok(Some(Action::Output(PseudoPort::make(port_code, max_len))))
        } else {
            bytes.consume(len - 4);
            Ok(None)
        }
    }

    fn parse_sequence(bytes: &mut Cursor<Vec<u8>>, len: usize) -> Result<Vec<Action>, OfpError> {
        let end = bytes.position() as usize + len;
        let mut actions = vec![];
        while (bytes.position() as usize) < end {
            if let Some(action) = Action::parse(bytes)? {
                actions.push(action);
            }
        }
        Ok(actions)
    }

    fn move_controller_last(acts: Vec<Action>) -> Vec<Action> {
        let (mut to_ctrl, mut not_to_ctrl): (Vec<Action>, Vec<Action>) = acts
            .into_iter()
            .partition(|act| matches!(*act, Action::Output(PseudoPort::Controller(_))));
        not_to_ctrl.append(&mut to_ctrl);
        not_to_ctrl
    }

    fn marshal(act: Action, bytes: &mut Vec<u8>) {
        bytes.write_u16::<BigEndian>(Action::type_code(&act) as u16).unwrap();
        bytes.write_u16::<BigEndian>(Action::size_of(&act) as u16).unwrap();
        match act {
            Action::Output(pp) => {
                PseudoPort::marshal(pp, bytes);
                bytes
                    .write_u16::<BigEndian>(match pp {
                        PseudoPort::Controller(w) => w,
                        _ => 0,
                    })
                    .unwrap()
            }
        }
    }
}

/// How long before a flow entry expires.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timeout {
    Permanent,
    ExpiresAfter(u16),
}

impl Timeout {
    fn of_int(tm: u16) -> Timeout {
        match tm {
            0 => Timeout::Permanent,
            d => Timeout::ExpiresAfter(d),
        }
    }

    fn to_int(tm: Timeout) -> u16 {
        match tm {
            Timeout::Permanent => 0,
            Timeout::ExpiresAfter(d) => d,
        }
    }
}

/// Description of a physical port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortDesc {
    pub port_no: u16,
    pub hw_addr: MacAddr,
    pub name: String,
    pub down: bool,
}

#[repr(packed)]
struct OfpPhyPort(u16, [u8; 6], [u8; 16], u32, u32, u32, u32, u32, u32);

impl PortDesc {
    fn size_of() -> usize {
        size_of::<OfpPhyPort>()
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Result<PortDesc, OfpError> {
        let port_no = bytes.read_u16::<BigEndian>()?;
        let hw_addr = read_mac(bytes)?;
        let mut name = [0; 16];
        bytes.read_exact(&mut name)?;
        let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
        let config = bytes.read_u32::<BigEndian>()?;
        let state = bytes.read_u32::<BigEndian>()?;
        // curr, advertised, supported, peer
        let mut features = [0; 16];
        bytes.read_exact(&mut features)?;
        Ok(PortDesc {
            port_no,
            hw_addr,
            name: String::from_utf8_lossy(&name[..end]).into_owned(),
            down: test_bit(0, config as u64) || test_bit(0, state as u64),
        })
    }

    fn marshal(pd: &PortDesc, bytes: &mut Vec<u8>) {
        bytes.write_u16::<BigEndian>(pd.port_no).unwrap();
        bytes.extend_from_slice(&pd.hw_addr.octets());
        let mut name = [0; 16];
        for (dst, src) in name.iter_mut().zip(pd.name.bytes().take(15)) {
            *dst = src;
        }
        bytes.extend_from_slice(&name);
        bytes.write_u32::<BigEndian>(if pd.down { 1 } else { 0 }).unwrap();
        bytes.extend_from_slice(&[0; 20]);
    }
}

/// Switch features.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchFeatures {
    pub datapath_id: Dpid,
    pub num_buffers: u32,
    pub num_tables: u8,
    pub ports: Vec<PortDesc>,
}

#[repr(packed)]
struct OfpSwitchFeatures(u64, u32, u8, [u8; 3], u32, u32);

impl MessageType for SwitchFeatures {
    fn size_of(sf: &SwitchFeatures) -> usize {
        size_of::<OfpSwitchFeatures>() + sf.ports.len() * PortDesc::size_of()
    }

    fn parse(buf: &[u8]) -> Result<SwitchFeatures, OfpError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let datapath_id = Dpid(bytes.read_u64::<BigEndian>()?);
        let num_buffers = bytes.read_u32::<BigEndian>()?;
        let num_tables = bytes.read_u8()?;
        bytes.consume(3);
        // capabilities, supported actions
        bytes.consume(8);
        let num_ports = buf.len().saturating_sub(size_of::<OfpSwitchFeatures>()) / PortDesc::size_of();
        let mut ports = Vec::with_capacity(num_ports);
        for _ in 0..num_ports {
            ports.push(PortDesc::parse(&mut bytes)?);
        }
        Ok(SwitchFeatures {
            datapath_id,
            num_buffers,
            num_tables,
            ports,
        })
    }

    fn marshal(sf: SwitchFeatures, bytes: &mut Vec<u8>) {
        bytes.write_u64::<BigEndian>(sf.datapath_id.0).unwrap();
        bytes.write_u32::<BigEndian>(sf.num_buffers).unwrap();
        bytes.write_u8(sf.num_tables).unwrap();
        bytes.extend_from_slice(&[0; 11]);
        for pd in &sf.ports {
            PortDesc::marshal(pd, bytes);
        }
    }
}

/// Why a port status message was sent.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortReason {
    PortAdd,
    PortDelete,
    PortModify,
}

/// A port was added, removed, or modified on the datapath.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PortDesc,
}

impl MessageType for PortStatus {
    fn size_of(_: &PortStatus) -> usize {
        8 + PortDesc::size_of()
    }

    fn parse(buf: &[u8]) -> Result<PortStatus, OfpError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let reason = match bytes.read_u8()? {
            0 => PortReason::PortAdd,
            1 => PortReason::PortDelete,
            _ => PortReason::PortModify,
        };
        bytes.consume(7);
        let desc = PortDesc::parse(&mut bytes)?;
        Ok(PortStatus { reason, desc })
    }

    fn marshal(sts: PortStatus, bytes: &mut Vec<u8>) {
        bytes.write_u8(sts.reason as u8).unwrap();
        bytes.extend_from_slice(&[0; 7]);
        PortDesc::marshal(&sts.desc, bytes);
    }
}

/// Type of modification to perform on a flow table.
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlowModCmd {
    AddFlow,
    ModFlow,
    ModStrictFlow,
    DeleteFlow,
    DeleteStrictFlow,
}

impl FlowModCmd {
    fn of_int(cmd: u16) -> Result<FlowModCmd, OfpError> {
        match cmd {
            0 => Ok(FlowModCmd::AddFlow),
            1 => Ok(FlowModCmd::ModFlow),
            2 => Ok(FlowModCmd::ModStrictFlow),
            3 => Ok(FlowModCmd::DeleteFlow),
            4 => Ok(FlowModCmd::DeleteStrictFlow),
            _ => Err(OfpError::Truncated("flow mod command")),
        }
    }
}

/// Represents modifications to a flow table from the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowMod {
    pub command: FlowModCmd,
    pub pattern: Pattern,
    pub priority: u16,
    pub actions: Vec<Action>,
    pub cookie: u64,
    pub idle_timeout: Timeout,
    pub hard_timeout: Timeout,
    pub notify_when_removed: bool,
    pub apply_to_packet: Option<u32>,
    pub out_port: Option<PseudoPort>,
    pub check_overlap: bool,
}

#[repr(packed)]
struct OfpFlowMod(u64, u16, u16, u16, u16, u32, u16, u16);

impl FlowMod {
    fn flags_to_int(check_overlap: bool, notify_when_removed: bool) -> u16 {
        (if check_overlap { 1 << 1 } else { 0 }) | (if notify_when_removed { 1 << 0 } else { 0 })
    }

    fn check_overlap_of_flags(flags: u16) -> bool {
        2 & flags != 0
    }

    fn notify_when_removed_of_flags(flags: u16) -> bool {
        1 & flags != 0
    }
}

impl MessageType for FlowMod {
    fn size_of(msg: &FlowMod) -> usize {
        Pattern::size_of() + size_of::<OfpFlowMod>() + Action::size_of_sequence(&msg.actions)
    }

    fn parse(buf: &[u8]) -> Result<FlowMod, OfpError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let pattern = Pattern::parse(&mut bytes)?;
        let cookie = bytes.read_u64::<BigEndian>()?;
        let command = FlowModCmd::of_int(bytes.read_u16::<BigEndian>()?)?;
        let idle = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        let hard = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        let prio = bytes.read_u16::<BigEndian>()?;
        let buffer_id = bytes.read_i32::<BigEndian>()?;
        let out_port = PseudoPort::of_int(bytes.read_u16::<BigEndian>()?);
        let flags = bytes.read_u16::<BigEndian>()?;
        let actions_len = buf.len().saturating_sub(bytes.position() as usize);
        let actions = Action::parse_sequence(&mut bytes, actions_len)?;
        Ok(FlowMod {
            command,
            pattern,
            priority: prio,
            actions,
            cookie,
            idle_timeout: idle,
            hard_timeout: hard,
            notify_when_removed: FlowMod::notify_when_removed_of_flags(flags),
            apply_to_packet: match buffer_id {
                -1 => None,
                n => Some(n as u32),
            },
            out_port,
            check_overlap: FlowMod::check_overlap_of_flags(flags),
        })
    }

    fn marshal(fm: FlowMod, bytes: &mut Vec<u8>) {
        Pattern::marshal(fm.pattern, bytes);
        bytes.write_u64::<BigEndian>(fm.cookie).unwrap();
        bytes.write_u16::<BigEndian>(fm.command as u16).unwrap();
        bytes.write_u16::<BigEndian>(Timeout::to_int(fm.idle_timeout)).unwrap();
        bytes.write_u16::<BigEndian>(Timeout::to_int(fm.hard_timeout)).unwrap();
        bytes.write_u16::<BigEndian>(fm.priority).unwrap();
        bytes
            .write_i32::<BigEndian>(match fm.apply_to_packet {
                None => -1,
                Some(buf_id) => buf_id as i32,
            })
            .unwrap();
        PseudoPort::marshal_opt(fm.out_port, bytes);
        bytes
            .write_u16::<BigEndian>(FlowMod::flags_to_int(fm.check_overlap, fm.notify_when_removed))
            .unwrap();
        for act in Action::move_controller_last(fm.actions) {
            Action::marshal(act, bytes)
        }
    }
}

/// The data associated with a packet received by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Buffered(u32, Vec<u8>),
    NotBuffered(Vec<u8>),
}

impl Payload {
    pub fn size_of(payload: &Payload) -> usize {
        match *payload {
            Payload::Buffered(_, ref buf) | Payload::NotBuffered(ref buf) => buf.len(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match *self {
            Payload::Buffered(_, ref buf) | Payload::NotBuffered(ref buf) => buf,
        }
    }

    pub fn buffer_id(&self) -> Option<u32> {
        match *self {
            Payload::Buffered(id, _) => Some(id),
            Payload::NotBuffered(_) => None,
        }
    }
}

/// The reason a packet arrives at the controller.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketInReason {
    NoMatch,
    ExplicitSend,
}

/// Represents packets received by the datapath and sent to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketIn {
    pub input_payload: Payload,
    pub total_len: u16,
    pub port: u16,
    pub reason: PacketInReason,
}

#[repr(packed)]
struct OfpPacketIn(i32, u16, u16, u8, u8);

impl MessageType for PacketIn {
    fn size_of(pi: &PacketIn) -> usize {
        size_of::<OfpPacketIn>() + Payload::size_of(&pi.input_payload)
    }

    fn parse(buf: &[u8]) -> Result<PacketIn, OfpError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let buf_id = match bytes.read_i32::<BigEndian>()? {
            -1 => None,
            n => Some(n as u32),
        };
        let total_len = bytes.read_u16::<BigEndian>()?;
        let port = bytes.read_u16::<BigEndian>()?;
        let reason = match bytes.read_u8()? {
            0 => PacketInReason::NoMatch,
            _ => PacketInReason::ExplicitSend,
        };
        bytes.consume(1);
        let pk = rest(bytes);
        let payload = match buf_id {
            None => Payload::NotBuffered(pk),
            Some(n) => Payload::Buffered(n, pk),
        };
        Ok(PacketIn {
            input_payload: payload,
            total_len,
            port,
            reason,
        })
    }

    fn marshal(pi: PacketIn, bytes: &mut Vec<u8>) {
        bytes
            .write_i32::<BigEndian>(match pi.input_payload.buffer_id() {
                None => -1,
                Some(n) => n as i32,
            })
            .unwrap();
        bytes.write_u16::<BigEndian>(pi.total_len).unwrap();
        bytes.write_u16::<BigEndian>(pi.port).unwrap();
        bytes.write_u8(pi.reason as u8).unwrap();
        bytes.write_u8(0).unwrap();
        bytes.extend_from_slice(pi.input_payload.bytes());
    }
}

/// Represents packets sent from the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketOut {
    pub output_payload: Payload,
    pub port_id: Option<u16>,
    pub apply_actions: Vec<Action>,
}

#[repr(packed)]
struct OfpPacketOut(u32, u16, u16);

impl MessageType for PacketOut {
    fn size_of(po: &PacketOut) -> usize {
        let data = match po.output_payload {
            Payload::Buffered(..) => 0,
            Payload::NotBuffered(ref buf) => buf.len(),
        };
        size_of::<OfpPacketOut>() + Action::size_of_sequence(&po.apply_actions) + data
    }

    fn parse(buf: &[u8]) -> Result<PacketOut, OfpError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let buf_id = bytes.read_i32::<BigEndian>()?;
        let port_id = match bytes.read_u16::<BigEndian>()? {
            p if p == OfpPort::OFPPNone as u16 => None,
            p => Some(p),
        };
        let actions_len = bytes.read_u16::<BigEndian>()? as usize;
        let apply_actions = Action::parse_sequence(&mut bytes, actions_len)?;
        let data = rest(bytes);
        let output_payload = match buf_id {
            -1 => Payload::NotBuffered(data),
            n => Payload::Buffered(n as u32, data),
        };
        Ok(PacketOut {
            output_payload,
            port_id,
            apply_actions,
        })
    }

    fn marshal(po: PacketOut, bytes: &mut Vec<u8>) {
        bytes
            .write_i32::<BigEndian>(match po.output_payload.buffer_id() {
                None => -1,
                Some(n) => n as i32,
            })
            .unwrap();
        bytes
            .write_u16::<BigEndian>(po.port_id.unwrap_or(OfpPort::OFPPNone as u16))
            .unwrap();
        bytes
            .write_u16::<BigEndian>(Action::size_of_sequence(&po.apply_actions) as u16)
            .unwrap();
        for act in Action::move_controller_last(po.apply_actions) {
            Action::marshal(act, bytes);
        }
        // a buffered packet is released by id, its bytes are not sent back
        if let Payload::NotBuffered(data) = po.output_payload {
            bytes.extend_from_slice(&data);
        }
    }
}

/// Type of stats request.
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatsReqType {
    Desc,
    Flow,
    Aggregate,
    Table,
    Port,
    Queue,
    Vendor = 0xffff,
}

/// Represents a flow stats request from the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsReq {
    pub req_type: StatsReqType,
    pub flags: u16,
    pub pattern: Pattern,
    pub table_id: u8,
    pub out_port: Option<PseudoPort>,
}

#[repr(packed)]
struct OfpFlowStatsRequest(u16, u16, [u8; 40], u8, u8, u16);

impl MessageType for StatsReq {
    fn size_of(_: &StatsReq) -> usize {
        size_of::<OfpFlowStatsRequest>()
    }

    fn parse(buf: &[u8]) -> Result<StatsReq, OfpError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let req_type = match bytes.read_u16::<BigEndian>()? {
            1 => StatsReqType::Flow,
            _ => return Err(OfpError::Truncated("flow stats request")),
        };
        let flags = bytes.read_u16::<BigEndian>()?;
        let pattern = Pattern::parse(&mut bytes)?;
        let table_id = bytes.read_u8()?;
        bytes.consume(1);
        let out_port = PseudoPort::of_int(bytes.read_u16::<BigEndian>()?);
        Ok(StatsReq {
            req_type,
            flags,
            pattern,
            table_id,
            out_port,
        })
    }

    fn marshal(sr: StatsReq, bytes: &mut Vec<u8>) {
        bytes.write_u16::<BigEndian>(sr.req_type as u16).unwrap();
        bytes.write_u16::<BigEndian>(sr.flags).unwrap();
        Pattern::marshal(sr.pattern, bytes);
        bytes.write_u8(sr.table_id).unwrap();
        bytes.write_u8(0).unwrap();
        PseudoPort::marshal_opt(sr.out_port, bytes);
    }
}

/// One flow entry of a flow stats reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowStats {
    pub table_id: u8,
    pub pattern: Pattern,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub priority: u16,
    pub idle_timeout: Timeout,
    pub hard_timeout: Timeout,
    pub cookie: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub actions: Vec<Action>,
}

#[repr(packed)]
struct OfpFlowStats(u16, u8, u8, [u8; 40], u32, u32, u16, u16, u16, [u8; 6], u64, u64, u64);

impl FlowStats {
    fn size_of(fs: &FlowStats) -> usize {
        size_of::<OfpFlowStats>() + Action::size_of_sequence(&fs.actions)
    }

    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Result<FlowStats, OfpError> {
        let length = bytes.read_u16::<BigEndian>()? as usize;
        if length < size_of::<OfpFlowStats>() {
            return Err(OfpError::Length(length));
        }
        let table_id = bytes.read_u8()?;
        bytes.consume(1);
        let pattern = Pattern::parse(bytes)?;
        let duration_sec = bytes.read_u32::<BigEndian>()?;
        let duration_nsec = bytes.read_u32::<BigEndian>()?;
        let priority = bytes.read_u16::<BigEndian>()?;
        let idle_timeout = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        let hard_timeout = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        bytes.consume(6);
        let cookie = bytes.read_u64::<BigEndian>()?;
        let packet_count = bytes.read_u64::<BigEndian>()?;
        let byte_count = bytes.read_u64::<BigEndian>()?;
        let actions = Action::parse_sequence(bytes, length - size_of::<OfpFlowStats>())?;
        Ok(FlowStats {
            table_id,
            pattern,
            duration_sec,
            duration_nsec,
            priority,
            idle_timeout,
            hard_timeout,
            cookie,
            packet_count,
            byte_count,
            actions,
        })
    }

    fn marshal(fs: FlowStats, bytes: &mut Vec<u8>) {
        bytes.write_u16::<BigEndian>(FlowStats::size_of(&fs) as u16).unwrap();
        bytes.write_u8(fs.table_id).unwrap();
        bytes.write_u8(0).unwrap();
        Pattern::marshal(fs.pattern, bytes);
        bytes.write_u32::<BigEndian>(fs.duration_sec).unwrap();
        bytes.write_u32::<BigEndian>(fs.duration_nsec).unwrap();
        bytes.write_u16::<BigEndian>(fs.priority).unwrap();
        bytes.write_u16::<BigEndian>(Timeout::to_int(fs.idle_timeout)).unwrap();
        bytes.write_u16::<BigEndian>(Timeout::to_int(fs.hard_timeout)).unwrap();
        bytes.extend_from_slice(&[0; 6]);
        bytes.write_u64::<BigEndian>(fs.cookie).unwrap();
        bytes.write_u64::<BigEndian>(fs.packet_count).unwrap();
        bytes.write_u64::<BigEndian>(fs.byte_count).unwrap();
        for act in fs.actions {
            Action::marshal(act, bytes);
        }
    }
}

/// Body of a stats reply. Only flow stats are decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatsRespBody {
    FlowStatsBody { flow_stats: Vec<FlowStats> },
    Other(Vec<u8>),
}

/// Represents a stats reply from the datapath.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsResp {
    pub req_type: u16,
    pub flags: u16,
    pub body: StatsRespBody,
}

impl StatsResp {
    /// More replies follow for the same request.
    pub fn more(&self) -> bool {
        test_bit(0, self.flags as u64)
    }
}

impl MessageType for StatsResp {
    fn size_of(sr: &StatsResp) -> usize {
        4 + match sr.body {
            StatsRespBody::FlowStatsBody { ref flow_stats } => {
                flow_stats.iter().map(FlowStats::size_of).sum()
            }
            StatsRespBody::Other(ref buf) => buf.len(),
        }
    }

    fn parse(buf: &[u8]) -> Result<StatsResp, OfpError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let req_type = bytes.read_u16::<BigEndian>()?;
        let flags = bytes.read_u16::<BigEndian>()?;
        let body = if req_type == StatsReqType::Flow as u16 {
            let mut flow_stats = vec![];
            while (bytes.position() as usize) < buf.len() {
                flow_stats.push(FlowStats::parse(&mut bytes)?);
            }
            StatsRespBody::FlowStatsBody { flow_stats }
        } else {
            StatsRespBody::Other(rest(bytes))
        };
        Ok(StatsResp {
            req_type,
            flags,
            body,
        })
    }

    fn marshal(sr: StatsResp, bytes: &mut Vec<u8>) {
        bytes.write_u16::<BigEndian>(sr.req_type).unwrap();
        bytes.write_u16::<BigEndian>(sr.flags).unwrap();
        match sr.body {
            StatsRespBody::FlowStatsBody { flow_stats } => {
                for fs in flow_stats {
                    FlowStats::marshal(fs, bytes);
                }
            }
            StatsRespBody::Other(buf) => bytes.extend_from_slice(&buf),
        }
    }
}

/// Error message (datapath -> controller).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMsg {
    pub typ: u16,
    pub code: u16,
    pub data: Vec<u8>,
}

impl MessageType for ErrorMsg {
    fn size_of(err: &ErrorMsg) -> usize {
        4 + err.data.len()
    }

    fn parse(buf: &[u8]) -> Result<ErrorMsg, OfpError> {
        let mut bytes = Cursor::new(buf.to_vec());
        let typ = bytes.read_u16::<BigEndian>()?;
        let code = bytes.read_u16::<BigEndian>()?;
        Ok(ErrorMsg {
            typ,
            code,
            data: rest(bytes),
        })
    }

    fn marshal(err: ErrorMsg, bytes: &mut Vec<u8>) {
        bytes.write_u16::<BigEndian>(err.typ).unwrap();
        bytes.write_u16::<BigEndian>(err.code).unwrap();
        bytes.extend_from_slice(&err.data);
    }
}

/// Encapsulates handling of messages implementing `MessageType` trait.
pub mod message {
    use super::*;
    use crate::error::PacketError;
    use crate::ofp_header::OfpHeader;
    use crate::ofp_message::OfpMessage;
    use crate::packet::Packet;

    /// Abstractions of OpenFlow 1.0 messages mapping to message codes.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Message {
        Hello,
        Error(ErrorMsg),
        EchoRequest(Vec<u8>),
        EchoReply(Vec<u8>),
        FeaturesReq,
        FeaturesReply(SwitchFeatures),
        FlowMod(FlowMod),
        PacketIn(PacketIn),
        PacketOut(PacketOut),
        PortStatus(PortStatus),
        BarrierRequest,
        BarrierReply,
        StatsRequest(StatsReq),
        StatsReply(StatsResp),
        /// A message this controller does not interpret.
        Unhandled(MsgCode, Vec<u8>),
    }

    impl Message {
        /// Map `Message` to associated OpenFlow message type code `MsgCode`.
        fn msg_code_of_message(msg: &Message) -> MsgCode {
            match *msg {
                Message::Hello => MsgCode::Hello,
                Message::Error(_) => MsgCode::Error,
                Message::EchoRequest(_) => MsgCode::EchoReq,
                Message::EchoReply(_) => MsgCode::EchoResp,
                Message::FeaturesReq => MsgCode::FeaturesReq,
                Message::FeaturesReply(_) => MsgCode::FeaturesResp,
                Message::FlowMod(_) => MsgCode::FlowMod,
                Message::PacketIn(_) => MsgCode::PacketIn,
                Message::PacketOut(_) => MsgCode::PacketOut,
                Message::PortStatus(_) => MsgCode::PortStatus,
                Message::BarrierRequest => MsgCode::BarrierReq,
                Message::BarrierReply => MsgCode::BarrierResp,
                Message::StatsRequest(_) => MsgCode::StatsReq,
                Message::StatsReply(_) => MsgCode::StatsResp,
                Message::Unhandled(code, _) => code,
            }
        }

        /// Marshal the OpenFlow message `msg`.
        fn marshal_body(msg: Message, bytes: &mut Vec<u8>) {
            match msg {
                Message::Hello
                | Message::FeaturesReq
                | Message::BarrierRequest
                | Message::BarrierReply => (),
                Message::Error(err) => ErrorMsg::marshal(err, bytes),
                Message::EchoRequest(buf) | Message::EchoReply(buf) => {
                    bytes.extend_from_slice(&buf)
                }
                Message::FeaturesReply(sf) => SwitchFeatures::marshal(sf, bytes),
                Message::FlowMod(flow_mod) => FlowMod::marshal(flow_mod, bytes),
                Message::PacketIn(packet_in) => PacketIn::marshal(packet_in, bytes),
                Message::PacketOut(po) => PacketOut::marshal(po, bytes),
                Message::PortStatus(sts) => PortStatus::marshal(sts, bytes),
                Message::StatsRequest(sr) => StatsReq::marshal(sr, bytes),
                Message::StatsReply(sr) => StatsResp::marshal(sr, bytes),
                Message::Unhandled(_, buf) => bytes.extend_from_slice(&buf),
            }
        }
    }

    impl OfpMessage for Message {
        fn size_of(msg: &Message) -> usize {
            OfpHeader::size()
                + match *msg {
                    Message::Hello
                    | Message::FeaturesReq
                    | Message::BarrierRequest
                    | Message::BarrierReply => 0,
                    Message::Error(ref err) => ErrorMsg::size_of(err),
                    Message::EchoRequest(ref buf) | Message::EchoReply(ref buf) => buf.len(),
                    Message::FeaturesReply(ref sf) => SwitchFeatures::size_of(sf),
                    Message::FlowMod(ref flow_mod) => FlowMod::size_of(flow_mod),
                    Message::PacketIn(ref packet_in) => PacketIn::size_of(packet_in),
                    Message::PacketOut(ref po) => PacketOut::size_of(po),
                    Message::PortStatus(ref sts) => PortStatus::size_of(sts),
                    Message::StatsRequest(ref sr) => StatsReq::size_of(sr),
                    Message::StatsReply(ref sr) => StatsResp::size_of(sr),
                    Message::Unhandled(_, ref buf) => buf.len(),
                }
        }

        fn header_of(xid: u32, msg: &Message) -> OfpHeader {
            let sizeof_buf = Self::size_of(msg);
            OfpHeader::new(
                OFP_VERSION,
                Self::msg_code_of_message(msg) as u8,
                sizeof_buf as u16,
                xid,
            )
        }

        fn marshal(xid: u32, msg: Message) -> Vec<u8> {
            let hdr = Self::header_of(xid, &msg);
            let mut bytes = Vec::with_capacity(hdr.length());
            OfpHeader::marshal(&mut bytes, hdr);
            Message::marshal_body(msg, &mut bytes);
            bytes
        }

        fn parse(header: &OfpHeader, buf: &[u8]) -> Result<(u32, Message), OfpError> {
            if header.version() != OFP_VERSION {
                return Err(OfpError::Version(header.version()));
            }
            let msg = match header.type_code()? {
                MsgCode::Hello => Message::Hello,
                MsgCode::Error => Message::Error(ErrorMsg::parse(buf)?),
                MsgCode::EchoReq => Message::EchoRequest(buf.to_vec()),
                MsgCode::EchoResp => Message::EchoReply(buf.to_vec()),
                MsgCode::FeaturesReq => Message::FeaturesReq,
                MsgCode::FeaturesResp => Message::FeaturesReply(SwitchFeatures::parse(buf)?),
                MsgCode::FlowMod => Message::FlowMod(FlowMod::parse(buf)?),
                MsgCode::PacketIn => Message::PacketIn(PacketIn::parse(buf)?),
                MsgCode::PacketOut => Message::PacketOut(PacketOut::parse(buf)?),
                MsgCode::PortStatus => Message::PortStatus(PortStatus::parse(buf)?),
                MsgCode::BarrierReq => Message::BarrierRequest,
                MsgCode::BarrierResp => Message::BarrierReply,
                MsgCode::StatsReq => Message::StatsRequest(StatsReq::parse(buf)?),
                MsgCode::StatsResp => Message::StatsReply(StatsResp::parse(buf)?),
                code => Message::Unhandled(code, buf.to_vec()),
            };
            Ok((header.xid(), msg))
        }
    }

    /// Return a `FlowMod` adding a flow parameterized by the given `priority`, `pattern`,
    /// and `actions`.
    pub fn add_flow(prio: u16, pattern: Pattern, actions: Vec<Action>) -> FlowMod {
        FlowMod {
            command: FlowModCmd::AddFlow,
            pattern,
            priority: prio,
            actions,
            cookie: 0,
            idle_timeout: Timeout::Permanent,
            hard_timeout: Timeout::Permanent,
            notify_when_removed: false,
            out_port: None,
            apply_to_packet: None,
            check_overlap: false,
        }
    }

    /// Return a `FlowMod` deleting every flow matched by `pattern`, whatever its output port.
    pub fn delete_flow(pattern: Pattern) -> FlowMod {
        FlowMod {
            command: FlowModCmd::DeleteFlow,
            actions: vec![],
            ..add_flow(0, pattern, vec![])
        }
    }

    /// Return a request for the stats of every flow in every table.
    pub fn flow_stats_request() -> StatsReq {
        StatsReq {
            req_type: StatsReqType::Flow,
            flags: 0,
            pattern: Pattern::match_all(),
            table_id: 0xff,
            out_port: None,
        }
    }

    /// Parse the Ethernet frame carried by a packet-in.
    pub fn parse_payload(p: &Payload) -> Result<Packet, PacketError> {
        Packet::parse(p.bytes())
    }
}
