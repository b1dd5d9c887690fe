use std::io::{BufRead, Cursor, Read};
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::PacketError;
use crate::mac::{Dpid, MacAddr};

/// Destination of LLDP frames: the nearest-bridge group address.
pub const LLDP_MULTICAST: MacAddr = MacAddr([0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e]);

const ETH_HEADER_LEN: usize = 14;
const ARP_LEN: usize = 28;

#[repr(u16)]
pub enum EthTyp {
    EthTypIP = 0x0800,
    EthTypARP = 0x0806,
    EthTypVLAN = 0x8100,
    EthTypLLDP = 0x88cc,
}

fn truncated(needed: usize, bytes: &Cursor<Vec<u8>>) -> PacketError {
    let got = bytes.get_ref().len().saturating_sub(bytes.position() as usize);
    PacketError::Truncated { needed, got }
}

fn remaining(bytes: &Cursor<Vec<u8>>) -> usize {
    bytes.get_ref().len().saturating_sub(bytes.position() as usize)
}

fn read_mac(bytes: &mut Cursor<Vec<u8>>) -> MacAddr {
    let mut arr = [0; 6];
    // callers check the length first
    let _ = bytes.read_exact(&mut arr);
    MacAddr(arr)
}

/// Address resolution protocol (ARP) packet payload, IPv4 over Ethernet only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arp {
    Query {
        sha: MacAddr,
        spa: Ipv4Addr,
        tpa: Ipv4Addr,
    },
    Reply {
        sha: MacAddr,
        spa: Ipv4Addr,
        tha: MacAddr,
        tpa: Ipv4Addr,
    },
}

impl Arp {
    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Result<Arp, PacketError> {
        if remaining(bytes) < ARP_LEN {
            return Err(truncated(ARP_LEN, bytes));
        }
        bytes.consume(6);
        let oper = bytes.read_u16::<BigEndian>().map_err(|_| truncated(2, bytes))?;
        let sha = read_mac(bytes);
        let spa = Ipv4Addr::from(bytes.read_u32::<BigEndian>().map_err(|_| truncated(4, bytes))?);
        let tha = read_mac(bytes);
        let tpa = Ipv4Addr::from(bytes.read_u32::<BigEndian>().map_err(|_| truncated(4, bytes))?);
        match oper {
            0x0001 => Ok(Arp::Query { sha, spa, tpa }),
            0x0002 => Ok(Arp::Reply { sha, spa, tha, tpa }),
            _ => Err(PacketError::Malformed("ARP")),
        }
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        let (oper, sha, spa, tha, tpa) = match *self {
            Arp::Query { sha, spa, tpa } => (1u16, sha, spa, MacAddr::BROADCAST, tpa),
            Arp::Reply { sha, spa, tha, tpa } => (2u16, sha, spa, tha, tpa),
        };
        bytes.write_u16::<BigEndian>(1).unwrap();
        bytes.write_u16::<BigEndian>(EthTyp::EthTypIP as u16).unwrap();
        bytes.write_u8(6).unwrap();
        bytes.write_u8(4).unwrap();
        bytes.write_u16::<BigEndian>(oper).unwrap();
        bytes.extend_from_slice(&sha.octets());
        bytes.write_u32::<BigEndian>(spa.into()).unwrap();
        bytes.extend_from_slice(&tha.octets());
        bytes.write_u32::<BigEndian>(tpa.into()).unwrap();
    }

    /// Hardware address of the sender.
    pub fn sender_mac(&self) -> MacAddr {
        match *self {
            Arp::Query { sha, .. } | Arp::Reply { sha, .. } => sha,
        }
    }

    /// Protocol address of the sender.
    pub fn sender_ip(&self) -> Ipv4Addr {
        match *self {
            Arp::Query { spa, .. } | Arp::Reply { spa, .. } => spa,
        }
    }
}

/// LLDP probe emitted by this controller: the chassis id names the sending datapath and the
/// port id its egress port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lldp {
    pub dpid: Dpid,
    pub port: u16,
}

const LLDP_TLV_END: u8 = 0;
const LLDP_TLV_CHASSIS_ID: u8 = 1;
const LLDP_TLV_PORT_ID: u8 = 2;
const LLDP_TLV_TTL: u8 = 3;
const LLDP_CHASSIS_LOCAL: u8 = 7;
const LLDP_PORT_COMPONENT: u8 = 2;
const LLDP_TTL_SECS: u16 = 120;
const LLDP_DPID_PREFIX: &str = "dpid:";

impl Lldp {
    fn write_tlv(bytes: &mut Vec<u8>, typ: u8, value: &[u8]) {
        let header = ((typ as u16) << 9) | (value.len() as u16 & 0x1ff);
        bytes.write_u16::<BigEndian>(header).unwrap();
        bytes.extend_from_slice(value);
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        let mut chassis = vec![LLDP_CHASSIS_LOCAL];
        chassis.extend_from_slice(format!("{}{}", LLDP_DPID_PREFIX, self.dpid).as_bytes());
        Self::write_tlv(bytes, LLDP_TLV_CHASSIS_ID, &chassis);
        let mut port = vec![LLDP_PORT_COMPONENT];
        port.write_u16::<BigEndian>(self.port).unwrap();
        Self::write_tlv(bytes, LLDP_TLV_PORT_ID, &port);
        Self::write_tlv(bytes, LLDP_TLV_TTL, &LLDP_TTL_SECS.to_be_bytes());
        Self::write_tlv(bytes, LLDP_TLV_END, &[]);
    }

    /// Parse the TLVs of an LLDP frame. Frames not produced by `marshal` are rejected.
    fn parse(bytes: &mut Cursor<Vec<u8>>) -> Result<Lldp, PacketError> {
        let mut dpid = None;
        let mut port = None;
        loop {
            let header = bytes.read_u16::<BigEndian>().map_err(|_| truncated(2, bytes))?;
            let typ = (header >> 9) as u8;
            let len = (header & 0x1ff) as usize;
            if typ == LLDP_TLV_END {
                break;
            }
            if remaining(bytes) < len {
                return Err(truncated(len, bytes));
            }
            let mut value = vec![0; len];
            bytes.read_exact(&mut value).map_err(|_| truncated(len, bytes))?;
            match typ {
                LLDP_TLV_CHASSIS_ID if value.first() == Some(&LLDP_CHASSIS_LOCAL) => {
                    let text = std::str::from_utf8(&value[1..])
                        .map_err(|_| PacketError::Malformed("LLDP chassis id"))?;
                    let hex = text
                        .strip_prefix(LLDP_DPID_PREFIX)
                        .ok_or(PacketError::Malformed("LLDP chassis id"))?;
                    dpid = Some(
                        hex.parse::<Dpid>()
                            .map_err(|_| PacketError::Malformed("LLDP chassis id"))?,
                    );
                }
                LLDP_TLV_PORT_ID if value.len() == 3 && value[0] == LLDP_PORT_COMPONENT => {
                    port = Some(u16::from_be_bytes([value[1], value[2]]));
                }
                _ => (),
            }
        }
        match (dpid, port) {
            (Some(dpid), Some(port)) => Ok(Lldp { dpid, port }),
            _ => Err(PacketError::Malformed("LLDP")),
        }
    }
}

/// Represents a packet at the network protocol level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nw {
    Arp(Arp),
    Lldp(Lldp),
    Unparsable(u16, Vec<u8>),
}

/// Represents a packet at the ethernet protocol level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub dl_src: MacAddr,
    pub dl_dst: MacAddr,
    pub dl_vlan: Option<u16>,
    pub nw: Nw,
}

impl Packet {
    pub fn parse(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < ETH_HEADER_LEN {
            return Err(PacketError::Truncated {
                needed: ETH_HEADER_LEN,
                got: buf.len(),
            });
        }
        let mut bytes = Cursor::new(buf.to_vec());
        let dl_dst = read_mac(&mut bytes);
        let dl_src = read_mac(&mut bytes);
        let typ = bytes.read_u16::<BigEndian>().map_err(|_| truncated(2, &bytes))?;
        let (dl_vlan, typ) = match typ {
            t if t == EthTyp::EthTypVLAN as u16 => {
                let tag = bytes.read_u16::<BigEndian>().map_err(|_| truncated(2, &bytes))?;
                let typ = bytes.read_u16::<BigEndian>().map_err(|_| truncated(2, &bytes))?;
                (Some(tag & 0xfff), typ)
            }
            _ => (None, typ),
        };
        let nw = match typ {
            t if t == EthTyp::EthTypARP as u16 => Nw::Arp(Arp::parse(&mut bytes)?),
            t if t == EthTyp::EthTypLLDP as u16 => match Lldp::parse(&mut bytes) {
                Ok(lldp) => Nw::Lldp(lldp),
                // LLDP from other speakers still has to be recognised as LLDP
                Err(_) => Nw::Unparsable(typ, buf[ETH_HEADER_LEN..].to_vec()),
            },
            _ => {
                let pos = bytes.position() as usize;
                Nw::Unparsable(typ, bytes.into_inner().split_off(pos))
            }
        };
        Ok(Packet {
            dl_src,
            dl_dst,
            dl_vlan,
            nw,
        })
    }

    /// Ethertype of the network layer payload.
    pub fn eth_type(&self) -> u16 {
        match self.nw {
            Nw::Arp(_) => EthTyp::EthTypARP as u16,
            Nw::Lldp(_) => EthTyp::EthTypLLDP as u16,
            Nw::Unparsable(typ, _) => typ,
        }
    }

    pub fn is_lldp(&self) -> bool {
        self.eth_type() == EthTyp::EthTypLLDP as u16
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&self.dl_dst.octets());
        bytes.extend_from_slice(&self.dl_src.octets());
        if let Some(vlan) = self.dl_vlan {
            bytes.write_u16::<BigEndian>(EthTyp::EthTypVLAN as u16).unwrap();
            bytes.write_u16::<BigEndian>(vlan & 0xfff).unwrap();
        }
        bytes.write_u16::<BigEndian>(self.eth_type()).unwrap();
        match self.nw {
            Nw::Arp(ref arp) => arp.marshal(&mut bytes),
            Nw::Lldp(ref lldp) => lldp.marshal(&mut bytes),
            Nw::Unparsable(_, ref payload) => bytes.extend_from_slice(payload),
        }
        bytes
    }

    /// Broadcast ARP request for `target` sent on behalf of `src_mac`.
    pub fn arp_request(src_mac: MacAddr, src_ip: Ipv4Addr, target: Ipv4Addr) -> Packet {
        Packet {
            dl_src: src_mac,
            dl_dst: MacAddr::BROADCAST,
            dl_vlan: None,
            nw: Nw::Arp(Arp::Query {
                sha: src_mac,
                spa: src_ip,
                tpa: target,
            }),
        }
    }

    /// LLDP probe announcing `port` of switch `dpid`, sourced from the port's own address.
    pub fn lldp_probe(dpid: Dpid, port: u16, hw_addr: MacAddr) -> Packet {
        Packet {
            dl_src: hw_addr,
            dl_dst: LLDP_MULTICAST,
            dl_vlan: None,
            nw: Nw::Lldp(Lldp { dpid, port }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr([0x52, 0x54, 0, 0, 0, last])
    }

    #[test]
    fn arp_reply_from_wire() {
        let reply = Packet {
            dl_src: mac(1),
            dl_dst: mac(2),
            dl_vlan: None,
            nw: Nw::Arp(Arp::Reply {
                sha: mac(1),
                spa: Ipv4Addr::new(10, 0, 0, 1),
                tha: mac(2),
                tpa: Ipv4Addr::new(10, 0, 0, 2),
            }),
        };
        let wire = reply.marshal();
        assert_eq!(wire.len(), ETH_HEADER_LEN + ARP_LEN);
        assert_eq!(&wire[12..14], &[0x08, 0x06]);
        assert_eq!(Packet::parse(&wire).unwrap(), reply);
    }

    #[test]
    fn probe_request_is_broadcast() {
        let probe = Packet::arp_request(
            MacAddr([2; 6]),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(10, 0, 0, 8),
        );
        let parsed = Packet::parse(&probe.marshal()).unwrap();
        assert!(parsed.dl_dst.is_broadcast());
        match parsed.nw {
            Nw::Arp(Arp::Query { sha, spa, tpa }) => {
                assert_eq!(sha, MacAddr([2; 6]));
                assert_eq!(spa, Ipv4Addr::UNSPECIFIED);
                assert_eq!(tpa, Ipv4Addr::new(10, 0, 0, 8));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn lldp_probe_carries_origin() {
        let probe = Packet::lldp_probe(Dpid(0x90b1_1c87_6975), 3, mac(9));
        let parsed = Packet::parse(&probe.marshal()).unwrap();
        assert!(parsed.is_lldp());
        assert_eq!(
            parsed.nw,
            Nw::Lldp(Lldp {
                dpid: Dpid(0x90b1_1c87_6975),
                port: 3
            })
        );
    }

    #[test]
    fn foreign_lldp_is_still_lldp() {
        let mut wire = vec![];
        wire.extend_from_slice(&LLDP_MULTICAST.octets());
        wire.extend_from_slice(&mac(3).octets());
        wire.extend_from_slice(&[0x88, 0xcc, 0x02, 0x07, 0x04, 1, 2, 3, 4, 5, 6, 0, 0]);
        let parsed = Packet::parse(&wire).unwrap();
        assert!(parsed.is_lldp());
    }

    #[test]
    fn short_frames_are_rejected() {
        assert_eq!(
            Packet::parse(&[0; 10]),
            Err(PacketError::Truncated { needed: 14, got: 10 })
        );
        let mut wire = Packet::arp_request(mac(1), Ipv4Addr::UNSPECIFIED, Ipv4Addr::LOCALHOST)
            .marshal();
        wire.truncate(30);
        assert!(matches!(Packet::parse(&wire), Err(PacketError::Truncated { .. })));
    }
}
