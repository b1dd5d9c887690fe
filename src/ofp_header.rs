use std::io::Cursor;
use std::mem::size_of;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::OfpError;
use crate::openflow0x01::MsgCode;

/// OpenFlow Header
///
/// The first fields of every OpenFlow message, no matter the protocol version.
/// This is parsed to determine version and length of the remaining message, so that
/// it can be properly handled.
#[repr(packed)]
pub struct OfpHeader {
    version: u8,
    typ: u8,
    length: u16,
    xid: u32,
}

impl OfpHeader {
    /// Create an `OfpHeader` out of the arguments.
    pub fn new(version: u8, typ: u8, length: u16, xid: u32) -> OfpHeader {
        OfpHeader {
            version,
            typ,
            length,
            xid,
        }
    }

    /// Return the byte-size of an `OfpHeader`.
    pub fn size() -> usize {
        size_of::<OfpHeader>()
    }

    /// Fills a message buffer with the header fields of an `OfpHeader`.
    pub fn marshal(bytes: &mut Vec<u8>, header: OfpHeader) {
        bytes.write_u8(header.version()).unwrap();
        bytes.write_u8(header.typ).unwrap();
        bytes.write_u16::<BigEndian>(header.length() as u16).unwrap();
        bytes.write_u32::<BigEndian>(header.xid()).unwrap();
    }

    /// Takes a message buffer (sized for an `OfpHeader`) and returns an `OfpHeader`.
    pub fn parse(buf: [u8; 8]) -> Result<Self, OfpError> {
        let mut bytes = Cursor::new(buf);
        let short = |_| OfpError::Truncated("header");
        let header = OfpHeader {
            version: bytes.read_u8().map_err(short)?,
            typ: bytes.read_u8().map_err(short)?,
            length: bytes.read_u16::<BigEndian>().map_err(short)?,
            xid: bytes.read_u32::<BigEndian>().map_err(short)?,
        };
        if header.length() < Self::size() {
            return Err(OfpError::Length(header.length()));
        }
        Ok(header)
    }

    /// Return the `version` field of a header.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Return the OpenFlow message type code of a header.
    pub fn type_code(&self) -> Result<MsgCode, OfpError> {
        MsgCode::try_from(self.typ)
    }

    /// Return the `length` field of a header. Includes the length of the header itself.
    pub fn length(&self) -> usize {
        self.length as usize
    }

    /// Return the `xid` field of a header, the transaction id associated with this packet.
    ///  Replies use the same id to facilitate pairing.
    pub fn xid(&self) -> u32 {
        self.xid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let mut bytes = vec![];
        OfpHeader::marshal(&mut bytes, OfpHeader::new(0x01, 10, 32, 7));
        assert_eq!(bytes, vec![0x01, 10, 0, 32, 0, 0, 0, 7]);
        let mut buf = [0; 8];
        buf.copy_from_slice(&bytes);
        let header = OfpHeader::parse(buf).unwrap();
        assert_eq!(header.length(), 32);
        assert_eq!(header.xid(), 7);
        assert!(matches!(header.type_code(), Ok(MsgCode::PacketIn)));
    }

    #[test]
    fn length_below_header_is_rejected() {
        assert!(matches!(
            OfpHeader::parse([0x01, 0, 0, 4, 0, 0, 0, 0]),
            Err(OfpError::Length(4))
        ));
    }
}
