//! The four publish acknowledgment packets.
//!
//! PUBACK, PUBREC, PUBREL, and PUBCOMP all carry a bare packet identifier;
//! only their type byte differs. PUBREL additionally requires the fixed
//! header flags `0b0010` [MQTT-3.6.1-1], the others reserve all four bits.

use bytes::{Buf, BufMut, Bytes};

use super::{read_u16, Error, FixedHeader};

/// QoS 1 acknowledgment [MQTT-3.4].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
}

/// First broker response in the QoS 2 handshake [MQTT-3.5].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub pkid: u16,
}

/// Release of a QoS 2 message [MQTT-3.6].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub pkid: u16,
}

/// Final packet of the QoS 2 handshake [MQTT-3.7].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub pkid: u16,
}

fn read_pkid(fixed_header: FixedHeader, mut bytes: Bytes, flags: u8) -> Result<u16, Error> {
    if fixed_header.flags() != flags || fixed_header.remaining_len != 2 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);
    read_u16(&mut bytes)
}

fn write_pkid(byte1: u8, pkid: u16, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.put_u8(byte1);
    buffer.put_u8(0x02);
    buffer.put_u16(pkid);
    Ok(4)
}

macro_rules! ack_codec {
    ($read:ident, $write:ident, $ack:ident, $byte1:literal, $flags:literal) => {
        pub fn $read(fixed_header: FixedHeader, bytes: Bytes) -> Result<$ack, Error> {
            let pkid = read_pkid(fixed_header, bytes, $flags)?;
            Ok($ack { pkid })
        }

        pub fn $write(ack: &$ack, buffer: &mut Vec<u8>) -> Result<usize, Error> {
            write_pkid($byte1, ack.pkid, buffer)
        }
    };
}

ack_codec!(read_pub_ack, write_pub_ack, PubAck, 0x40, 0b0000);
ack_codec!(read_pub_rec, write_pub_rec, PubRec, 0x50, 0b0000);
ack_codec!(read_pub_rel, write_pub_rel, PubRel, 0x62, 0b0010);
ack_codec!(read_pub_comp, write_pub_comp, PubComp, 0x70, 0b0000);
