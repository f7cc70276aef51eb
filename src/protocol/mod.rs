//! MQTT 3.1.1 control packet codec.
//!
//! Every packet type gets a `read`/`write` pair in its own module; this
//! module owns the fixed header, the remaining-length encoding, and the
//! length-prefixed primitives they share.
//!
//! Reads are strict: a frame whose body decoder consumes more or fewer bytes
//! than the remaining length declares is malformed, as are reserved flag
//! bits that don't match the pattern mandated for the packet type.

use std::slice::Iter;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use connack::{ConnAck, ConnectReturnCode};
pub use connect::{Connect, LastWill, Login};
pub use publish::Publish;

pub mod acks;
pub mod connack;
pub mod connect;
pub mod publish;
pub mod suback;
pub mod subscribe;
pub mod unsubscribe;

pub use acks::{PubAck, PubComp, PubRec, PubRel};
pub use suback::{SubAck, SubscribeReturnCode};
pub use subscribe::{Subscribe, SubscribeFilter};
pub use unsubscribe::Unsubscribe;

/// The largest value the 4-byte remaining-length encoding can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Length-prefixed strings and binary fields carry a `u16` length.
pub const MAX_STRING_LEN: usize = 65_535;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("at least {0} more bytes required to frame the packet")]
    InsufficientBytes(usize),
    #[error("malformed packet")]
    MalformedPacket,
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("invalid QoS level: {0}")]
    InvalidQoS(u8),
    #[error("invalid connect return code: {0}")]
    InvalidConnectReturnCode(u8),
    #[error("invalid subscribe return code: {0}")]
    InvalidSubscribeReturnCode(u8),
    #[error("string is not valid UTF-8")]
    StringNotUtf8,
    #[error("payload size limit exceeded: {0}")]
    PayloadSizeLimitExceeded(usize),
}

/// Delivery guarantee requested for a PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

pub fn qos(num: u8) -> Result<QoS, Error> {
    match num {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        qos => Err(Error::InvalidQoS(qos)),
    }
}

/// Packet type from the high nibble of the first fixed-header byte.
///
/// Types 0 and 15 are reserved and never appear on the wire [MQTT-2.2.2-1].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

/// First byte of a control packet plus its decoded remaining length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Packet type nibble and flag nibble, as read off the wire.
    pub byte1: u8,
    /// Byte count of the fixed header itself (1 + 1..=4 length bytes).
    pub fixed_header_len: usize,
    /// Length of the variable header plus payload.
    pub remaining_len: usize,
}

impl FixedHeader {
    pub fn new(byte1: u8, remaining_len_len: usize, remaining_len: usize) -> FixedHeader {
        FixedHeader {
            byte1,
            fixed_header_len: remaining_len_len + 1,
            remaining_len,
        }
    }

    pub fn packet_type(&self) -> Result<PacketType, Error> {
        match self.byte1 >> 4 {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            num => Err(Error::InvalidPacketType(num)),
        }
    }

    /// Flag nibble of the first byte.
    pub fn flags(&self) -> u8 {
        self.byte1 & 0x0F
    }

    /// Full frame length: fixed header plus remaining length.
    pub fn frame_length(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }

    pub fn write(&self, buffer: &mut Vec<u8>) -> Result<usize, Error> {
        buffer.put_u8(self.byte1);
        let count = write_remaining_length(buffer, self.remaining_len)?;
        Ok(1 + count)
    }
}

/// An MQTT 3.1.1 control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Read one complete packet from the front of `stream`, consuming it.
    ///
    /// Returns [`Error::InsufficientBytes`] without consuming anything when
    /// the buffer does not yet hold a whole frame.
    pub fn read(stream: &mut BytesMut, max_size: usize) -> Result<Packet, Error> {
        let fixed_header = check(stream.iter(), max_size)?;

        // Only the bytes belonging to this frame are handed to the body
        // decoder, so over-reads past the remaining length show up as
        // malformed instead of eating the next packet.
        let packet = stream.split_to(fixed_header.frame_length()).freeze();
        let packet_type = fixed_header.packet_type()?;

        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(connect::read(fixed_header, packet)?),
            PacketType::ConnAck => Packet::ConnAck(connack::read(fixed_header, packet)?),
            PacketType::Publish => Packet::Publish(publish::read(fixed_header, packet)?),
            PacketType::PubAck => Packet::PubAck(acks::read_pub_ack(fixed_header, packet)?),
            PacketType::PubRec => Packet::PubRec(acks::read_pub_rec(fixed_header, packet)?),
            PacketType::PubRel => Packet::PubRel(acks::read_pub_rel(fixed_header, packet)?),
            PacketType::PubComp => Packet::PubComp(acks::read_pub_comp(fixed_header, packet)?),
            PacketType::Subscribe => Packet::Subscribe(subscribe::read(fixed_header, packet)?),
            PacketType::SubAck => Packet::SubAck(suback::read(fixed_header, packet)?),
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(unsubscribe::read(fixed_header, packet)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(unsuback_read(fixed_header, packet)?),
            PacketType::PingReq => {
                expect_empty(&fixed_header)?;
                Packet::PingReq
            }
            PacketType::PingResp => {
                expect_empty(&fixed_header)?;
                Packet::PingResp
            }
            PacketType::Disconnect => {
                expect_empty(&fixed_header)?;
                Packet::Disconnect
            }
        };

        Ok(packet)
    }

    /// Serialize into `buffer`, returning the number of bytes written.
    pub fn write(&self, buffer: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Packet::Connect(connect) => connect::write(connect, buffer),
            Packet::ConnAck(connack) => connack::write(connack, buffer),
            Packet::Publish(publish) => publish::write(publish, buffer),
            Packet::PubAck(puback) => acks::write_pub_ack(puback, buffer),
            Packet::PubRec(pubrec) => acks::write_pub_rec(pubrec, buffer),
            Packet::PubRel(pubrel) => acks::write_pub_rel(pubrel, buffer),
            Packet::PubComp(pubcomp) => acks::write_pub_comp(pubcomp, buffer),
            Packet::Subscribe(subscribe) => subscribe::write(subscribe, buffer),
            Packet::SubAck(suback) => suback::write(suback, buffer),
            Packet::Unsubscribe(unsubscribe) => unsubscribe::write(unsubscribe, buffer),
            Packet::UnsubAck(unsuback) => unsuback_write(unsuback, buffer),
            Packet::PingReq => write_empty(0xC0, buffer),
            Packet::PingResp => write_empty(0xD0, buffer),
            Packet::Disconnect => write_empty(0xE0, buffer),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

/// Acknowledgment of an UNSUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
}

fn unsuback_read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<UnsubAck, Error> {
    if fixed_header.flags() != 0 || fixed_header.remaining_len != 2 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;
    Ok(UnsubAck { pkid })
}

fn unsuback_write(unsuback: &UnsubAck, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.put_u8(0xB0);
    buffer.put_u8(0x02);
    buffer.put_u16(unsuback.pkid);
    Ok(4)
}

fn expect_empty(fixed_header: &FixedHeader) -> Result<(), Error> {
    if fixed_header.flags() != 0 || fixed_header.remaining_len != 0 {
        return Err(Error::MalformedPacket);
    }
    Ok(())
}

fn write_empty(byte1: u8, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.put_u8(byte1);
    buffer.put_u8(0x00);
    Ok(2)
}

/// Parse and validate a fixed header, verifying the whole frame is buffered.
pub fn check(stream: Iter<u8>, max_packet_size: usize) -> Result<FixedHeader, Error> {
    let stream_len = stream.len();
    let fixed_header = parse_fixed_header(stream)?;

    if fixed_header.remaining_len > max_packet_size {
        return Err(Error::PayloadSizeLimitExceeded(fixed_header.remaining_len));
    }

    let frame_length = fixed_header.frame_length();
    if stream_len < frame_length {
        return Err(Error::InsufficientBytes(frame_length - stream_len));
    }

    Ok(fixed_header)
}

fn parse_fixed_header(mut stream: Iter<u8>) -> Result<FixedHeader, Error> {
    let stream_len = stream.len();
    if stream_len < 2 {
        return Err(Error::InsufficientBytes(2 - stream_len));
    }

    let byte1 = *stream.next().expect("checked above");
    let (len_len, len) = length(stream)?;

    Ok(FixedHeader::new(byte1, len_len, len))
}

/// Decode the variable-byte remaining length: 7 bits of value per byte, the
/// high bit a continuation marker, at most 4 bytes [MQTT-2.2.3].
fn length(stream: Iter<u8>) -> Result<(usize, usize), Error> {
    let mut len = 0;
    let mut len_len = 0;
    let mut done = false;
    let mut shift = 0;

    for byte in stream {
        len_len += 1;
        let byte = *byte as usize;
        len += (byte & 0x7F) << shift;

        done = (byte & 0x80) == 0;
        if done {
            break;
        }

        shift += 7;
        // A fourth byte with its continuation bit set would encode a value
        // above 0x0FFFFFFF.
        if shift > 21 {
            return Err(Error::MalformedPacket);
        }
    }

    if !done {
        return Err(Error::InsufficientBytes(1));
    }

    Ok((len_len, len))
}

pub fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if !stream.has_remaining() {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u8())
}

pub fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.get_u16())
}

/// Read a `u16` length prefix and that many bytes.
pub fn read_mqtt_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    let len = read_u16(stream)? as usize;
    if len > stream.len() {
        return Err(Error::MalformedPacket);
    }
    Ok(stream.split_to(len))
}

pub fn read_mqtt_string(stream: &mut Bytes) -> Result<String, Error> {
    let bytes = read_mqtt_bytes(stream)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::StringNotUtf8)
}

pub fn write_mqtt_bytes(buffer: &mut Vec<u8>, bytes: &[u8]) -> Result<(), Error> {
    if bytes.len() > MAX_STRING_LEN {
        return Err(Error::PayloadSizeLimitExceeded(bytes.len()));
    }
    buffer.put_u16(bytes.len() as u16);
    buffer.extend_from_slice(bytes);
    Ok(())
}

pub fn write_mqtt_string(buffer: &mut Vec<u8>, string: &str) -> Result<(), Error> {
    write_mqtt_bytes(buffer, string.as_bytes())
}

/// Encoded size of a length-prefixed string.
pub(crate) fn len_of_string(string: &str) -> usize {
    2 + string.len()
}

pub fn write_remaining_length(buffer: &mut Vec<u8>, len: usize) -> Result<usize, Error> {
    if len > MAX_REMAINING_LENGTH {
        return Err(Error::PayloadSizeLimitExceeded(len));
    }

    let mut done = false;
    let mut x = len;
    let mut count = 0;

    while !done {
        let mut byte = (x % 128) as u8;
        x /= 128;
        if x > 0 {
            byte |= 128;
        }

        buffer.put_u8(byte);
        count += 1;
        done = x == 0;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_length(len: usize) -> usize {
        let mut buffer = Vec::new();
        write_remaining_length(&mut buffer, len).unwrap();
        let (_, decoded) = length(buffer.iter()).unwrap();
        decoded
    }

    #[test]
    fn remaining_length_boundaries() {
        for len in [0, 1, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, 268_435_455] {
            assert_eq!(roundtrip_length(len), len, "length {len} did not round-trip");
        }

        let mut buffer = Vec::new();
        assert!(matches!(
            write_remaining_length(&mut buffer, 268_435_456),
            Err(Error::PayloadSizeLimitExceeded(_))
        ));

        // Four continuation bits in a row can't happen in a valid encoding.
        assert!(matches!(
            length([0xFF, 0xFF, 0xFF, 0xFF, 0x01].iter()),
            Err(Error::MalformedPacket)
        ));
    }

    #[test]
    fn fixed_header_write() {
        let mut buffer = Vec::new();
        FixedHeader::new(0x1F, 2, 255).write(&mut buffer).unwrap();
        assert_eq!(buffer, [0x1F, 0xFF, 0x01]);

        buffer.clear();
        FixedHeader::new(0x1F, 1, 10).write(&mut buffer).unwrap();
        assert_eq!(buffer, [0x1F, 0x0A]);
    }

    #[test]
    fn fixed_header_parse() {
        let bytes = [0x20, 0x80, 0x02];
        let fixed_header = parse_fixed_header(bytes.iter()).unwrap();
        assert_eq!(fixed_header.byte1, 0x20);
        assert_eq!(fixed_header.packet_type().unwrap(), PacketType::ConnAck);
        assert_eq!(fixed_header.remaining_len, 256);
        assert_eq!(fixed_header.fixed_header_len, 3);
    }

    #[test]
    fn reserved_packet_types_rejected() {
        let mut stream = BytesMut::from(&[0x00u8, 0x00][..]);
        expect_test::expect![[r#"
            Err(
                InvalidPacketType(
                    0,
                ),
            )
        "#]]
        .assert_debug_eq(&Packet::read(&mut stream, usize::MAX));

        let mut stream = BytesMut::from(&[0xF0u8, 0x00][..]);
        expect_test::expect![[r#"
            Err(
                InvalidPacketType(
                    15,
                ),
            )
        "#]]
        .assert_debug_eq(&Packet::read(&mut stream, usize::MAX));
    }

    #[test]
    fn empty_packets() {
        for (packet, byte1) in [
            (Packet::PingReq, 0xC0u8),
            (Packet::PingResp, 0xD0),
            (Packet::Disconnect, 0xE0),
        ] {
            let mut buffer = Vec::new();
            assert_eq!(packet.write(&mut buffer).unwrap(), 2);
            assert_eq!(buffer, [byte1, 0x00]);

            let mut stream = BytesMut::from(&buffer[..]);
            assert_eq!(Packet::read(&mut stream, usize::MAX).unwrap(), packet);
            assert!(stream.is_empty());
        }

        // A PINGREQ with a payload is nonsense.
        let mut stream = BytesMut::from(&[0xC0u8, 0x01, 0x00][..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        ));
    }

    #[test]
    fn partial_frame_reports_missing_bytes() {
        let mut stream = BytesMut::from(&[0x30u8, 0x0A, 0x00][..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::InsufficientBytes(9))
        ));
        // Nothing consumed.
        assert_eq!(stream.len(), 3);
    }

    #[test]
    fn oversize_frame_rejected() {
        let mut stream = BytesMut::from(&[0x30u8, 0xFF, 0xFF, 0xFF, 0x7F][..]);
        assert!(matches!(
            Packet::read(&mut stream, 1024),
            Err(Error::PayloadSizeLimitExceeded(_))
        ));
    }
}
