use bytes::{Buf, BufMut, Bytes};

use super::{read_u16, read_u8, write_remaining_length, Error, FixedHeader, QoS};

/// Broker's response to a SUBSCRIBE, one return code per requested filter
/// [MQTT-3.9].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// Return codes other than 0x00, 0x01, 0x02 and 0x80 are reserved
/// [MQTT-3.9.3-2].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

fn len(suback: &SubAck) -> usize {
    2 + suback.return_codes.len()
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<SubAck, Error> {
    if fixed_header.flags() != 0 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;

    if !bytes.has_remaining() {
        return Err(Error::MalformedPacket);
    }

    let mut return_codes = Vec::new();
    while bytes.has_remaining() {
        let return_code = read_u8(&mut bytes)?;
        return_codes.push(reason(return_code)?);
    }

    Ok(SubAck { pkid, return_codes })
}

pub fn write(suback: &SubAck, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    let remaining_len = len(suback);

    buffer.put_u8(0x90);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    buffer.put_u16(suback.pkid);
    for &return_code in &suback.return_codes {
        buffer.put_u8(code(return_code));
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}

fn reason(code: u8) -> Result<SubscribeReturnCode, Error> {
    let code = match code {
        0 => SubscribeReturnCode::Success(QoS::AtMostOnce),
        1 => SubscribeReturnCode::Success(QoS::AtLeastOnce),
        2 => SubscribeReturnCode::Success(QoS::ExactlyOnce),
        0x80 => SubscribeReturnCode::Failure,
        code => return Err(Error::InvalidSubscribeReturnCode(code)),
    };

    Ok(code)
}

fn code(reason: SubscribeReturnCode) -> u8 {
    match reason {
        SubscribeReturnCode::Success(qos) => qos as u8,
        SubscribeReturnCode::Failure => 0x80,
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::protocol::Packet;

    #[test]
    fn mixed_codes_fixture() {
        let suback = SubAck {
            pkid: 0xABCD,
            return_codes: vec![
                SubscribeReturnCode::Success(QoS::AtMostOnce),
                SubscribeReturnCode::Success(QoS::AtLeastOnce),
                SubscribeReturnCode::Success(QoS::ExactlyOnce),
                SubscribeReturnCode::Failure,
            ],
        };

        let mut buffer = Vec::new();
        Packet::SubAck(suback.clone()).write(&mut buffer).unwrap();
        assert_eq!(buffer, [0x90, 0x06, 0xAB, 0xCD, 0x00, 0x01, 0x02, 0x80]);

        let mut stream = BytesMut::from(&buffer[..]);
        assert_eq!(
            Packet::read(&mut stream, usize::MAX).unwrap(),
            Packet::SubAck(suback)
        );
    }

    #[test]
    fn rejects_reserved_return_code() {
        let mut stream = BytesMut::from(&[0x90u8, 0x03, 0x00, 0x01, 0x03][..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::InvalidSubscribeReturnCode(3))
        ));
    }

    #[test]
    fn rejects_missing_return_codes() {
        let mut stream = BytesMut::from(&[0x90u8, 0x02, 0x00, 0x01][..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        ));
    }
}
