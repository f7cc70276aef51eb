use bytes::{Buf, BufMut, Bytes};

use super::{read_u8, Error, FixedHeader};

/// Broker's response to a CONNECT [MQTT-3.2].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    RefusedProtocolVersion = 1,
    BadClientId = 2,
    ServiceUnavailable = 3,
    BadUserNamePassword = 4,
    NotAuthorized = 5,
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<ConnAck, Error> {
    if fixed_header.flags() != 0 || fixed_header.remaining_len != 2 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);

    let flags = read_u8(&mut bytes)?;
    // Bits 1-7 of the acknowledge-flags byte are reserved [MQTT-3.2.2-1].
    if flags & 0b1111_1110 != 0 {
        return Err(Error::MalformedPacket);
    }

    let return_code = read_u8(&mut bytes)?;

    Ok(ConnAck {
        session_present: flags & 0b0000_0001 != 0,
        code: connect_return(return_code)?,
    })
}

pub fn write(connack: &ConnAck, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.put_u8(0x20);
    buffer.put_u8(0x02);
    buffer.put_u8(connack.session_present as u8);
    buffer.put_u8(connack.code as u8);
    Ok(4)
}

fn connect_return(num: u8) -> Result<ConnectReturnCode, Error> {
    match num {
        0 => Ok(ConnectReturnCode::Accepted),
        1 => Ok(ConnectReturnCode::RefusedProtocolVersion),
        2 => Ok(ConnectReturnCode::BadClientId),
        3 => Ok(ConnectReturnCode::ServiceUnavailable),
        4 => Ok(ConnectReturnCode::BadUserNamePassword),
        5 => Ok(ConnectReturnCode::NotAuthorized),
        num => Err(Error::InvalidConnectReturnCode(num)),
    }
}
