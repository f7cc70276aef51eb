use bytes::{Buf, BufMut, Bytes};

use super::{
    len_of_string, qos, read_mqtt_bytes, read_mqtt_string, read_u16, read_u8, write_mqtt_bytes,
    write_mqtt_string, write_remaining_length, Error, FixedHeader, QoS,
};

/// First packet on a connection, client to broker [MQTT-3.1].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub keep_alive: u16,
    pub client_id: String,
    pub clean_session: bool,
    pub last_will: Option<LastWill>,
    pub login: Option<Login>,
}

/// Message the broker publishes on the client's behalf if the connection
/// drops without a DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub username: String,
    /// A password is only allowed together with a user name
    /// [MQTT-3.1.2-22], and is opaque binary data on the wire.
    pub password: Option<Bytes>,
}

fn len(connect: &Connect) -> usize {
    // Protocol name (6), level (1), connect flags (1), keep alive (2).
    let mut len = 10;
    len += len_of_string(&connect.client_id);

    if let Some(will) = &connect.last_will {
        len += len_of_string(&will.topic) + 2 + will.message.len();
    }

    if let Some(login) = &connect.login {
        len += len_of_string(&login.username);
        if let Some(password) = &login.password {
            len += 2 + password.len();
        }
    }

    len
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Connect, Error> {
    if fixed_header.flags() != 0 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);

    let protocol_name = read_mqtt_string(&mut bytes)?;
    let protocol_level = read_u8(&mut bytes)?;
    if protocol_name != "MQTT" || protocol_level != 4 {
        return Err(Error::MalformedPacket);
    }

    let connect_flags = read_u8(&mut bytes)?;
    // Bit 0 of the connect flags is reserved and must be zero [MQTT-3.1.2-3].
    if connect_flags & 0b0000_0001 != 0 {
        return Err(Error::MalformedPacket);
    }

    let clean_session = connect_flags & 0b0000_0010 != 0;
    let will_flag = connect_flags & 0b0000_0100 != 0;
    let will_qos = (connect_flags >> 3) & 0b11;
    let will_retain = connect_flags & 0b0010_0000 != 0;
    let password_flag = connect_flags & 0b0100_0000 != 0;
    let username_flag = connect_flags & 0b1000_0000 != 0;

    // Without a will there is nothing for the will QoS and retain bits to
    // describe [MQTT-3.1.2-11, -13, -15].
    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(Error::MalformedPacket);
    }

    // A password requires a user name [MQTT-3.1.2-22].
    if !username_flag && password_flag {
        return Err(Error::MalformedPacket);
    }

    let keep_alive = read_u16(&mut bytes)?;
    let client_id = read_mqtt_string(&mut bytes)?;

    let last_will = if will_flag {
        Some(LastWill {
            topic: read_mqtt_string(&mut bytes)?,
            message: read_mqtt_bytes(&mut bytes)?,
            qos: qos(will_qos)?,
            retain: will_retain,
        })
    } else {
        None
    };

    let login = if username_flag {
        Some(Login {
            username: read_mqtt_string(&mut bytes)?,
            password: if password_flag {
                Some(read_mqtt_bytes(&mut bytes)?)
            } else {
                None
            },
        })
    } else {
        None
    };

    if bytes.has_remaining() {
        return Err(Error::MalformedPacket);
    }

    Ok(Connect {
        keep_alive,
        client_id,
        clean_session,
        last_will,
        login,
    })
}

pub fn write(connect: &Connect, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    let remaining_len = len(connect);

    buffer.put_u8(0x10);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    write_mqtt_string(buffer, "MQTT")?;
    buffer.put_u8(0x04);

    let mut connect_flags = 0u8;
    if connect.clean_session {
        connect_flags |= 0b0000_0010;
    }
    if let Some(will) = &connect.last_will {
        connect_flags |= 0b0000_0100;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0b0010_0000;
        }
    }
    if let Some(login) = &connect.login {
        connect_flags |= 0b1000_0000;
        if login.password.is_some() {
            connect_flags |= 0b0100_0000;
        }
    }
    buffer.put_u8(connect_flags);

    buffer.put_u16(connect.keep_alive);
    write_mqtt_string(buffer, &connect.client_id)?;

    if let Some(will) = &connect.last_will {
        write_mqtt_string(buffer, &will.topic)?;
        write_mqtt_bytes(buffer, &will.message)?;
    }

    if let Some(login) = &connect.login {
        write_mqtt_string(buffer, &login.username)?;
        if let Some(password) = &login.password {
            write_mqtt_bytes(buffer, password)?;
        }
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::protocol::Packet;

    fn roundtrip(connect: Connect) {
        let mut buffer = Vec::new();
        Packet::Connect(connect.clone()).write(&mut buffer).unwrap();

        let mut stream = BytesMut::from(&buffer[..]);
        let decoded = Packet::read(&mut stream, usize::MAX).unwrap();
        assert_eq!(decoded, Packet::Connect(connect));
        assert!(stream.is_empty());
    }

    #[test]
    fn username_only_fixture() {
        let connect = Connect {
            keep_alive: 0,
            client_id: "testclient".into(),
            clean_session: false,
            last_will: None,
            login: Some(Login {
                username: "user".into(),
                password: None,
            }),
        };

        let mut buffer = Vec::new();
        Packet::Connect(connect).write(&mut buffer).unwrap();

        #[rustfmt::skip]
        let expected = [
            0x10, 0x1C,
            0x00, 0x04, b'M', b'Q', b'T', b'T',
            0x04,
            0x80,
            0x00, 0x00,
            0x00, 0x0A, b't', b'e', b's', b't', b'c', b'l', b'i', b'e', b'n', b't',
            0x00, 0x04, b'u', b's', b'e', b'r',
        ];
        assert_eq!(buffer, expected);
    }

    #[test]
    fn roundtrips() {
        roundtrip(Connect {
            keep_alive: 60,
            client_id: "a".into(),
            clean_session: true,
            last_will: None,
            login: None,
        });

        roundtrip(Connect {
            keep_alive: 10,
            client_id: "with-will".into(),
            clean_session: false,
            last_will: Some(LastWill {
                topic: "will/topic".into(),
                message: Bytes::from_static(b"gone"),
                qos: QoS::ExactlyOnce,
                retain: true,
            }),
            login: Some(Login {
                username: "user".into(),
                password: Some(Bytes::from_static(&[0xDE, 0xAD])),
            }),
        });

        // Zero-byte client ID is legal; the broker may assign one.
        roundtrip(Connect {
            keep_alive: 0,
            client_id: String::new(),
            clean_session: true,
            last_will: None,
            login: None,
        });
    }

    #[test]
    fn rejects_bad_variable_header() {
        // "MQIsdp" (3.1 protocol name) instead of "MQTT".
        #[rustfmt::skip]
        let old_protocol = [
            0x10, 0x0E,
            0x00, 0x06, b'M', b'Q', b'I', b's', b'd', b'p',
            0x03, 0x02, 0x00, 0x3C,
            0x00, 0x00,
        ];
        let mut stream = BytesMut::from(&old_protocol[..]);
        assert!(Packet::read(&mut stream, usize::MAX).is_err());

        // Protocol level 5.
        #[rustfmt::skip]
        let level5 = [
            0x10, 0x0C,
            0x00, 0x04, b'M', b'Q', b'T', b'T',
            0x05, 0x02, 0x00, 0x3C,
            0x00, 0x00,
        ];
        let mut stream = BytesMut::from(&level5[..]);
        assert!(Packet::read(&mut stream, usize::MAX).is_err());
    }

    #[test]
    fn rejects_bad_connect_flags() {
        let frame = |connect_flags: u8| {
            #[rustfmt::skip]
            let bytes = [
                0x10, 0x0C,
                0x00, 0x04, b'M', b'Q', b'T', b'T',
                0x04, connect_flags, 0x00, 0x00,
                0x00, 0x00,
            ];
            BytesMut::from(&bytes[..])
        };

        // Reserved bit set.
        assert!(Packet::read(&mut frame(0b0000_0011), usize::MAX).is_err());
        // Will QoS without the will flag.
        assert!(Packet::read(&mut frame(0b0000_1000), usize::MAX).is_err());
        // Will retain without the will flag.
        assert!(Packet::read(&mut frame(0b0010_0000), usize::MAX).is_err());
        // Password without a user name.
        assert!(Packet::read(&mut frame(0b0100_0000), usize::MAX).is_err());
    }
}
