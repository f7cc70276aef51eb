use bytes::{Buf, BufMut, Bytes};

use super::{
    len_of_string, qos, read_mqtt_string, read_u16, write_mqtt_string, write_remaining_length,
    Error, FixedHeader, QoS,
};

/// An application message in either direction [MQTT-3.3].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Zero when `qos` is [`QoS::AtMostOnce`]; nonzero otherwise.
    pub pkid: u16,
    pub payload: Bytes,
}

fn len(publish: &Publish) -> usize {
    let mut len = len_of_string(&publish.topic) + publish.payload.len();
    if publish.qos != QoS::AtMostOnce {
        len += 2;
    }
    len
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Publish, Error> {
    let flags = fixed_header.flags();
    let dup = flags & 0b1000 != 0;
    let qos_num = (flags >> 1) & 0b11;
    let retain = flags & 0b0001 != 0;
    let qos = qos(qos_num)?;

    // The DUP flag is meaningless for QoS 0 and must be zero [MQTT-3.3.1-2].
    if qos == QoS::AtMostOnce && dup {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);

    let topic = read_mqtt_string(&mut bytes)?;

    let pkid = if qos == QoS::AtMostOnce {
        0
    } else {
        let pkid = read_u16(&mut bytes)?;
        // A zero packet identifier can never be acknowledged [MQTT-2.3.1-1].
        if pkid == 0 {
            return Err(Error::MalformedPacket);
        }
        pkid
    };

    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        pkid,
        payload: bytes,
    })
}

pub fn write(publish: &Publish, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    let remaining_len = len(publish);

    let mut byte1 = 0x30;
    if publish.dup {
        // Writing a DUP QoS 0 publish is a bug in the caller.
        debug_assert_ne!(publish.qos, QoS::AtMostOnce);
        byte1 |= 0b1000;
    }
    byte1 |= (publish.qos as u8) << 1;
    if publish.retain {
        byte1 |= 0b0001;
    }
    buffer.put_u8(byte1);

    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    write_mqtt_string(buffer, &publish.topic)?;

    if publish.qos != QoS::AtMostOnce {
        debug_assert_ne!(publish.pkid, 0);
        buffer.put_u16(publish.pkid);
    }

    buffer.extend_from_slice(&publish.payload);

    Ok(1 + remaining_len_bytes + remaining_len)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::protocol::Packet;

    fn roundtrip(publish: Publish) {
        let mut buffer = Vec::new();
        Packet::Publish(publish.clone()).write(&mut buffer).unwrap();

        let mut stream = BytesMut::from(&buffer[..]);
        assert_eq!(
            Packet::read(&mut stream, usize::MAX).unwrap(),
            Packet::Publish(publish)
        );
        assert!(stream.is_empty());
    }

    #[test]
    fn qos1_retained_fixture() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "/root/sec".into(),
            pkid: 0xABCD,
            payload: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };

        let mut buffer = Vec::new();
        Packet::Publish(publish).write(&mut buffer).unwrap();

        #[rustfmt::skip]
        let expected = [
            0x33, 0x12,
            0x00, 0x09, b'/', b'r', b'o', b'o', b't', b'/', b's', b'e', b'c',
            0xAB, 0xCD,
            0x01, 0x02, 0x03, 0x04, 0x05,
        ];
        assert_eq!(buffer, expected);
    }

    #[test]
    fn roundtrips() {
        roundtrip(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".into(),
            pkid: 0,
            payload: Bytes::new(),
        });

        roundtrip(Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "a/b/c".into(),
            pkid: 1,
            payload: Bytes::from_static(b"payload bytes"),
        });
    }

    #[test]
    fn rejects_dup_on_qos0() {
        // DUP bit set with QoS 0 flags.
        #[rustfmt::skip]
        let bytes = [0x38u8, 0x04, 0x00, 0x01, b't', 0xFF];
        let mut stream = BytesMut::from(&bytes[..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        ));
    }

    #[test]
    fn rejects_qos3() {
        #[rustfmt::skip]
        let bytes = [0x36u8, 0x06, 0x00, 0x01, b't', 0x00, 0x01, 0xFF];
        let mut stream = BytesMut::from(&bytes[..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::InvalidQoS(3))
        ));
    }

    #[test]
    fn rejects_zero_packet_id() {
        #[rustfmt::skip]
        let bytes = [0x32u8, 0x05, 0x00, 0x01, b't', 0x00, 0x00];
        let mut stream = BytesMut::from(&bytes[..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        ));
    }

    #[test]
    fn rejects_topic_longer_than_frame() {
        // Declared topic length runs past the remaining length.
        #[rustfmt::skip]
        let bytes = [0x30u8, 0x03, 0x00, 0x09, b'x'];
        let mut stream = BytesMut::from(&bytes[..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        ));
    }
}
