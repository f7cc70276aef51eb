use bytes::{Buf, BufMut, Bytes};

use super::{
    len_of_string, qos, read_mqtt_string, read_u16, read_u8, write_mqtt_string,
    write_remaining_length, Error, FixedHeader, QoS,
};

/// Subscription request [MQTT-3.8]. Must carry at least one filter
/// [MQTT-3.8.3-3].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

fn len(subscribe: &Subscribe) -> usize {
    2 + subscribe
        .filters
        .iter()
        .map(|filter| len_of_string(&filter.path) + 1)
        .sum::<usize>()
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Subscribe, Error> {
    // SUBSCRIBE shares PUBREL's mandatory flag bits [MQTT-3.8.1-1].
    if fixed_header.flags() != 0b0010 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;

    let mut filters = Vec::new();
    while bytes.has_remaining() {
        let path = read_mqtt_string(&mut bytes)?;
        let options = read_u8(&mut bytes)?;

        // The upper six bits of the options byte are reserved [MQTT-3.8.3-4].
        if options & 0b1111_1100 != 0 {
            return Err(Error::MalformedPacket);
        }

        filters.push(SubscribeFilter {
            path,
            qos: qos(options)?,
        });
    }

    if filters.is_empty() {
        return Err(Error::MalformedPacket);
    }

    Ok(Subscribe { pkid, filters })
}

pub fn write(subscribe: &Subscribe, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    if subscribe.filters.is_empty() {
        return Err(Error::MalformedPacket);
    }

    let remaining_len = len(subscribe);

    buffer.put_u8(0x82);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    buffer.put_u16(subscribe.pkid);
    for filter in &subscribe.filters {
        write_mqtt_string(buffer, &filter.path)?;
        buffer.put_u8(filter.qos as u8);
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::protocol::Packet;

    #[test]
    fn single_filter_fixture() {
        let subscribe = Subscribe {
            pkid: 0xABCD,
            filters: vec![SubscribeFilter {
                path: "/root/*".into(),
                qos: QoS::ExactlyOnce,
            }],
        };

        let mut buffer = Vec::new();
        Packet::Subscribe(subscribe).write(&mut buffer).unwrap();

        #[rustfmt::skip]
        let expected = [
            0x82, 0x0C,
            0xAB, 0xCD,
            0x00, 0x07, b'/', b'r', b'o', b'o', b't', b'/', b'*',
            0x02,
        ];
        assert_eq!(buffer, expected);
    }

    #[test]
    fn roundtrips() {
        let subscribe = Subscribe {
            pkid: 7,
            filters: vec![
                SubscribeFilter {
                    path: "a/b".into(),
                    qos: QoS::AtMostOnce,
                },
                SubscribeFilter {
                    path: "c/#".into(),
                    qos: QoS::AtLeastOnce,
                },
            ],
        };

        let mut buffer = Vec::new();
        Packet::Subscribe(subscribe.clone()).write(&mut buffer).unwrap();

        let mut stream = BytesMut::from(&buffer[..]);
        assert_eq!(
            Packet::read(&mut stream, usize::MAX).unwrap(),
            Packet::Subscribe(subscribe)
        );
    }

    #[test]
    fn rejects_empty_filter_list() {
        let subscribe = Subscribe {
            pkid: 1,
            filters: vec![],
        };
        let mut buffer = Vec::new();
        assert!(Packet::Subscribe(subscribe).write(&mut buffer).is_err());

        // On the wire: just a packet identifier and no filters.
        let mut stream = BytesMut::from(&[0x82u8, 0x02, 0x00, 0x01][..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        ));
    }

    #[test]
    fn rejects_bad_flags_and_options() {
        // Missing the mandatory 0b0010 flags.
        let mut stream = BytesMut::from(&[0x80u8, 0x06, 0x00, 0x01, 0x00, 0x01, b't', 0x00][..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        ));

        // Reserved bits in the options byte.
        let mut stream = BytesMut::from(&[0x82u8, 0x06, 0x00, 0x01, 0x00, 0x01, b't', 0x84][..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        ));

        // Requested QoS 3.
        let mut stream = BytesMut::from(&[0x82u8, 0x06, 0x00, 0x01, 0x00, 0x01, b't', 0x03][..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::InvalidQoS(3))
        ));
    }
}
