use bytes::{Buf, BufMut, Bytes};

use super::{
    len_of_string, read_mqtt_string, read_u16, write_mqtt_string, write_remaining_length, Error,
    FixedHeader,
};

/// Unsubscription request [MQTT-3.10]. Must carry at least one filter
/// [MQTT-3.10.3-2].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub filters: Vec<String>,
}

fn len(unsubscribe: &Unsubscribe) -> usize {
    2 + unsubscribe
        .filters
        .iter()
        .map(|filter| len_of_string(filter))
        .sum::<usize>()
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Unsubscribe, Error> {
    // Same mandatory flag bits as SUBSCRIBE [MQTT-3.10.1-1].
    if fixed_header.flags() != 0b0010 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;

    let mut filters = Vec::new();
    while bytes.has_remaining() {
        filters.push(read_mqtt_string(&mut bytes)?);
    }

    if filters.is_empty() {
        return Err(Error::MalformedPacket);
    }

    Ok(Unsubscribe { pkid, filters })
}

pub fn write(unsubscribe: &Unsubscribe, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    if unsubscribe.filters.is_empty() {
        return Err(Error::MalformedPacket);
    }

    let remaining_len = len(unsubscribe);

    buffer.put_u8(0xA2);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    buffer.put_u16(unsubscribe.pkid);
    for filter in &unsubscribe.filters {
        write_mqtt_string(buffer, filter)?;
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::protocol::Packet;

    #[test]
    fn roundtrips() {
        let unsubscribe = Unsubscribe {
            pkid: 0x1234,
            filters: vec!["a/b".into(), "c/d/e".into()],
        };

        let mut buffer = Vec::new();
        Packet::Unsubscribe(unsubscribe.clone())
            .write(&mut buffer)
            .unwrap();

        let mut stream = BytesMut::from(&buffer[..]);
        assert_eq!(
            Packet::read(&mut stream, usize::MAX).unwrap(),
            Packet::Unsubscribe(unsubscribe)
        );
        assert!(stream.is_empty());
    }

    #[test]
    fn rejects_empty_filter_list() {
        let mut buffer = Vec::new();
        let unsubscribe = Unsubscribe {
            pkid: 1,
            filters: vec![],
        };
        assert!(Packet::Unsubscribe(unsubscribe).write(&mut buffer).is_err());

        let mut stream = BytesMut::from(&[0xA2u8, 0x02, 0x00, 0x01][..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        ));
    }

    #[test]
    fn rejects_missing_mandatory_flags() {
        let mut stream = BytesMut::from(&[0xA0u8, 0x05, 0x00, 0x01, 0x00, 0x01, b't'][..]);
        assert!(matches!(
            Packet::read(&mut stream, usize::MAX),
            Err(Error::MalformedPacket)
        ));
    }
}
