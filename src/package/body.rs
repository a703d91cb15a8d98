use std::str::FromStr;

use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::endpoint::Endpoint;
use crate::error::{BdtError, BdtResult};

/// The structured part of a package. On the wire this is a sequence of TLV entries
///  (`tag: u8, len: varint, value`), written in tag order and only for fields that are present.
///  Unknown tags are skipped on decode, so newer peers can add fields.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PackageBody {
    pub src_peerid: Option<String>,
    pub dest_peerid: Option<String>,
    /// endpoints the sender can be reached at, or (in SN replies) the endpoints of the called peer
    pub endpoints: Vec<Endpoint>,
    /// sender's wall clock in millis
    pub timestamp: Option<u64>,
    /// the sender's own session id, used in handshake replies
    pub session_id: Option<u32>,
    pub sn_peerid: Option<String>,
    pub reason: Option<u32>,
}

impl PackageBody {
    const TAG_SRC_PEERID: u8 = 1;
    const TAG_DEST_PEERID: u8 = 2;
    const TAG_ENDPOINTS: u8 = 3;
    const TAG_TIMESTAMP: u8 = 4;
    const TAG_SESSION_ID: u8 = 5;
    const TAG_SN_PEERID: u8 = 6;
    const TAG_REASON: u8 = 7;

    pub fn is_empty(&self) -> bool {
        self == &PackageBody::default()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        if let Some(s) = &self.src_peerid {
            put_entry(buf, Self::TAG_SRC_PEERID, s.as_bytes());
        }
        if let Some(s) = &self.dest_peerid {
            put_entry(buf, Self::TAG_DEST_PEERID, s.as_bytes());
        }
        if !self.endpoints.is_empty() {
            let mut value = Vec::new();
            value.put_usize_varint(self.endpoints.len());
            for endpoint in &self.endpoints {
                let key = endpoint.to_string();
                value.put_usize_varint(key.len());
                value.put_slice(key.as_bytes());
            }
            put_entry(buf, Self::TAG_ENDPOINTS, &value);
        }
        if let Some(timestamp) = self.timestamp {
            let mut value = Vec::new();
            value.put_u64_varint(timestamp);
            put_entry(buf, Self::TAG_TIMESTAMP, &value);
        }
        if let Some(session_id) = self.session_id {
            let mut value = Vec::new();
            value.put_u32_varint(session_id);
            put_entry(buf, Self::TAG_SESSION_ID, &value);
        }
        if let Some(s) = &self.sn_peerid {
            put_entry(buf, Self::TAG_SN_PEERID, s.as_bytes());
        }
        if let Some(reason) = self.reason {
            let mut value = Vec::new();
            value.put_u32_varint(reason);
            put_entry(buf, Self::TAG_REASON, &value);
        }
    }

    pub fn deser(mut buf: &[u8]) -> BdtResult<PackageBody> {
        let mut result = PackageBody::default();

        while buf.has_remaining() {
            let tag = buf.try_get_u8().map_err(|_| BdtError::InvalidPackage)?;
            let len = buf.try_get_usize_varint().map_err(|_| BdtError::InvalidPackage)?;
            if buf.remaining() < len {
                return Err(BdtError::InvalidPackage);
            }
            let mut value = &buf[..len];
            buf.advance(len);

            match tag {
                Self::TAG_SRC_PEERID => result.src_peerid = Some(to_string(value)?),
                Self::TAG_DEST_PEERID => result.dest_peerid = Some(to_string(value)?),
                Self::TAG_ENDPOINTS => {
                    let num = value.try_get_usize_varint().map_err(|_| BdtError::InvalidPackage)?;
                    for _ in 0..num {
                        let key_len = value.try_get_usize_varint().map_err(|_| BdtError::InvalidPackage)?;
                        if value.remaining() < key_len {
                            return Err(BdtError::InvalidPackage);
                        }
                        let key = to_string(&value[..key_len])?;
                        value.advance(key_len);
                        result.endpoints.push(Endpoint::from_str(&key).map_err(|_| BdtError::InvalidPackage)?);
                    }
                }
                Self::TAG_TIMESTAMP => result.timestamp = Some(value.try_get_u64_varint().map_err(|_| BdtError::InvalidPackage)?),
                Self::TAG_SESSION_ID => result.session_id = Some(value.try_get_u32_varint().map_err(|_| BdtError::InvalidPackage)?),
                Self::TAG_SN_PEERID => result.sn_peerid = Some(to_string(value)?),
                Self::TAG_REASON => result.reason = Some(value.try_get_u32_varint().map_err(|_| BdtError::InvalidPackage)?),
                _ => {
                    // forward compatibility: entries we don't know are skipped
                }
            }
        }

        Ok(result)
    }
}

fn put_entry(buf: &mut impl BufMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_usize_varint(value.len());
    buf.put_slice(value);
}

fn to_string(value: &[u8]) -> BdtResult<String> {
    String::from_utf8(value.to_vec())
        .map_err(|_| BdtError::InvalidPackage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::SocketAddr;

    fn full_body() -> PackageBody {
        PackageBody {
            src_peerid: Some("peer-a".to_string()),
            dest_peerid: Some("peer-b".to_string()),
            endpoints: vec![
                Endpoint::udp(SocketAddr::from(([1,2,3,4], 5000))),
                Endpoint::tcp(SocketAddr::from(([5,6,7,8], 80))),
            ],
            timestamp: Some(1_700_000_000_000),
            session_id: Some(0xdead_beef),
            sn_peerid: Some("sn".to_string()),
            reason: Some(3),
        }
    }

    #[rstest]
    #[case::empty(PackageBody::default())]
    #[case::peerids_only(PackageBody { src_peerid: Some("a".to_string()), dest_peerid: Some("b".to_string()), ..Default::default() })]
    #[case::full(full_body())]
    fn test_ser_deser(#[case] body: PackageBody) {
        let mut buf = Vec::new();
        body.ser(&mut buf);
        assert_eq!(PackageBody::deser(&buf), Ok(body));
    }

    #[test]
    fn test_empty_body_has_no_bytes() {
        let mut buf = Vec::new();
        PackageBody::default().ser(&mut buf);
        assert!(buf.is_empty());
        assert!(PackageBody::default().is_empty());
        assert!(!full_body().is_empty());
    }

    #[test]
    fn test_skips_unknown_tags() {
        let mut buf = vec![99, 3, 1, 2, 3];
        PackageBody { reason: Some(7), ..Default::default() }.ser(&mut buf);
        assert_eq!(PackageBody::deser(&buf), Ok(PackageBody { reason: Some(7), ..Default::default() }));
    }

    #[rstest]
    #[case::truncated_len(vec![1])]
    #[case::value_too_short(vec![1, 5, b'a'])]
    #[case::invalid_utf8(vec![1, 2, 0xff, 0xfe])]
    #[case::invalid_endpoint(vec![3, 3, 1, 1, b'x'])]
    fn test_deser_invalid(#[case] buf: Vec<u8>) {
        assert_eq!(PackageBody::deser(&buf), Err(BdtError::InvalidPackage));
    }
}
