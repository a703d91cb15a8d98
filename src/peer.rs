use crc::{Crc, CRC_16_IBM_SDLC};

use crate::endpoint::Endpoint;

const PEERID_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// The 16 bit hash of a peer id as it is transmitted in package headers. Collisions are expected
///  and are disambiguated by session ids.
pub fn peerid_hash(peerid: &str) -> u16 {
    PEERID_CRC.checksum(peerid.as_bytes())
}

/// A peer as known to the peer finder: its id and the endpoints it can (possibly) be reached at
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerInfo {
    pub peerid: String,
    pub endpoints: Vec<Endpoint>,
}

impl PeerInfo {
    pub fn new(peerid: impl Into<String>, endpoints: Vec<Endpoint>) -> PeerInfo {
        PeerInfo {
            peerid: peerid.into(),
            endpoints,
        }
    }
}
