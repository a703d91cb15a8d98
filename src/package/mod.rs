mod body;

pub use body::PackageBody;

use std::fmt::{Debug, Formatter};

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{BdtError, BdtResult};
use crate::sequence::SeqNum;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum CommandType {
    CallReq = 0x10,
    CallResp = 0x11,
    PingReq = 0x12,
    PingResp = 0x13,
    CalledReq = 0x14,
    CalledResp = 0x15,
    Sn2SnReq = 0x16,
    Sn2SnResp = 0x17,

    Syn = 0x20,
    SynAck = 0x21,
    SynAckAck = 0x22,

    Data = 0x30,
    Heartbeat = 0x32,
    HeartbeatResp = 0x33,
    Fin = 0x34,
}

impl CommandType {
    /// handshake requests that are routed by destination vport rather than by session id
    pub fn is_handshake_request(&self) -> bool {
        matches!(self, CommandType::Syn | CommandType::CalledReq)
    }

    /// commands that belong to the rendezvous protocol and are not handled by connections
    pub fn is_rendezvous(&self) -> bool {
        matches!(self,
            CommandType::PingReq | CommandType::PingResp | CommandType::Sn2SnReq | CommandType::Sn2SnResp
        )
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PackageFlags: u16 {
        /// the package travels on a TCP path
        const TCP       = 0x1;
        /// an ack re-sent because the peer went quiet
        const FINAL_ACK = 0x2;
        /// the data tail holds SACK ranges instead of payload
        const SACK      = 0x4;
        /// the package is a retransmission
        const RESEND    = 0x8;
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PackageHeader {
    pub cmd_type: CommandType,
    pub flags: PackageFlags,
    pub src_vport: u16,
    pub dest_vport: u16,
    pub src_peerid_hash: u16,
    pub dest_peerid_hash: u16,
    pub seq: SeqNum,
    /// cumulative ack: the next sequence number the sender expects from the receiver
    pub ack_seq: SeqNum,
    pub window_size: u16,
    pub session_id: u32,
}

/// Length fields of a decoded header
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderLengths {
    pub total: u16,
    pub header: u8,
    pub body: u16,
}

impl PackageHeader {
    pub const MAGIC: u16 = 0x8083;
    pub const VERSION: u16 = 0x102;
    pub const SERIALIZED_LEN: usize = 35;

    pub fn new(cmd_type: CommandType) -> PackageHeader {
        PackageHeader {
            cmd_type,
            flags: PackageFlags::empty(),
            src_vport: 0,
            dest_vport: 0,
            src_peerid_hash: 0,
            dest_peerid_hash: 0,
            seq: SeqNum::ZERO,
            ack_seq: SeqNum::ZERO,
            window_size: 0,
            session_id: 0,
        }
    }

    fn ser(&self, lengths: HeaderLengths, buf: &mut impl BufMut) {
        buf.put_u16_le(Self::MAGIC);
        buf.put_u16_le(Self::VERSION);
        buf.put_u16_le(self.cmd_type.into());
        buf.put_u16_le(lengths.total);
        buf.put_u8(lengths.header);
        buf.put_u16_le(self.flags.bits());
        buf.put_u16_le(lengths.body);
        buf.put_u16_le(self.src_vport);
        buf.put_u16_le(self.dest_vport);
        buf.put_u16_le(self.src_peerid_hash);
        buf.put_u16_le(self.dest_peerid_hash);
        buf.put_u32_le(self.seq.to_raw());
        buf.put_u32_le(self.ack_seq.to_raw());
        buf.put_u16_le(self.window_size);
        buf.put_u32_le(self.session_id);
    }

    pub fn decode(buf: &[u8]) -> BdtResult<(PackageHeader, HeaderLengths)> {
        if buf.len() < Self::SERIALIZED_LEN {
            return Err(BdtError::OutOfSize);
        }
        let mut buf = buf;
        let available = buf.len();

        if buf.get_u16_le() != Self::MAGIC {
            return Err(BdtError::UnmatchPackage);
        }
        if buf.get_u16_le() != Self::VERSION {
            return Err(BdtError::NotSupportVersion);
        }
        let cmd_type = CommandType::try_from(buf.get_u16_le())
            .map_err(|_| BdtError::UnmatchPackage)?;

        let total = buf.get_u16_le();
        let header = buf.get_u8();
        let flags = PackageFlags::from_bits_truncate(buf.get_u16_le());
        let body = buf.get_u16_le();

        if available < total as usize {
            return Err(BdtError::OutOfSize);
        }
        if (header as usize) < Self::SERIALIZED_LEN || header as usize + body as usize > total as usize {
            return Err(BdtError::InvalidPackage);
        }

        let result = PackageHeader {
            cmd_type,
            flags,
            src_vport: buf.get_u16_le(),
            dest_vport: buf.get_u16_le(),
            src_peerid_hash: buf.get_u16_le(),
            dest_peerid_hash: buf.get_u16_le(),
            seq: SeqNum::from_raw(buf.get_u32_le()),
            ack_seq: SeqNum::from_raw(buf.get_u32_le()),
            window_size: buf.get_u16_le(),
            session_id: buf.get_u32_le(),
        };
        Ok((result, HeaderLengths { total, header, body }))
    }
}

/// A half-open range `[from, to)` of sequence numbers acknowledged out of order
pub type SackRange = (SeqNum, SeqNum);

/// A package as it travels on the wire: fixed header, structured body and raw data tail.
///
/// Encoding is memoized: [Package::encode] serializes once and returns the cached buffer
///  afterwards. Code changing a package after it was encoded (e.g. setting the resend flag or a
///  fresh ack before a retransmission) must call [Package::invalidate].
#[derive(Clone)]
pub struct Package {
    pub header: PackageHeader,
    pub body: PackageBody,
    pub data: Bytes,
    encoded: Option<Bytes>,
}

impl Debug for Package {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PKG{{{:?} {:?} seq={:?} ack={:?} sid={} data={}}}",
               self.header.cmd_type, self.header.flags, self.header.seq, self.header.ack_seq, self.header.session_id, self.data.len())
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.body == other.body && self.data == other.data
    }
}
impl Eq for Package {}

impl Package {
    pub fn new(header: PackageHeader) -> Package {
        Package {
            header,
            body: PackageBody::default(),
            data: Bytes::new(),
            encoded: None,
        }
    }

    pub fn cmd_type(&self) -> CommandType {
        self.header.cmd_type
    }

    /// `true` if the data tail is payload (as opposed to SACK ranges) and not empty
    pub fn has_payload(&self) -> bool {
        !self.data.is_empty() && !self.header.flags.contains(PackageFlags::SACK)
    }

    /// The last sequence unit occupied by this package: every payload byte takes one unit
    pub fn ack_seq(&self) -> SeqNum {
        if self.has_payload() {
            self.header.seq + self.data.len() as u32
        }
        else {
            self.header.seq
        }
    }

    /// The first sequence number after this package. The extra unit means that every package,
    ///  including empty control packages, can be acknowledged unambiguously.
    pub fn next_seq(&self) -> SeqNum {
        self.ack_seq() + 1
    }

    pub fn invalidate(&mut self) {
        self.encoded = None;
    }

    pub fn encode(&mut self) -> BdtResult<Bytes> {
        if let Some(encoded) = &self.encoded {
            return Ok(encoded.clone());
        }

        let mut body_buf = BytesMut::new();
        self.body.ser(&mut body_buf);

        let total = PackageHeader::SERIALIZED_LEN + body_buf.len() + self.data.len();
        if total > u16::MAX as usize {
            return Err(BdtError::OutOfSize);
        }
        let lengths = HeaderLengths {
            total: total as u16,
            header: PackageHeader::SERIALIZED_LEN as u8,
            body: body_buf.len() as u16,
        };

        let mut buf = BytesMut::with_capacity(total);
        self.header.ser(lengths, &mut buf);
        buf.put_slice(&body_buf);
        buf.put_slice(&self.data);

        let encoded = buf.freeze();
        self.encoded = Some(encoded.clone());
        Ok(encoded)
    }

    /// Decodes a single package that spans the entire buffer
    pub fn decode(buf: &[u8]) -> BdtResult<Package> {
        let (header, lengths) = PackageHeader::decode(buf)?;
        if buf.len() != lengths.total as usize {
            return Err(BdtError::InvalidPackage);
        }

        let body_start = lengths.header as usize;
        let body_end = body_start + lengths.body as usize;
        let body = PackageBody::deser(&buf[body_start..body_end])?;
        let data = Bytes::copy_from_slice(&buf[body_end..]);

        Ok(Package {
            header,
            body,
            data,
            encoded: Some(Bytes::copy_from_slice(buf)),
        })
    }

    pub fn set_sack_ranges(&mut self, ranges: &[SackRange]) {
        let mut buf = BytesMut::with_capacity(ranges.len() * 8);
        for (from, to) in ranges {
            buf.put_u32_le(from.to_raw());
            buf.put_u32_le(to.to_raw());
        }
        self.data = buf.freeze();
        self.header.flags.insert(PackageFlags::SACK);
        self.invalidate();
    }

    /// SACK ranges carried in the data tail, empty if the SACK flag is not set. A trailing
    ///  partial range is ignored.
    pub fn sack_ranges(&self) -> Vec<SackRange> {
        if !self.header.flags.contains(PackageFlags::SACK) {
            return Vec::new();
        }

        let mut buf = self.data.as_ref();
        let mut result = Vec::with_capacity(buf.len() / 8);
        while buf.remaining() >= 8 {
            let from = SeqNum::from_raw(buf.get_u32_le());
            let to = SeqNum::from_raw(buf.get_u32_le());
            result.push((from, to));
        }
        result
    }
}
