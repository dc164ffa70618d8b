//! Wire format serialization and deserialization.
//!
//! Every dlarp message is a single fixed-size header in network byte order:
//!
//! ```text
//! type (1) || seq_no (4) || request_id (4) || src (4) || dst (4)
//! || hop_count (1) || metric (8, IEEE-754 double)
//!
//! type:
//! - 1: Hello
//! - 2: RouteRequest
//! - 3: RouteReply
//! - 4: Agreement (hop_count 0 = proposal, 1 = vote)
//! ```
//!
//! Decoding only requires the first [`HEADER_SIZE`] bytes. Trailing bytes are
//! ignored so that a future header extension stays readable by older nodes.

use alloc::vec::Vec;
use core::net::Ipv4Addr;

use crate::types::{Address, RequestId, HEADER_SIZE};

/// Decoding error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of buffer: needed {needed} bytes, {available} available")]
    UnexpectedEof { needed: usize, available: usize },

    #[error("invalid message type {0}")]
    InvalidMessageType(u8),
}

/// Cursor over a borrowed byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the number of bytes remaining.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let slice = self.buf.get(self.pos..end).ok_or(DecodeError::UnexpectedEof {
            needed: N,
            available: self.remaining(),
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_u32_be(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    pub fn read_f64_be(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_be_bytes(self.take()?))
    }

    pub fn read_addr(&mut self) -> Result<Address, DecodeError> {
        Ok(Ipv4Addr::from(self.take::<4>()?))
    }
}

/// Growable output buffer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32_be(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_f64_be(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_addr(&mut self, addr: Address) {
        self.buf.extend_from_slice(&addr.octets());
    }

    /// Consume the writer and return the bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Trait for types that can be encoded to wire format.
pub trait Encode {
    fn encode(&self, w: &mut Writer);

    /// Encode and return the bytes.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(HEADER_SIZE);
        self.encode(&mut w);
        w.finish()
    }
}

/// Trait for types that can be decoded from wire format.
pub trait Decode: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decode from the start of a byte slice.
    fn decode_from_slice(data: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(&mut Reader::new(data))
    }
}

/// Message type tag, the first header byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    RouteRequest = 2,
    RouteReply = 3,
    Agreement = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(MessageType::Hello),
            2 => Ok(MessageType::RouteRequest),
            3 => Ok(MessageType::RouteReply),
            4 => Ok(MessageType::Agreement),
            other => Err(DecodeError::InvalidMessageType(other)),
        }
    }
}

/// Agreement phase carried in the hop count byte of an Agreement message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgreementPhase {
    Proposal,
    Vote,
}

/// A decoded dlarp control message.
///
/// Field meaning per type:
///
/// | type | src | dst | metric |
/// |------|-----|-----|--------|
/// | Hello | sender interface | unspecified (0.0.0.0) | 0 |
/// | RouteRequest | originator | target | accumulated cost so far |
/// | RouteReply | target | originator | accumulated cost so far |
/// | Agreement | candidate next hop | candidate destination | proposed or estimated cost |
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DlarpMessage {
    pub kind: MessageType,
    pub seq_no: u32,
    pub request_id: RequestId,
    pub src: Address,
    pub dst: Address,
    pub hop_count: u8,
    pub metric: f64,
}

impl DlarpMessage {
    pub fn hello(seq_no: u32, src: Address) -> Self {
        Self {
            kind: MessageType::Hello,
            seq_no,
            request_id: 0,
            src,
            dst: Ipv4Addr::UNSPECIFIED,
            hop_count: 0,
            metric: 0.0,
        }
    }

    pub fn route_request(
        seq_no: u32,
        request_id: RequestId,
        originator: Address,
        target: Address,
    ) -> Self {
        Self {
            kind: MessageType::RouteRequest,
            seq_no,
            request_id,
            src: originator,
            dst: target,
            hop_count: 0,
            metric: 0.0,
        }
    }

    /// A reply for `target`, sent back toward `originator`.
    pub fn route_reply(
        seq_no: u32,
        request_id: RequestId,
        target: Address,
        originator: Address,
        hop_count: u8,
        metric: f64,
    ) -> Self {
        Self {
            kind: MessageType::RouteReply,
            seq_no,
            request_id,
            src: target,
            dst: originator,
            hop_count,
            metric,
        }
    }

    pub fn agreement_proposal(
        seq_no: u32,
        request_id: RequestId,
        via: Address,
        destination: Address,
        metric: f64,
    ) -> Self {
        Self {
            kind: MessageType::Agreement,
            seq_no,
            request_id,
            src: via,
            dst: destination,
            hop_count: 0,
            metric,
        }
    }

    pub fn agreement_vote(
        seq_no: u32,
        request_id: RequestId,
        via: Address,
        destination: Address,
        estimate: f64,
    ) -> Self {
        Self {
            kind: MessageType::Agreement,
            seq_no,
            request_id,
            src: via,
            dst: destination,
            hop_count: 1,
            metric: estimate,
        }
    }

    /// Phase of an Agreement message, `None` for other types.
    pub fn agreement_phase(&self) -> Option<AgreementPhase> {
        match (self.kind, self.hop_count) {
            (MessageType::Agreement, 0) => Some(AgreementPhase::Proposal),
            (MessageType::Agreement, _) => Some(AgreementPhase::Vote),
            _ => None,
        }
    }

    /// Copy of this message after one more hop costing `link_cost`.
    pub fn relayed(&self, link_cost: f64) -> Self {
        Self {
            hop_count: self.hop_count.saturating_add(1),
            metric: self.metric + link_cost,
            ..*self
        }
    }
}

impl Encode for DlarpMessage {
    fn encode(&self, w: &mut Writer) {
        w.write_u8(self.kind as u8);
        w.write_u32_be(self.seq_no);
        w.write_u32_be(self.request_id);
        w.write_addr(self.src);
        w.write_addr(self.dst);
        w.write_u8(self.hop_count);
        w.write_f64_be(self.metric);
    }
}

impl Decode for DlarpMessage {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        if r.remaining() < HEADER_SIZE {
            return Err(DecodeError::UnexpectedEof {
                needed: HEADER_SIZE,
                available: r.remaining(),
            });
        }
        let kind = MessageType::try_from(r.read_u8()?)?;
        Ok(Self {
            kind,
            seq_no: r.read_u32_be()?,
            request_id: r.read_u32_be()?,
            src: r.read_addr()?,
            dst: r.read_addr()?,
            hop_count: r.read_u8()?,
            metric: r.read_f64_be()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    fn addr(last: u8) -> Address {
        Ipv4Addr::new(10, 1, 1, last)
    }

    #[test]
    fn test_header_layout() {
        let msg = DlarpMessage::route_request(0x0102_0304, 7, addr(1), addr(3));
        let bytes = msg.encode_to_vec();

        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..5], &[1, 2, 3, 4]);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 7]);
        assert_eq!(&bytes[9..13], &[10, 1, 1, 1]);
        assert_eq!(&bytes[13..17], &[10, 1, 1, 3]);
        assert_eq!(bytes[17], 0);
        assert_eq!(&bytes[18..26], &0.0f64.to_be_bytes());
    }

    #[test]
    fn test_hello_has_zero_request_and_dst() {
        let hello = DlarpMessage::hello(5, addr(2));
        let decoded = DlarpMessage::decode_from_slice(&hello.encode_to_vec()).unwrap();
        assert_eq!(decoded.request_id, 0);
        assert_eq!(decoded.dst, Ipv4Addr::UNSPECIFIED);
        assert_eq!(decoded, hello);
    }

    #[test]
    fn test_short_buffer_is_malformed() {
        let err = DlarpMessage::decode_from_slice(&[1, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnexpectedEof {
                needed: HEADER_SIZE,
                available: 3
            }
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        for tag in [0u8, 5, 255] {
            let mut bytes = DlarpMessage::hello(1, addr(1)).encode_to_vec();
            bytes[0] = tag;
            assert_eq!(
                DlarpMessage::decode_from_slice(&bytes),
                Err(DecodeError::InvalidMessageType(tag))
            );
        }
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let msg = DlarpMessage::agreement_vote(9, 4, addr(2), addr(3), 2.0);
        let mut bytes = msg.encode_to_vec();
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(DlarpMessage::decode_from_slice(&bytes), Ok(msg));
    }

    #[test]
    fn test_agreement_phase() {
        let proposal = DlarpMessage::agreement_proposal(1, 1, addr(2), addr(3), 2.0);
        let vote = DlarpMessage::agreement_vote(1, 1, addr(2), addr(3), 2.0);
        assert_eq!(proposal.agreement_phase(), Some(AgreementPhase::Proposal));
        assert_eq!(vote.agreement_phase(), Some(AgreementPhase::Vote));
        assert_eq!(DlarpMessage::hello(1, addr(1)).agreement_phase(), None);
    }

    #[test]
    fn test_relayed_accumulates() {
        let rreq = DlarpMessage::route_request(3, 1, addr(1), addr(9));
        let hop1 = rreq.relayed(1.0);
        let hop2 = hop1.relayed(2.5);
        assert_eq!(hop2.hop_count, 2);
        assert_eq!(hop2.metric, 3.5);
        assert_eq!(hop2.seq_no, 3);
        assert_eq!(hop2.src, addr(1));
    }

    #[test]
    fn test_reader_eof_reports_sizes() {
        let mut r = Reader::new(&[0u8; 2]);
        assert_eq!(
            r.read_u32_be(),
            Err(DecodeError::UnexpectedEof {
                needed: 4,
                available: 2
            })
        );
        let buf = vec![0u8; 4];
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_addr(), Ok(Ipv4Addr::UNSPECIFIED));
        assert_eq!(r.remaining(), 0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_addr() -> impl Strategy<Value = Address> {
            any::<u32>().prop_map(Ipv4Addr::from)
        }

        fn arb_metric() -> impl Strategy<Value = f64> {
            0.0f64..1.0e9
        }

        fn arb_message() -> impl Strategy<Value = DlarpMessage> {
            prop_oneof![
                (any::<u32>(), arb_addr()).prop_map(|(seq, src)| DlarpMessage::hello(seq, src)),
                (any::<u32>(), any::<u32>(), arb_addr(), arb_addr(), any::<u8>(), arb_metric())
                    .prop_map(|(seq, id, src, dst, hops, metric)| DlarpMessage {
                        hop_count: hops,
                        metric,
                        ..DlarpMessage::route_request(seq, id, src, dst)
                    }),
                (any::<u32>(), any::<u32>(), arb_addr(), arb_addr(), any::<u8>(), arb_metric())
                    .prop_map(|(seq, id, src, dst, hops, metric)| {
                        DlarpMessage::route_reply(seq, id, src, dst, hops, metric)
                    }),
                (any::<u32>(), any::<u32>(), arb_addr(), arb_addr(), any::<bool>(), arb_metric())
                    .prop_map(|(seq, id, via, dst, vote, metric)| if vote {
                        DlarpMessage::agreement_vote(seq, id, via, dst, metric)
                    } else {
                        DlarpMessage::agreement_proposal(seq, id, via, dst, metric)
                    }),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            #[test]
            fn roundtrip(msg in arb_message()) {
                let bytes = msg.encode_to_vec();
                prop_assert_eq!(bytes.len(), HEADER_SIZE);
                prop_assert_eq!(DlarpMessage::decode_from_slice(&bytes), Ok(msg));
            }

            #[test]
            fn arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..64)) {
                match DlarpMessage::decode_from_slice(&data) {
                    Ok(_) => prop_assert!(data.len() >= HEADER_SIZE && (1..=4).contains(&data[0])),
                    Err(DecodeError::UnexpectedEof { .. }) => prop_assert!(data.len() < HEADER_SIZE),
                    Err(DecodeError::InvalidMessageType(tag)) => prop_assert_eq!(tag, data[0]),
                }
            }
        }
    }
}
