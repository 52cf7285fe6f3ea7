//! Wire message types and the frame codec.
//!
//! Envelope layout: magic (4) | command (12, zero-padded) | payload length
//! (4, LE) | checksum (4, leading bytes of double-SHA256 of the payload) |
//! payload. Integers are little-endian; collection lengths use the
//! compact-size encoding; hashes travel in wire order, which is the reverse
//! of the hex the RPC interface prints.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::error::P2pError;

/// Upper bound on a single payload. The largest message the harness ever
/// receives is a cfilter batch element, far below this.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

const HEADER_SIZE: usize = 24;
const BLS_SIG_SIZE: usize = 96;

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// A 256-bit hash in wire byte order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Parse the hex form the RPC interface prints (reversed byte order).
    pub fn from_rpc_hex(s: &str) -> Result<Self, P2pError> {
        let raw = hex::decode(s).map_err(|_| P2pError::Malformed("hash hex"))?;
        let mut bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| P2pError::Malformed("hash length"))?;
        bytes.reverse();
        Ok(Hash256(bytes))
    }

    /// Render as the RPC hex form (reversed byte order).
    pub fn to_rpc_hex(&self) -> String {
        let mut bytes = self.0;
        bytes.reverse();
        hex::encode(bytes)
    }
}

impl std::fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash256({})", self.to_rpc_hex())
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_rpc_hex())
    }
}

/// A transaction outpoint (txid + output index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.txid.0);
        buf.put_u32_le(self.vout);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, P2pError> {
        let txid = get_hash(buf)?;
        need(buf, 4, "outpoint vout")?;
        Ok(OutPoint {
            txid,
            vout: buf.get_u32_le(),
        })
    }
}

/// The `version` handshake message (fields the harness cares about).
#[derive(Debug, Clone)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
}

/// A `cfilter` response element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CFilterMessage {
    pub filter_type: u8,
    pub block_hash: Hash256,
    pub filter: Vec<u8>,
}

/// A `cfheaders` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CFHeadersMessage {
    pub filter_type: u8,
    pub stop_hash: Hash256,
    pub prev_header: Hash256,
    pub hashes: Vec<Hash256>,
}

/// A `cfcheckpt` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CFCheckptMessage {
    pub filter_type: u8,
    pub stop_hash: Hash256,
    pub headers: Vec<Hash256>,
}

/// An InstantSend lock: quorum signature over a transaction's input set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsLockMessage {
    pub inputs: Vec<OutPoint>,
    pub txid: Hash256,
    pub signature: [u8; BLS_SIG_SIZE],
}

/// A wire message. Commands outside the harness's working set decode to
/// [`Message::Unknown`].
#[derive(Debug, Clone)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetCFilters {
        filter_type: u8,
        start_height: u32,
        stop_hash: Hash256,
    },
    CFilter(CFilterMessage),
    GetCFHeaders {
        filter_type: u8,
        start_height: u32,
        stop_hash: Hash256,
    },
    CFHeaders(CFHeadersMessage),
    GetCFCheckpt {
        filter_type: u8,
        stop_hash: Hash256,
    },
    CFCheckpt(CFCheckptMessage),
    IsLock(IsLockMessage),
    Unknown {
        command: String,
        payload: Bytes,
    },
}

impl Message {
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetCFilters { .. } => "getcfilters",
            Message::CFilter(_) => "cfilter",
            Message::GetCFHeaders { .. } => "getcfheaders",
            Message::CFHeaders(_) => "cfheaders",
            Message::GetCFCheckpt { .. } => "getcfcheckpt",
            Message::CFCheckpt(_) => "cfcheckpt",
            Message::IsLock(_) => "islock",
            Message::Unknown { command, .. } => command,
        }
    }

    fn encode_payload(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Message::Version(v) => {
                buf.put_i32_le(v.version);
                buf.put_u64_le(v.services);
                buf.put_i64_le(v.timestamp);
                put_net_addr(&mut buf, 0);
                put_net_addr(&mut buf, v.services);
                buf.put_u64_le(v.nonce);
                put_var_bytes(&mut buf, v.user_agent.as_bytes());
                buf.put_i32_le(v.start_height);
                buf.put_u8(1); // relay
            }
            Message::Verack => {}
            Message::Ping(nonce) | Message::Pong(nonce) => buf.put_u64_le(*nonce),
            Message::GetCFilters {
                filter_type,
                start_height,
                stop_hash,
            }
            | Message::GetCFHeaders {
                filter_type,
                start_height,
                stop_hash,
            } => {
                buf.put_u8(*filter_type);
                buf.put_u32_le(*start_height);
                buf.put_slice(&stop_hash.0);
            }
            Message::GetCFCheckpt {
                filter_type,
                stop_hash,
            } => {
                buf.put_u8(*filter_type);
                buf.put_slice(&stop_hash.0);
            }
            Message::CFilter(m) => {
                buf.put_u8(m.filter_type);
                buf.put_slice(&m.block_hash.0);
                put_var_bytes(&mut buf, &m.filter);
            }
            Message::CFHeaders(m) => {
                buf.put_u8(m.filter_type);
                buf.put_slice(&m.stop_hash.0);
                buf.put_slice(&m.prev_header.0);
                put_var_int(&mut buf, m.hashes.len() as u64);
                for h in &m.hashes {
                    buf.put_slice(&h.0);
                }
            }
            Message::CFCheckpt(m) => {
                buf.put_u8(m.filter_type);
                buf.put_slice(&m.stop_hash.0);
                put_var_int(&mut buf, m.headers.len() as u64);
                for h in &m.headers {
                    buf.put_slice(&h.0);
                }
            }
            Message::IsLock(m) => {
                put_var_int(&mut buf, m.inputs.len() as u64);
                for input in &m.inputs {
                    input.encode(&mut buf);
                }
                buf.put_slice(&m.txid.0);
                buf.put_slice(&m.signature);
            }
            Message::Unknown { payload, .. } => buf.put_slice(payload),
        }
        buf
    }

    fn decode_payload(command: &str, mut payload: Bytes) -> Result<Message, P2pError> {
        let msg = match command {
            "version" => {
                need(&payload, 4 + 8 + 8, "version header")?;
                let version = payload.get_i32_le();
                let services = payload.get_u64_le();
                let timestamp = payload.get_i64_le();
                // addr_recv and addr_from, 26 bytes each, unused here.
                need(&payload, 52, "version addrs")?;
                payload.advance(52);
                need(&payload, 8, "version nonce")?;
                let nonce = payload.get_u64_le();
                let user_agent = String::from_utf8_lossy(&get_var_bytes(&mut payload)?).into_owned();
                need(&payload, 4, "version height")?;
                let start_height = payload.get_i32_le();
                Message::Version(VersionMessage {
                    version,
                    services,
                    timestamp,
                    nonce,
                    user_agent,
                    start_height,
                })
            }
            "verack" => Message::Verack,
            "ping" => {
                need(&payload, 8, "ping nonce")?;
                Message::Ping(payload.get_u64_le())
            }
            "pong" => {
                need(&payload, 8, "pong nonce")?;
                Message::Pong(payload.get_u64_le())
            }
            "getcfilters" | "getcfheaders" => {
                need(&payload, 5, "filter request")?;
                let filter_type = payload.get_u8();
                let start_height = payload.get_u32_le();
                let stop_hash = get_hash(&mut payload)?;
                if command == "getcfilters" {
                    Message::GetCFilters {
                        filter_type,
                        start_height,
                        stop_hash,
                    }
                } else {
                    Message::GetCFHeaders {
                        filter_type,
                        start_height,
                        stop_hash,
                    }
                }
            }
            "getcfcheckpt" => {
                need(&payload, 1, "cfcheckpt request")?;
                let filter_type = payload.get_u8();
                let stop_hash = get_hash(&mut payload)?;
                Message::GetCFCheckpt {
                    filter_type,
                    stop_hash,
                }
            }
            "cfilter" => {
                need(&payload, 1, "cfilter")?;
                let filter_type = payload.get_u8();
                let block_hash = get_hash(&mut payload)?;
                let filter = get_var_bytes(&mut payload)?;
                Message::CFilter(CFilterMessage {
                    filter_type,
                    block_hash,
                    filter,
                })
            }
            "cfheaders" => {
                need(&payload, 1, "cfheaders")?;
                let filter_type = payload.get_u8();
                let stop_hash = get_hash(&mut payload)?;
                let prev_header = get_hash(&mut payload)?;
                let hashes = get_hash_vec(&mut payload)?;
                Message::CFHeaders(CFHeadersMessage {
                    filter_type,
                    stop_hash,
                    prev_header,
                    hashes,
                })
            }
            "cfcheckpt" => {
                need(&payload, 1, "cfcheckpt")?;
                let filter_type = payload.get_u8();
                let stop_hash = get_hash(&mut payload)?;
                let headers = get_hash_vec(&mut payload)?;
                Message::CFCheckpt(CFCheckptMessage {
                    filter_type,
                    stop_hash,
                    headers,
                })
            }
            "islock" => {
                let count = get_var_int(&mut payload)?;
                if count as usize > payload.remaining() / 36 {
                    return Err(P2pError::Malformed("islock input count"));
                }
                let mut inputs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    inputs.push(OutPoint::decode(&mut payload)?);
                }
                let txid = get_hash(&mut payload)?;
                need(&payload, BLS_SIG_SIZE, "islock signature")?;
                let mut signature = [0u8; BLS_SIG_SIZE];
                payload.copy_to_slice(&mut signature);
                Message::IsLock(IsLockMessage {
                    inputs,
                    txid,
                    signature,
                })
            }
            other => Message::Unknown {
                command: other.to_string(),
                payload,
            },
        };
        Ok(msg)
    }
}

/// Encode a complete frame (envelope + payload) for the given network.
pub fn encode_frame(magic: [u8; 4], msg: &Message) -> Vec<u8> {
    let payload = msg.encode_payload();
    let command = msg.command();
    let mut command_bytes = [0u8; 12];
    command_bytes[..command.len()].copy_from_slice(command.as_bytes());

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(&payload));
    frame.extend_from_slice(&payload);
    frame
}

/// Try to decode one frame from the front of `buf`. Returns `Ok(None)` when
/// the buffer does not yet hold a complete frame.
pub fn decode_frame(magic: [u8; 4], buf: &mut BytesMut) -> Result<Option<Message>, P2pError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    if buf[..4] != magic {
        let mut got = [0u8; 4];
        got.copy_from_slice(&buf[..4]);
        return Err(P2pError::BadMagic(got));
    }
    let length = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(P2pError::Oversized { size: length });
    }
    if buf.len() < HEADER_SIZE + length {
        return Ok(None);
    }

    let header = buf.split_to(HEADER_SIZE);
    let payload = buf.split_to(length).freeze();
    if checksum(&payload).as_slice() != &header[20..24] {
        return Err(P2pError::BadChecksum(command_from_header(&header)));
    }
    let command = command_from_header(&header);
    Message::decode_payload(&command, payload).map(Some)
}

fn command_from_header(header: &[u8]) -> String {
    let raw = &header[4..16];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(12);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Deterministic signing-request id for an InstantSend lock over `inputs`:
/// double SHA-256 of the length-prefixed tag `"islock"`, the compact-size
/// input count, and the serialized prevouts.
pub fn islock_request_id(inputs: &[OutPoint]) -> Hash256 {
    let mut buf = BytesMut::new();
    put_var_bytes(&mut buf, b"islock");
    put_var_int(&mut buf, inputs.len() as u64);
    for input in inputs {
        input.encode(&mut buf);
    }
    Hash256(sha256d(&buf))
}

/// Fold filter hashes into a chained filter header: each step is the double
/// SHA-256 of the filter hash concatenated with the previous header. With no
/// hashes the result is the starting header itself.
pub fn fold_filter_headers(prev_header: Hash256, hashes: &[Hash256]) -> Hash256 {
    let mut header = prev_header;
    for hash in hashes {
        let mut data = [0u8; 64];
        data[..32].copy_from_slice(&hash.0);
        data[32..].copy_from_slice(&header.0);
        header = Hash256(sha256d(&data));
    }
    header
}

// ── Primitive encoders/decoders ───────────────────────────────────────────

fn need(buf: &impl Buf, n: usize, what: &'static str) -> Result<(), P2pError> {
    if buf.remaining() < n {
        return Err(P2pError::Malformed(what));
    }
    Ok(())
}

fn put_net_addr(buf: &mut BytesMut, services: u64) {
    buf.put_u64_le(services);
    buf.put_slice(&[0u8; 16]); // ip
    buf.put_u16(0); // port, big-endian per the legacy format
}

pub(crate) fn put_var_int(buf: &mut BytesMut, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        }
    }
}

pub(crate) fn get_var_int(buf: &mut Bytes) -> Result<u64, P2pError> {
    need(buf, 1, "varint tag")?;
    let tag = buf.get_u8();
    let value = match tag {
        0xfd => {
            need(buf, 2, "varint u16")?;
            buf.get_u16_le() as u64
        }
        0xfe => {
            need(buf, 4, "varint u32")?;
            buf.get_u32_le() as u64
        }
        0xff => {
            need(buf, 8, "varint u64")?;
            buf.get_u64_le()
        }
        small => small as u64,
    };
    Ok(value)
}

pub(crate) fn put_var_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_var_int(buf, data.len() as u64);
    buf.put_slice(data);
}

pub(crate) fn get_var_bytes(buf: &mut Bytes) -> Result<Vec<u8>, P2pError> {
    let len = get_var_int(buf)? as usize;
    need(buf, len, "var bytes")?;
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    Ok(data)
}

fn get_hash(buf: &mut Bytes) -> Result<Hash256, P2pError> {
    need(buf, 32, "hash")?;
    let mut bytes = [0u8; 32];
    buf.copy_to_slice(&mut bytes);
    Ok(Hash256(bytes))
}

fn get_hash_vec(buf: &mut Bytes) -> Result<Vec<Hash256>, P2pError> {
    let count = get_var_int(buf)? as usize;
    if count > buf.remaining() / 32 {
        return Err(P2pError::Malformed("hash count"));
    }
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(get_hash(buf)?);
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAGIC: [u8; 4] = crate::REGTEST_MAGIC;

    fn hash(byte: u8) -> Hash256 {
        Hash256([byte; 32])
    }

    fn roundtrip(msg: Message) -> Message {
        let frame = encode_frame(MAGIC, &msg);
        let mut buf = BytesMut::from(&frame[..]);
        let decoded = decode_frame(MAGIC, &mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "frame should consume the whole buffer");
        decoded
    }

    #[test]
    fn rpc_hex_is_reversed_wire_order() {
        let mut rpc = String::from("ff");
        rpc.push_str(&"00".repeat(31));
        let h = Hash256::from_rpc_hex(&rpc).unwrap();
        assert_eq!(h.0[31], 0xff);
        assert_eq!(h.0[0], 0x00);
        assert_eq!(h.to_rpc_hex(), rpc);
    }

    #[test]
    fn rejects_wrong_length_hash_hex() {
        assert!(Hash256::from_rpc_hex("abcd").is_err());
        assert!(Hash256::from_rpc_hex("zz").is_err());
    }

    #[test]
    fn getcfilters_roundtrip() {
        let msg = Message::GetCFilters {
            filter_type: crate::FILTER_TYPE_BASIC,
            start_height: 1,
            stop_hash: hash(0xab),
        };
        match roundtrip(msg) {
            Message::GetCFilters {
                filter_type,
                start_height,
                stop_hash,
            } => {
                assert_eq!(filter_type, 0);
                assert_eq!(start_height, 1);
                assert_eq!(stop_hash, hash(0xab));
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn cfheaders_roundtrip() {
        let msg = Message::CFHeaders(CFHeadersMessage {
            filter_type: 0,
            stop_hash: hash(1),
            prev_header: hash(2),
            hashes: vec![hash(3), hash(4), hash(5)],
        });
        match roundtrip(msg) {
            Message::CFHeaders(m) => {
                assert_eq!(m.hashes, vec![hash(3), hash(4), hash(5)]);
                assert_eq!(m.prev_header, hash(2));
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn islock_roundtrip() {
        let msg = Message::IsLock(IsLockMessage {
            inputs: vec![
                OutPoint {
                    txid: hash(7),
                    vout: 0,
                },
                OutPoint {
                    txid: hash(8),
                    vout: 3,
                },
            ],
            txid: hash(9),
            signature: [0x42; 96],
        });
        match roundtrip(msg) {
            Message::IsLock(m) => {
                assert_eq!(m.inputs.len(), 2);
                assert_eq!(m.inputs[1].vout, 3);
                assert_eq!(m.txid, hash(9));
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_passthrough() {
        let decoded = roundtrip(Message::Unknown {
            command: "sendheaders".into(),
            payload: Bytes::new(),
        });
        match decoded {
            Message::Unknown { command, payload } => {
                assert_eq!(command, "sendheaders");
                assert!(payload.is_empty());
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn partial_frame_is_incomplete_not_error() {
        let frame = encode_frame(MAGIC, &Message::Ping(7));
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(decode_frame(MAGIC, &mut buf).unwrap().is_none());
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut frame = encode_frame(MAGIC, &Message::Ping(7));
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut buf = BytesMut::from(&frame[..]);
        assert!(matches!(
            decode_frame(MAGIC, &mut buf),
            Err(P2pError::BadChecksum(_))
        ));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let frame = encode_frame([0xde, 0xad, 0xbe, 0xef], &Message::Verack);
        let mut buf = BytesMut::from(&frame[..]);
        assert!(matches!(
            decode_frame(MAGIC, &mut buf),
            Err(P2pError::BadMagic(_))
        ));
    }

    #[test]
    fn islock_request_id_is_deterministic_and_input_sensitive() {
        let a = [
            OutPoint {
                txid: hash(1),
                vout: 0,
            },
            OutPoint {
                txid: hash(2),
                vout: 1,
            },
        ];
        assert_eq!(islock_request_id(&a), islock_request_id(&a));

        let reordered = [a[1], a[0]];
        assert_ne!(islock_request_id(&a), islock_request_id(&reordered));

        let different_vout = [
            a[0],
            OutPoint {
                txid: hash(2),
                vout: 2,
            },
        ];
        assert_ne!(islock_request_id(&a), islock_request_id(&different_vout));
    }

    #[test]
    fn fold_with_no_hashes_is_identity() {
        assert_eq!(fold_filter_headers(hash(9), &[]), hash(9));
    }

    #[test]
    fn fold_is_order_sensitive() {
        let a = fold_filter_headers(Hash256::ZERO, &[hash(1), hash(2)]);
        let b = fold_filter_headers(Hash256::ZERO, &[hash(2), hash(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn fold_chains_incrementally() {
        // Folding [h1, h2] equals folding h2 onto the fold of [h1].
        let step1 = fold_filter_headers(Hash256::ZERO, &[hash(1)]);
        let full = fold_filter_headers(Hash256::ZERO, &[hash(1), hash(2)]);
        assert_eq!(fold_filter_headers(step1, &[hash(2)]), full);
    }

    proptest! {
        #[test]
        fn var_int_roundtrip(n in any::<u64>()) {
            let mut buf = BytesMut::new();
            put_var_int(&mut buf, n);
            let mut bytes = buf.freeze();
            prop_assert_eq!(get_var_int(&mut bytes).unwrap(), n);
            prop_assert!(bytes.is_empty());
        }

        #[test]
        fn var_bytes_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut buf = BytesMut::new();
            put_var_bytes(&mut buf, &data);
            let mut bytes = buf.freeze();
            prop_assert_eq!(get_var_bytes(&mut bytes).unwrap(), data);
        }
    }

    #[test]
    fn var_int_boundary_widths() {
        for (n, width) in [
            (0xfcu64, 1usize),
            (0xfd, 3),
            (0xffff, 3),
            (0x1_0000, 5),
            (0xffff_ffff, 5),
            (0x1_0000_0000, 9),
        ] {
            let mut buf = BytesMut::new();
            put_var_int(&mut buf, n);
            assert_eq!(buf.len(), width, "width for {n:#x}");
        }
    }
}
