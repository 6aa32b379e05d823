//! ryuldn_bridge/src/protocol/codec.rs
//! Streaming decoder and encode helpers (sec. 4.2), grounded on
//! `ryuldn/ryu_ldn_protocol.hpp`. Borrows an assembly buffer from the
//! `BufferPool` for the lifetime of one packet rather than holding a
//! dedicated buffer per connection, matching the reference's
//! BufferPool-backed design (superseding its fixed-per-instance-array
//! predecessor).

use std::sync::Arc;
use std::time::Duration;

use crate::buffer_pool::BufferPool;
use crate::error::{LdnError, Result};
use crate::protocol::types::*;

/// One fully decoded frame, owned and detached from the borrowed assembly
/// buffer. Rust's ownership model is the natural substitute for the
/// reference's "callee must not retain borrowed references past return":
/// `Frame` variants own their data, so there is nothing to dangle.
#[derive(Debug, Clone)]
pub enum Frame {
    Initialize(InitializeMessage),
    Passphrase(String),
    CreateAccessPoint(CreateAccessPointRequest, Vec<u8>),
    CreateAccessPointPrivate(CreateAccessPointRequest, Vec<u8>),
    ExternalProxy(ExternalProxyConfig),
    ExternalProxyToken(ExternalProxyToken),
    ExternalProxyState(ExternalProxyConnectionState),
    SyncNetwork(NetworkInfo),
    Reject(RejectRequest),
    RejectReply,
    Scan(ScanFilter),
    ScanReply(NetworkInfo),
    ScanReplyEnd,
    Connect(ConnectRequest),
    ConnectPrivate(ConnectRequest),
    Connected(NetworkInfo),
    Disconnect(DisconnectMessage),
    ProxyConfig(ProxyConfig),
    ProxyConnect(ProxyConnectRequest),
    ProxyConnectReply(ProxyConnectResponse),
    ProxyData(ProxyDataHeader, Vec<u8>),
    ProxyDisconnect(ProxyDisconnectMessage),
    SetAcceptPolicy(u8),
    SetAdvertiseData(Vec<u8>),
    Ping(PingMessage),
    NetworkError(NetworkErrorMessage),
}

enum State {
    Header { received: usize },
    Payload { packet_type: u8, payload_size: usize, received: usize },
}

/// Streaming decoder. `feed` tolerates arbitrary chunk boundaries: the
/// concatenation of N `feed` calls totalling `n` bytes produces the same
/// frames as one `feed` of `n` bytes (sec. 8, invariant 1).
pub struct Decoder {
    pool: Arc<BufferPool>,
    header_buf: [u8; HEADER_SIZE],
    state: State,
    borrowed: Option<crate::buffer_pool::PooledBuffer>,
}

impl Decoder {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Decoder {
            pool,
            header_buf: [0u8; HEADER_SIZE],
            state: State::Header { received: 0 },
            borrowed: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Header { received: 0 };
        self.borrowed = None;
    }

    /// Feeds raw bytes into the decoder, returning every frame fully
    /// assembled during this call. On a framing violation the decoder is
    /// reset and an error is returned; bytes already consumed for the bad
    /// frame are discarded per sec. 4.2.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        while !data.is_empty() {
            match &mut self.state {
                State::Header { received } => {
                    let need = HEADER_SIZE - *received;
                    let take = need.min(data.len());
                    self.header_buf[*received..*received + take].copy_from_slice(&data[..take]);
                    *received += take;
                    data = &data[take..];
                    if *received == HEADER_SIZE {
                        let header = LdnHeader::decode(&self.header_buf);
                        if !header.is_valid() {
                            tracing::warn!(
                                "protocol: bad header magic=0x{:x} version={}, resetting decoder",
                                header.magic,
                                header.version
                            );
                            self.reset();
                            return Err(LdnError::Framing("invalid magic or version"));
                        }
                        let payload_size = header.payload_size.max(0) as usize;
                        let final_size = HEADER_SIZE + payload_size;
                        if final_size >= MAX_PACKET_SIZE {
                            tracing::warn!(
                                "protocol: oversize frame {} bytes, resetting decoder",
                                final_size
                            );
                            self.reset();
                            return Err(LdnError::Framing("frame exceeds maximum packet size"));
                        }
                        if payload_size == 0 {
                            frames.push(Self::decode_and_handle(header.packet_type, &[])?);
                            self.reset();
                        } else {
                            self.state = State::Payload {
                                packet_type: header.packet_type,
                                payload_size,
                                received: 0,
                            };
                        }
                    }
                }
                State::Payload { packet_type, payload_size, received } => {
                    if self.borrowed.is_none() {
                        let guard = self
                            .pool
                            .borrow(Duration::from_millis(50))
                            .ok_or(LdnError::ResourceExhausted("buffer pool exhausted"))?;
                        self.borrowed = Some(guard);
                    }
                    let need = *payload_size - *received;
                    let take = need.min(data.len());
                    let buf = self.borrowed.as_mut().unwrap().as_mut_slice();
                    buf[*received..*received + take].copy_from_slice(&data[..take]);
                    *received += take;
                    data = &data[take..];
                    if *received == *payload_size {
                        let frame = {
                            let buf = self.borrowed.as_ref().unwrap().as_slice();
                            Self::decode_and_handle(*packet_type, &buf[..*payload_size])?
                        };
                        frames.push(frame);
                        self.reset();
                    }
                }
            }
        }
        Ok(frames)
    }

    fn decode_and_handle(packet_type: u8, data: &[u8]) -> Result<Frame> {
        let id = PacketId::from_u8(packet_type)
            .ok_or(LdnError::Framing("unknown packet type"))?;
        Ok(match id {
            PacketId::Initialize => Frame::Initialize(InitializeMessage::decode(data)),
            PacketId::Passphrase => Frame::Passphrase(decode_cstring(data)),
            PacketId::CreateAccessPoint => {
                let (req, tail) = decode_create_access_point(data);
                Frame::CreateAccessPoint(req, tail)
            }
            PacketId::CreateAccessPointPrivate => {
                let (req, tail) = decode_create_access_point(data);
                Frame::CreateAccessPointPrivate(req, tail)
            }
            PacketId::ExternalProxy => Frame::ExternalProxy(ExternalProxyConfig::decode(data)),
            PacketId::ExternalProxyToken => {
                Frame::ExternalProxyToken(ExternalProxyToken::decode(data))
            }
            PacketId::ExternalProxyState => {
                Frame::ExternalProxyState(ExternalProxyConnectionState::decode(data))
            }
            PacketId::SyncNetwork => Frame::SyncNetwork(NetworkInfo::decode_wrapped_or_bare(data)),
            PacketId::Reject => Frame::Reject(RejectRequest::decode(data)),
            PacketId::RejectReply => Frame::RejectReply,
            PacketId::Scan => Frame::Scan(ScanFilter {
                local_communication_id: u64::from_le_bytes(
                    data.get(0..8).and_then(|s| s.try_into().ok()).unwrap_or([0; 8]),
                ),
            }),
            PacketId::ScanReply => Frame::ScanReply(NetworkInfo::decode_wrapped_or_bare(data)),
            PacketId::ScanReplyEnd => Frame::ScanReplyEnd,
            PacketId::Connect => Frame::Connect(decode_connect_request(data)),
            PacketId::ConnectPrivate => Frame::ConnectPrivate(decode_connect_request(data)),
            PacketId::Connected => Frame::Connected(NetworkInfo::decode_wrapped_or_bare(data)),
            PacketId::Disconnect => Frame::Disconnect(DisconnectMessage::decode(data)),
            PacketId::ProxyConfig => Frame::ProxyConfig(ProxyConfig::decode(data)),
            PacketId::ProxyConnect => Frame::ProxyConnect(ProxyConnectRequest::decode(pad_to(
                data,
                ProxyInfo::WIRE_SIZE,
            ))),
            PacketId::ProxyConnectReply => Frame::ProxyConnectReply(ProxyConnectResponse::decode(
                pad_to(data, ProxyInfo::WIRE_SIZE),
            )),
            PacketId::ProxyData => {
                let header = ProxyDataHeader::decode(pad_to(data, ProxyDataHeader::WIRE_SIZE));
                let len = (header.data_length as usize).min(data.len().saturating_sub(ProxyDataHeader::WIRE_SIZE));
                let payload = data[ProxyDataHeader::WIRE_SIZE..ProxyDataHeader::WIRE_SIZE + len].to_vec();
                Frame::ProxyData(header, payload)
            }
            PacketId::ProxyDisconnect => Frame::ProxyDisconnect(ProxyDisconnectMessage::decode(
                pad_to(data, ProxyInfo::WIRE_SIZE),
            )),
            PacketId::SetAcceptPolicy => Frame::SetAcceptPolicy(data.first().copied().unwrap_or(0)),
            PacketId::SetAdvertiseData => Frame::SetAdvertiseData(data.to_vec()),
            PacketId::Ping => Frame::Ping(PingMessage::decode(data)),
            PacketId::NetworkError => Frame::NetworkError(NetworkErrorMessage::decode(data)),
        })
    }
}

/// Returns a `len`-byte slice of `data`, backed by a static zero buffer if
/// `data` is shorter than `len`. Malformed or truncated peers get zero-filled
/// fields instead of a panic.
fn pad_to(data: &[u8], len: usize) -> &[u8] {
    if data.len() >= len {
        &data[..len]
    } else {
        static ZEROS: [u8; MAX_PACKET_SIZE] = [0u8; MAX_PACKET_SIZE];
        &ZEROS[..len]
    }
}

fn decode_cstring(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn decode_create_access_point(data: &[u8]) -> (CreateAccessPointRequest, Vec<u8>) {
    // Layout: NetworkConfig-ish fixed prefix, then a u16 advertise-data length
    // prefix, then the variable advertise-data tail (sec. 4.2's "fixed struct
    // + optional variable tail" encoder contract, mirrored on decode).
    const FIXED: usize = 16;
    let req = CreateAccessPointRequest {
        security_mode: u16::from_le_bytes(data[0..2].try_into().unwrap_or([0, 0])),
        station_accept_policy: data.get(2).copied().unwrap_or(0),
        channel: u16::from_le_bytes(data.get(4..6).and_then(|s| s.try_into().ok()).unwrap_or([0, 0])),
        node_count_max: data.get(6).copied().unwrap_or(0),
        local_communication_version: u16::from_le_bytes(
            data.get(8..10).and_then(|s| s.try_into().ok()).unwrap_or([0, 0]),
        ),
    };
    let tail = if data.len() > FIXED { data[FIXED..].to_vec() } else { Vec::new() };
    (req, tail)
}

fn decode_connect_request(data: &[u8]) -> ConnectRequest {
    let info = NetworkInfo::decode_full(&data[..NETWORK_INFO_SIZE.min(data.len())]);
    let tail_off = NETWORK_INFO_SIZE.min(data.len());
    ConnectRequest {
        info,
        security_mode: u16::from_le_bytes(
            data.get(tail_off..tail_off + 2).and_then(|s| s.try_into().ok()).unwrap_or([0, 0]),
        ),
        local_communication_version: u16::from_le_bytes(
            data.get(tail_off + 2..tail_off + 4).and_then(|s| s.try_into().ok()).unwrap_or([0, 0]),
        ),
    }
}

/// Encodes `header + fixed-size struct` into `out`, returning the total
/// length written. Pure: no hidden state, no I/O.
pub fn encode_header_only(id: PacketId, out: &mut Vec<u8>) {
    out.clear();
    out.resize(HEADER_SIZE, 0);
    let header = LdnHeader { magic: RYU_LDN_MAGIC, packet_type: id as u8, version: PROTOCOL_VERSION, payload_size: 0 };
    header.encode((&mut out[0..HEADER_SIZE]).try_into().unwrap());
}

pub fn encode_fixed(id: PacketId, payload: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.resize(HEADER_SIZE + payload.len(), 0);
    let header = LdnHeader {
        magic: RYU_LDN_MAGIC,
        packet_type: id as u8,
        version: PROTOCOL_VERSION,
        payload_size: payload.len() as i32,
    };
    let mut hdr_bytes = [0u8; HEADER_SIZE];
    header.encode(&mut hdr_bytes);
    out[0..HEADER_SIZE].copy_from_slice(&hdr_bytes);
    out[HEADER_SIZE..].copy_from_slice(payload);
}

pub fn encode_with_tail(id: PacketId, fixed: &[u8], tail: &[u8], out: &mut Vec<u8>) {
    out.clear();
    let total = fixed.len() + tail.len();
    out.resize(HEADER_SIZE + total, 0);
    let header = LdnHeader {
        magic: RYU_LDN_MAGIC,
        packet_type: id as u8,
        version: PROTOCOL_VERSION,
        payload_size: total as i32,
    };
    let mut hdr_bytes = [0u8; HEADER_SIZE];
    header.encode(&mut hdr_bytes);
    out[0..HEADER_SIZE].copy_from_slice(&hdr_bytes);
    out[HEADER_SIZE..HEADER_SIZE + fixed.len()].copy_from_slice(fixed);
    out[HEADER_SIZE + fixed.len()..].copy_from_slice(tail);
}

pub fn encode_proxy_data(info: &ProxyInfo, payload: &[u8], out: &mut Vec<u8>) {
    let header = ProxyDataHeader { info: *info, data_length: payload.len() as u32 };
    let mut fixed = [0u8; ProxyDataHeader::WIRE_SIZE];
    header.encode(&mut fixed);
    encode_with_tail(PacketId::ProxyData, &fixed, payload, out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_decoder() -> Decoder {
        Decoder::new(Arc::new(BufferPool::new(2)))
    }

    #[test]
    fn ping_round_trips_through_arbitrary_chunking() {
        let ping = PingMessage { requester: 0, id: 7 };
        let mut payload = [0u8; PingMessage::WIRE_SIZE];
        ping.encode(&mut payload);
        let mut encoded = Vec::new();
        encode_fixed(PacketId::Ping, &payload, &mut encoded);

        for chunk_size in [1usize, 2, 3, 5, encoded.len()] {
            let mut dec = new_decoder();
            let mut frames = Vec::new();
            for chunk in encoded.chunks(chunk_size) {
                frames.extend(dec.feed(chunk).unwrap());
            }
            assert_eq!(frames.len(), 1, "chunk_size={chunk_size}");
            match &frames[0] {
                Frame::Ping(p) => assert_eq!(p.id, 7),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[test]
    fn bad_magic_resets_decoder_without_invoking_callback() {
        let mut dec = new_decoder();
        let mut bad = vec![0u8; HEADER_SIZE];
        bad[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        let err = dec.feed(&bad);
        assert!(err.is_err());

        // A subsequent well-formed frame parses normally.
        let mut encoded = Vec::new();
        encode_header_only(PacketId::ScanReplyEnd, &mut encoded);
        let frames = dec.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::ScanReplyEnd));
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut dec = new_decoder();
        let mut header_bytes = [0u8; HEADER_SIZE];
        let header = LdnHeader {
            magic: RYU_LDN_MAGIC,
            packet_type: PacketId::ProxyData as u8,
            version: PROTOCOL_VERSION,
            payload_size: MAX_PACKET_SIZE as i32,
        };
        header.encode(&mut header_bytes);
        assert!(dec.feed(&header_bytes).is_err());
    }

    #[test]
    fn proxy_data_round_trips_with_variable_tail() {
        let info = ProxyInfo { source_ip: 1, source_port: 5000, dest_ip: 2, dest_port: 6000, protocol: 17 };
        let payload = b"hello virtual socket";
        let mut encoded = Vec::new();
        encode_proxy_data(&info, payload, &mut encoded);

        let mut dec = new_decoder();
        let frames = dec.feed(&encoded).unwrap();
        match &frames[0] {
            Frame::ProxyData(hdr, data) => {
                assert_eq!(hdr.info, info);
                assert_eq!(data.as_slice(), payload);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn header_split_across_many_chunks() {
        let mut encoded = Vec::new();
        encode_header_only(PacketId::RejectReply, &mut encoded);
        let mut dec = new_decoder();
        let mut frames = Vec::new();
        for byte in &encoded {
            frames.extend(dec.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::RejectReply));
    }

    #[test]
    fn network_info_wrapped_and_bare_forms_agree() {
        let wrapped_len = NETWORK_ID_SIZE + COMMON_NETWORK_INFO_SIZE + LDN_NETWORK_INFO_SIZE;
        let mut wrapped = vec![0u8; wrapped_len];
        wrapped[NETWORK_ID_SIZE + COMMON_NETWORK_INFO_SIZE] = 5; // node_count
        let from_wrapped = NetworkInfo::decode_wrapped_or_bare(&wrapped);
        assert_eq!(from_wrapped.node_count(), 5);

        let mut bare = vec![0u8; LDN_NETWORK_INFO_SIZE];
        bare[0] = 5;
        let from_bare = NetworkInfo::decode_wrapped_or_bare(&bare);
        assert_eq!(from_bare.node_count(), 5);
    }
}
