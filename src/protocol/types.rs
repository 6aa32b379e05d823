//! ryuldn_bridge/src/protocol/types.rs
//! Wire data model (sec. 3). Layouts are bit-exact with the reference relay
//! server; every struct here round-trips through `encode`/`decode` with no
//! padding beyond what the wire format itself specifies.

pub const RYU_LDN_MAGIC: u32 = 0x4E444C52; // 'R','L','D','N' little-endian on the wire
pub const PROTOCOL_VERSION: u8 = 1;
pub const MAX_PACKET_SIZE: usize = 16 * 1024;
pub const HEADER_SIZE: usize = 12;

pub const NETWORK_ID_SIZE: usize = 32;
pub const COMMON_NETWORK_INFO_SIZE: usize = 48;
pub const LDN_NETWORK_INFO_SIZE: usize = 1072;
pub const NETWORK_INFO_SIZE: usize = NETWORK_ID_SIZE + COMMON_NETWORK_INFO_SIZE + LDN_NETWORK_INFO_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketId {
    Initialize = 0,
    Passphrase = 1,
    CreateAccessPoint = 2,
    CreateAccessPointPrivate = 3,
    ExternalProxy = 4,
    ExternalProxyToken = 5,
    ExternalProxyState = 6,
    SyncNetwork = 7,
    Reject = 8,
    RejectReply = 9,
    Scan = 10,
    ScanReply = 11,
    ScanReplyEnd = 12,
    Connect = 13,
    ConnectPrivate = 14,
    Connected = 15,
    Disconnect = 16,
    ProxyConfig = 17,
    ProxyConnect = 24,
    ProxyConnectReply = 26,
    ProxyData = 27,
    ProxyDisconnect = 28,
    SetAcceptPolicy = 29,
    SetAdvertiseData = 30,
    Ping = 254,
    NetworkError = 255,
}

impl PacketId {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PacketId::*;
        Some(match v {
            0 => Initialize,
            1 => Passphrase,
            2 => CreateAccessPoint,
            3 => CreateAccessPointPrivate,
            4 => ExternalProxy,
            5 => ExternalProxyToken,
            6 => ExternalProxyState,
            7 => SyncNetwork,
            8 => Reject,
            9 => RejectReply,
            10 => Scan,
            11 => ScanReply,
            12 => ScanReplyEnd,
            13 => Connect,
            14 => ConnectPrivate,
            15 => Connected,
            16 => Disconnect,
            17 => ProxyConfig,
            24 => ProxyConnect,
            26 => ProxyConnectReply,
            27 => ProxyData,
            28 => ProxyDisconnect,
            29 => SetAcceptPolicy,
            30 => SetAdvertiseData,
            254 => Ping,
            255 => NetworkError,
            _ => return None,
        })
    }
}

/// `{magic, type, version, _pad, payload_size}` — 12 bytes total. The 2-byte
/// padding between `version` and `payload_size` exists purely for layout
/// compatibility with the reference relay's C# struct; it carries no data.
#[derive(Debug, Clone, Copy)]
pub struct LdnHeader {
    pub magic: u32,
    pub packet_type: u8,
    pub version: u8,
    pub payload_size: i32,
}

impl LdnHeader {
    pub fn encode(&self, out: &mut [u8; HEADER_SIZE]) {
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4] = self.packet_type;
        out[5] = self.version;
        out[6] = 0;
        out[7] = 0;
        out[8..12].copy_from_slice(&self.payload_size.to_le_bytes());
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        LdnHeader {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            packet_type: buf[4],
            version: buf[5],
            payload_size: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == RYU_LDN_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub proxy_ip: u32,
    pub subnet_mask: u32,
}

impl ProxyConfig {
    pub const WIRE_SIZE: usize = 8;

    pub fn broadcast(&self) -> u32 {
        self.proxy_ip | !self.subnet_mask
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.proxy_ip.to_le_bytes());
        out[4..8].copy_from_slice(&self.subnet_mask.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Self {
        ProxyConfig {
            proxy_ip: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            subnet_mask: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProxyInfo {
    pub source_ip: u32,
    pub source_port: u16,
    pub dest_ip: u32,
    pub dest_port: u16,
    pub protocol: u32,
}

impl ProxyInfo {
    pub const WIRE_SIZE: usize = 16;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.source_ip.to_le_bytes());
        out[4..6].copy_from_slice(&self.source_port.to_le_bytes());
        out[6..10].copy_from_slice(&self.dest_ip.to_le_bytes());
        out[10..12].copy_from_slice(&self.dest_port.to_le_bytes());
        out[12..16].copy_from_slice(&self.protocol.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Self {
        ProxyInfo {
            source_ip: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            source_port: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
            dest_ip: u32::from_le_bytes(buf[6..10].try_into().unwrap()),
            dest_port: u16::from_le_bytes(buf[10..12].try_into().unwrap()),
            protocol: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    pub fn reversed(&self) -> ProxyInfo {
        ProxyInfo {
            source_ip: self.dest_ip,
            source_port: self.dest_port,
            dest_ip: self.source_ip,
            dest_port: self.source_port,
            protocol: self.protocol,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyDataHeader {
    pub info: ProxyInfo,
    pub data_length: u32,
}

impl ProxyDataHeader {
    pub const WIRE_SIZE: usize = ProxyInfo::WIRE_SIZE + 4;

    pub fn encode(&self, out: &mut [u8]) {
        self.info.encode(&mut out[0..ProxyInfo::WIRE_SIZE]);
        out[ProxyInfo::WIRE_SIZE..Self::WIRE_SIZE].copy_from_slice(&self.data_length.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Self {
        ProxyDataHeader {
            info: ProxyInfo::decode(&buf[0..ProxyInfo::WIRE_SIZE]),
            data_length: u32::from_le_bytes(
                buf[ProxyInfo::WIRE_SIZE..Self::WIRE_SIZE].try_into().unwrap(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExternalProxyConfig {
    pub proxy_ip: [u8; 16],
    pub address_family: u32,
    pub proxy_port: u16,
    pub token: [u8; 16],
}

impl ExternalProxyConfig {
    pub const WIRE_SIZE: usize = 16 + 4 + 2 + 2 /* pad */ + 16;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..16].copy_from_slice(&self.proxy_ip);
        out[16..20].copy_from_slice(&self.address_family.to_le_bytes());
        out[20..22].copy_from_slice(&self.proxy_port.to_le_bytes());
        out[22..24].copy_from_slice(&[0, 0]);
        out[24..40].copy_from_slice(&self.token);
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut proxy_ip = [0u8; 16];
        proxy_ip.copy_from_slice(&buf[0..16]);
        let mut token = [0u8; 16];
        token.copy_from_slice(&buf[24..40]);
        ExternalProxyConfig {
            proxy_ip,
            address_family: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            proxy_port: u16::from_le_bytes(buf[20..22].try_into().unwrap()),
            token,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExternalProxyToken {
    pub virtual_ip: u32,
    pub token: [u8; 16],
    pub physical_ip: [u8; 16],
    pub address_family: u32,
}

impl ExternalProxyToken {
    pub const WIRE_SIZE: usize = 4 + 16 + 16 + 4;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.virtual_ip.to_le_bytes());
        out[4..20].copy_from_slice(&self.token);
        out[20..36].copy_from_slice(&self.physical_ip);
        out[36..40].copy_from_slice(&self.address_family.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Self {
        let mut token = [0u8; 16];
        token.copy_from_slice(&buf[4..20]);
        let mut physical_ip = [0u8; 16];
        physical_ip.copy_from_slice(&buf[20..36]);
        ExternalProxyToken {
            virtual_ip: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            token,
            physical_ip,
            address_family: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
        }
    }

    /// Per sec. 4.8: an all-zero `physical_ip` marks a private-network token,
    /// where only the 16-byte secret needs to match.
    pub fn is_private(&self) -> bool {
        self.physical_ip == [0u8; 16]
    }

    pub fn matches(&self, presented_token: &[u8; 16], presented_family: u32, presented_ip: &[u8; 16]) -> bool {
        if &self.token != presented_token {
            return false;
        }
        if self.is_private() {
            return true;
        }
        self.address_family == presented_family && &self.physical_ip == presented_ip
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalProxyConnectionState {
    pub virtual_ip: u32,
    pub connected: bool,
}

impl ExternalProxyConnectionState {
    pub const WIRE_SIZE: usize = 8;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.virtual_ip.to_le_bytes());
        out[4] = self.connected as u8;
        out[5..8].copy_from_slice(&[0, 0, 0]);
    }

    pub fn decode(buf: &[u8]) -> Self {
        ExternalProxyConnectionState {
            virtual_ip: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            connected: buf[4] != 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyConnectRequest {
    pub info: ProxyInfo,
}

impl ProxyConnectRequest {
    pub const WIRE_SIZE: usize = ProxyInfo::WIRE_SIZE;
    pub fn encode(&self, out: &mut [u8]) {
        self.info.encode(out);
    }
    pub fn decode(buf: &[u8]) -> Self {
        ProxyConnectRequest { info: ProxyInfo::decode(buf) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyConnectResponse {
    pub info: ProxyInfo,
}

impl ProxyConnectResponse {
    pub const WIRE_SIZE: usize = ProxyInfo::WIRE_SIZE;
    pub fn encode(&self, out: &mut [u8]) {
        self.info.encode(out);
    }
    pub fn decode(buf: &[u8]) -> Self {
        ProxyConnectResponse { info: ProxyInfo::decode(buf) }
    }

    /// Per sec. 4.6: `source_ip == 0` signals the connection was refused.
    pub fn refused(&self) -> bool {
        self.info.source_ip == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyDisconnectMessage {
    pub info: ProxyInfo,
}

impl ProxyDisconnectMessage {
    pub const WIRE_SIZE: usize = ProxyInfo::WIRE_SIZE;
    pub fn encode(&self, out: &mut [u8]) {
        self.info.encode(out);
    }
    pub fn decode(buf: &[u8]) -> Self {
        ProxyDisconnectMessage { info: ProxyInfo::decode(buf) }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PingMessage {
    pub requester: u32,
    pub id: u32,
}

impl PingMessage {
    pub const WIRE_SIZE: usize = 8;
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.requester.to_le_bytes());
        out[4..8].copy_from_slice(&self.id.to_le_bytes());
    }
    pub fn decode(buf: &[u8]) -> Self {
        PingMessage {
            requester: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            id: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkErrorMessage {
    pub error_code: u8,
}

impl NetworkErrorMessage {
    pub const WIRE_SIZE: usize = 4;
    pub fn encode(&self, out: &mut [u8]) {
        out[0] = self.error_code;
        out[1..4].copy_from_slice(&[0, 0, 0]);
    }
    pub fn decode(buf: &[u8]) -> Self {
        NetworkErrorMessage { error_code: buf[0] }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectMessage {
    pub node_id: u32,
    pub reason: u32,
}

impl DisconnectMessage {
    pub const WIRE_SIZE: usize = 8;
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.node_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.reason.to_le_bytes());
    }
    pub fn decode(buf: &[u8]) -> Self {
        DisconnectMessage {
            node_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            reason: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RejectRequest {
    pub disconnect_reason: u32,
    pub node_id: u32,
}

impl RejectRequest {
    pub const WIRE_SIZE: usize = 8;
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.disconnect_reason.to_le_bytes());
        out[4..8].copy_from_slice(&self.node_id.to_le_bytes());
    }
    pub fn decode(buf: &[u8]) -> Self {
        RejectRequest {
            disconnect_reason: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            node_id: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InitializeMessage {
    pub id: [u8; 16],
    pub mac_address: [u8; 6],
}

impl InitializeMessage {
    pub const WIRE_SIZE: usize = 16 + 6 + 2 /* pad */;
    pub fn encode(&self, out: &mut [u8]) {
        out[0..16].copy_from_slice(&self.id);
        out[16..22].copy_from_slice(&self.mac_address);
        out[22..24].copy_from_slice(&[0, 0]);
    }
    pub fn decode(buf: &[u8]) -> Self {
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[0..16]);
        let mut mac_address = [0u8; 6];
        mac_address.copy_from_slice(&buf[16..22]);
        InitializeMessage { id, mac_address }
    }
}

/// Opaque 1152-byte LDN network descriptor (sec. 3). Stored and forwarded
/// verbatim; this crate does not interpret node records beyond the header
/// fields it needs for the testable scenarios in sec. 8 (ssid, node counts).
#[derive(Clone)]
pub struct NetworkInfo {
    pub raw: [u8; NETWORK_INFO_SIZE],
}

impl Default for NetworkInfo {
    fn default() -> Self {
        NetworkInfo { raw: [0u8; NETWORK_INFO_SIZE] }
    }
}

impl std::fmt::Debug for NetworkInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkInfo")
            .field("ssid", &self.ssid())
            .field("node_count", &self.node_count())
            .field("node_count_max", &self.node_count_max())
            .finish()
    }
}

// Offsets within CommonNetworkInfo (sec. 3): bssid(6) + ssid_len(1) + ssid(32)
// + channel(2) + link_level(1) + network_type(1) + _unk(4) = 47, padded to 48.
const SSID_OFFSET_IN_COMMON: usize = 7;
const SSID_MAX_LEN: usize = 32;
// Offsets within LdnNetworkInfo (sec. 3): first two fields are node counts.
const NODE_COUNT_OFFSET_IN_LDN: usize = 0;
const NODE_COUNT_MAX_OFFSET_IN_LDN: usize = 1;

impl NetworkInfo {
    /// Decode the full 1152-byte on-wire form (ScanReply/Connected/SyncNetwork,
    /// and embedded inside ConnectRequest per sec. 4.2).
    pub fn decode_full(buf: &[u8]) -> Self {
        let mut raw = [0u8; NETWORK_INFO_SIZE];
        let n = buf.len().min(NETWORK_INFO_SIZE);
        raw[..n].copy_from_slice(&buf[..n]);
        NetworkInfo { raw }
    }

    /// Resolves the sec. 9 open question: the server sometimes sends the
    /// LdnNetworkInfo-only form (1072 bytes, no offset) and sometimes the
    /// wrapped NetworkId+CommonNetworkInfo+LdnNetworkInfo form (1152 bytes,
    /// offset 80). Dispatches on the observed length rather than guessing a
    /// single canonical form, exactly as the reference's `ParseNetworkInfo`
    /// does.
    pub fn decode_wrapped_or_bare(buf: &[u8]) -> Self {
        let offset = NETWORK_ID_SIZE + COMMON_NETWORK_INFO_SIZE;
        if buf.len() >= offset + LDN_NETWORK_INFO_SIZE {
            tracing::trace!("NetworkInfo: wrapped form ({} bytes), full struct", buf.len());
            NetworkInfo::decode_full(buf)
        } else if buf.len() >= LDN_NETWORK_INFO_SIZE {
            tracing::trace!("NetworkInfo: bare LdnNetworkInfo form ({} bytes)", buf.len());
            let mut raw = [0u8; NETWORK_INFO_SIZE];
            raw[offset..offset + LDN_NETWORK_INFO_SIZE].copy_from_slice(&buf[..LDN_NETWORK_INFO_SIZE]);
            NetworkInfo { raw }
        } else {
            tracing::warn!("NetworkInfo: payload too short ({} bytes), zero-filling", buf.len());
            NetworkInfo::default()
        }
    }

    pub fn encode(&self) -> &[u8; NETWORK_INFO_SIZE] {
        &self.raw
    }

    pub fn ssid(&self) -> String {
        let start = NETWORK_ID_SIZE + SSID_OFFSET_IN_COMMON;
        let slice = &self.raw[start..start + SSID_MAX_LEN];
        let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
        String::from_utf8_lossy(&slice[..end]).into_owned()
    }

    pub fn node_count(&self) -> u8 {
        self.raw[NETWORK_ID_SIZE + COMMON_NETWORK_INFO_SIZE + NODE_COUNT_OFFSET_IN_LDN]
    }

    pub fn node_count_max(&self) -> u8 {
        self.raw[NETWORK_ID_SIZE + COMMON_NETWORK_INFO_SIZE + NODE_COUNT_MAX_OFFSET_IN_LDN]
    }

    /// Builds the synthetic "dummy" NetworkInfo emitted immediately on
    /// `CreateNetwork` (sec. 4.5, sec. 9) so games observe an instantaneous
    /// state change instead of waiting for the master's real `Connected`.
    pub fn synthetic(ssid: &str, node_count: u8, node_count_max: u8) -> Self {
        let mut info = NetworkInfo::default();
        let ssid_bytes = ssid.as_bytes();
        let start = NETWORK_ID_SIZE + SSID_OFFSET_IN_COMMON;
        let n = ssid_bytes.len().min(SSID_MAX_LEN);
        info.raw[start..start + n].copy_from_slice(&ssid_bytes[..n]);
        info.raw[NETWORK_ID_SIZE + COMMON_NETWORK_INFO_SIZE + NODE_COUNT_OFFSET_IN_LDN] = node_count;
        info.raw[NETWORK_ID_SIZE + COMMON_NETWORK_INFO_SIZE + NODE_COUNT_MAX_OFFSET_IN_LDN] = node_count_max;
        info
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub local_communication_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CreateAccessPointRequest {
    pub security_mode: u16,
    pub station_accept_policy: u8,
    pub channel: u16,
    pub node_count_max: u8,
    pub local_communication_version: u16,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub info: NetworkInfo,
    pub security_mode: u16,
    pub local_communication_version: u16,
}
