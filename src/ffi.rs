//! ryuldn_bridge/src/ffi.rs
//! FFI interface functions, grounded on the teacher's `extern "C"` +
//! `CStr`/`CString` idiom: every call is synchronous from the host's point
//! of view, driving the async core through `RUNTIME.block_on`, and results
//! cross the boundary as either a plain `FfiCode` or a JSON string the host
//! must free with `ryuldn_free_string`.

use std::ffi::{CStr, CString};
use std::net::SocketAddr;
use std::os::raw::c_char;
use std::ptr;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{FfiCode, LdnError, ERR_BAD_PARAM, ERR_INTERNAL, OK};
use crate::logging;
use crate::protocol::types::{CreateAccessPointRequest, NetworkInfo, RejectRequest, ScanFilter};
use crate::state::{CONFIG, ORCHESTRATOR, RUNTIME};

fn to_c_string(s: String) -> *const c_char {
    match CString::new(s) {
        Ok(c) => c.into_raw(),
        Err(_) => ptr::null(),
    }
}

fn read_c_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Sets the host-supplied configuration from a JSON string (sec. 6).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_set_config(config_json: *const c_char) -> FfiCode {
    let Some(json) = read_c_str(config_json) else { return ERR_BAD_PARAM };
    let config: Config = match serde_json::from_str(&json) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("ryuldn_set_config: invalid JSON: {e}");
            return ERR_BAD_PARAM;
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("ryuldn_set_config: {e}");
        return ERR_BAD_PARAM;
    }
    *CONFIG.write().unwrap() = config;
    OK
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_init_logging(level: *const c_char) -> FfiCode {
    let Some(level) = read_c_str(level) else { return ERR_BAD_PARAM };
    logging::init_logging(&level);
    OK
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_set_log_level(level: *const c_char) -> FfiCode {
    let Some(level) = read_c_str(level) else { return ERR_BAD_PARAM };
    match crate::state::RELOAD_HANDLE.lock().unwrap().as_ref() {
        Some(handle) => match handle.reload(tracing_subscriber::filter::EnvFilter::new(level)) {
            Ok(()) => OK,
            Err(_) => ERR_INTERNAL,
        },
        None => ERR_INTERNAL,
    }
}

/// Connects to the master relay using the currently stored `Config`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_start() -> FfiCode {
    let config = CONFIG.read().unwrap().clone();
    if let Err(e) = config.validate() {
        tracing::error!("ryuldn_start: {e}");
        return ERR_BAD_PARAM;
    }
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let addr: SocketAddr = match addr.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("ryuldn_start: invalid server address {addr}: {e}");
            return ERR_BAD_PARAM;
        }
    };
    RUNTIME.block_on(async { ORCHESTRATOR.master.connect(addr, &config.passphrase).await.map(|_| OK).unwrap_or_else(to_code) })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_stop() -> FfiCode {
    RUNTIME.block_on(ORCHESTRATOR.teardown());
    OK
}

fn to_code(e: LdnError) -> FfiCode {
    FfiCode::from(&e)
}

#[derive(Deserialize)]
struct CreateNetworkArgs {
    ssid: String,
    security_mode: u16,
    #[serde(default)]
    station_accept_policy: u8,
    #[serde(default)]
    channel: u16,
    node_count_max: u8,
    #[serde(default)]
    local_communication_version: u16,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    advertise_data_hex: String,
}

/// Creates an access point (sec. 4.5's `CreateNetwork`). Blocks until the
/// master relay confirms or `FAILURE_TIMEOUT` elapses; the result network's
/// opaque descriptor is returned as hex so the host can hand it back
/// unmodified to `ryuldn_connect`/diagnostics without this layer interpreting it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_create_network(args_json: *const c_char) -> *const c_char {
    let Some(json) = read_c_str(args_json) else { return ptr::null() };
    let args: CreateNetworkArgs = match serde_json::from_str(&json) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("ryuldn_create_network: invalid JSON: {e}");
            return ptr::null();
        }
    };
    let Some(advertise) = decode_hex(&args.advertise_data_hex) else { return ptr::null() };
    let req = CreateAccessPointRequest {
        security_mode: args.security_mode,
        station_accept_policy: args.station_accept_policy,
        channel: args.channel,
        node_count_max: args.node_count_max,
        local_communication_version: args.local_communication_version,
    };
    let result = RUNTIME.block_on(ORCHESTRATOR.master.create_network(req, advertise, &args.ssid, args.private));
    respond_network(result)
}

#[derive(Deserialize)]
struct ConnectArgs {
    network_info_hex: String,
    security_mode: u16,
    #[serde(default)]
    local_communication_version: u16,
    #[serde(default)]
    private: bool,
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_connect(args_json: *const c_char) -> *const c_char {
    let Some(json) = read_c_str(args_json) else { return ptr::null() };
    let args: ConnectArgs = match serde_json::from_str(&json) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("ryuldn_connect: invalid JSON: {e}");
            return ptr::null();
        }
    };
    let Some(raw) = decode_hex(&args.network_info_hex) else { return ptr::null() };
    let info = NetworkInfo::decode_full(&raw);
    let result = RUNTIME.block_on(ORCHESTRATOR.master.connect_to(info, args.security_mode, args.local_communication_version, args.private));
    respond_network(result)
}

#[derive(Serialize)]
struct NetworkResponse {
    ok: bool,
    error: Option<String>,
    ssid: Option<String>,
    node_count: Option<u8>,
    node_count_max: Option<u8>,
    network_info_hex: Option<String>,
}

fn respond_network(result: crate::error::Result<NetworkInfo>) -> *const c_char {
    let response = match result {
        Ok(info) => NetworkResponse {
            ok: true,
            error: None,
            ssid: Some(info.ssid()),
            node_count: Some(info.node_count()),
            node_count_max: Some(info.node_count_max()),
            network_info_hex: Some(encode_hex(info.encode())),
        },
        Err(e) => NetworkResponse { ok: false, error: Some(e.to_string()), ssid: None, node_count: None, node_count_max: None, network_info_hex: None },
    };
    match serde_json::to_string(&response) {
        Ok(json) => to_c_string(json),
        Err(_) => ptr::null(),
    }
}

#[derive(Deserialize)]
struct ScanArgs {
    #[serde(default)]
    local_communication_id: u64,
}

#[derive(Serialize)]
struct ScanResult {
    ssid: String,
    node_count: u8,
    node_count_max: u8,
    network_info_hex: String,
}

/// Issues a scan and returns every reply collected within `SCAN_TIMEOUT` as
/// a JSON array (sec. 4.5).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_scan(args_json: *const c_char) -> *const c_char {
    let Some(json) = read_c_str(args_json) else { return ptr::null() };
    let args: ScanArgs = match serde_json::from_str(&json) {
        Ok(a) => a,
        Err(_) => ScanArgs { local_communication_id: 0 },
    };
    let filter = ScanFilter { local_communication_id: args.local_communication_id };
    let results = match RUNTIME.block_on(ORCHESTRATOR.master.scan(filter)) {
        Ok(results) => results,
        Err(e) => {
            tracing::warn!("ryuldn_scan: {e}");
            Vec::new()
        }
    };
    let out: Vec<ScanResult> = results
        .into_iter()
        .map(|info| ScanResult {
            ssid: info.ssid(),
            node_count: info.node_count(),
            node_count_max: info.node_count_max(),
            network_info_hex: encode_hex(info.encode()),
        })
        .collect();
    match serde_json::to_string(&out) {
        Ok(json) => to_c_string(json),
        Err(_) => ptr::null(),
    }
}

#[derive(Deserialize)]
struct RejectArgs {
    node_id: u32,
    #[serde(default)]
    disconnect_reason: u32,
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_reject(args_json: *const c_char) -> FfiCode {
    let Some(json) = read_c_str(args_json) else { return ERR_BAD_PARAM };
    let args: RejectArgs = match serde_json::from_str(&json) {
        Ok(a) => a,
        Err(_) => return ERR_BAD_PARAM,
    };
    let req = RejectRequest { disconnect_reason: args.disconnect_reason, node_id: args.node_id };
    match RUNTIME.block_on(ORCHESTRATOR.master.reject(req)) {
        Ok(()) => OK,
        Err(e) => to_code(e),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_disconnect_network(reason: u32) -> FfiCode {
    match RUNTIME.block_on(ORCHESTRATOR.master.disconnect_network(reason)) {
        Ok(()) => OK,
        Err(e) => to_code(e),
    }
}

/// Returns the current session snapshot as JSON (state, network summary,
/// last error) for the host to poll on its own cadence.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_get_session_snapshot() -> *const c_char {
    let snapshot = RUNTIME.block_on(async {
        ORCHESTRATOR.poll().await;
        ORCHESTRATOR.snapshot().await
    });
    #[derive(Serialize)]
    struct SnapshotJson {
        state: &'static str,
        ssid: Option<String>,
        node_count: Option<u8>,
        node_count_max: Option<u8>,
        last_error: Option<String>,
    }
    let json = SnapshotJson {
        state: snapshot.state,
        ssid: snapshot.network.as_ref().map(|n| n.ssid.clone()),
        node_count: snapshot.network.as_ref().map(|n| n.node_count),
        node_count_max: snapshot.network.as_ref().map(|n| n.node_count_max),
        last_error: snapshot.last_error,
    };
    match serde_json::to_string(&json) {
        Ok(json) => to_c_string(json),
        Err(_) => ptr::null(),
    }
}

/// Reports whether a router is currently installed for the active session,
/// i.e. whether the master relay has handed down its `ProxyConfig` yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_is_router_ready() -> bool {
    RUNTIME.block_on(async {
        ORCHESTRATOR.poll().await;
        ORCHESTRATOR.router().await.is_some()
    })
}

/// Frees a string that was allocated by Rust and passed to another language.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ryuldn_free_string(s: *mut c_char) {
    if !s.is_null() {
        unsafe {
            let _ = CString::from_raw(s);
        }
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0xf) as usize] as char);
    }
    out
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

