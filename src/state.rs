//! ryuldn_bridge/src/state.rs
//! Global state management, grounded on the teacher's `lazy_static!` module:
//! one process-wide orchestrator (master client + router lifecycle), the
//! active configuration, and the logging reload handle the FFI surface
//! mutates at runtime.

use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::reload::Handle as ReloadHandle;

use crate::buffer_pool::{BufferPool, DEFAULT_POOL_SIZE};
use crate::config::Config;
use crate::orchestrator::Orchestrator;

lazy_static! {
    pub static ref CONFIG: RwLock<Config> = RwLock::new(Config::default());
    pub static ref BUFFER_POOL: Arc<BufferPool> = Arc::new(BufferPool::new(DEFAULT_POOL_SIZE));
    pub static ref ORCHESTRATOR: Orchestrator = Orchestrator::new(BUFFER_POOL.clone());
    pub static ref RELOAD_HANDLE: std::sync::Mutex<Option<ReloadHandle<EnvFilter, tracing_subscriber::Registry>>> =
        std::sync::Mutex::new(None);
    // Single-threaded runtime host processes (e.g. the Ryujinx libryujinx
    // embedding) spin up to drive every async call issued from FFI; see
    // `ffi.rs`'s `block_on` usage.
    pub static ref RUNTIME: tokio::runtime::Runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build ryuldn_bridge tokio runtime");
}
