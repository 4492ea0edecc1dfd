//! # Protocol Constants
//!
//! Parameter keys and well-known values shared by broker and worker. Both ends
//! of a connection build and read messages through these keys, so they are part
//! of the wire contract.

/// Parameter keys carried in [`crate::network::Message::parameters`]
pub mod params {
    pub const TASK_ID: &str = "taskid";
    pub const TASK_TYPE: &str = "tasktype";
    pub const PROCESS_ID: &str = "processId";
    pub const WORKER_ID: &str = "workerId";
    pub const LOCATION: &str = "location";
    pub const MAX_THREADS: &str = "maxThreads";
    pub const MAX_THREADS_BY_TAG: &str = "maxThreadsByTag";
    pub const STATUS: &str = "status";
    pub const RESULTS: &str = "results";
    pub const ERROR: &str = "error";
    pub const SECRET: &str = "secret";
    pub const PAYLOAD: &str = "payload";
}

/// Lifecycle event names delivered to status listeners
pub mod connection_events {
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
}

/// Default pause between two connection attempts
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 1000;

/// Default number of concurrently executing tasks
pub const DEFAULT_MAX_THREADS: usize = 10;

/// Largest TCP frame accepted from a peer, newline excluded
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
