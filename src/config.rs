//! Server configuration
//!
//! Collects the option table from the framework's external interfaces
//! into one struct, constructed via [`Default`] and mutated with setters.
//! Defaults match the documented constructor defaults this framework
//! replaces.

use std::path::PathBuf;
use std::sync::Arc;

use rustls::ServerConfig as RustlsServerConfig;

use crate::log::Level;

/// Per-server configuration options.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on concurrent connections; sizes the connection table.
    pub max_fd: usize,
    /// Per-connection receive buffer cap, in bytes.
    pub buffer_size: usize,
    /// Capacity (rounded to a power of two) of the worker completion queue.
    pub finish_queue_cap: usize,
    /// Number of worker threads in the pool.
    pub worker_threads: usize,
    /// Enables or disables the security gate wholesale.
    pub security_open: bool,
    /// Max concurrent connections per IP.
    pub connection_num_limit: usize,
    /// Connect-rate limiter window, in seconds.
    pub connection_secs: u64,
    /// Connect-rate limiter threshold.
    pub connection_times: u32,
    /// Request-rate limiter window, in seconds.
    pub request_secs: u64,
    /// Request-rate limiter threshold.
    pub request_times: u32,
    /// Seconds between zombie-connection sweeps (`None` disables).
    pub check_frequency: Option<u64>,
    /// Idle seconds before a connection is considered zombie (`None` disables).
    pub connection_timeout: Option<u64>,
    /// WebSocket: idle seconds before a heartbeat ping is sent.
    pub heartbeat_idle: u64,
    /// WebSocket: seconds to wait for a heartbeat ack before closing.
    pub heartbeat_ack_timeout: u64,
    /// TLS server configuration, if TLS is enabled.
    pub tls: Option<Arc<RustlsServerConfig>>,
    /// Path the async log sink appends to.
    pub log_path: PathBuf,
    /// Minimum severity the log sink writes.
    pub log_level: Level,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_fd: 10_000,
            buffer_size: 8 * 1024,
            finish_queue_cap: 4096,
            worker_threads: 8,
            security_open: true,
            connection_num_limit: 20,
            connection_secs: 1,
            connection_times: 6,
            request_secs: 1,
            request_times: 12,
            check_frequency: Some(60),
            connection_timeout: Some(1800),
            heartbeat_idle: 20 * 60,
            heartbeat_ack_timeout: 30,
            tls: None,
            log_path: PathBuf::from("emberweb.log"),
            log_level: Level::Info,
        }
    }
}

impl ServerConfig {
    /// Starts from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connection table size.
    pub fn with_max_fd(mut self, max_fd: usize) -> Self {
        self.max_fd = max_fd;
        self
    }

    /// Sets the per-connection buffer cap in KiB, matching the original
    /// implementation's constructor parameter unit.
    pub fn with_buffer_size_kb(mut self, kb: usize) -> Self {
        self.buffer_size = kb * 1024;
        self
    }

    /// Sets the worker pool size.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Disables the security gate entirely.
    pub fn without_security(mut self) -> Self {
        self.security_open = false;
        self
    }

    /// Sets the connect-rate window and threshold.
    pub fn with_connection_rate(mut self, times: u32, secs: u64) -> Self {
        self.connection_times = times;
        self.connection_secs = secs;
        self
    }

    /// Sets the request-rate window and threshold.
    pub fn with_request_rate(mut self, times: u32, secs: u64) -> Self {
        self.request_times = times;
        self.request_secs = secs;
        self
    }

    /// Disables zombie sweeps and timeouts.
    pub fn without_zombie_reaping(mut self) -> Self {
        self.check_frequency = None;
        self.connection_timeout = None;
        self
    }

    /// Sets the log file path.
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    /// Sets the minimum log severity.
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(10_000, cfg.max_fd);
        assert_eq!(8 * 1024, cfg.buffer_size);
        assert_eq!(20, cfg.connection_num_limit);
        assert_eq!(6, cfg.connection_times);
        assert_eq!(12, cfg.request_times);
        assert_eq!(Some(60), cfg.check_frequency);
        assert_eq!(Some(1800), cfg.connection_timeout);
    }

    #[test]
    fn builder_methods_compose() {
        let cfg = ServerConfig::new()
            .with_max_fd(100)
            .with_worker_threads(2)
            .without_security();
        assert_eq!(100, cfg.max_fd);
        assert_eq!(2, cfg.worker_threads);
        assert!(!cfg.security_open);
    }
}
