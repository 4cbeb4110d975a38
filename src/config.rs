//! Server configuration
//!
//! All settings are optional with defaults. Environment variables provide
//! the base values and command-line flags override them, matching the
//! precedence the host integration expects (`HOSTLINK_SOCKET` vs `--socket`).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default Unix socket path for the bridge.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/hostlink.sock";

/// Default TCP port used when domain sockets are unavailable or `--tcp` is set.
pub const DEFAULT_TCP_PORT: u16 = 23456;

/// Default maximum frame size: 1 MiB.
///
/// Bounds memory against a hostile or buggy peer. Raise via
/// `HOSTLINK_MAX_FRAME` for hosts that ship large payloads (screenshots,
/// mesh exports).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Default wait for a GUI-thread task result before the caller gets a
/// timeout error. The task itself keeps running; see `gui_exec`.
pub const DEFAULT_GUI_WAIT: Duration = Duration::from_millis(5000);

/// Default depth of the GUI task queue before submitters get backpressure.
pub const DEFAULT_GUI_QUEUE_DEPTH: usize = 256;

/// Default drain tick for the headless drain loop. A real host drains the
/// queue from its own event-loop timer instead.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Default number of jobs retained in the ring buffer.
pub const DEFAULT_JOB_RETENTION: usize = 64;

/// Default TTL for abandoned selection handshakes.
pub const DEFAULT_SELECTION_TTL: Duration = Duration::from_secs(300);

/// Default interval of the expired-selection sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Transport endpoint selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket at the given path.
    Unix(PathBuf),
    /// Loopback TCP on the given port (platforms without domain sockets,
    /// or explicit `--tcp`).
    Tcp(u16),
}

/// Bridge server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    pub max_frame_bytes: usize,
    pub gui_wait: Duration,
    pub gui_queue_depth: usize,
    pub tick: Duration,
    pub job_retention: usize,
    pub selection_ttl: Duration,
    pub sweep_interval: Duration,
    pub metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(DEFAULT_TCP_PORT),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            gui_wait: DEFAULT_GUI_WAIT,
            gui_queue_depth: DEFAULT_GUI_QUEUE_DEPTH,
            tick: DEFAULT_TICK,
            job_retention: DEFAULT_JOB_RETENTION,
            selection_ttl: DEFAULT_SELECTION_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            metrics: false,
        }
    }
}

#[cfg(unix)]
fn default_endpoint(_tcp_port: u16) -> Endpoint {
    Endpoint::Unix(PathBuf::from(DEFAULT_SOCKET_PATH))
}

#[cfg(not(unix))]
fn default_endpoint(tcp_port: u16) -> Endpoint {
    Endpoint::Tcp(tcp_port)
}

impl ServerConfig {
    /// Build a config from the environment, with defaults for anything
    /// unset. Unparseable values fall back to the default with a warning
    /// rather than refusing to start.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        let tcp_port = parse_env::<u16>("HOSTLINK_TCP_PORT").unwrap_or(DEFAULT_TCP_PORT);
        cfg.endpoint = match env_var("HOSTLINK_SOCKET") {
            Some(path) if cfg!(unix) => Endpoint::Unix(PathBuf::from(path)),
            _ => default_endpoint(tcp_port),
        };

        if let Some(bytes) = parse_env::<usize>("HOSTLINK_MAX_FRAME") {
            cfg.max_frame_bytes = bytes.max(1);
        }
        if let Some(ms) = parse_env::<u64>("HOSTLINK_GUI_TIMEOUT_MS") {
            cfg.gui_wait = Duration::from_millis(ms);
        }
        if let Some(depth) = parse_env::<usize>("HOSTLINK_GUI_QUEUE") {
            cfg.gui_queue_depth = depth.max(1);
        }
        if let Some(ms) = parse_env::<u64>("HOSTLINK_TICK_MS") {
            cfg.tick = Duration::from_millis(ms.max(1));
        }
        if let Some(n) = parse_env::<usize>("HOSTLINK_JOB_RETENTION") {
            cfg.job_retention = n.max(1);
        }
        if let Some(secs) = parse_env::<u64>("HOSTLINK_SELECTION_TTL_SECS") {
            cfg.selection_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("HOSTLINK_SWEEP_SECS") {
            cfg.sweep_interval = Duration::from_secs(secs.max(1));
        }

        cfg
    }

    /// Switch this config to loopback TCP, keeping `HOSTLINK_TCP_PORT` if
    /// it was set. Used by the `--tcp` flag.
    pub fn force_tcp(&mut self) {
        let port = match self.endpoint {
            Endpoint::Tcp(port) => port,
            Endpoint::Unix(_) => parse_env::<u16>("HOSTLINK_TCP_PORT").unwrap_or(DEFAULT_TCP_PORT),
        };
        self.endpoint = Endpoint::Tcp(port);
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_var(name)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_frame_bytes, 1024 * 1024);
        assert_eq!(cfg.gui_wait, Duration::from_millis(5000));
        assert_eq!(cfg.gui_queue_depth, 256);
        assert_eq!(cfg.job_retention, 64);
        assert_eq!(cfg.selection_ttl, Duration::from_secs(300));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(30));
        assert!(!cfg.metrics);
    }

    #[cfg(unix)]
    #[test]
    fn test_default_endpoint_is_unix_socket() {
        match ServerConfig::default().endpoint {
            Endpoint::Unix(path) => assert_eq!(path, PathBuf::from(DEFAULT_SOCKET_PATH)),
            Endpoint::Tcp(_) => panic!("expected unix endpoint on unix platforms"),
        }
    }

    #[test]
    fn test_force_tcp() {
        let mut cfg = ServerConfig::default();
        cfg.force_tcp();
        match cfg.endpoint {
            Endpoint::Tcp(port) => assert_eq!(port, DEFAULT_TCP_PORT),
            Endpoint::Unix(_) => panic!("force_tcp left a unix endpoint"),
        }
    }
}
