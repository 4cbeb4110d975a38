//! Bridge server: transport listener and service wiring
//!
//! `BridgeService` is the explicitly constructed owner of everything the
//! connections share: the dispatcher (and through it the tool registry,
//! the GUI executor handle and the job table), the selection registry, the
//! metrics collector and the shutdown flag. There are no process-wide
//! singletons; `main` builds the service, hands the GUI drain to the
//! designated thread, and calls `serve`.
//!
//! One OS thread per accepted connection: the accept loop never blocks on
//! a slow client, and a slow or malicious peer only affects its own
//! connection.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::{Endpoint, ServerConfig};
use crate::dispatch::{Dispatcher, ExecMode, ToolRegistry, ToolReply};
use crate::error::{BridgeError, Result};
use crate::framing::{read_frame, write_frame};
use crate::gui_exec::GuiExecutor;
use crate::jobs::{JobManager, JobStatus};
use crate::metrics::Metrics;
use crate::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::selection::SelectionRegistry;

// Global client ID counter
static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

// ============================================================================
// Transport
// ============================================================================

/// Listening endpoint: Unix domain socket, or loopback TCP on platforms
/// without domain sockets (and under `--tcp`).
pub enum BridgeListener {
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

/// One accepted connection.
pub enum BridgeStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl BridgeListener {
    /// Bind the configured endpoint. A stale Unix socket file from a
    /// previous run is removed first.
    pub fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                Ok(BridgeListener::Unix(listener, path.clone()))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix domain sockets are not available on this platform",
            )),
            Endpoint::Tcp(port) => {
                let listener = TcpListener::bind(("127.0.0.1", *port))?;
                Ok(BridgeListener::Tcp(listener))
            }
        }
    }

    pub fn accept(&self) -> io::Result<BridgeStream> {
        match self {
            #[cfg(unix)]
            BridgeListener::Unix(listener, _) => {
                listener.accept().map(|(stream, _)| BridgeStream::Unix(stream))
            }
            BridgeListener::Tcp(listener) => {
                listener.accept().map(|(stream, _)| BridgeStream::Tcp(stream))
            }
        }
    }

    /// Human-readable bound address for startup logging.
    pub fn describe(&self) -> String {
        match self {
            #[cfg(unix)]
            BridgeListener::Unix(_, path) => format!("{} (unix socket)", path.display()),
            BridgeListener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => format!("{} (tcp)", addr),
                Err(_) => "tcp".to_string(),
            },
        }
    }

    /// Actual TCP port after binding (useful with port 0 in tests).
    pub fn local_tcp_port(&self) -> Option<u16> {
        match self {
            #[cfg(unix)]
            BridgeListener::Unix(..) => None,
            BridgeListener::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
        }
    }
}

impl Read for BridgeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            BridgeStream::Unix(stream) => stream.read(buf),
            BridgeStream::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for BridgeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            BridgeStream::Unix(stream) => stream.write(buf),
            BridgeStream::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            BridgeStream::Unix(stream) => stream.flush(),
            BridgeStream::Tcp(stream) => stream.flush(),
        }
    }
}

// ============================================================================
// Service
// ============================================================================

/// Owner of all cross-connection state, with an explicit lifecycle.
pub struct BridgeService {
    config: ServerConfig,
    dispatcher: Dispatcher,
    selections: Arc<SelectionRegistry>,
    shutdown: Arc<AtomicBool>,
}

impl BridgeService {
    /// Wire up the service. Built-in protocol tools (`ping`, job and
    /// selection management, `get_stats`, `shutdown`) are registered here,
    /// on top of whatever host tools the caller already put into
    /// `registry`. The GUI drain half stays with the caller: handing it to
    /// the designated thread is the embedder's job.
    pub fn new(
        config: ServerConfig,
        mut registry: ToolRegistry,
        gui: GuiExecutor<ToolReply>,
        jobs: Arc<JobManager>,
        selections: Arc<SelectionRegistry>,
    ) -> Arc<Self> {
        let metrics = config.metrics.then(|| Arc::new(Metrics::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        register_builtin_tools(
            &mut registry,
            &gui,
            &jobs,
            &selections,
            metrics.clone(),
            Arc::clone(&shutdown),
        );

        let dispatcher = Dispatcher::new(registry, gui, jobs, metrics);
        Arc::new(Self {
            config,
            dispatcher,
            selections,
            shutdown,
        })
    }

    /// Set by the `shutdown` tool; observed by connection loops.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Accept loop. Runs until the process exits; each connection gets its
    /// own thread so one slow peer cannot starve the others. Also starts
    /// the periodic expired-selection sweep.
    pub fn serve(self: &Arc<Self>, listener: BridgeListener) -> ! {
        self.spawn_selection_sweep();
        info!("Listening on {}", listener.describe());

        loop {
            match listener.accept() {
                Ok(stream) => {
                    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
                    let service = Arc::clone(self);
                    thread::Builder::new()
                        .name(format!("hostlink-client-{}", client_id))
                        .spawn(move || service.handle_connection(stream, client_id))
                        .expect("failed to spawn connection thread");
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Per-connection read-decode-dispatch-encode-write loop.
    ///
    /// Protocol errors (bad JSON in a well-framed payload) answer with
    /// `{error}` and keep the loop alive. Transport errors (oversize,
    /// truncation, I/O) answer best-effort and terminate only this
    /// connection; the listener and every other connection are unaffected.
    pub fn handle_connection(&self, mut stream: BridgeStream, client_id: usize) {
        info!(client = client_id, "Client connected");

        loop {
            let payload = match read_frame(&mut stream, self.config.max_frame_bytes) {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    info!(client = client_id, "Client disconnected");
                    break;
                }
                Err(e) => {
                    warn!(client = client_id, code = e.code(), "Read error: {}", e);
                    // Best-effort error response; the frame boundary is
                    // gone, so the connection cannot continue either way.
                    let _ = write_frame(&mut stream, &ResponseEnvelope::error(&e).encode());
                    break;
                }
            };

            let response = match RequestEnvelope::decode(&payload) {
                Ok(request) => {
                    debug!(client = client_id, tool = %request.tool, "Request");
                    self.dispatcher.dispatch(&request)
                }
                Err(e) => {
                    warn!(client = client_id, "Invalid request body: {}", e);
                    ResponseEnvelope::error(&e)
                }
            };

            if let Err(e) = write_frame(&mut stream, &response.encode()) {
                warn!(client = client_id, "Write error: {}", e);
                break;
            }

            if self.shutdown_requested() {
                info!(client = client_id, "Shutdown requested, exiting");
                std::process::exit(0);
            }
        }
    }

    fn spawn_selection_sweep(self: &Arc<Self>) {
        let service = Arc::clone(self);
        thread::Builder::new()
            .name("hostlink-sweep".to_string())
            .spawn(move || loop {
                thread::sleep(service.config.sweep_interval);
                if service.shutdown_requested() {
                    break;
                }
                service.selections.purge_expired();
            })
            .expect("failed to spawn sweep thread");
    }
}

// ============================================================================
// Built-in tools
// ============================================================================

fn register_builtin_tools(
    registry: &mut ToolRegistry,
    gui: &GuiExecutor<ToolReply>,
    jobs: &Arc<JobManager>,
    selections: &Arc<SelectionRegistry>,
    metrics: Option<Arc<Metrics>>,
    shutdown: Arc<AtomicBool>,
) {
    registry.register("ping", ExecMode::Direct, |_, _| {
        ToolReply::value(json!({
            "pong": true,
            "version": env!("CARGO_PKG_VERSION"),
        }))
    });

    {
        let jobs = Arc::clone(jobs);
        registry.register("poll_job", ExecMode::Direct, move |args, _| {
            let job_id = required_str_arg(args, "job_id")?;
            let snapshot = jobs.poll(job_id)?;
            ToolReply::value(to_value(&snapshot)?)
        });
    }

    {
        let jobs = Arc::clone(jobs);
        registry.register("cancel_job", ExecMode::Direct, move |args, _| {
            let job_id = required_str_arg(args, "job_id")?;
            let snapshot = jobs.cancel(job_id)?;
            ToolReply::value(to_value(&snapshot)?)
        });
    }

    {
        let jobs = Arc::clone(jobs);
        registry.register("list_jobs", ExecMode::Direct, move |args, _| {
            let filter = match args.get("status") {
                None | Some(Value::Null) => None,
                Some(value) => Some(
                    serde_json::from_value::<JobStatus>(value.clone())
                        .map_err(|_| BridgeError::Handler(format!("invalid status filter: {}", value)))?,
                ),
            };
            ToolReply::value(to_value(&jobs.list(filter))?)
        });
    }

    {
        // Reads the live selection and completes the pending operation on
        // the GUI thread: both touch host state.
        let selections = Arc::clone(selections);
        registry.register("continue_selection", ExecMode::GuiThread, move |args, _| {
            let operation_id = required_str_arg(args, "operation_id")?;
            ToolReply::value(selections.resume(operation_id)?)
        });
    }

    {
        let gui = gui.clone();
        let jobs = Arc::clone(jobs);
        let selections = Arc::clone(selections);
        registry.register("get_stats", ExecMode::Direct, move |_, _| {
            let metrics = metrics
                .as_ref()
                .ok_or_else(|| BridgeError::Handler("metrics not enabled".into()))?;
            let mut stats = to_value(&metrics.snapshot())?;
            if let Value::Object(map) = &mut stats {
                map.insert("gui_queue_depth".into(), json!(gui.queue_depth()));
                map.insert("jobs_retained".into(), json!(jobs.retained()));
                map.insert("selections_pending".into(), json!(selections.pending()));
            }
            ToolReply::value(stats)
        });
    }

    registry.register("shutdown", ExecMode::Direct, move |_, _| {
        info!("Shutdown requested by client");
        shutdown.store(true, Ordering::SeqCst);
        ToolReply::value(json!("shutting down"))
    });
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| BridgeError::Handler(e.to_string()))
}

// ============================================================================
// Argument helpers
// ============================================================================

/// Required string argument, or a handler error naming the field.
pub fn required_str_arg<'a>(
    args: &'a serde_json::Map<String, Value>,
    key: &str,
) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::Handler(format!("{} is required", key)))
}

/// Optional string argument; `None` when absent or null.
pub fn opt_str_arg<'a>(args: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

/// Optional non-negative integer argument with a default.
pub fn usize_arg(args: &serde_json::Map<String, Value>, key: &str, default: usize) -> usize {
    args.get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

// ============================================================================
// Tests
// ============================================================================
