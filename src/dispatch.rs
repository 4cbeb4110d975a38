//! Tool registry and command dispatcher
//!
//! Tools are registered once at startup as name → descriptor. Each
//! descriptor declares how its handler is routed (directly on the
//! connection thread, through the GUI-affinity executor, or as a
//! background job), so the routing decision is part of registration, never
//! made per call. The dispatcher itself only looks the name up, applies
//! the declared routing, and converts every failure into an error
//! response: nothing a handler does may break the connection loop.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::gui_exec::GuiExecutor;
use crate::jobs::{JobHandle, JobManager};
use crate::metrics::Metrics;
use crate::protocol::{RequestEnvelope, ResponseEnvelope};

/// How a registered tool is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Runs on the connection thread. For handlers that never touch host
    /// GUI/document state (job polling, ping, protocol plumbing).
    Direct,
    /// Serialized onto the designated GUI thread via `submit_and_wait`.
    GuiThread,
    /// Submitted to the job manager; responds immediately with a job id.
    Background,
}

/// Per-invocation context handed to every handler.
///
/// Only background jobs carry a cancel handle; `checkpoint` is a no-op in
/// the other modes so handlers can sprinkle checkpoints unconditionally.
#[derive(Default)]
pub struct ToolCtx<'a> {
    job: Option<&'a JobHandle>,
}

impl<'a> ToolCtx<'a> {
    pub fn for_job(handle: &'a JobHandle) -> Self {
        Self { job: Some(handle) }
    }

    /// Cooperative cancellation checkpoint: errors with `Cancelled` when
    /// the enclosing job was asked to stop.
    pub fn checkpoint(&self) -> Result<()> {
        match self.job {
            Some(handle) => handle.checkpoint(),
            None => Ok(()),
        }
    }
}

/// Handler outcome: a final value, or the suspension sentinel that the
/// dispatcher renders as the `awaiting_selection` response variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolReply {
    Value(Value),
    AwaitingSelection { operation_id: String },
}

impl ToolReply {
    /// Shorthand for handlers that answer with a JSON value.
    pub fn value(v: Value) -> Result<ToolReply> {
        Ok(ToolReply::Value(v))
    }
}

type Handler = Arc<dyn Fn(&Map<String, Value>, &ToolCtx) -> Result<ToolReply> + Send + Sync>;

#[derive(Clone)]
struct ToolDef {
    mode: ExecMode,
    handler: Handler,
}

/// Static mapping of tool name → handler descriptor. Built once at
/// startup; immutable afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` with its routing mode. Re-registering a name
    /// replaces the previous descriptor (last registration wins).
    pub fn register<F>(&mut self, name: &str, mode: ExecMode, handler: F)
    where
        F: Fn(&Map<String, Value>, &ToolCtx) -> Result<ToolReply> + Send + Sync + 'static,
    {
        if self
            .tools
            .insert(
                name.to_string(),
                ToolDef {
                    mode,
                    handler: Arc::new(handler),
                },
            )
            .is_some()
        {
            warn!(tool = name, "Tool re-registered, previous handler replaced");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    fn get(&self, name: &str) -> Option<&ToolDef> {
        self.tools.get(name)
    }
}

/// Routes decoded requests to handlers and renders responses.
pub struct Dispatcher {
    registry: ToolRegistry,
    gui: GuiExecutor<ToolReply>,
    jobs: Arc<JobManager>,
    metrics: Option<Arc<Metrics>>,
}

impl Dispatcher {
    pub fn new(
        registry: ToolRegistry,
        gui: GuiExecutor<ToolReply>,
        jobs: Arc<JobManager>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            registry,
            gui,
            jobs,
            metrics,
        }
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Dispatch one request envelope to its registered handler.
    ///
    /// Every failure (unknown tool, handler error, handler panic, GUI
    /// timeout, backpressure) comes back as a `{error}` response; the
    /// caller's connection loop continues regardless.
    pub fn dispatch(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let start = Instant::now();
        let response = match self.run_tool(request) {
            Ok(ToolReply::Value(value)) => ResponseEnvelope::result(value),
            Ok(ToolReply::AwaitingSelection { operation_id }) => {
                ResponseEnvelope::awaiting_selection(operation_id)
            }
            Err(e) => {
                warn!(tool = %request.tool, code = e.code(), "Request failed: {}", e);
                ResponseEnvelope::error(&e)
            }
        };

        if let Some(metrics) = &self.metrics {
            let duration_ms = start.elapsed().as_millis() as u64;
            let is_error = matches!(response, ResponseEnvelope::Error { .. });
            metrics.record(&request.tool, duration_ms, is_error);
        }

        response
    }

    fn run_tool(&self, request: &RequestEnvelope) -> Result<ToolReply> {
        let def = self
            .registry
            .get(&request.tool)
            .ok_or_else(|| BridgeError::UnknownTool(request.tool.clone()))?;

        debug!(tool = %request.tool, mode = ?def.mode, "Dispatching");
        match def.mode {
            ExecMode::Direct => invoke(&def.handler, &request.args, &ToolCtx::default()),
            ExecMode::GuiThread => {
                let handler = Arc::clone(&def.handler);
                let args = request.args.clone();
                // Panic capture happens in the drain loop; here the closure
                // only adapts the handler signature to the task shape.
                self.gui
                    .submit_and_wait(move || handler(&args, &ToolCtx::default()), None)
            }
            ExecMode::Background => {
                let handler = Arc::clone(&def.handler);
                let args = request.args.clone();
                let label = request.tool.clone();
                let job_id = self.jobs.submit(&label, move |handle| {
                    handle.checkpoint()?;
                    match invoke(&handler, &args, &ToolCtx::for_job(handle))? {
                        ToolReply::Value(value) => Ok(value),
                        // A background job has no connection to hand the
                        // handshake back to; treat suspension as misuse.
                        ToolReply::AwaitingSelection { .. } => Err(BridgeError::Handler(
                            "background tools cannot await selection".into(),
                        )),
                    }
                });
                ToolReply::value(json!({ "job_id": job_id }))
            }
        }
    }
}

/// Invoke a handler with panic capture. A panicking handler is a handler
/// error, not a dead connection.
fn invoke(handler: &Handler, args: &Map<String, Value>, ctx: &ToolCtx) -> Result<ToolReply> {
    match catch_unwind(AssertUnwindSafe(|| handler(args, ctx))) {
        Ok(result) => result,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(BridgeError::Handler(format!("handler panicked: {}", msg)))
        }
    }
}
