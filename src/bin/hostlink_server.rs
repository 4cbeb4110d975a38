//! hostlink-server - headless command bridge
//!
//! Runs the bridge against an in-memory stand-in host: the same wire
//! protocol a GUI-embedded deployment speaks, without the GUI. The
//! designated "GUI thread" is a dedicated drain thread.
//!
//! Usage:
//!   hostlink-server [--socket /tmp/hostlink.sock] [--tcp] [--metrics]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [JSON payload]
//!   Response: [4-byte length BE] [JSON payload]
//!
//! Environment (flags take precedence):
//!   HOSTLINK_SOCKET, HOSTLINK_TCP_PORT, HOSTLINK_MAX_FRAME,
//!   HOSTLINK_GUI_TIMEOUT_MS, HOSTLINK_GUI_QUEUE, HOSTLINK_TICK_MS,
//!   HOSTLINK_JOB_RETENTION, HOSTLINK_SELECTION_TTL_SECS, HOSTLINK_SWEEP_SECS

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hostlink::config::{Endpoint, ServerConfig};
use hostlink::dispatch::{ExecMode, ToolRegistry, ToolReply};
use hostlink::error::BridgeError;
use hostlink::gui_exec::{gui_channel, GuiExecutor};
use hostlink::host::MemoryHost;
use hostlink::jobs::JobManager;
use hostlink::paginate::paginate;
use hostlink::selection::{
    ElementKind, SelectionConstraints, SelectionRegistry, SelectionSource,
};
use hostlink::server::{opt_str_arg, required_str_arg, usize_arg, BridgeListener, BridgeService};

/// Listing cap, regardless of the client's requested limit.
const LIST_MAX_LIMIT: usize = 500;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("hostlink-server {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("hostlink-server {}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Headless command bridge for GUI host applications");
        println!();
        println!("Usage: hostlink-server [--socket <path>] [--tcp] [--tcp-port <port>] [--metrics]");
        println!();
        println!("Flags:");
        println!("  --socket <path>     Unix socket path (default: /tmp/hostlink.sock)");
        println!("  --tcp               Listen on loopback TCP instead of a unix socket");
        println!("  --tcp-port <port>   TCP port for --tcp (default: 23456)");
        println!("  --max-frame <bytes> Maximum frame size (default: 1048576)");
        println!("  --gui-timeout <ms>  GUI-thread wait timeout (default: 5000)");
        println!("  --metrics           Enable request metrics (get_stats tool)");
        println!("  -V, --version       Print version information");
        println!("  -h, --help          Print this help message");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = build_config(&args);
    info!("Starting hostlink-server v{}", env!("CARGO_PKG_VERSION"));

    // Service wiring: the stand-in host plays the GUI application.
    let host = MemoryHost::new();
    let selections = Arc::new(SelectionRegistry::new(
        Arc::clone(&host) as Arc<dyn SelectionSource>,
        config.selection_ttl,
    ));
    let (gui, drain) = gui_channel(config.gui_queue_depth, config.gui_wait);
    let jobs = Arc::new(JobManager::new(config.job_retention));

    let mut registry = ToolRegistry::new();
    register_host_tools(&mut registry, &host, &selections, &gui);

    let endpoint = config.endpoint.clone();
    let tick = config.tick;
    let service = BridgeService::new(config, registry, gui, jobs, selections);

    install_signal_handler(&endpoint)?;

    // The drain thread is the designated GUI thread of this process:
    // everything registered as ExecMode::GuiThread runs here, one task at
    // a time, in submission order.
    let drain_stop = Arc::new(AtomicBool::new(false));
    thread::Builder::new()
        .name("hostlink-gui".to_string())
        .spawn(move || drain.run(tick, &drain_stop))
        .context("failed to spawn GUI drain thread")?;

    let listener = BridgeListener::bind(&endpoint)
        .with_context(|| format!("failed to bind {:?}", endpoint))?;
    service.serve(listener)
}

fn build_config(args: &[String]) -> ServerConfig {
    let mut config = ServerConfig::from_env();

    if let Some(path) = flag_value(args, "--socket") {
        config.endpoint = Endpoint::Unix(PathBuf::from(path));
    }
    if let Some(port) = flag_value(args, "--tcp-port").and_then(|p| p.parse().ok()) {
        config.endpoint = Endpoint::Tcp(port);
    } else if args.iter().any(|a| a == "--tcp") {
        config.force_tcp();
    }
    if let Some(bytes) = flag_value(args, "--max-frame").and_then(|v| v.parse().ok()) {
        config.max_frame_bytes = bytes;
    }
    if let Some(ms) = flag_value(args, "--gui-timeout").and_then(|v| v.parse().ok()) {
        config.gui_wait = Duration::from_millis(ms);
    }
    if args.iter().any(|a| a == "--metrics") {
        info!("Metrics collection enabled");
        config.metrics = true;
    }

    config
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a String> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1))
}

/// Remove the socket file and exit on SIGINT/SIGTERM.
fn install_signal_handler(endpoint: &Endpoint) -> anyhow::Result<()> {
    let socket_path = match endpoint {
        Endpoint::Unix(path) => Some(path.clone()),
        Endpoint::Tcp(_) => None,
    };
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("failed to register signal handlers")?;

    thread::Builder::new()
        .name("hostlink-signals".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("Received signal {}, shutting down", sig);
                if let Some(path) = socket_path {
                    let _ = std::fs::remove_file(path);
                }
                std::process::exit(0);
            }
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}

// ============================================================================
// Host tools
// ============================================================================

/// Register the stand-in host's operation surface.
///
/// Everything that reads or mutates host document/selection state is
/// `GuiThread`; `export_objects` demonstrates a long-running background
/// job that itself crosses back into the GUI thread for a sub-step.
fn register_host_tools(
    registry: &mut ToolRegistry,
    host: &Arc<MemoryHost>,
    selections: &Arc<SelectionRegistry>,
    gui: &GuiExecutor<ToolReply>,
) {
    {
        let host = Arc::clone(host);
        registry.register("create_object", ExecMode::GuiThread, move |args, _| {
            let kind = opt_str_arg(args, "kind").unwrap_or("Box");
            let object = host.create_object(kind, opt_str_arg(args, "label"));
            ToolReply::value(MemoryHost::object_summary(&object))
        });
    }

    {
        let host = Arc::clone(host);
        registry.register("delete_object", ExecMode::GuiThread, move |args, _| {
            let name = required_str_arg(args, "object_name")?;
            host.delete_object(name)?;
            ToolReply::value(json!({ "deleted": name }))
        });
    }

    {
        let host = Arc::clone(host);
        registry.register("list_objects", ExecMode::GuiThread, move |args, _| {
            let offset = usize_arg(args, "offset", 0);
            let limit = usize_arg(args, "limit", 100);
            let type_filter = opt_str_arg(args, "type_filter").map(str::to_string);

            let page = paginate(
                host.objects()
                    .into_iter()
                    .filter(|o| {
                        type_filter
                            .as_deref()
                            .map_or(true, |f| o.kind.contains(f))
                    })
                    .map(|o| Ok::<Value, BridgeError>(MemoryHost::object_summary(&o))),
                offset,
                limit,
                LIST_MAX_LIMIT,
            );
            ToolReply::value(serde_json::to_value(page).map_err(|e| {
                BridgeError::Handler(e.to_string())
            })?)
        });
    }

    {
        let host = Arc::clone(host);
        registry.register("select_object", ExecMode::GuiThread, move |args, _| {
            let name = required_str_arg(args, "object_name")?;
            let sub_elements = args
                .get("sub_elements")
                .and_then(Value::as_array)
                .map(|subs| {
                    subs.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            host.select(name, sub_elements)?;
            ToolReply::value(json!({ "selected": name }))
        });
    }

    {
        let host = Arc::clone(host);
        registry.register("clear_selection", ExecMode::GuiThread, move |_, _| {
            host.clear_selection();
            ToolReply::value(json!({ "cleared": true }))
        });
    }

    {
        let host = Arc::clone(host);
        registry.register("get_selection", ExecMode::GuiThread, move |_, _| {
            let snapshot = host.current_selection()?;
            ToolReply::value(
                serde_json::to_value(snapshot).map_err(|e| BridgeError::Handler(e.to_string()))?,
            )
        });
    }

    {
        // Interactive edge operation: an explicit edge list completes
        // synchronously; without one the user picks edges in the host and
        // the client continues the operation later.
        let host = Arc::clone(host);
        let selections = Arc::clone(selections);
        registry.register("fillet_edges", ExecMode::GuiThread, move |args, _| {
            let object_name = required_str_arg(args, "object_name")?.to_string();
            let radius = args.get("radius").and_then(Value::as_f64).unwrap_or(1.0);
            if !host.objects().iter().any(|o| o.name == object_name) {
                return Err(BridgeError::NotFound(format!("object {}", object_name)));
            }

            if let Some(edges) = args.get("edges").and_then(Value::as_array) {
                let result = apply_fillet(&host, &object_name, radius, edges);
                return ToolReply::value(result);
            }

            let fillet_host = Arc::clone(&host);
            let operation_id = selections.begin(
                "fillet_edges",
                json!({ "object_name": object_name, "radius": radius }),
                SelectionConstraints::non_empty(ElementKind::Edges),
                move |params, edges| {
                    let object_name = params["object_name"].as_str().unwrap_or_default();
                    let radius = params["radius"].as_f64().unwrap_or(1.0);
                    Ok(apply_fillet(&fillet_host, object_name, radius, edges))
                },
            );
            Ok(ToolReply::AwaitingSelection { operation_id })
        });
    }

    {
        // Long-running export: snapshots the document through the GUI
        // thread, then works through it with cancellation checkpoints.
        let gui = gui.clone();
        let host = Arc::clone(host);
        registry.register("export_objects", ExecMode::Background, move |args, ctx| {
            let per_object = Duration::from_millis(
                args.get("ms_per_object").and_then(Value::as_u64).unwrap_or(10),
            );

            let snapshot_host = Arc::clone(&host);
            let objects = gui.submit_and_wait(
                move || {
                    ToolReply::value(json!(snapshot_host
                        .objects()
                        .iter()
                        .map(|o| o.name.clone())
                        .collect::<Vec<_>>()))
                },
                None,
            )?;
            let names: Vec<String> = match objects {
                ToolReply::Value(value) => {
                    serde_json::from_value(value).map_err(|e| BridgeError::Handler(e.to_string()))?
                }
                ToolReply::AwaitingSelection { .. } => Vec::new(),
            };

            for _name in &names {
                ctx.checkpoint()?;
                thread::sleep(per_object);
            }
            ToolReply::value(json!({ "exported": names.len(), "objects": names }))
        });
    }
}

fn apply_fillet(host: &Arc<MemoryHost>, object_name: &str, radius: f64, edges: &[Value]) -> Value {
    let fillet = host.create_object("Fillet", None);
    json!({
        "created": fillet.name,
        "base": object_name,
        "edges": edges,
        "radius": radius,
    })
}
