//! hostlink — local-socket command bridge for GUI host applications
//!
//! A long-running, single-instance desktop application (CAD, EDA, anything
//! with a toolkit event loop) exposes its operations to external clients
//! over a local socket. This crate is the dispatch and concurrency layer
//! between the two:
//!
//! - [`framing`] — length-prefixed JSON message frames
//! - [`protocol`] — request/response envelopes
//! - [`dispatch`] — typed tool registry with per-tool routing modes
//! - [`gui_exec`] — single-consumer executor for GUI-thread-affine work
//! - [`jobs`] — background job manager with bounded retention
//! - [`selection`] — interactive selection handshake registry
//! - [`paginate`] — bounded, fault-isolated listing windows
//! - [`server`] — transport listener and service wiring
//!
//! The host's domain operations are opaque to all of this: they are
//! registered as named handlers and routed according to their declared
//! execution mode. `hostlink-server` runs the bridge headless against an
//! in-memory stand-in host ([`host::MemoryHost`]); a real host embeds the
//! library and drains the GUI executor from its own event loop.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod gui_exec;
pub mod host;
pub mod jobs;
pub mod metrics;
pub mod paginate;
pub mod protocol;
pub mod selection;
pub mod server;

pub use config::{Endpoint, ServerConfig};
pub use dispatch::{Dispatcher, ExecMode, ToolRegistry, ToolReply};
pub use error::{BridgeError, Result};
pub use gui_exec::{gui_channel, GuiDrain, GuiExecutor};
pub use jobs::{JobManager, JobStatus};
pub use protocol::{RequestEnvelope, ResponseEnvelope};
pub use selection::{SelectionRegistry, SelectionSource};
pub use server::{BridgeListener, BridgeService, BridgeStream};
