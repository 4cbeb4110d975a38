//! Interactive selection handshake
//!
//! Some operations cannot finish synchronously: they need a human to pick
//! elements in the host GUI first. The handler stores its pending
//! parameters here and answers `awaiting_selection` immediately. That is a
//! normal suspension point, not an error; nothing blocks server-side. The
//! client calls `continue_selection` once the user has picked, at which
//! point the externally observed selection is read through an injected
//! accessor, validated, and the original operation completed.
//!
//! Per-operation state machine:
//! initiated → awaiting_selection → {completed | expired}
//!
//! Abandoned operations are purged after a TTL by a periodic sweep so an
//! absent-minded client cannot grow the table without bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

/// Kind of element a handshake expects the user to pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Objects,
    Edges,
    Faces,
}

impl ElementKind {
    fn sub_element_prefix(self) -> Option<&'static str> {
        match self {
            ElementKind::Objects => None,
            ElementKind::Edges => Some("Edge"),
            ElementKind::Faces => Some("Face"),
        }
    }
}

/// One selected object, as observed in the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectedObject {
    pub object: String,
    /// Sub-element names in host notation ("Edge3", "Face1", ...).
    #[serde(default)]
    pub sub_elements: Vec<String>,
}

/// The externally observed selection at one point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SelectionSnapshot {
    pub objects: Vec<SelectedObject>,
}

impl SelectionSnapshot {
    /// Extract the elements of `kind` from the snapshot. For `Objects`
    /// this is the object names; for edges/faces the numeric indices of
    /// matching sub-elements ("Edge3" → 3). Malformed sub-element names
    /// are ignored.
    pub fn elements(&self, kind: ElementKind) -> Vec<Value> {
        match kind.sub_element_prefix() {
            None => self
                .objects
                .iter()
                .map(|o| Value::from(o.object.clone()))
                .collect(),
            Some(prefix) => self
                .objects
                .iter()
                .flat_map(|o| o.sub_elements.iter())
                .filter_map(|sub| sub.strip_prefix(prefix))
                .filter_map(|idx| idx.parse::<u64>().ok())
                .map(Value::from)
                .collect(),
        }
    }
}

/// Read access to the host's current selection. Injected by the embedding
/// host (or the headless stand-in); implementations that touch GUI state
/// must be called from the affinity executor.
pub trait SelectionSource: Send + Sync {
    fn current_selection(&self) -> Result<SelectionSnapshot>;
}

/// What a pending operation requires of the eventual selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionConstraints {
    pub kind: ElementKind,
    /// Minimum number of matching elements; 1 means "non-empty".
    pub min_count: usize,
}

impl SelectionConstraints {
    pub fn non_empty(kind: ElementKind) -> Self {
        Self { kind, min_count: 1 }
    }

    fn validate(&self, snapshot: &SelectionSnapshot) -> Result<Vec<Value>> {
        let elements = snapshot.elements(self.kind);
        if elements.len() < self.min_count {
            return Err(BridgeError::SelectionInvalid(format!(
                "need at least {} selected {:?}, found {}",
                self.min_count,
                self.kind,
                elements.len()
            )));
        }
        Ok(elements)
    }
}

/// Completion closure: pending params + validated elements → final result.
type CompleteFn = Box<dyn Fn(&Value, &[Value]) -> Result<Value> + Send>;

struct PendingOp {
    pending_params: Value,
    constraints: SelectionConstraints,
    created_at: Instant,
    complete: CompleteFn,
}

/// Registry of operations suspended on an external selection.
pub struct SelectionRegistry {
    ops: Mutex<HashMap<String, PendingOp>>,
    source: Arc<dyn SelectionSource>,
    ttl: Duration,
    next_seq: AtomicU64,
}

impl SelectionRegistry {
    pub fn new(source: Arc<dyn SelectionSource>, ttl: Duration) -> Self {
        Self {
            ops: Mutex::new(HashMap::new()),
            source,
            ttl,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Suspend `tool` until an external selection arrives. Returns the
    /// operation id for the `awaiting_selection` response.
    pub fn begin<F>(
        &self,
        tool: &str,
        pending_params: Value,
        constraints: SelectionConstraints,
        complete: F,
    ) -> String
    where
        F: Fn(&Value, &[Value]) -> Result<Value> + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let operation_id = format!("{}-{}", tool, seq);
        let op = PendingOp {
            pending_params,
            constraints,
            created_at: Instant::now(),
            complete: Box::new(complete),
        };
        self.ops.lock().unwrap().insert(operation_id.clone(), op);
        info!(operation = %operation_id, "Awaiting external selection");
        operation_id
    }

    /// Complete a suspended operation against the current selection.
    ///
    /// Unknown or expired id → `NotFound`. A selection that fails the
    /// stored constraints returns `SelectionInvalid` and leaves the entry
    /// live so the caller can adjust the selection and retry. On success
    /// the entry is consumed; a second call with the same id is `NotFound`.
    pub fn resume(&self, operation_id: &str) -> Result<Value> {
        // Read the external selection before taking the table lock: the
        // accessor may itself go through the affinity executor, and no lock
        // may be held across that call.
        let snapshot = self.source.current_selection()?;

        let completed = {
            let mut ops = self.ops.lock().unwrap();
            let op = ops
                .get(operation_id)
                .ok_or_else(|| BridgeError::NotFound(format!("operation {}", operation_id)))?;

            if op.created_at.elapsed() > self.ttl {
                ops.remove(operation_id);
                debug!(operation = %operation_id, "Entry expired before resume");
                return Err(BridgeError::NotFound(format!(
                    "operation {}",
                    operation_id
                )));
            }

            match op.constraints.validate(&snapshot) {
                Ok(elements) => {
                    // Only a valid selection consumes the entry.
                    let op = ops.remove(operation_id).expect("entry vanished under lock");
                    (op, elements)
                }
                Err(e) => {
                    warn!(operation = %operation_id, "Selection rejected: {}", e);
                    return Err(e);
                }
            }
        };

        let (op, elements) = completed;
        info!(operation = %operation_id, selected = elements.len(), "Completing operation");
        (op.complete)(&op.pending_params, &elements)
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    /// Called by the server's periodic sweep.
    pub fn purge_expired(&self) -> usize {
        let mut ops = self.ops.lock().unwrap();
        let before = ops.len();
        ops.retain(|_, op| op.created_at.elapsed() <= self.ttl);
        let removed = before - ops.len();
        if removed > 0 {
            info!(removed, "Purged expired selection operations");
        }
        removed
    }

    /// Number of live pending operations, for stats.
    pub fn pending(&self) -> usize {
        self.ops.lock().unwrap().len()
    }
}

#[cfg(test)]
mod selection_tests {
    use super::*;
    use serde_json::json;

    /// Selection source whose snapshot the test can swap at will.
    struct ScriptedSource {
        snapshot: Mutex<SelectionSnapshot>,
    }

    impl ScriptedSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                snapshot: Mutex::new(SelectionSnapshot::default()),
            })
        }

        fn set(&self, objects: Vec<SelectedObject>) {
            self.snapshot.lock().unwrap().objects = objects;
        }
    }

    impl SelectionSource for ScriptedSource {
        fn current_selection(&self) -> Result<SelectionSnapshot> {
            Ok(self.snapshot.lock().unwrap().clone())
        }
    }

    fn picked(object: &str, subs: &[&str]) -> SelectedObject {
        SelectedObject {
            object: object.to_string(),
            sub_elements: subs.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn make_registry(ttl: Duration) -> (Arc<ScriptedSource>, SelectionRegistry) {
        let source = ScriptedSource::new();
        let registry = SelectionRegistry::new(source.clone() as Arc<dyn SelectionSource>, ttl);
        (source, registry)
    }

    #[test]
    fn test_snapshot_element_extraction() {
        let snap = SelectionSnapshot {
            objects: vec![picked("Box", &["Edge1", "Edge12", "Face3", "Vertex2"])],
        };
        assert_eq!(snap.elements(ElementKind::Edges), vec![json!(1), json!(12)]);
        assert_eq!(snap.elements(ElementKind::Faces), vec![json!(3)]);
        assert_eq!(snap.elements(ElementKind::Objects), vec![json!("Box")]);
    }

    #[test]
    fn test_resume_unknown_id() {
        let (_source, registry) = make_registry(Duration::from_secs(300));
        assert!(matches!(
            registry.resume("fillet_edges-99"),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_selection_leaves_entry_for_retry() {
        let (source, registry) = make_registry(Duration::from_secs(300));
        let op_id = registry.begin(
            "fillet_edges",
            json!({"radius": 2.0}),
            SelectionConstraints::non_empty(ElementKind::Edges),
            |params, elements| Ok(json!({"params": params, "edges": elements})),
        );

        // Nothing selected yet: validation error, entry stays retrievable.
        assert!(matches!(
            registry.resume(&op_id),
            Err(BridgeError::SelectionInvalid(_))
        ));
        assert_eq!(registry.pending(), 1);

        // User picks edges; the retry succeeds with the pending params.
        source.set(vec![picked("Box", &["Edge2", "Edge5"])]);
        let result = registry.resume(&op_id).unwrap();
        assert_eq!(
            result,
            json!({"params": {"radius": 2.0}, "edges": [2, 5]})
        );
    }

    #[test]
    fn test_completion_consumes_entry() {
        let (source, registry) = make_registry(Duration::from_secs(300));
        source.set(vec![picked("Plate", &["Face1"])]);

        let op_id = registry.begin(
            "tag_faces",
            json!({}),
            SelectionConstraints::non_empty(ElementKind::Faces),
            |_, elements| Ok(json!(elements.len())),
        );

        assert_eq!(registry.resume(&op_id).unwrap(), json!(1));
        assert!(matches!(
            registry.resume(&op_id),
            Err(BridgeError::NotFound(_))
        ));
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_min_count_constraint() {
        let (source, registry) = make_registry(Duration::from_secs(300));
        source.set(vec![picked("Box", &["Edge1"])]);

        let op_id = registry.begin(
            "chamfer_edges",
            json!({}),
            SelectionConstraints {
                kind: ElementKind::Edges,
                min_count: 2,
            },
            |_, elements| Ok(json!(elements)),
        );

        assert!(matches!(
            registry.resume(&op_id),
            Err(BridgeError::SelectionInvalid(_))
        ));
        source.set(vec![picked("Box", &["Edge1", "Edge2"])]);
        assert_eq!(registry.resume(&op_id).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_expired_entry_is_not_found() {
        let (source, registry) = make_registry(Duration::from_millis(20));
        source.set(vec![picked("Box", &["Edge1"])]);

        let op_id = registry.begin(
            "fillet_edges",
            json!({}),
            SelectionConstraints::non_empty(ElementKind::Edges),
            |_, _| Ok(json!(())),
        );
        std::thread::sleep(Duration::from_millis(40));

        assert!(matches!(
            registry.resume(&op_id),
            Err(BridgeError::NotFound(_))
        ));
        // Eagerly removed on access.
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_sweep_purges_only_expired() {
        let (_source, registry) = make_registry(Duration::from_millis(30));
        let _old = registry.begin(
            "old_op",
            json!({}),
            SelectionConstraints::non_empty(ElementKind::Objects),
            |_, _| Ok(json!(())),
        );
        std::thread::sleep(Duration::from_millis(50));
        let _fresh = registry.begin(
            "fresh_op",
            json!({}),
            SelectionConstraints::non_empty(ElementKind::Objects),
            |_, _| Ok(json!(())),
        );

        assert_eq!(registry.purge_expired(), 1);
        assert_eq!(registry.pending(), 1);
    }

    #[test]
    fn test_source_failure_propagates() {
        struct BrokenSource;
        impl SelectionSource for BrokenSource {
            fn current_selection(&self) -> Result<SelectionSnapshot> {
                Err(BridgeError::Handler("selection unavailable".into()))
            }
        }

        let registry =
            SelectionRegistry::new(Arc::new(BrokenSource), Duration::from_secs(300));
        let op_id = registry.begin(
            "op",
            json!({}),
            SelectionConstraints::non_empty(ElementKind::Objects),
            |_, _| Ok(json!(())),
        );
        assert!(matches!(
            registry.resume(&op_id),
            Err(BridgeError::Handler(_))
        ));
        // Accessor failure is not a validation failure: entry survives.
        assert_eq!(registry.pending(), 1);
    }
}
