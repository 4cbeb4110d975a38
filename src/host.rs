//! In-memory stand-in host
//!
//! The bridge normally lives inside a GUI host application, whose document
//! and selection state it reaches through registered handlers. For headless
//! operation (and for tests) this module provides a minimal stand-in: a
//! document of named objects plus a current selection, mutated only through
//! tools routed over the affinity executor.
//!
//! The interior mutex exists because Rust cannot express "only the GUI
//! thread touches this" in the type system; the executor routing is what
//! upholds it, the lock is what keeps a misrouted access from being UB.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{BridgeError, Result};
use crate::selection::{SelectedObject, SelectionSnapshot, SelectionSource};

/// One object in the stand-in document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostObject {
    pub name: String,
    pub label: String,
    pub kind: String,
}

#[derive(Default)]
struct HostState {
    objects: Vec<HostObject>,
    selection: Vec<SelectedObject>,
}

/// Headless host: a document plus a selection.
#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<HostState>,
    next_name: AtomicU64,
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add an object of `kind`, generating a unique name. Returns it.
    pub fn create_object(&self, kind: &str, label: Option<&str>) -> HostObject {
        let seq = self.next_name.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}{:03}", kind, seq);
        let object = HostObject {
            label: label.unwrap_or(&name).to_string(),
            name,
            kind: kind.to_string(),
        };
        self.state.lock().unwrap().objects.push(object.clone());
        object
    }

    /// Remove `name` from the document and from the selection.
    pub fn delete_object(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.objects.len();
        state.objects.retain(|o| o.name != name);
        if state.objects.len() == before {
            return Err(BridgeError::NotFound(format!("object {}", name)));
        }
        state.selection.retain(|s| s.object != name);
        Ok(())
    }

    /// All objects, in creation order, with per-item fault isolation left
    /// to the caller (the listing tool wraps each entry in `Ok`).
    pub fn objects(&self) -> Vec<HostObject> {
        self.state.lock().unwrap().objects.clone()
    }

    /// Add `name` (with optional sub-elements) to the current selection.
    pub fn select(&self, name: &str, sub_elements: Vec<String>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.objects.iter().any(|o| o.name == name) {
            return Err(BridgeError::NotFound(format!("object {}", name)));
        }
        state.selection.push(SelectedObject {
            object: name.to_string(),
            sub_elements,
        });
        Ok(())
    }

    pub fn clear_selection(&self) {
        self.state.lock().unwrap().selection.clear();
    }

    /// Object count, for stats and export sizing.
    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    /// Render `name` as a JSON summary, the shape listings use.
    pub fn object_summary(object: &HostObject) -> Value {
        json!({
            "name": object.name,
            "label": object.label,
            "type": object.kind,
        })
    }
}

impl SelectionSource for MemoryHost {
    fn current_selection(&self) -> Result<SelectionSnapshot> {
        Ok(SelectionSnapshot {
            objects: self.state.lock().unwrap().selection.clone(),
        })
    }
}

#[cfg(test)]
mod host_tests {
    use super::*;

    #[test]
    fn test_create_generates_unique_names() {
        let host = MemoryHost::new();
        let a = host.create_object("Box", None);
        let b = host.create_object("Box", Some("lid"));
        assert_ne!(a.name, b.name);
        assert_eq!(b.label, "lid");
        assert_eq!(host.object_count(), 2);
    }

    #[test]
    fn test_delete_removes_object_and_selection() {
        let host = MemoryHost::new();
        let obj = host.create_object("Cylinder", None);
        host.select(&obj.name, vec!["Edge1".into()]).unwrap();

        host.delete_object(&obj.name).unwrap();
        assert_eq!(host.object_count(), 0);
        assert!(host.current_selection().unwrap().objects.is_empty());
    }

    #[test]
    fn test_delete_unknown_object() {
        let host = MemoryHost::new();
        assert!(matches!(
            host.delete_object("Ghost"),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[test]
    fn test_select_requires_existing_object() {
        let host = MemoryHost::new();
        assert!(matches!(
            host.select("Ghost", vec![]),
            Err(BridgeError::NotFound(_))
        ));

        let obj = host.create_object("Box", None);
        host.select(&obj.name, vec!["Face2".into()]).unwrap();
        let snap = host.current_selection().unwrap();
        assert_eq!(snap.objects.len(), 1);
        assert_eq!(snap.objects[0].sub_elements, vec!["Face2".to_string()]);
    }
}
