// ============================================================================
// Shape Service
// ============================================================================
//
// Converts between serialized document bodies and named-attribute accessors.
// Every distinct structural signature of a document gets a shape id; every
// dotted attribute path gets an interned path id. Both registrations are
// replayed from markers when a collection is opened.

pub mod shaped;

pub use shaped::{ShapeId, ShapedValue, SHAPE_SID_NULL, compare_shaped, compare_values};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::{DbError, Result, Tick};

/// Opaque handle to a registered attribute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathId(pub Tick);

#[derive(Default)]
struct PathRegistry {
    by_name: HashMap<String, PathId>,
    names: Vec<String>,
}

/// Per-collection shape state.
pub struct Shaper {
    paths: RwLock<PathRegistry>,
    shapes: RwLock<HashMap<String, ShapeId>>,
    next_sid: AtomicU64,
}

impl Shaper {
    pub fn new() -> Self {
        Self {
            paths: RwLock::new(PathRegistry::default()),
            shapes: RwLock::new(HashMap::new()),
            // sid 1 is reserved for null
            next_sid: AtomicU64::new(SHAPE_SID_NULL + 1),
        }
    }

    /// Intern an attribute path. Returns the handle and whether the path was
    /// newly registered (the caller then emits an AttributeRegister marker).
    pub fn attribute_path(&self, name: &str) -> Result<(PathId, bool)> {
        if name.is_empty() {
            return Err(DbError::IllegalName("empty attribute path".into()));
        }
        {
            let registry = self.paths.read()?;
            if let Some(pid) = registry.by_name.get(name) {
                return Ok((*pid, false));
            }
        }
        let mut registry = self.paths.write()?;
        if let Some(pid) = registry.by_name.get(name) {
            return Ok((*pid, false));
        }
        let pid = PathId(registry.names.len() as Tick + 1);
        registry.names.push(name.to_string());
        registry.by_name.insert(name.to_string(), pid);
        Ok((pid, true))
    }

    /// Resolve a path handle back to its dotted name.
    pub fn path_name(&self, pid: PathId) -> Option<String> {
        let registry = self.paths.read().ok()?;
        registry.names.get((pid.0 as usize).checked_sub(1)?).cloned()
    }

    /// Return the shape id for a value, registering the shape if needed.
    /// The second component tells the caller whether a ShapeRegister marker
    /// is due.
    pub fn shape_of(&self, value: &Value) -> Result<(ShapeId, bool)> {
        if value.is_null() {
            return Ok((SHAPE_SID_NULL, false));
        }
        let signature = signature_of(value);
        {
            let shapes = self.shapes.read()?;
            if let Some(sid) = shapes.get(&signature) {
                return Ok((*sid, false));
            }
        }
        let mut shapes = self.shapes.write()?;
        if let Some(sid) = shapes.get(&signature) {
            return Ok((*sid, false));
        }
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst);
        shapes.insert(signature, sid);
        Ok((sid, true))
    }

    /// Re-register a shape signature replayed from a marker.
    pub fn register_shape(&self, signature: &str, sid: ShapeId) -> Result<()> {
        let mut shapes = self.shapes.write()?;
        shapes.entry(signature.to_string()).or_insert(sid);
        // keep allocation above anything replayed
        self.next_sid.fetch_max(sid + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Re-register an attribute path replayed from a marker.
    pub fn register_attribute(&self, name: &str) -> Result<PathId> {
        Ok(self.attribute_path(name)?.0)
    }

    /// Extract the attribute at `path` from a decoded document body.
    /// Returns None if any segment of the path is missing.
    pub fn extract(&self, body: &Value, path: &str) -> Result<Option<ShapedValue>> {
        let mut current = body;
        for segment in path.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        let (sid, _) = self.shape_of(current)?;
        Ok(Some(ShapedValue::new(sid, current.clone())))
    }

    /// Number of registered shapes.
    pub fn shape_count(&self) -> usize {
        self.shapes.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Number of registered attribute paths.
    pub fn attribute_count(&self) -> usize {
        self.paths.read().map(|p| p.names.len()).unwrap_or(0)
    }
}

impl Default for Shaper {
    fn default() -> Self {
        Self::new()
    }
}

/// Structural signature of a value: the type skeleton, ignoring scalar
/// payloads. Two documents with the same attribute names and types share a
/// shape.
pub fn signature_of(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "num".to_string(),
        Value::String(_) => "str".to_string(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(signature_of).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}:{}", k, signature_of(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_same_structure_shares_shape() {
        let shaper = Shaper::new();
        let (a, new_a) = shaper.shape_of(&json!({"x": 1, "y": "s"})).unwrap();
        let (b, new_b) = shaper.shape_of(&json!({"x": 99, "y": "t"})).unwrap();
        assert!(new_a);
        assert!(!new_b);
        assert_eq!(a, b);

        let (c, _) = shaper.shape_of(&json!({"x": 1})).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_null_has_reserved_sid() {
        let shaper = Shaper::new();
        let (sid, is_new) = shaper.shape_of(&json!(null)).unwrap();
        assert_eq!(sid, SHAPE_SID_NULL);
        assert!(!is_new);
    }

    #[test]
    fn test_extract_walks_dotted_paths() {
        let shaper = Shaper::new();
        let doc = json!({"a": {"b": {"c": 7}}, "d": null});

        let found = shaper.extract(&doc, "a.b.c").unwrap().unwrap();
        assert_eq!(found.value(), &json!(7));

        assert!(shaper.extract(&doc, "a.b.missing").unwrap().is_none());

        let null_attr = shaper.extract(&doc, "d").unwrap().unwrap();
        assert!(null_attr.is_null());
        assert_eq!(null_attr.sid(), SHAPE_SID_NULL);
    }

    #[test]
    fn test_attribute_paths_are_interned() {
        let shaper = Shaper::new();
        let (p1, new1) = shaper.attribute_path("name").unwrap();
        let (p2, new2) = shaper.attribute_path("name").unwrap();
        assert!(new1);
        assert!(!new2);
        assert_eq!(p1, p2);
        assert_eq!(shaper.path_name(p1).unwrap(), "name");
    }
}
