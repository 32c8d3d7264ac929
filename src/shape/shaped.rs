// ============================================================================
// Shaped values
// ============================================================================

use serde_json::Value;
use std::cmp::Ordering;

use crate::core::Tick;

/// Identifier of a shape (a structural type descriptor). Stable across the
/// process once issued by the shaper.
pub type ShapeId = Tick;

/// The shape id reserved for the JSON null value.
pub const SHAPE_SID_NULL: ShapeId = 1;

/// An attribute value extracted from a document, tagged with its shape id
/// and carrying the canonical byte encoding of the payload.
///
/// Hash indexes hash only `bytes` (never the shape id) so that equal value
/// bytes compare equal across shapes; equality still checks the shape id
/// first, then length, then the payload.
#[derive(Debug, Clone)]
pub struct ShapedValue {
    sid: ShapeId,
    value: Value,
    bytes: Vec<u8>,
}

impl ShapedValue {
    pub fn new(sid: ShapeId, value: Value) -> Self {
        let bytes = rmp_serde::to_vec(&value).unwrap_or_default();
        Self { sid, value, bytes }
    }

    pub fn null() -> Self {
        Self::new(SHAPE_SID_NULL, Value::Null)
    }

    pub fn sid(&self) -> ShapeId {
        self.sid
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn payload_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }
}

impl PartialEq for ShapedValue {
    fn eq(&self, other: &Self) -> bool {
        self.sid == other.sid
            && self.bytes.len() == other.bytes.len()
            && self.bytes == other.bytes
    }
}

impl Eq for ShapedValue {}

/// Rank in the shape-typed total order:
/// null < boolean < number < string < sequence < object.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values used by the skiplist comparator.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    let lr = type_rank(left);
    let rr = type_rank(right);
    if lr != rr {
        return lr.cmp(&rr);
    }

    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let fa = a.as_f64().unwrap_or(f64::NAN);
            let fb = b.as_f64().unwrap_or(f64::NAN);
            fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            // serde_json's map iterates keys in sorted order
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                let ord = ka.cmp(kb);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = compare_values(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => unreachable!("type ranks matched"),
    }
}

pub fn compare_shaped(left: &ShapedValue, right: &ShapedValue) -> Ordering {
    compare_values(left.value(), right.value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_order() {
        let values = [
            json!(null),
            json!(false),
            json!(42),
            json!("a"),
            json!([1]),
            json!({"a": 1}),
        ];
        for window in values.windows(2) {
            assert_eq!(compare_values(&window[0], &window[1]), Ordering::Less);
        }
    }

    #[test]
    fn test_numeric_order_crosses_int_and_float() {
        assert_eq!(compare_values(&json!(1), &json!(1.5)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.0), &json!(2)), Ordering::Equal);
    }

    #[test]
    fn test_equality_uses_payload_bytes() {
        let a = ShapedValue::new(7, json!("x"));
        let b = ShapedValue::new(7, json!("x"));
        let c = ShapedValue::new(8, json!("x"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
