// ============================================================================
// Documents and key generation
// ============================================================================

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::{DatafileId, DbError, Result, RevisionId, Tick};
use crate::shape::ShapeId;
use crate::wal::EdgeRef;

/// The serialized body of one document version plus its extracted key.
/// `fid` names the datafile the version was replayed from (0 for versions
/// created live).
#[derive(Debug, Clone)]
pub struct DocumentBody {
    pub key: String,
    pub revision: RevisionId,
    pub shape: ShapeId,
    pub data: Vec<u8>,
    pub edge: Option<(EdgeRef, EdgeRef)>,
    pub fid: DatafileId,
}

impl DocumentBody {
    pub fn new(key: String, revision: RevisionId, shape: ShapeId, value: &Value) -> Result<Self> {
        let data = rmp_serde::to_vec(value)?;
        Ok(Self {
            key,
            revision,
            shape,
            data,
            edge: None,
            fid: DatafileId(0),
        })
    }

    pub fn new_edge(
        key: String,
        revision: RevisionId,
        shape: ShapeId,
        value: &Value,
        from: EdgeRef,
        to: EdgeRef,
    ) -> Result<Self> {
        let mut body = Self::new(key, revision, shape, value)?;
        body.edge = Some((from, to));
        Ok(body)
    }

    pub fn from_parts(
        key: String,
        revision: RevisionId,
        shape: ShapeId,
        data: Vec<u8>,
        edge: Option<(EdgeRef, EdgeRef)>,
        fid: DatafileId,
    ) -> Self {
        Self {
            key,
            revision,
            shape,
            data,
            edge,
            fid,
        }
    }

    /// Decode the body back into its JSON form.
    pub fn decode(&self) -> Result<Value> {
        Ok(rmp_serde::from_slice(&self.data)?)
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_edge(&self) -> bool {
        self.edge.is_some()
    }
}

// ============================================================================
// Key generators
// ============================================================================

const MAX_KEY_LENGTH: usize = 254;

fn is_allowed_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.' | '@')
}

/// Syntax check shared by all generators.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(DbError::IllegalName(format!(
            "invalid document key '{}'",
            key
        )));
    }
    if !key.chars().all(is_allowed_key_char) {
        return Err(DbError::IllegalName(format!(
            "invalid document key '{}'",
            key
        )));
    }
    Ok(())
}

/// Per-collection key generator. `track` is fed every key seen during
/// datafile replay so generation resumes above replayed keys.
#[derive(Debug)]
pub enum KeyGenerator {
    /// Server-generated numeric-string keys taken from ticks; user-supplied
    /// keys optionally allowed.
    Traditional { allow_user_keys: bool },
    /// offset + n * increment counters; user keys must be numeric.
    AutoIncrement {
        allow_user_keys: bool,
        offset: u64,
        increment: u64,
        last: AtomicU64,
    },
}

impl KeyGenerator {
    pub fn traditional() -> Self {
        KeyGenerator::Traditional {
            allow_user_keys: true,
        }
    }

    /// Build a generator from its JSON options, as persisted beside the
    /// collection. Unknown types fail with InvalidKeyGenerator.
    pub fn from_json(options: &Value) -> Result<Self> {
        let type_name = options
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("traditional");
        let allow_user_keys = options
            .get("allowUserKeys")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        match type_name {
            "traditional" => Ok(KeyGenerator::Traditional { allow_user_keys }),
            "autoincrement" => {
                let offset = options.get("offset").and_then(Value::as_u64).unwrap_or(0);
                let increment = options
                    .get("increment")
                    .and_then(Value::as_u64)
                    .unwrap_or(1);
                if increment == 0 || increment > 1u64 << 16 {
                    return Err(DbError::InvalidKeyGenerator(format!(
                        "invalid increment {}",
                        increment
                    )));
                }
                Ok(KeyGenerator::AutoIncrement {
                    allow_user_keys,
                    offset,
                    increment,
                    last: AtomicU64::new(0),
                })
            }
            other => Err(DbError::InvalidKeyGenerator(format!(
                "unknown key generator type '{}'",
                other
            ))),
        }
    }

    /// Validate a user-supplied key.
    pub fn validate(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        match self {
            KeyGenerator::Traditional { allow_user_keys } => {
                if !allow_user_keys {
                    return Err(DbError::IllegalName(
                        "collection does not allow user-defined keys".into(),
                    ));
                }
            }
            KeyGenerator::AutoIncrement {
                allow_user_keys, ..
            } => {
                if !allow_user_keys {
                    return Err(DbError::IllegalName(
                        "collection does not allow user-defined keys".into(),
                    ));
                }
                if key.parse::<u64>().is_err() {
                    return Err(DbError::IllegalName(format!(
                        "autoincrement keys must be numeric, got '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Generate a key for a document without one.
    pub fn generate(&self, tick: Tick) -> String {
        match self {
            KeyGenerator::Traditional { .. } => tick.to_string(),
            KeyGenerator::AutoIncrement {
                offset,
                increment,
                last,
                ..
            } => {
                let mut current = last.load(Ordering::SeqCst);
                loop {
                    let base = current.max(*offset);
                    let steps = base.saturating_sub(*offset) / increment + 1;
                    let next = offset + steps * increment;
                    match last.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                        Ok(_) => return next.to_string(),
                        Err(seen) => current = seen,
                    }
                }
            }
        }
    }

    /// Record a key observed during replay.
    pub fn track(&self, key: &str) {
        if let KeyGenerator::AutoIncrement { last, .. } = self {
            if let Ok(value) = key.parse::<u64>() {
                last.fetch_max(value, Ordering::SeqCst);
            }
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyGenerator::Traditional { allow_user_keys } => serde_json::json!({
                "type": "traditional",
                "allowUserKeys": allow_user_keys,
            }),
            KeyGenerator::AutoIncrement {
                allow_user_keys,
                offset,
                increment,
                ..
            } => serde_json::json!({
                "type": "autoincrement",
                "allowUserKeys": allow_user_keys,
                "offset": offset,
                "increment": increment,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_round_trip() {
        let value = json!({"name": "tintin", "age": 12});
        let body = DocumentBody::new("k1".into(), 99, 2, &value).unwrap();
        assert_eq!(body.decode().unwrap(), value);
        assert!(body.byte_size() > 0);
        assert!(!body.is_edge());
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("abc-123_x:y.z@h").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key(&"x".repeat(255)).is_err());
    }

    #[test]
    fn test_traditional_generates_from_ticks() {
        let generator = KeyGenerator::traditional();
        assert_eq!(generator.generate(42), "42");
        assert!(generator.validate("user-key").is_ok());
    }

    #[test]
    fn test_autoincrement_sequence() {
        let generator = KeyGenerator::from_json(&json!({
            "type": "autoincrement", "offset": 10, "increment": 5,
        }))
        .unwrap();
        assert_eq!(generator.generate(0), "15");
        assert_eq!(generator.generate(0), "20");

        generator.track("100");
        assert_eq!(generator.generate(0), "105");

        assert!(generator.validate("123").is_ok());
        assert!(generator.validate("abc").is_err());
    }

    #[test]
    fn test_unknown_generator_type_fails() {
        let err = KeyGenerator::from_json(&json!({"type": "padded"})).unwrap_err();
        assert!(matches!(err, DbError::InvalidKeyGenerator(_)));
    }
}
