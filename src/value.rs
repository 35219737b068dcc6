//! Reply values returned by the store.
//!
//! This is the decoded shape of a server reply. The transport collaborator
//! owns the wire protocol; by the time a reply reaches this crate it is
//! already one of these variants.

/// A decoded server reply.
///
/// Mirrors the reply types of the target store: a status line, an error
/// line, an integer, a bulk payload, an absent value, or an array of
/// nested replies (`HGETALL` returns field/value pairs flattened into one
/// array).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Status reply such as `OK`.
    Status(String),
    /// Error reply. Top-level errors are normally surfaced as
    /// [`RedisError::Remote`](crate::transport::RedisError::Remote) by the
    /// dispatcher; this variant also covers errors embedded in arrays.
    Error(String),
    Integer(i64),
    /// Bulk payload. The store is byte-safe but every value this layer
    /// reads and writes is textual, so bulk data is kept as a `String`.
    Data(String),
    Nil,
    Array(Vec<Value>),
}

impl Value {
    pub fn ok() -> Value {
        Value::Status("OK".to_string())
    }

    /// Textual form of a status or bulk reply.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Status(s) | Value::Data(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric form of an integer or numeric bulk reply.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Data(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Interpret an array reply of flattened `field, value, field, value`
    /// elements as pairs, the shape `HGETALL` returns.
    ///
    /// `Nil` is treated as an empty pair list (absent key). Returns `None`
    /// for replies that are not an array of an even number of textual
    /// elements, so callers can surface a decode error instead of silently
    /// coercing.
    pub fn as_pairs(&self) -> Option<Vec<(String, String)>> {
        let items = match self {
            Value::Array(items) => items,
            Value::Nil => return Some(Vec::new()),
            _ => return None,
        };
        if items.len() % 2 != 0 {
            return None;
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        for chunk in items.chunks_exact(2) {
            let field = chunk[0].as_str()?;
            let value = chunk[1].as_str()?;
            pairs.push((field.to_string(), value.to_string()));
        }
        Some(pairs)
    }
}
