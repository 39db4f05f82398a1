use serde_json::{Map, Value};

/// Keyword-style arguments attached to a task invocation.
///
/// Arguments are opaque to the scheduler: they are serialised to JSON when a
/// task is queued and handed back, structurally unchanged, when a worker
/// executes it. Task bodies own the schema of their payload.
pub type Arguments = Map<String, Value>;

/// Build an [`Arguments`] map from a `serde_json::Value` object literal.
///
/// Convenience for call sites using `serde_json::json!`:
///
/// ```
/// use norn_core::types::object_arguments;
/// let args = object_arguments(serde_json::json!({"user_id": 7}));
/// assert_eq!(args["user_id"], 7);
/// ```
///
/// # Panics
///
/// Panics if `value` is not a JSON object. Invocation arguments are always
/// keyword maps, so a non-object literal is a programming mistake at the
/// call site.
pub fn object_arguments(value: Value) -> Arguments {
    match value {
        Value::Object(map) => map,
        other => panic!("task arguments must be a JSON object, got: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_literal_becomes_arguments() {
        let args = object_arguments(serde_json::json!({"a": 1, "b": [1, 2]}));
        assert_eq!(args.len(), 2);
        assert_eq!(args["b"], serde_json::json!([1, 2]));
    }

    #[test]
    #[should_panic(expected = "must be a JSON object")]
    fn non_object_literal_panics() {
        object_arguments(serde_json::json!([1, 2, 3]));
    }
}
