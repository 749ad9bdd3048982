//! The per-instance variable bag (§3 "context", §9 "dynamic variable bag").
//!
//! Backed by a `serde_json::Value::Object` rather than a hand-rolled variant
//! map: the context already needs to round-trip through the event store and
//! the AG-UI wire protocol as JSON, and task runners (script, agent, service)
//! naturally produce JSON-shaped results.

use serde_json::{Map, Value};

#[derive(Clone, Debug, Default)]
pub struct Context {
    root: Value,
}

impl Context {
    pub fn new(initial: Value) -> Self {
        let root = match initial {
            Value::Object(_) => initial,
            Value::Null => Value::Object(Map::new()),
            other => {
                // Non-object initial context is preserved under a single key
                // rather than silently discarded.
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Value::Object(map)
            }
        };
        Self { root }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Read a dotted path (`a.b.c`). Missing segments yield `None`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get(path).map(value_to_display_string)
    }

    /// Write a dotted path, creating intermediate objects as needed.
    pub fn set(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = &mut self.root;
        for segment in &segments[..segments.len() - 1] {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            let map = current.as_object_mut().expect("just normalized to object");
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current
            .as_object_mut()
            .expect("just normalized to object")
            .insert(segments[segments.len() - 1].to_string(), value);
    }

    /// Deep-merge `patch` into the context root. Object keys recurse; any
    /// other value (including arrays) replaces the existing value outright —
    /// "last writer wins" per §5's shared-resource policy.
    pub fn merge(&mut self, patch: Value) {
        deep_merge(&mut self.root, patch);
    }

    /// Resolve every `${a.b.c}` occurrence in `template` against this
    /// context. A path that resolves to a string is substituted verbatim; any
    /// other JSON value is substituted via its compact JSON rendering except
    /// when the *entire* template is a single placeholder, in which case the
    /// raw value's display form is used (so `${x}` with `x = 12` interpolates
    /// to the bare token `12`, matching the "as primitive" expectation of
    /// gateway conditions).
    pub fn interpolate(&self, template: &str) -> String {
        if let Some(path) = single_placeholder(template) {
            return self
                .get(path)
                .map(value_to_display_string)
                .unwrap_or_default();
        }
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let path = &after[..end];
                    out.push_str(&self.get(path).map(value_to_display_string).unwrap_or_default());
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                    break;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// If `template` is exactly `${path}` with nothing else, return `path`.
fn single_placeholder(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix("${")?.strip_suffix('}')?;
    Some(inner)
}

fn value_to_display_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                deep_merge(base_map.entry(k).or_insert(Value::Null), v);
            }
        }
        (base, patch) => *base = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_path_read() {
        let ctx = Context::new(json!({"a": {"b": {"c": 12}}}));
        assert_eq!(ctx.get("a.b.c"), Some(&json!(12)));
        assert_eq!(ctx.get("a.missing"), None);
    }

    #[test]
    fn dotted_path_write_creates_intermediates() {
        let mut ctx = Context::new(json!({}));
        ctx.set("order.amount", json!(99));
        assert_eq!(ctx.get("order.amount"), Some(&json!(99)));
    }

    #[test]
    fn merge_is_deep_and_last_writer_wins_on_scalars() {
        let mut ctx = Context::new(json!({"a": {"x": 1, "y": 2}}));
        ctx.merge(json!({"a": {"y": 3, "z": 4}}));
        assert_eq!(ctx.get("a.x"), Some(&json!(1)));
        assert_eq!(ctx.get("a.y"), Some(&json!(3)));
        assert_eq!(ctx.get("a.z"), Some(&json!(4)));
    }

    #[test]
    fn interpolate_mixed_template() {
        let ctx = Context::new(json!({"x": 12, "name": "ord-1"}));
        assert_eq!(ctx.interpolate("value is ${x} for ${name}"), "value is 12 for ord-1");
    }

    #[test]
    fn interpolate_whole_placeholder_preserves_primitive_display() {
        let ctx = Context::new(json!({"x": 12}));
        assert_eq!(ctx.interpolate("${x}"), "12");
    }

    #[test]
    fn interpolate_missing_path_yields_empty() {
        let ctx = Context::new(json!({}));
        assert_eq!(ctx.interpolate("${missing.path}"), "");
    }
}
