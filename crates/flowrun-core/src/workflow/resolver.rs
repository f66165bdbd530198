//! `${name}` placeholder resolution against an execution's variable table.
//!
//! Rules:
//! - A string that is exactly one placeholder (`"${items}"`) resolves to the
//!   typed variable value.
//! - Any other string gets substring substitution, each value rendered as
//!   text (strings raw, everything else as compact JSON).
//! - Objects and arrays are resolved recursively.
//! - Dotted names (`${user.name}`, `${items.0}`) traverse objects and arrays
//!   when no variable has the full dotted name.
//! - Unresolved names are left as literal text.

use std::collections::HashMap;

use serde_json::Value;

// ---------------------------------------------------------------------------
// Variable lookup
// ---------------------------------------------------------------------------

/// Read access to a variable table.
pub trait Variables {
    fn get_var(&self, name: &str) -> Option<&Value>;
}

impl Variables for HashMap<String, Value> {
    fn get_var(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// Local bindings layered over a parent table (transform filters bind
/// `item` and `index` this way).
pub struct Scoped<'a> {
    pub locals: &'a HashMap<String, Value>,
    pub parent: &'a dyn Variables,
}

impl Variables for Scoped<'_> {
    fn get_var(&self, name: &str) -> Option<&Value> {
        self.locals.get(name).or_else(|| self.parent.get_var(name))
    }
}

/// Look up a variable, falling back to dotted-path traversal.
pub fn lookup<'v>(vars: &'v dyn Variables, name: &str) -> Option<&'v Value> {
    if let Some(value) = vars.get_var(name) {
        return Some(value);
    }
    let (head, rest) = name.split_once('.')?;
    let root = vars.get_var(head)?;
    get_path(root, rest)
}

/// Traverse a dotted path (`a.b.0.c`) into a JSON value.
pub fn get_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve every placeholder inside a JSON value.
pub fn resolve_value(value: &Value, vars: &dyn Variables) -> Value {
    match value {
        Value::String(s) => resolve_str(s, vars),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a string template. An exact single placeholder keeps its type.
pub fn resolve_str(template: &str, vars: &dyn Variables) -> Value {
    if let Some(name) = exact_placeholder(template) {
        if let Some(value) = lookup(vars, name) {
            return value.clone();
        }
        return Value::String(template.to_string());
    }
    Value::String(substitute(template, vars))
}

/// Substring substitution; always produces text.
pub fn substitute(template: &str, vars: &dyn Variables) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = after[..end].trim();
                match lookup(vars, name) {
                    Some(value) => out.push_str(&value_to_string(value)),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render a value as text for embedding in a string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// If `template` is exactly `${name}`, return the trimmed name.
fn exact_placeholder(template: &str) -> Option<&str> {
    let inner = template.trim().strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains('}') || inner.contains("${") {
        return None;
    }
    Some(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), json!("Ada"));
        vars.insert("count".to_string(), json!(3));
        vars.insert("items".to_string(), json!([10, 20, 30]));
        vars.insert("user".to_string(), json!({ "profile": { "city": "Paris" } }));
        vars.insert("a.b".to_string(), json!("flat"));
        vars
    }

    #[test]
    fn test_exact_placeholder_keeps_type() {
        let vars = vars();
        assert_eq!(resolve_str("${items}", &vars), json!([10, 20, 30]));
        assert_eq!(resolve_str("${count}", &vars), json!(3));
        assert_eq!(resolve_str(" ${ count } ", &vars), json!(3));
    }

    #[test]
    fn test_substring_substitution() {
        let vars = vars();
        assert_eq!(
            resolve_str("Hello ${name}, you have ${count} items", &vars),
            json!("Hello Ada, you have 3 items")
        );
        assert_eq!(resolve_str("list=${items}", &vars), json!("list=[10,20,30]"));
    }

    #[test]
    fn test_unresolved_left_literal() {
        let vars = vars();
        assert_eq!(resolve_str("${missing}", &vars), json!("${missing}"));
        assert_eq!(resolve_str("hi ${missing}!", &vars), json!("hi ${missing}!"));
        assert_eq!(resolve_str("broken ${name", &vars), json!("broken ${name"));
    }

    #[test]
    fn test_dotted_paths() {
        let vars = vars();
        assert_eq!(resolve_str("${user.profile.city}", &vars), json!("Paris"));
        assert_eq!(resolve_str("${items.1}", &vars), json!(20));
        assert_eq!(resolve_str("${a.b}", &vars), json!("flat"));
        assert_eq!(resolve_str("${items.9}", &vars), json!("${items.9}"));
    }

    #[test]
    fn test_nested_values_resolve_recursively() {
        let vars = vars();
        let input = json!({ "who": "${name}", "list": ["${count}", "x${count}"], "n": 1 });
        assert_eq!(
            resolve_value(&input, &vars),
            json!({ "who": "Ada", "list": [3, "x3"], "n": 1 })
        );
    }

    #[test]
    fn test_scoped_locals_shadow_parent() {
        let parent = vars();
        let mut locals = HashMap::new();
        locals.insert("name".to_string(), json!("Grace"));
        let scoped = Scoped { locals: &locals, parent: &parent };
        assert_eq!(resolve_str("${name}/${count}", &scoped), json!("Grace/3"));
    }
}
