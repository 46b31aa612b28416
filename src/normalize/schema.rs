//! Tool input-schema model: classification, strict-mode coercion and validation,
//! sample generation, and the Gemini-compatible cleanup.
//!
//! Recursion over schema trees always threads an explicit depth and stops at
//! [`MAX_SCHEMA_DEPTH`].

use serde_json::{json, Map, Value};

/// Recursion cap for every schema walk.
pub const MAX_SCHEMA_DEPTH: usize = 64;

const UNION_KEYS: &[&str] = &["anyOf", "oneOf", "allOf"];
const CONDITIONAL_KEYS: &[&str] = &["not", "if", "then", "else"];
const DEFS_KEYS: &[&str] = &["$defs", "definitions"];

/// Kind of a schema node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Object,
    Array,
    Union,
    Reference,
    Leaf,
}

/// Classify a schema node. `$ref` wins over everything, then unions, then structure.
pub fn classify(schema: &Value) -> SchemaKind {
    let Some(obj) = schema.as_object() else {
        return SchemaKind::Leaf;
    };
    if obj.get("$ref").and_then(Value::as_str).is_some() {
        return SchemaKind::Reference;
    }
    if UNION_KEYS.iter().any(|k| obj.get(*k).map(Value::is_array).unwrap_or(false)) {
        return SchemaKind::Union;
    }
    if has_type(obj, "object") || obj.get("properties").map(Value::is_object).unwrap_or(false) {
        return SchemaKind::Object;
    }
    if has_type(obj, "array") || obj.contains_key("items") || obj.contains_key("prefixItems") {
        return SchemaKind::Array;
    }
    SchemaKind::Leaf
}

fn has_type(obj: &Map<String, Value>, wanted: &str) -> bool {
    match obj.get("type") {
        Some(Value::String(t)) => t == wanted,
        Some(Value::Array(ts)) => ts.iter().any(|t| t.as_str() == Some(wanted)),
        _ => false,
    }
}

fn is_object_node(obj: &Map<String, Value>) -> bool {
    has_type(obj, "object") || obj.get("properties").map(Value::is_object).unwrap_or(false)
}

/// Apply `f` to every direct sub-schema (properties, items, prefixItems, unions,
/// conditionals, definitions). `f` receives the JSON-pointer-ish path segment.
fn for_each_child_mut(obj: &mut Map<String, Value>, mut f: impl FnMut(&str, &mut Value)) {
    if let Some(Value::Object(props)) = obj.get_mut("properties") {
        for (k, v) in props.iter_mut() {
            f(&format!("properties.{}", k), v);
        }
    }
    match obj.get_mut("items") {
        Some(Value::Array(items)) => {
            for (i, v) in items.iter_mut().enumerate() {
                f(&format!("items[{}]", i), v);
            }
        }
        Some(v @ Value::Object(_)) => f("items", v),
        _ => {}
    }
    if let Some(Value::Array(items)) = obj.get_mut("prefixItems") {
        for (i, v) in items.iter_mut().enumerate() {
            f(&format!("prefixItems[{}]", i), v);
        }
    }
    for key in UNION_KEYS {
        if let Some(Value::Array(branches)) = obj.get_mut(*key) {
            for (i, v) in branches.iter_mut().enumerate() {
                f(&format!("{}[{}]", key, i), v);
            }
        }
    }
    for key in CONDITIONAL_KEYS {
        if let Some(v @ Value::Object(_)) = obj.get_mut(*key) {
            f(key, v);
        }
    }
    for key in DEFS_KEYS {
        if let Some(Value::Object(defs)) = obj.get_mut(*key) {
            for (k, v) in defs.iter_mut() {
                f(&format!("{}.{}", key, k), v);
            }
        }
    }
}

fn for_each_child<'a>(obj: &'a Map<String, Value>, mut f: impl FnMut(String, &'a Value)) {
    if let Some(Value::Object(props)) = obj.get("properties") {
        for (k, v) in props {
            f(format!("properties.{}", k), v);
        }
    }
    match obj.get("items") {
        Some(Value::Array(items)) => {
            for (i, v) in items.iter().enumerate() {
                f(format!("items[{}]", i), v);
            }
        }
        Some(v @ Value::Object(_)) => f("items".to_string(), v),
        _ => {}
    }
    if let Some(Value::Array(items)) = obj.get("prefixItems") {
        for (i, v) in items.iter().enumerate() {
            f(format!("prefixItems[{}]", i), v);
        }
    }
    for key in UNION_KEYS {
        if let Some(Value::Array(branches)) = obj.get(*key) {
            for (i, v) in branches.iter().enumerate() {
                f(format!("{}[{}]", key, i), v);
            }
        }
    }
    for key in CONDITIONAL_KEYS {
        if let Some(v @ Value::Object(_)) = obj.get(*key) {
            f(key.to_string(), v);
        }
    }
    for key in DEFS_KEYS {
        if let Some(Value::Object(defs)) = obj.get(*key) {
            for (k, v) in defs {
                f(format!("{}.{}", key, k), v);
            }
        }
    }
}

/// Rewrite a schema so every object (sub)schema satisfies strict mode:
/// `additionalProperties: false` and every property key listed in `required`.
///
/// Properties that were optional become nullable so that the model may still omit a
/// value. `oneOf` is rewritten to `anyOf`, which strict mode accepts. A non-object root
/// is wrapped into an empty object schema.
pub fn coerce_strict_schema(schema: &Value) -> Value {
    let mut out = match schema {
        Value::Object(_) => schema.clone(),
        _ => json!({"type": "object", "properties": {}}),
    };
    if let Some(obj) = out.as_object_mut() {
        if !is_object_node(obj) && classify_map(obj) == SchemaKind::Leaf {
            obj.insert("type".into(), json!("object"));
            obj.entry("properties").or_insert_with(|| json!({}));
        }
    }
    coerce_node(&mut out, 0);
    out
}

fn classify_map(obj: &Map<String, Value>) -> SchemaKind {
    classify(&Value::Object(obj.clone()))
}

fn coerce_node(node: &mut Value, depth: usize) {
    if depth >= MAX_SCHEMA_DEPTH {
        return;
    }
    let Some(obj) = node.as_object_mut() else {
        return;
    };

    if let Some(branches) = obj.remove("oneOf") {
        match obj.get_mut("anyOf") {
            Some(Value::Array(existing)) => {
                if let Value::Array(b) = branches {
                    existing.extend(b);
                }
            }
            _ => {
                obj.insert("anyOf".into(), branches);
            }
        }
    }

    if is_object_node(obj) {
        let previously_required: Vec<String> = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let props = obj
            .entry("properties")
            .or_insert_with(|| json!({}));
        let mut keys = Vec::new();
        if let Value::Object(props) = props {
            for (key, prop) in props.iter_mut() {
                if !previously_required.contains(key) {
                    make_nullable(prop);
                }
                keys.push(Value::String(key.clone()));
            }
        }
        obj.insert("required".into(), Value::Array(keys));
        obj.insert("additionalProperties".into(), Value::Bool(false));
    }

    for_each_child_mut(obj, |_, child| coerce_node(child, depth + 1));
}

fn make_nullable(prop: &mut Value) {
    let Some(obj) = prop.as_object_mut() else {
        return;
    };
    match obj.get("type").cloned() {
        Some(Value::String(t)) => {
            if t != "null" {
                obj.insert("type".into(), json!([t, "null"]));
            }
        }
        Some(Value::Array(mut ts)) => {
            if !ts.iter().any(|t| t.as_str() == Some("null")) {
                ts.push(json!("null"));
                obj.insert("type".into(), Value::Array(ts));
            }
        }
        _ => {
            let key = if obj.contains_key("anyOf") { "anyOf" } else { "oneOf" };
            if let Some(Value::Array(branches)) = obj.get_mut(key) {
                if !branches.iter().any(|b| b.get("type").and_then(Value::as_str) == Some("null")) {
                    branches.push(json!({"type": "null"}));
                }
            }
        }
    }
    if let Some(Value::Array(values)) = obj.get_mut("enum") {
        if !values.contains(&Value::Null) {
            values.push(Value::Null);
        }
    }
}

/// One strict-mode violation, located by a dotted path from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Walk the schema and report every object (sub)schema that violates strict mode.
pub fn validate_strict_schema(schema: &Value) -> Vec<SchemaIssue> {
    let mut issues = Vec::new();
    validate_node(schema, "$", 0, &mut issues);
    issues
}

fn validate_node(node: &Value, path: &str, depth: usize, issues: &mut Vec<SchemaIssue>) {
    if depth >= MAX_SCHEMA_DEPTH {
        issues.push(SchemaIssue {
            path: path.to_string(),
            message: format!("schema nesting exceeds {} levels", MAX_SCHEMA_DEPTH),
        });
        return;
    }
    let Some(obj) = node.as_object() else {
        return;
    };

    if is_object_node(obj) {
        if obj.get("additionalProperties") != Some(&Value::Bool(false)) {
            issues.push(SchemaIssue {
                path: path.to_string(),
                message: "additionalProperties must be false".into(),
            });
        }
        let required: Vec<&str> = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if let Some(Value::Object(props)) = obj.get("properties") {
            let missing: Vec<&str> = props
                .keys()
                .map(String::as_str)
                .filter(|k| !required.contains(k))
                .collect();
            if !missing.is_empty() {
                issues.push(SchemaIssue {
                    path: path.to_string(),
                    message: format!("required is missing: {}", missing.join(", ")),
                });
            }
        }
    }
    if obj.contains_key("oneOf") {
        issues.push(SchemaIssue {
            path: path.to_string(),
            message: "oneOf is not supported in strict mode".into(),
        });
    }

    for_each_child(obj, |segment, child| {
        validate_node(child, &format!("{}.{}", path, segment), depth + 1, issues)
    });
}

/// Produce a value that should validate against `schema`: required properties are
/// filled, strings become `"sample"` (or a short candidate matching `pattern`), numbers
/// are `0` clamped into their bounds, unions take their first branch and local `$ref`s
/// are resolved against the root.
pub fn sample_json_from_schema(schema: &Value) -> Value {
    sample_node(schema, schema, 0)
}

fn resolve_ref<'a>(root: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix('#')?;
    if pointer.is_empty() {
        return Some(root);
    }
    root.pointer(pointer)
}

fn sample_node(node: &Value, root: &Value, depth: usize) -> Value {
    if depth >= MAX_SCHEMA_DEPTH {
        return Value::Null;
    }
    let obj = match node {
        Value::Object(obj) => obj,
        // `true` schemas accept anything.
        _ => return json!({}),
    };

    if let Some(c) = obj.get("const") {
        return c.clone();
    }
    if let Some(first) = obj.get("enum").and_then(Value::as_array).and_then(|e| e.first()) {
        return first.clone();
    }
    if let Some(d) = obj.get("default") {
        return d.clone();
    }
    if let Some(examples) = obj.get("examples").and_then(Value::as_array) {
        if let Some(first) = examples.first() {
            return first.clone();
        }
    }

    match classify(node) {
        SchemaKind::Reference => {
            let target = obj
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| resolve_ref(root, r));
            match target {
                Some(t) => sample_node(t, root, depth + 1),
                None => Value::Null,
            }
        }
        SchemaKind::Union => {
            if let Some(Value::Array(all)) = obj.get("allOf") {
                let mut merged = Map::new();
                for branch in all {
                    match sample_node(branch, root, depth + 1) {
                        Value::Object(m) => merged.extend(m),
                        other if all.len() == 1 => return other,
                        _ => {}
                    }
                }
                if let Value::Object(own) = sample_object(obj, root, depth) {
                    merged.extend(own);
                }
                return Value::Object(merged);
            }
            let branches = obj
                .get("anyOf")
                .or_else(|| obj.get("oneOf"))
                .and_then(Value::as_array);
            let first = branches.and_then(|b| {
                b.iter()
                    .find(|br| br.get("type").and_then(Value::as_str) != Some("null"))
                    .or_else(|| b.first())
            });
            match first {
                Some(b) => sample_node(b, root, depth + 1),
                None => Value::Null,
            }
        }
        SchemaKind::Object => sample_object(obj, root, depth),
        SchemaKind::Array => {
            if let Some(Value::Array(prefix)) = obj.get("prefixItems") {
                return Value::Array(prefix.iter().map(|p| sample_node(p, root, depth + 1)).collect());
            }
            let min = obj.get("minItems").and_then(Value::as_u64).unwrap_or(0) as usize;
            let item = obj.get("items").cloned().unwrap_or_else(|| json!({"type": "string"}));
            Value::Array((0..min).map(|_| sample_node(&item, root, depth + 1)).collect())
        }
        SchemaKind::Leaf => sample_leaf(obj),
    }
}

fn sample_object(obj: &Map<String, Value>, root: &Value, depth: usize) -> Value {
    let mut out = Map::new();
    let props = obj.get("properties").and_then(Value::as_object);
    let required = obj
        .get("required")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for key in required.iter().filter_map(Value::as_str) {
        let value = props
            .and_then(|p| p.get(key))
            .map(|s| sample_node(s, root, depth + 1))
            .unwrap_or_else(|| json!("sample"));
        out.insert(key.to_string(), value);
    }
    Value::Object(out)
}

fn first_type(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("type") {
        Some(Value::String(t)) => Some(t.clone()),
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .or_else(|| ts.first().and_then(Value::as_str))
            .map(String::from),
        _ => None,
    }
}

/// Strings tried against a `pattern` before giving up on it.
const PATTERN_CANDIDATES: &[&str] = &["sample", "0", "a", "A", "sample_0", "sample-0", "x0", "0.0.0"];

fn sample_leaf(obj: &Map<String, Value>) -> Value {
    match first_type(obj).as_deref() {
        Some("string") => {
            let min_len = obj.get("minLength").and_then(Value::as_u64).unwrap_or(0) as usize;
            let mut s = match obj.get("format").and_then(Value::as_str) {
                Some("date-time") => "2024-01-01T00:00:00Z".to_string(),
                Some("date") => "2024-01-01".to_string(),
                Some("uri") | Some("url") => "https://example.com".to_string(),
                Some("email") => "sample@example.com".to_string(),
                _ => obj
                    .get("pattern")
                    .and_then(Value::as_str)
                    .and_then(|p| regex::Regex::new(p).ok())
                    .and_then(|re| PATTERN_CANDIDATES.iter().find(|c| re.is_match(c)))
                    .unwrap_or(&"sample")
                    .to_string(),
            };
            while s.len() < min_len {
                s.push('x');
            }
            if let Some(max) = obj.get("maxLength").and_then(Value::as_u64) {
                s.truncate(max as usize);
            }
            Value::String(s)
        }
        Some("integer") => {
            let mut n = 0.0_f64;
            if let Some(min) = bound(obj, "minimum") {
                n = n.max(min.ceil());
            }
            if let Some(ex) = bound(obj, "exclusiveMinimum") {
                n = n.max(ex.floor() + 1.0);
            }
            if let Some(max) = bound(obj, "maximum") {
                n = n.min(max.floor());
            }
            if let Some(ex) = bound(obj, "exclusiveMaximum") {
                n = n.min(ex.ceil() - 1.0);
            }
            json!(n as i64)
        }
        Some("number") => {
            let lower = bound(obj, "exclusiveMinimum").or_else(|| bound(obj, "minimum"));
            let upper = bound(obj, "exclusiveMaximum").or_else(|| bound(obj, "maximum"));
            let mut n = 0.0_f64;
            if let Some(min) = bound(obj, "minimum") {
                n = n.max(min);
            }
            if let Some(max) = bound(obj, "maximum") {
                n = n.min(max);
            }
            let above = bound(obj, "exclusiveMinimum").map_or(true, |ex| n > ex);
            let below = bound(obj, "exclusiveMaximum").map_or(true, |ex| n < ex);
            if !(above && below) {
                n = match (lower, upper) {
                    (Some(lo), Some(hi)) => (lo + hi) / 2.0,
                    (Some(lo), None) => lo + 1.0,
                    (None, Some(hi)) => hi - 1.0,
                    (None, None) => n,
                };
            }
            json!(n)
        }
        Some("boolean") => Value::Bool(true),
        Some("null") => Value::Null,
        Some("array") => json!([]),
        Some("object") => json!({}),
        _ => json!("sample"),
    }
}

fn bound(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64)
}

/// Validate `instance` against `schema` with a compiled JSON Schema.
pub fn validate_instance(schema: &Value, instance: &Value) -> Result<(), Vec<String>> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| vec![format!("schema does not compile: {}", e)])?;
    let issues: Vec<String> = match compiled.validate(instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.map(|e| e.to_string()).collect(),
    };
    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// A sample that validated, plus what the sampler could not check.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleCheck {
    pub sample: Value,
    /// `pattern` constraints no built-in candidate satisfies. The schema itself is fine.
    pub notes: Vec<String>,
}

/// Sample the schema and validate the sample. Pattern mismatches become notes; every
/// other violation is returned as the error.
pub fn check_sample(schema: &Value) -> Result<SampleCheck, Vec<String>> {
    let sample = sample_json_from_schema(schema);
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| vec![format!("schema does not compile: {}", e)])?;
    let mut notes = Vec::new();
    let mut issues = Vec::new();
    if let Err(errors) = compiled.validate(&sample) {
        for error in errors {
            match &error.kind {
                jsonschema::error::ValidationErrorKind::Pattern { pattern } => notes.push(format!(
                    "no sample for pattern {} at '{}'",
                    pattern, error.instance_path
                )),
                _ => issues.push(error.to_string()),
            }
        }
    }
    if issues.is_empty() {
        Ok(SampleCheck { sample, notes })
    } else {
        Err(issues)
    }
}

/// Drop `null` values for optional properties whose schema does not accept null,
/// recursing through nested objects and array items. Strict-mode coercion makes such
/// properties nullable, so strict backends send them explicitly.
pub fn strip_optional_nulls(schema: &Value, instance: &mut Value) {
    strip_nulls_node(schema, schema, instance, 0);
}

fn strip_nulls_node(node: &Value, root: &Value, instance: &mut Value, depth: usize) {
    if depth >= MAX_SCHEMA_DEPTH {
        return;
    }
    let Some(obj) = node.as_object() else {
        return;
    };
    if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
        if let Some(target) = resolve_ref(root, reference) {
            strip_nulls_node(target, root, instance, depth + 1);
        }
        return;
    }
    if let Some(Value::Array(all)) = obj.get("allOf") {
        for branch in all {
            strip_nulls_node(branch, root, instance, depth + 1);
        }
    }
    for key in ["anyOf", "oneOf"] {
        if let Some(Value::Array(branches)) = obj.get(key) {
            let objects: Vec<&Value> = branches
                .iter()
                .filter(|b| b.as_object().map(is_object_node).unwrap_or(false))
                .collect();
            // Ambiguous with several object branches.
            if let [only] = objects.as_slice() {
                strip_nulls_node(only, root, instance, depth + 1);
            }
        }
    }

    match instance {
        Value::Object(map) => {
            let Some(props) = obj.get("properties").and_then(Value::as_object) else {
                return;
            };
            let required: Vec<&str> = obj
                .get("required")
                .and_then(Value::as_array)
                .map(|r| r.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            map.retain(|key, value| {
                !(value.is_null()
                    && !required.contains(&key.as_str())
                    && props.get(key).map_or(false, |p| !accepts_null(p, root, depth + 1)))
            });
            for (key, value) in map.iter_mut() {
                if let Some(prop) = props.get(key) {
                    strip_nulls_node(prop, root, value, depth + 1);
                }
            }
        }
        Value::Array(items) => {
            if let Some(item) = obj.get("items") {
                for value in items.iter_mut() {
                    strip_nulls_node(item, root, value, depth + 1);
                }
            }
        }
        _ => {}
    }
}

fn accepts_null(node: &Value, root: &Value, depth: usize) -> bool {
    if depth >= MAX_SCHEMA_DEPTH {
        return true;
    }
    let Some(obj) = node.as_object() else {
        return node.as_bool().unwrap_or(true);
    };
    if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
        return resolve_ref(root, reference).map_or(true, |t| accepts_null(t, root, depth + 1));
    }
    if obj.get("nullable") == Some(&Value::Bool(true)) {
        return true;
    }
    if let Some(c) = obj.get("const") {
        return c.is_null();
    }
    if let Some(Value::Array(values)) = obj.get("enum") {
        return values.iter().any(Value::is_null);
    }
    for key in ["anyOf", "oneOf"] {
        if let Some(Value::Array(branches)) = obj.get(key) {
            return branches.iter().any(|b| accepts_null(b, root, depth + 1));
        }
    }
    if let Some(Value::Array(all)) = obj.get("allOf") {
        if !all.iter().all(|b| accepts_null(b, root, depth + 1)) {
            return false;
        }
    }
    match obj.get("type") {
        Some(Value::String(t)) => t == "null",
        Some(Value::Array(ts)) => ts.iter().any(|t| t.as_str() == Some("null")),
        _ => !matches!(classify(node), SchemaKind::Object | SchemaKind::Array),
    }
}

/// Keywords Gemini's function-declaration schema subset understands.
const GEMINI_ALLOWED_KEYS: &[&str] = &[
    "type",
    "format",
    "description",
    "nullable",
    "enum",
    "properties",
    "required",
    "items",
    "minItems",
    "maxItems",
    "minimum",
    "maximum",
    "anyOf",
    "propertyOrdering",
];

/// Rewrite a schema into the Gemini subset: local `$ref`s inlined, `oneOf`/`allOf`
/// reduced, `["x","null"]` type arrays turned into `nullable`, unsupported keys dropped.
pub fn clean_gemini_schema(schema: &Value) -> Value {
    let cleaned = clean_gemini_node(schema, schema, 0);
    match cleaned {
        Value::Object(ref m) if !m.is_empty() => cleaned,
        _ => json!({"type": "object", "properties": {}}),
    }
}

fn clean_gemini_node(node: &Value, root: &Value, depth: usize) -> Value {
    if depth >= MAX_SCHEMA_DEPTH {
        return json!({"type": "string"});
    }
    let Some(obj) = node.as_object() else {
        return json!({"type": "string"});
    };

    if let Some(target) = obj
        .get("$ref")
        .and_then(Value::as_str)
        .and_then(|r| resolve_ref(root, r))
    {
        let mut resolved = clean_gemini_node(target, root, depth + 1);
        if let (Some(desc), Value::Object(m)) = (obj.get("description"), &mut resolved) {
            m.insert("description".into(), desc.clone());
        }
        return resolved;
    }

    if let Some(Value::Array(all)) = obj.get("allOf") {
        // Merge object branches; the first non-object branch wins otherwise.
        let mut merged = Map::new();
        let mut props = Map::new();
        let mut required: Vec<Value> = Vec::new();
        for branch in all {
            if let Value::Object(b) = clean_gemini_node(branch, root, depth + 1) {
                for (k, v) in b {
                    match (k.as_str(), v) {
                        ("properties", Value::Object(p)) => props.extend(p),
                        ("required", Value::Array(r)) => required.extend(r),
                        (_, v) => {
                            merged.insert(k, v);
                        }
                    }
                }
            }
        }
        if !props.is_empty() {
            merged.insert("type".into(), json!("object"));
            merged.insert("properties".into(), Value::Object(props));
        }
        if !required.is_empty() {
            merged.insert("required".into(), Value::Array(required));
        }
        return Value::Object(merged);
    }

    let mut out = Map::new();
    for (key, value) in obj {
        if key == "oneOf" {
            continue;
        }
        if !GEMINI_ALLOWED_KEYS.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "type" => match value {
                Value::Array(ts) => {
                    let non_null: Vec<&str> = ts.iter().filter_map(Value::as_str).filter(|t| *t != "null").collect();
                    if non_null.len() < ts.len() {
                        out.insert("nullable".into(), Value::Bool(true));
                    }
                    out.insert("type".into(), json!(non_null.first().copied().unwrap_or("string")));
                }
                other => {
                    out.insert("type".into(), other.clone());
                }
            },
            "properties" => {
                if let Value::Object(props) = value {
                    let cleaned: Map<String, Value> = props
                        .iter()
                        .map(|(k, v)| (k.clone(), clean_gemini_node(v, root, depth + 1)))
                        .collect();
                    out.insert("properties".into(), Value::Object(cleaned));
                }
            }
            "items" => {
                out.insert("items".into(), clean_gemini_node(value, root, depth + 1));
            }
            "anyOf" => {
                if let Value::Array(branches) = value {
                    let cleaned: Vec<Value> = branches
                        .iter()
                        .filter(|b| b.get("type").and_then(Value::as_str) != Some("null"))
                        .map(|b| clean_gemini_node(b, root, depth + 1))
                        .collect();
                    if cleaned.len() < branches.len() {
                        out.insert("nullable".into(), Value::Bool(true));
                    }
                    if cleaned.len() == 1 {
                        if let Some(Value::Object(single)) = cleaned.into_iter().next() {
                            out.extend(single);
                        }
                    } else if !cleaned.is_empty() {
                        out.insert("anyOf".into(), Value::Array(cleaned));
                    }
                }
            }
            "enum" => {
                if let Value::Array(values) = value {
                    // Gemini only accepts string enums.
                    let strings: Vec<Value> = values
                        .iter()
                        .filter(|v| !v.is_null())
                        .map(|v| match v {
                            Value::String(_) => v.clone(),
                            other => Value::String(other.to_string()),
                        })
                        .collect();
                    out.insert("enum".into(), Value::Array(strings));
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    if let Some(Value::Array(branches)) = obj.get("oneOf") {
        if !out.contains_key("type") {
            if let Some(Value::Object(first)) = branches.first().map(|b| clean_gemini_node(b, root, depth + 1)) {
                for (k, v) in first {
                    out.entry(k).or_insert(v);
                }
            }
        }
    }
    if out.contains_key("enum") {
        out.insert("type".into(), json!("string"));
    }
    if !out.contains_key("type") && out.contains_key("properties") {
        out.insert("type".into(), json!("object"));
    }
    // `required` must only list declared properties.
    if let (Some(Value::Array(req)), Some(Value::Object(props))) =
        (out.get("required").cloned(), out.get("properties"))
    {
        let kept: Vec<Value> = req
            .into_iter()
            .filter(|r| r.as_str().map(|k| props.contains_key(k)).unwrap_or(false))
            .collect();
        out.insert("required".into(), Value::Array(kept));
    }
    Value::Object(out)
}
