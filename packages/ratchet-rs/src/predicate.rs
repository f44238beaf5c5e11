//! Predicate-tree evaluator.
//!
//! Guards on transitions and conditions on routing rules are stored as JSON
//! trees and interpreted here against a JSON context. The evaluator is a pure
//! function: no IO, no state, safe to call concurrently from the engine and
//! the router.
//!
//! # Tree shape
//!
//! ```json
//! { "op": "and", "conditions": [
//!     { "field": "requires_approval", "op": "eq", "value": false },
//!     { "field": "amount", "op": "gt", "value": 1000 }
//! ] }
//! ```
//!
//! - **Compound**: `{op: "and"|"or", conditions: [...]}`. Short-circuits
//!   left-to-right. An empty `and` is true, an empty `or` is false.
//! - **Leaf**: `{field, op, value}` where `field` is a dotted path into the
//!   context.
//! - **Empty**: `null` or `{}` evaluates to true (an unguarded transition).
//!
//! # Resolution rules
//!
//! A field missing from the context makes positive operators false and
//! negative operators (`neq`, `not_in`, `not_contains`) true, so negative
//! rules match "unset" as "not equal to anything". Numeric comparisons
//! coerce both sides with a tolerant parse, treating unparseable operands
//! as 0. Unknown operators fail closed (false).

use serde_json::Value;

use crate::error::PredicateError;

/// Evaluate a predicate tree against a context.
///
/// The only hard failure is a leaf carrying neither `field` nor `op`; every
/// other malformation resolves to a boolean per the rules above.
pub fn eval(tree: &Value, ctx: &Value) -> Result<bool, PredicateError> {
    match tree {
        Value::Null => Ok(true),
        Value::Object(map) if map.is_empty() => Ok(true),
        Value::Object(map) => {
            let op = map.get("op").and_then(Value::as_str);
            if matches!(op, Some("and") | Some("or")) && !map.contains_key("field") {
                return eval_compound(op.unwrap_or_default(), map.get("conditions"), ctx);
            }
            eval_leaf(map, ctx)
        }
        // Arrays, numbers, and strings are not predicates.
        other => Err(PredicateError::Malformed(format!(
            "expected object or null, got {other}"
        ))),
    }
}

fn eval_compound(
    op: &str,
    conditions: Option<&Value>,
    ctx: &Value,
) -> Result<bool, PredicateError> {
    let children = match conditions {
        Some(Value::Array(items)) => items.as_slice(),
        // `{op: "and"}` without conditions is the empty conjunction.
        _ => &[],
    };
    match op {
        "and" => {
            for child in children {
                if !eval(child, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "or" => {
            for child in children {
                if eval(child, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => unreachable!("eval_compound called with op={op}"),
    }
}

fn eval_leaf(
    map: &serde_json::Map<String, Value>,
    ctx: &Value,
) -> Result<bool, PredicateError> {
    let field = map.get("field").and_then(Value::as_str);
    let op = map.get("op").and_then(Value::as_str);

    let (field, op) = match (field, op) {
        (None, None) => {
            return Err(PredicateError::Malformed(
                "leaf is missing both 'field' and 'op'".into(),
            ))
        }
        // Missing op alone falls through to the unknown-operator arm below.
        (f, o) => (f.unwrap_or_default(), o.unwrap_or_default()),
    };

    let expected = map.get("value").unwrap_or(&Value::Null);
    let actual = lookup(ctx, field);

    Ok(match op {
        "eq" => actual.map(|a| loose_eq(a, expected)).unwrap_or(false),
        "neq" => actual.map(|a| !loose_eq(a, expected)).unwrap_or(true),
        "gt" => actual.map(|a| as_number(a) > as_number(expected)).unwrap_or(false),
        "gte" => actual.map(|a| as_number(a) >= as_number(expected)).unwrap_or(false),
        "lt" => actual.map(|a| as_number(a) < as_number(expected)).unwrap_or(false),
        "lte" => actual.map(|a| as_number(a) <= as_number(expected)).unwrap_or(false),
        "in" => actual.map(|a| is_member(a, expected)).unwrap_or(false),
        "not_in" => actual.map(|a| !is_member(a, expected)).unwrap_or(true),
        "contains" => actual.map(|a| contains(a, expected)).unwrap_or(false),
        "not_contains" => actual.map(|a| !contains(a, expected)).unwrap_or(true),
        // Unknown operators fail closed.
        _ => false,
    })
}

/// Resolve a dotted path against the context. Returns `None` for any missing
/// segment or non-object intermediate.
fn lookup<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = ctx;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Canonical string form: strings as-is, everything else via JSON rendering.
fn canon(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Tolerant numeric coercion. Unparseable operands become 0.
fn as_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        Value::Bool(true) => 1.0,
        Value::Bool(false) => 0.0,
        _ => 0.0,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

/// Equality across mixed types: canonical string form first, then numeric,
/// then boolean coercion.
fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if canon(actual) == canon(expected) {
        return true;
    }
    if matches!(actual, Value::Number(_) | Value::String(_))
        && matches!(expected, Value::Number(_) | Value::String(_))
        && as_number(actual) == as_number(expected)
        && (matches!(actual, Value::Number(_)) || matches!(expected, Value::Number(_)))
    {
        return true;
    }
    match (as_bool(actual), as_bool(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// `in` / `not_in`: stringified membership against array members. A scalar
/// expected value is treated as a single-member set.
fn is_member(actual: &Value, expected: &Value) -> bool {
    let needle = canon(actual);
    match expected {
        Value::Array(members) => members.iter().any(|m| canon(m) == needle),
        other => canon(other) == needle,
    }
}

/// `contains`: substring on strings, stringified membership on arrays.
fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(s) => s.contains(&canon(expected)),
        Value::Array(members) => {
            let needle = canon(expected);
            members.iter().any(|m| canon(m) == needle)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "amount": 5000,
            "requires_approval": true,
            "owner": { "role": "engineer", "level": 3 },
            "tags": ["urgent", "mechanical"],
            "title": "bracket revision",
            "count_text": "12",
        })
    }

    // =========================================================================
    // Empty and compound trees
    // =========================================================================

    #[test]
    fn test_empty_tree_is_true() {
        assert!(eval(&Value::Null, &ctx()).unwrap());
        assert!(eval(&json!({}), &ctx()).unwrap());
    }

    #[test]
    fn test_empty_and_is_true_empty_or_is_false() {
        assert!(eval(&json!({"op": "and", "conditions": []}), &ctx()).unwrap());
        assert!(!eval(&json!({"op": "or", "conditions": []}), &ctx()).unwrap());
        // Missing conditions behaves like empty.
        assert!(eval(&json!({"op": "and"}), &ctx()).unwrap());
    }

    #[test]
    fn test_compound_short_circuit() {
        let tree = json!({"op": "and", "conditions": [
            {"field": "amount", "op": "gt", "value": 1000},
            {"field": "requires_approval", "op": "eq", "value": true},
        ]});
        assert!(eval(&tree, &ctx()).unwrap());

        let tree = json!({"op": "or", "conditions": [
            {"field": "amount", "op": "lt", "value": 10},
            {"field": "owner.role", "op": "eq", "value": "engineer"},
        ]});
        assert!(eval(&tree, &ctx()).unwrap());
    }

    #[test]
    fn test_nested_compound() {
        let tree = json!({"op": "and", "conditions": [
            {"op": "or", "conditions": [
                {"field": "amount", "op": "gt", "value": 10000},
                {"field": "tags", "op": "contains", "value": "urgent"},
            ]},
            {"field": "owner.level", "op": "gte", "value": 3},
        ]});
        assert!(eval(&tree, &ctx()).unwrap());
    }

    // =========================================================================
    // Leaf operators
    // =========================================================================

    #[test]
    fn test_dotted_path() {
        let tree = json!({"field": "owner.role", "op": "eq", "value": "engineer"});
        assert!(eval(&tree, &ctx()).unwrap());

        let tree = json!({"field": "owner.missing.deep", "op": "eq", "value": 1});
        assert!(!eval(&tree, &ctx()).unwrap());
    }

    #[test]
    fn test_missing_field_positive_false_negative_true() {
        let c = ctx();
        assert!(!eval(&json!({"field": "ghost", "op": "eq", "value": 1}), &c).unwrap());
        assert!(!eval(&json!({"field": "ghost", "op": "gt", "value": 0}), &c).unwrap());
        assert!(!eval(&json!({"field": "ghost", "op": "in", "value": [1]}), &c).unwrap());
        assert!(!eval(&json!({"field": "ghost", "op": "contains", "value": "x"}), &c).unwrap());
        assert!(eval(&json!({"field": "ghost", "op": "neq", "value": 1}), &c).unwrap());
        assert!(eval(&json!({"field": "ghost", "op": "not_in", "value": [1]}), &c).unwrap());
        assert!(eval(&json!({"field": "ghost", "op": "not_contains", "value": "x"}), &c).unwrap());
    }

    #[test]
    fn test_numeric_coercion() {
        let c = ctx();
        // String "12" compares numerically.
        assert!(eval(&json!({"field": "count_text", "op": "gt", "value": 10}), &c).unwrap());
        assert!(eval(&json!({"field": "count_text", "op": "lte", "value": "12"}), &c).unwrap());
        // Unparseable operand becomes 0.
        assert!(eval(&json!({"field": "title", "op": "lt", "value": 1}), &c).unwrap());
        assert!(eval(&json!({"field": "title", "op": "gte", "value": "junk"}), &c).unwrap());
    }

    #[test]
    fn test_eq_mixed_types() {
        let c = ctx();
        assert!(eval(&json!({"field": "amount", "op": "eq", "value": "5000"}), &c).unwrap());
        assert!(eval(&json!({"field": "requires_approval", "op": "eq", "value": "true"}), &c).unwrap());
        assert!(eval(&json!({"field": "amount", "op": "eq", "value": 5000.0}), &c).unwrap());
        assert!(!eval(&json!({"field": "amount", "op": "eq", "value": 5001}), &c).unwrap());
        assert!(eval(&json!({"field": "amount", "op": "neq", "value": 1}), &c).unwrap());
    }

    #[test]
    fn test_in_and_contains() {
        let c = ctx();
        assert!(eval(&json!({"field": "owner.role", "op": "in", "value": ["engineer", "lead"]}), &c).unwrap());
        assert!(!eval(&json!({"field": "owner.role", "op": "in", "value": ["lead"]}), &c).unwrap());
        assert!(eval(&json!({"field": "owner.level", "op": "in", "value": [1, 2, 3]}), &c).unwrap());
        assert!(eval(&json!({"field": "title", "op": "contains", "value": "bracket"}), &c).unwrap());
        assert!(eval(&json!({"field": "tags", "op": "contains", "value": "urgent"}), &c).unwrap());
        assert!(eval(&json!({"field": "tags", "op": "not_contains", "value": "cosmetic"}), &c).unwrap());
    }

    // =========================================================================
    // Failure modes
    // =========================================================================

    #[test]
    fn test_unknown_operator_fails_closed() {
        let tree = json!({"field": "amount", "op": "regex", "value": ".*"});
        assert!(!eval(&tree, &ctx()).unwrap());
        // Missing op entirely also fails closed rather than erroring.
        let tree = json!({"field": "amount", "value": 1});
        assert!(!eval(&tree, &ctx()).unwrap());
    }

    #[test]
    fn test_leaf_missing_field_and_op_is_malformed() {
        let tree = json!({"value": 42});
        assert!(matches!(
            eval(&tree, &ctx()),
            Err(PredicateError::Malformed(_))
        ));
    }

    #[test]
    fn test_non_object_tree_is_malformed() {
        assert!(eval(&json!([1, 2]), &ctx()).is_err());
        assert!(eval(&json!("and"), &ctx()).is_err());
    }
}
