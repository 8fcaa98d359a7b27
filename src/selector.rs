//! # Selectors
//!
//! Declarative document predicates used by `_selector` change filters.
//!
//! ```text
//! {"type": "post", "score": {"$gte": 10}, "$or": [{"draft": false}, {"tags": {"$all": ["x"]}}]}
//! ```
//!
//! A field name may be a dotted path (`"author.name"`). A bare value means
//! equality. Field conditions:
//!
//! | Operator | Matches when the field |
//! |----------|------------------------|
//! | `$eq` `$ne` `$gt` `$gte` `$lt` `$lte` | compares (by view collation) |
//! | `$in` `$nin` | is / is not one of the listed values |
//! | `$exists` | is present (`true`) or absent (`false`) |
//! | `$type` | has the JSON type (`null`, `boolean`, `number`, `string`, `array`, `object`) |
//! | `$size` | is an array of that length |
//! | `$all` | is an array holding every listed value |
//! | `$elemMatch` | is an array with an element matching the sub-condition |
//! | `$mod` | is an integer `n` with `n % divisor == remainder` |
//! | `$not` | does not match the sub-condition |
//!
//! Combinators `$and`, `$or`, `$nor` take arrays of selectors. An absent
//! field only ever matches `{"$exists": false}`.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::view::collate::{collate, collate_eq};

const FIELD_OPERATORS: &[&str] = &[
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists", "$type", "$size", "$all",
    "$elemMatch", "$mod", "$not",
];

const COMBINATORS: &[&str] = &["$and", "$or", "$nor", "$not"];

/// A validated selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    root: Map<String, Value>,
}

impl Selector {
    /// Validates a selector object.
    ///
    /// # Errors
    ///
    /// `BadRequest` for a non-object selector, an unknown operator, or an
    /// operator argument of the wrong shape.
    pub fn new(selector: Value) -> Result<Self> {
        match selector {
            Value::Object(root) => {
                validate_selector(&root)?;
                Ok(Self { root })
            }
            _ => Err(Error::BadRequest("selector must be a JSON object".to_string())),
        }
    }

    /// The selector as JSON.
    pub fn to_json(&self) -> Value {
        Value::Object(self.root.clone())
    }

    /// True if `doc` satisfies the selector.
    pub fn matches(&self, doc: &Value) -> bool {
        match_selector(&self.root, doc)
    }
}

// =============================================================================
// Validation
// =============================================================================

fn bad(msg: impl Into<String>) -> Error {
    Error::BadRequest(msg.into())
}

fn validate_selector(selector: &Map<String, Value>) -> Result<()> {
    for (key, cond) in selector {
        if key.starts_with('$') {
            if !COMBINATORS.contains(&key.as_str()) {
                return Err(bad(format!("unknown selector operator {key}")));
            }
            match (key.as_str(), cond) {
                ("$not", Value::Object(inner)) => validate_selector(inner)?,
                ("$not", _) => return Err(bad("$not requires an object")),
                (_, Value::Array(items)) => {
                    for item in items {
                        let Value::Object(inner) = item else {
                            return Err(bad(format!("{key} requires an array of selectors")));
                        };
                        validate_selector(inner)?;
                    }
                }
                _ => return Err(bad(format!("{key} requires an array"))),
            }
        } else {
            validate_condition(cond)?;
        }
    }
    Ok(())
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn validate_condition(cond: &Value) -> Result<()> {
    let Value::Object(map) = cond else {
        return Ok(());
    };
    if !is_operator_object(map) {
        return validate_selector(map);
    }
    for (op, arg) in map {
        if !FIELD_OPERATORS.contains(&op.as_str()) {
            return Err(bad(format!("unknown selector operator {op}")));
        }
        match op.as_str() {
            "$in" | "$nin" | "$all" if !arg.is_array() => return Err(bad(format!("{op} requires an array"))),
            "$exists" if !arg.is_boolean() => return Err(bad("$exists requires a boolean")),
            "$type" if !arg.is_string() => return Err(bad("$type requires a string")),
            "$size" if !arg.is_u64() => return Err(bad("$size requires a non-negative integer")),
            "$mod" => {
                let valid = arg
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .map(|a| a[0].as_i64().map(|d| d != 0).unwrap_or(false) && a[1].is_i64())
                    .unwrap_or(false);
                if !valid {
                    return Err(bad("$mod requires [divisor, remainder] with a non-zero divisor"));
                }
            }
            "$not" | "$elemMatch" => validate_condition(arg)?,
            _ => {}
        }
    }
    Ok(())
}

// =============================================================================
// Matching
// =============================================================================

/// Resolves a dotted path.
fn field<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, part| match value {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn match_selector(selector: &Map<String, Value>, doc: &Value) -> bool {
    selector.iter().all(|(key, cond)| match key.as_str() {
        "$and" => sub_selectors(cond).all(|s| match_selector(s, doc)),
        "$or" => sub_selectors(cond).any(|s| match_selector(s, doc)),
        "$nor" => !sub_selectors(cond).any(|s| match_selector(s, doc)),
        "$not" => match cond {
            Value::Object(inner) => !match_selector(inner, doc),
            _ => false,
        },
        path => match_condition(cond, field(doc, path)),
    })
}

fn sub_selectors(cond: &Value) -> impl Iterator<Item = &Map<String, Value>> {
    cond.as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn match_condition(cond: &Value, value: Option<&Value>) -> bool {
    match cond {
        Value::Object(map) if is_operator_object(map) => {
            map.iter().all(|(op, arg)| match_operator(op, arg, value))
        }
        Value::Object(map) => match value {
            Some(inner) => match_selector(map, inner),
            None => false,
        },
        expected => value.map(|v| collate_eq(v, expected)).unwrap_or(false),
    }
}

fn match_operator(op: &str, arg: &Value, value: Option<&Value>) -> bool {
    if op == "$exists" {
        return arg.as_bool() == Some(value.is_some());
    }
    if op == "$not" {
        return value.is_some() && !match_condition(arg, value);
    }
    let Some(value) = value else {
        return false;
    };
    match op {
        "$eq" => collate_eq(value, arg),
        "$ne" => !collate_eq(value, arg),
        "$gt" => collate(value, arg).is_gt(),
        "$gte" => collate(value, arg).is_ge(),
        "$lt" => collate(value, arg).is_lt(),
        "$lte" => collate(value, arg).is_le(),
        "$in" => in_list(arg, value),
        "$nin" => !in_list(arg, value),
        "$type" => arg.as_str() == Some(type_name(value)),
        "$size" => value.as_array().map(|a| Some(a.len() as u64) == arg.as_u64()).unwrap_or(false),
        "$all" => match (value.as_array(), arg.as_array()) {
            (Some(items), Some(wanted)) => wanted.iter().all(|w| items.iter().any(|i| collate_eq(i, w))),
            _ => false,
        },
        "$elemMatch" => value
            .as_array()
            .map(|items| items.iter().any(|item| match_condition(arg, Some(item))))
            .unwrap_or(false),
        "$mod" => {
            let (Some(n), Some(params)) = (value.as_i64(), arg.as_array()) else {
                return false;
            };
            match (params.first().and_then(Value::as_i64), params.get(1).and_then(Value::as_i64)) {
                (Some(divisor), Some(remainder)) if divisor != 0 => n % divisor == remainder,
                _ => false,
            }
        }
        _ => false,
    }
}

fn in_list(list: &Value, value: &Value) -> bool {
    list.as_array()
        .map(|items| items.iter().any(|item| collate_eq(item, value)))
        .unwrap_or(false)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
