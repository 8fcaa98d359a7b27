//! Built-in reduce functions.
//!
//! A view whose `reduce` is `_sum`, `_count` or `_stats` is reduced natively
//! instead of through the script evaluator. The registry is an ordinary
//! value handed to the view engine, so callers can add their own.

use std::collections::HashMap;
use std::fmt;

use serde_json::{json, Number, Value};

use crate::error::{Error, Result};

/// `(values, rereduce) -> reduced`.
pub type BuiltinReduce = fn(&[Value], bool) -> Result<Value>;

/// Named native reducers.
#[derive(Clone)]
pub struct ReduceRegistry {
    reducers: HashMap<String, BuiltinReduce>,
}

impl fmt::Debug for ReduceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.reducers.keys().collect();
        names.sort();
        f.debug_struct("ReduceRegistry").field("reducers", &names).finish()
    }
}

impl Default for ReduceRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("_sum", sum);
        registry.register("_count", count);
        registry.register("_stats", stats);
        registry
    }
}

impl ReduceRegistry {
    /// A registry with no reducers.
    pub fn empty() -> Self {
        Self { reducers: HashMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, reducer: BuiltinReduce) {
        self.reducers.insert(name.into(), reducer);
    }

    pub fn get(&self, name: &str) -> Option<BuiltinReduce> {
        self.reducers.get(name).copied()
    }

    /// True if `name` refers to a native reducer rather than script source.
    pub fn is_builtin_name(name: &str) -> bool {
        name.trim_start().starts_with('_')
    }

    /// Looks up a `_`-prefixed reducer by prefix, so `"_sum // total"`
    /// resolves to `_sum`. The longest registered name wins.
    ///
    /// # Errors
    ///
    /// `BadRequest` if no registered name prefixes `name`.
    pub fn resolve(&self, name: &str) -> Result<BuiltinReduce> {
        let name = name.trim();
        self.reducers
            .iter()
            .filter(|(registered, _)| name.starts_with(registered.as_str()))
            .max_by_key(|(registered, _)| registered.len())
            .map(|(_, reducer)| *reducer)
            .ok_or_else(|| Error::BadRequest(format!("{name} is not a supported reduce function")))
    }
}

fn builtin_err(name: &str, msg: impl fmt::Display) -> Error {
    Error::BuiltIn(format!("{name}: {msg}"))
}

/// Integral results stay integers.
pub(crate) fn number(n: f64) -> Value {
    if n.is_finite() && n == n.trunc() && n.abs() < 9.007_199_254_740_992e15 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn as_number(name: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| builtin_err(name, format!("expected a number, got {value}")))
}

/// Numeric sum, or element-wise sum when every input is an array.
///
/// Arrays of different lengths are summed position by position, the
/// shorter ones contributing nothing past their end.
pub fn sum(values: &[Value], _rereduce: bool) -> Result<Value> {
    let arrays = values.iter().filter(|v| v.is_array()).count();
    if arrays == 0 {
        let mut total = 0.0;
        for value in values {
            total += as_number("_sum", value)?;
        }
        return Ok(number(total));
    }
    if arrays != values.len() {
        return Err(builtin_err("_sum", "cannot mix numbers and arrays"));
    }

    let mut totals: Vec<f64> = Vec::new();
    for value in values {
        let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
        if items.len() > totals.len() {
            totals.resize(items.len(), 0.0);
        }
        for (slot, item) in totals.iter_mut().zip(items) {
            *slot += as_number("_sum", item)?;
        }
    }
    Ok(Value::Array(totals.into_iter().map(number).collect()))
}

/// Row count; on rereduce, the sum of partial counts.
pub fn count(values: &[Value], rereduce: bool) -> Result<Value> {
    if rereduce {
        return sum(values, true);
    }
    Ok(Value::from(values.len() as u64))
}

/// `{sum, min, max, count, sumsqr}`.
pub fn stats(values: &[Value], rereduce: bool) -> Result<Value> {
    let mut acc = Stats::default();
    for value in values {
        if rereduce {
            acc.merge(Stats::from_value(value)?);
        } else {
            acc.push(as_number("_stats", value)?);
        }
    }
    Ok(acc.to_value())
}

#[derive(Debug, Clone, Copy)]
struct Stats {
    sum: f64,
    min: f64,
    max: f64,
    count: f64,
    sumsqr: f64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0.0,
            sumsqr: 0.0,
        }
    }
}

impl Stats {
    fn push(&mut self, n: f64) {
        self.sum += n;
        self.min = self.min.min(n);
        self.max = self.max.max(n);
        self.count += 1.0;
        self.sumsqr += n * n;
    }

    fn merge(&mut self, other: Stats) {
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
        self.sumsqr += other.sumsqr;
    }

    fn from_value(value: &Value) -> Result<Self> {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_f64)
                .ok_or_else(|| builtin_err("_stats", format!("missing {name} in partial result")))
        };
        Ok(Self {
            sum: field("sum")?,
            min: field("min")?,
            max: field("max")?,
            count: field("count")?,
            sumsqr: field("sumsqr")?,
        })
    }

    fn to_value(self) -> Value {
        if self.count == 0.0 {
            return json!({"sum": 0, "min": 0, "max": 0, "count": 0, "sumsqr": 0});
        }
        json!({
            "sum": number(self.sum),
            "min": number(self.min),
            "max": number(self.max),
            "count": number(self.count),
            "sumsqr": number(self.sumsqr),
        })
    }
}
