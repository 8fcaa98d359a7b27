//! # Sandboxed Script Evaluation
//!
//! Map, reduce and filter functions stored in design documents are untrusted
//! source text. They run in a small tree-walking interpreter that can only
//! see the capabilities injected for that call:
//!
//! ```text
//! ┌──────────────┐   source    ┌─────────┐   AST   ┌──────────────────────┐
//! │ design doc   │ ──────────► │ parser  │ ──────► │ LRU program cache    │
//! └──────────────┘             └─────────┘         └──────────┬───────────┘
//!                                                             │
//!                    Invocation (doc / keys+values / doc+req) ▼
//!                 ┌───────────────────────────────────────────────────────┐
//!                 │ Interp: fresh globals per call                        │
//!                 │   emit?  sum?  JSON/toJSON?  log?   (Capabilities)    │
//!                 │   Math, Object.keys, String, parseInt, ...            │
//!                 │   step budget + call depth limit                      │
//!                 └───────────────────────────────────────────────────────┘
//! ```
//!
//! There is no access to the host: no I/O, no clock, no randomness, and no
//! state survives between invocations. Parsed programs are shared across
//! threads; interpreter state never is.

mod interp;
pub mod lexer;
pub mod parser;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde_json::Value;

use crate::error::{Error, Result};
use interp::{truthy, Interp, Val};
use parser::Program;

/// Intrinsics made visible to one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub emit: bool,
    pub sum: bool,
    pub json: bool,
    pub log: bool,
}

impl Capabilities {
    pub const MAP: Self = Self { emit: true, sum: true, json: true, log: true };
    pub const REDUCE: Self = Self { emit: false, sum: true, json: true, log: true };
    pub const FILTER: Self = Self { emit: false, sum: false, json: true, log: true };

    pub const fn union(self, other: Self) -> Self {
        Self {
            emit: self.emit || other.emit,
            sum: self.sum || other.sum,
            json: self.json || other.json,
            log: self.log || other.log,
        }
    }
}

/// What the script is asked to do.
#[derive(Debug, Clone, Copy)]
pub enum Invocation<'a> {
    /// `function (doc)`; emits key/value pairs.
    Map { doc: &'a Value },
    /// `function (keys, values, rereduce)`. `keys` holds `[key, id]` pairs
    /// and is passed as `null` on rereduce.
    Reduce { keys: &'a [Value], values: &'a [Value], rereduce: bool },
    /// `function (doc, req)`; truthy return means the change passes.
    Filter { doc: &'a Value, req: &'a Value },
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Emitted(Vec<(Value, Value)>),
    Reduced(Value),
    Matched(bool),
}

/// Runs user code.
///
/// Implementations must be safe to share across tasks. Each call is
/// independent; a failure affects only that call.
pub trait Evaluator: Send + Sync {
    fn run(&self, source: &str, capabilities: Capabilities, invocation: Invocation<'_>) -> Result<Outcome>;
}

/// The built-in [`Evaluator`].
pub struct ScriptEvaluator {
    step_limit: u64,
    cache: Mutex<LruCache<String, Arc<Program>>>,
}

impl std::fmt::Debug for ScriptEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEvaluator")
            .field("step_limit", &self.step_limit)
            .finish_non_exhaustive()
    }
}

impl ScriptEvaluator {
    pub fn new(step_limit: u64, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            step_limit,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Parses `source`, or returns the cached parse.
    fn program(&self, source: &str) -> Result<Arc<Program>> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(program) = cache.get(source) {
                return Ok(Arc::clone(program));
            }
        }
        let program = Arc::new(parser::parse(source)?);
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.put(source.to_string(), Arc::clone(&program));
        Ok(program)
    }

    /// Checks that `source` parses and defines a function.
    pub fn compile(&self, source: &str) -> Result<()> {
        let program = self.program(source)?;
        program
            .entry()
            .map(|_| ())
            .ok_or_else(|| Error::Eval("script does not define a function".to_string()))
    }
}

impl Evaluator for ScriptEvaluator {
    fn run(&self, source: &str, capabilities: Capabilities, invocation: Invocation<'_>) -> Result<Outcome> {
        let program = self.program(source)?;
        let entry = program
            .entry()
            .ok_or_else(|| Error::Eval("script does not define a function".to_string()))?;

        let mut interp = Interp::new(self.step_limit, capabilities);
        let args: Vec<Val> = match invocation {
            Invocation::Map { doc } => vec![interp.from_json(doc)],
            Invocation::Reduce { keys, values, rereduce } => {
                let keys = if rereduce {
                    Value::Null
                } else {
                    Value::Array(keys.to_vec())
                };
                vec![
                    interp.from_json(&keys),
                    interp.from_json(&Value::Array(values.to_vec())),
                    Val::Bool(rereduce),
                ]
            }
            Invocation::Filter { doc, req } => vec![interp.from_json(doc), interp.from_json(req)],
        };

        let result = interp.run(&program, &entry, args)?;
        Ok(match invocation {
            Invocation::Map { .. } => Outcome::Emitted(interp.take_emitted()),
            Invocation::Reduce { .. } => Outcome::Reduced(interp.to_json(&result)?),
            Invocation::Filter { .. } => Outcome::Matched(truthy(&result)),
        })
    }
}
