//! Tree-walking interpreter.
//!
//! Values live in `Rc`/`RefCell` cells owned by one [`Interp`], which never
//! leaves the thread that created it. Every expression and statement costs
//! one step; running out of steps, recursing too deep or touching a missing
//! global ends the invocation with `Error::Eval`.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use tracing::info;

use super::parser::{BinOp, Expr, FuncDef, Program, Stmt, UnaryOp};
use super::Capabilities;
use crate::error::{Error, Result};

const MAX_CALL_DEPTH: usize = 64;
const MAX_VALUE_DEPTH: usize = 64;
/// Largest gap an index assignment may open at the end of an array.
const MAX_ARRAY_GROWTH: usize = 10_000;

// =============================================================================
// Values
// =============================================================================

type ArrayCell = Rc<RefCell<Vec<Val>>>;
type ObjectCell = Rc<RefCell<Vec<(String, Val)>>>;

#[derive(Clone)]
pub enum Val {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(Rc<str>),
    Array(ArrayCell),
    /// Insertion-ordered properties.
    Object(ObjectCell),
    Closure(Rc<Closure>),
    Native(Native),
}

pub struct Closure {
    def: Arc<FuncDef>,
    env: Rc<Scope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Native {
    Emit,
    Sum,
    Log,
    IsArray,
    JsonParse,
    JsonStringify,
    MathMax,
    MathMin,
    MathFloor,
    MathCeil,
    MathRound,
    MathAbs,
    MathSqrt,
    MathPow,
    ObjectKeys,
    ObjectValues,
    ToStr,
    ToNum,
    ToBool,
    ParseInt,
    ParseFloat,
    IsNaN,
}

fn string(s: impl AsRef<str>) -> Val {
    Val::Str(Rc::from(s.as_ref()))
}

fn eval_err(msg: impl Into<String>) -> Error {
    Error::Eval(msg.into())
}

pub(crate) fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

pub fn truthy(value: &Val) -> bool {
    match value {
        Val::Undefined | Val::Null => false,
        Val::Bool(b) => *b,
        Val::Num(n) => *n != 0.0 && !n.is_nan(),
        Val::Str(s) => !s.is_empty(),
        _ => true,
    }
}

fn type_of(value: &Val) -> &'static str {
    match value {
        Val::Undefined => "undefined",
        Val::Null | Val::Array(_) | Val::Object(_) => "object",
        Val::Bool(_) => "boolean",
        Val::Num(_) => "number",
        Val::Str(_) => "string",
        Val::Closure(_) | Val::Native(_) => "function",
    }
}

fn to_str(value: &Val) -> String {
    to_str_nested(value, 0)
}

fn to_str_nested(value: &Val, depth: usize) -> String {
    match value {
        Val::Undefined => "undefined".to_string(),
        Val::Null => "null".to_string(),
        Val::Bool(b) => b.to_string(),
        Val::Num(n) => number_to_string(*n),
        Val::Str(s) => s.to_string(),
        Val::Array(items) if depth < MAX_VALUE_DEPTH => items
            .borrow()
            .iter()
            .map(|item| match item {
                Val::Undefined | Val::Null => String::new(),
                other => to_str_nested(other, depth + 1),
            })
            .collect::<Vec<_>>()
            .join(","),
        Val::Array(_) => String::new(),
        Val::Object(_) => "[object Object]".to_string(),
        Val::Closure(_) | Val::Native(_) => "function".to_string(),
    }
}

fn to_number(value: &Val) -> f64 {
    match value {
        Val::Undefined => f64::NAN,
        Val::Null => 0.0,
        Val::Bool(b) => f64::from(u8::from(*b)),
        Val::Num(n) => *n,
        Val::Str(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse().unwrap_or(f64::NAN)
            }
        }
        Val::Array(_) => to_number(&string(to_str(value))),
        _ => f64::NAN,
    }
}

fn strict_eq(a: &Val, b: &Val) -> bool {
    match (a, b) {
        (Val::Undefined, Val::Undefined) | (Val::Null, Val::Null) => true,
        (Val::Bool(x), Val::Bool(y)) => x == y,
        (Val::Num(x), Val::Num(y)) => x == y,
        (Val::Str(x), Val::Str(y)) => x == y,
        (Val::Array(x), Val::Array(y)) => Rc::ptr_eq(x, y),
        (Val::Object(x), Val::Object(y)) => Rc::ptr_eq(x, y),
        (Val::Closure(x), Val::Closure(y)) => Rc::ptr_eq(x, y),
        (Val::Native(x), Val::Native(y)) => x == y,
        _ => false,
    }
}

fn loose_eq(a: &Val, b: &Val) -> bool {
    match (a, b) {
        (Val::Undefined | Val::Null, Val::Undefined | Val::Null) => true,
        (Val::Undefined | Val::Null, _) | (_, Val::Undefined | Val::Null) => false,
        (Val::Num(x), Val::Str(_)) => *x == to_number(b),
        (Val::Str(_), Val::Num(y)) => to_number(a) == *y,
        (Val::Bool(_), _) => loose_eq(&Val::Num(to_number(a)), b),
        (_, Val::Bool(_)) => loose_eq(a, &Val::Num(to_number(b))),
        (Val::Array(_) | Val::Object(_), Val::Num(_) | Val::Str(_)) => loose_eq(&string(to_str(a)), b),
        (Val::Num(_) | Val::Str(_), Val::Array(_) | Val::Object(_)) => loose_eq(a, &string(to_str(b))),
        _ => strict_eq(a, b),
    }
}

fn as_index(key: &Val) -> Option<usize> {
    match key {
        Val::Num(n) if *n >= 0.0 && n.fract() == 0.0 => Some(*n as usize),
        Val::Str(s) => s.parse().ok(),
        _ => None,
    }
}

/// Resolves a possibly negative relative index against `len`.
fn relative_index(arg: Option<&Val>, len: usize, default: usize) -> usize {
    match arg {
        None | Some(Val::Undefined) => default,
        Some(value) => {
            let n = to_number(value);
            if n.is_nan() {
                0
            } else if n < 0.0 {
                (len as f64 + n).max(0.0) as usize
            } else {
                (n as usize).min(len)
            }
        }
    }
}

// =============================================================================
// Scopes
// =============================================================================

pub struct Scope {
    vars: RefCell<HashMap<String, Val>>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    fn lookup(&self, name: &str) -> Option<Val> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    fn declare(&self, name: &str, value: Val) {
        self.vars.borrow_mut().insert(name.to_string(), value);
    }

    /// Assigns to the nearest binding, or creates a global.
    fn assign(&self, name: &str, value: Val) {
        if let Some(slot) = self.vars.borrow_mut().get_mut(name) {
            *slot = value;
            return;
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => self.declare(name, value),
        }
    }
}

enum Flow {
    Normal,
    Return(Val),
    Break,
    Continue,
}

// =============================================================================
// Interpreter
// =============================================================================

pub struct Interp {
    steps: u64,
    step_limit: u64,
    depth: usize,
    emitted: Vec<(Value, Value)>,
    globals: Rc<Scope>,
    // Everything allocated during the run, cleared on drop so reference
    // cycles built by user code do not outlive the invocation.
    scopes: Vec<Rc<Scope>>,
    arrays: Vec<ArrayCell>,
    objects: Vec<ObjectCell>,
}

impl Drop for Interp {
    fn drop(&mut self) {
        for scope in &self.scopes {
            scope.vars.borrow_mut().clear();
        }
        for array in &self.arrays {
            array.borrow_mut().clear();
        }
        for object in &self.objects {
            object.borrow_mut().clear();
        }
    }
}

impl Interp {
    pub fn new(step_limit: u64, caps: Capabilities) -> Self {
        let globals = Rc::new(Scope { vars: RefCell::new(HashMap::new()), parent: None });
        let mut interp = Self {
            steps: 0,
            step_limit,
            depth: 0,
            emitted: Vec::new(),
            globals: Rc::clone(&globals),
            scopes: vec![Rc::clone(&globals)],
            arrays: Vec::new(),
            objects: Vec::new(),
        };
        interp.install_globals(caps);
        interp
    }

    fn install_globals(&mut self, caps: Capabilities) {
        let natives = [
            ("isArray", Native::IsArray),
            ("String", Native::ToStr),
            ("Number", Native::ToNum),
            ("Boolean", Native::ToBool),
            ("parseInt", Native::ParseInt),
            ("parseFloat", Native::ParseFloat),
            ("isNaN", Native::IsNaN),
        ];
        for (name, native) in natives {
            self.globals.declare(name, Val::Native(native));
        }
        self.globals.declare("NaN", Val::Num(f64::NAN));
        self.globals.declare("Infinity", Val::Num(f64::INFINITY));

        let math = self.new_object(vec![
            ("max".into(), Val::Native(Native::MathMax)),
            ("min".into(), Val::Native(Native::MathMin)),
            ("floor".into(), Val::Native(Native::MathFloor)),
            ("ceil".into(), Val::Native(Native::MathCeil)),
            ("round".into(), Val::Native(Native::MathRound)),
            ("abs".into(), Val::Native(Native::MathAbs)),
            ("sqrt".into(), Val::Native(Native::MathSqrt)),
            ("pow".into(), Val::Native(Native::MathPow)),
            ("PI".into(), Val::Num(std::f64::consts::PI)),
        ]);
        self.globals.declare("Math", math);
        let object = self.new_object(vec![
            ("keys".into(), Val::Native(Native::ObjectKeys)),
            ("values".into(), Val::Native(Native::ObjectValues)),
        ]);
        self.globals.declare("Object", object);
        let array = self.new_object(vec![("isArray".into(), Val::Native(Native::IsArray))]);
        self.globals.declare("Array", array);

        if caps.emit {
            self.globals.declare("emit", Val::Native(Native::Emit));
        }
        if caps.sum {
            self.globals.declare("sum", Val::Native(Native::Sum));
        }
        if caps.json {
            let json = self.new_object(vec![
                ("parse".into(), Val::Native(Native::JsonParse)),
                ("stringify".into(), Val::Native(Native::JsonStringify)),
            ]);
            self.globals.declare("JSON", json);
            self.globals.declare("toJSON", Val::Native(Native::JsonStringify));
        }
        if caps.log {
            self.globals.declare("log", Val::Native(Native::Log));
        }
    }

    /// Runs top-level statements, then calls `entry` with `args`.
    pub fn run(&mut self, program: &Program, entry: &Arc<FuncDef>, args: Vec<Val>) -> Result<Val> {
        let globals = Rc::clone(&self.globals);
        self.exec_block(&program.body, &globals)?;
        let closure = Rc::new(Closure { def: Arc::clone(entry), env: globals });
        self.call_closure(&closure, args)
    }

    pub fn take_emitted(&mut self) -> Vec<(Value, Value)> {
        std::mem::take(&mut self.emitted)
    }

    fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(eval_err(format!("step limit of {} exceeded", self.step_limit)));
        }
        Ok(())
    }

    fn new_array(&mut self, items: Vec<Val>) -> Val {
        let cell = Rc::new(RefCell::new(items));
        self.arrays.push(Rc::clone(&cell));
        Val::Array(cell)
    }

    fn new_object(&mut self, entries: Vec<(String, Val)>) -> Val {
        let cell = Rc::new(RefCell::new(entries));
        self.objects.push(Rc::clone(&cell));
        Val::Object(cell)
    }

    fn child_scope(&mut self, parent: &Rc<Scope>) -> Rc<Scope> {
        let scope = Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
        });
        self.scopes.push(Rc::clone(&scope));
        scope
    }

    // -------------------------------------------------------------------------
    // JSON conversion
    // -------------------------------------------------------------------------

    pub fn from_json(&mut self, value: &Value) -> Val {
        match value {
            Value::Null => Val::Null,
            Value::Bool(b) => Val::Bool(*b),
            Value::Number(n) => Val::Num(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => string(s),
            Value::Array(items) => {
                let items = items.iter().map(|v| self.from_json(v)).collect();
                self.new_array(items)
            }
            Value::Object(map) => {
                let entries = map.iter().map(|(k, v)| (k.clone(), self.from_json(v))).collect();
                self.new_object(entries)
            }
        }
    }

    pub fn to_json(&self, value: &Val) -> Result<Value> {
        to_json_nested(value, 0)
    }

    // -------------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------------

    fn hoist(&mut self, stmts: &[Stmt], scope: &Rc<Scope>) {
        for stmt in stmts {
            if let Stmt::Function(def) = stmt {
                if let Some(name) = &def.name {
                    let closure = Closure { def: Arc::clone(def), env: Rc::clone(scope) };
                    scope.declare(name, Val::Closure(Rc::new(closure)));
                }
            }
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt], scope: &Rc<Scope>) -> Result<Flow> {
        self.hoist(stmts, scope);
        for stmt in stmts {
            let flow = self.exec(stmt, scope)?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> Result<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, scope)?;
            }
            Stmt::Var(decls) => {
                for (name, init) in decls {
                    match init {
                        Some(expr) => {
                            let value = self.eval(expr, scope)?;
                            scope.declare(name, value);
                        }
                        None => {
                            if !scope.vars.borrow().contains_key(name) {
                                scope.declare(name, Val::Undefined);
                            }
                        }
                    }
                }
            }
            Stmt::If { test, then, otherwise } => {
                let test = self.eval(test, scope)?;
                if truthy(&test) {
                    return self.exec(then, scope);
                } else if let Some(otherwise) = otherwise {
                    return self.exec(otherwise, scope);
                }
            }
            Stmt::Block(stmts) => {
                let inner = self.child_scope(scope);
                return self.exec_block(stmts, &inner);
            }
            Stmt::For { init, test, update, body } => {
                let inner = self.child_scope(scope);
                if let Some(init) = init {
                    self.exec(init, &inner)?;
                }
                loop {
                    if let Some(test) = test {
                        let test = self.eval(test, &inner)?;
                        if !truthy(&test) {
                            break;
                        }
                    }
                    match self.exec(body, &inner)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(update) = update {
                        self.eval(update, &inner)?;
                    }
                    self.tick()?;
                }
            }
            Stmt::ForEach { name, of, iterable, body } => {
                let iterable = self.eval(iterable, scope)?;
                let items: Vec<Val> = match (&iterable, of) {
                    (Val::Array(items), true) => items.borrow().clone(),
                    (Val::Array(items), false) => (0..items.borrow().len()).map(|i| string(i.to_string())).collect(),
                    (Val::Str(s), true) => s.chars().map(|c| string(c.to_string())).collect(),
                    (Val::Str(s), false) => (0..s.chars().count()).map(|i| string(i.to_string())).collect(),
                    (Val::Object(map), false) => map.borrow().iter().map(|(k, _)| string(k)).collect(),
                    (Val::Undefined | Val::Null, false) => Vec::new(),
                    (other, _) => return Err(eval_err(format!("{} is not iterable", type_of(other)))),
                };
                for item in items {
                    let inner = self.child_scope(scope);
                    inner.declare(name, item);
                    match self.exec(body, &inner)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            Stmt::While { test, body } => loop {
                let value = self.eval(test, scope)?;
                if !truthy(&value) {
                    break;
                }
                match self.exec(body, scope)? {
                    Flow::Break => break,
                    Flow::Return(value) => return Ok(Flow::Return(value)),
                    Flow::Normal | Flow::Continue => {}
                }
            },
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Val::Undefined,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Throw(expr) => {
                let value = self.eval(expr, scope)?;
                let shown = match &value {
                    Val::Str(s) => s.to_string(),
                    other => self.to_json(other).map(|v| v.to_string()).unwrap_or_else(|_| to_str(other)),
                };
                return Err(eval_err(format!("uncaught exception: {shown}")));
            }
            Stmt::Function(_) | Stmt::Empty => {}
        }
        Ok(Flow::Normal)
    }

    // -------------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------------

    fn eval(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Result<Val> {
        self.tick()?;
        match expr {
            Expr::Num(n) => Ok(Val::Num(*n)),
            Expr::Str(s) => Ok(string(s)),
            Expr::Bool(b) => Ok(Val::Bool(*b)),
            Expr::Null => Ok(Val::Null),
            Expr::Undefined => Ok(Val::Undefined),
            Expr::Ident(name) => scope
                .lookup(name)
                .ok_or_else(|| eval_err(format!("{name} is not defined"))),
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, scope)?);
                }
                Ok(self.new_array(values))
            }
            Expr::Object(entries) => {
                let object = self.new_object(Vec::with_capacity(entries.len()));
                for (key, value) in entries {
                    let value = self.eval(value, scope)?;
                    self.set_member(&object, &string(key), value)?;
                }
                Ok(object)
            }
            Expr::Member { object, property } => {
                let target = self.eval(object, scope)?;
                let key = self.eval(property, scope)?;
                self.get_member(&target, &key)
            }
            Expr::Call { callee, args } => self.eval_call(callee, args, scope),
            Expr::Unary { op, expr } => {
                if let (UnaryOp::TypeOf, Expr::Ident(name)) = (op, expr.as_ref()) {
                    let value = scope.lookup(name).unwrap_or(Val::Undefined);
                    return Ok(string(type_of(&value)));
                }
                let value = self.eval(expr, scope)?;
                Ok(match op {
                    UnaryOp::Not => Val::Bool(!truthy(&value)),
                    UnaryOp::Neg => Val::Num(-to_number(&value)),
                    UnaryOp::Plus => Val::Num(to_number(&value)),
                    UnaryOp::TypeOf => string(type_of(&value)),
                })
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                Ok(binary(*op, &left, &right))
            }
            Expr::Logical { and, left, right } => {
                let left = self.eval(left, scope)?;
                if truthy(&left) == *and {
                    self.eval(right, scope)
                } else {
                    Ok(left)
                }
            }
            Expr::Conditional { test, then, otherwise } => {
                let test = self.eval(test, scope)?;
                if truthy(&test) {
                    self.eval(then, scope)
                } else {
                    self.eval(otherwise, scope)
                }
            }
            Expr::Assign { target, op, value } => {
                let value = match op {
                    None => self.eval(value, scope)?,
                    Some(op) => {
                        let current = self.eval(target, scope)?;
                        let operand = self.eval(value, scope)?;
                        binary(*op, &current, &operand)
                    }
                };
                self.store(target, value.clone(), scope)?;
                Ok(value)
            }
            Expr::Update { target, delta, prefix } => {
                let old = to_number(&self.eval(target, scope)?);
                let new = old + delta;
                self.store(target, Val::Num(new), scope)?;
                Ok(Val::Num(if *prefix { new } else { old }))
            }
            Expr::Function(def) => Ok(Val::Closure(Rc::new(Closure {
                def: Arc::clone(def),
                env: Rc::clone(scope),
            }))),
        }
    }

    fn store(&mut self, target: &Expr, value: Val, scope: &Rc<Scope>) -> Result<()> {
        match target {
            Expr::Ident(name) => {
                scope.assign(name, value);
                Ok(())
            }
            Expr::Member { object, property } => {
                let object = self.eval(object, scope)?;
                let key = self.eval(property, scope)?;
                self.set_member(&object, &key, value)
            }
            _ => Err(eval_err("invalid assignment target")),
        }
    }

    fn get_member(&mut self, target: &Val, key: &Val) -> Result<Val> {
        let name = to_str(key);
        match target {
            Val::Undefined | Val::Null => Err(eval_err(format!(
                "cannot read property '{name}' of {}",
                to_str(target)
            ))),
            Val::Object(map) => Ok(map
                .borrow()
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
                .unwrap_or(Val::Undefined)),
            Val::Array(items) => {
                let items = items.borrow();
                if name == "length" {
                    return Ok(Val::Num(items.len() as f64));
                }
                Ok(as_index(key)
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Val::Undefined))
            }
            Val::Str(s) => {
                if name == "length" {
                    return Ok(Val::Num(s.chars().count() as f64));
                }
                Ok(as_index(key)
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| string(c.to_string()))
                    .unwrap_or(Val::Undefined))
            }
            _ => Ok(Val::Undefined),
        }
    }

    fn set_member(&mut self, target: &Val, key: &Val, value: Val) -> Result<()> {
        match target {
            Val::Undefined | Val::Null => Err(eval_err(format!(
                "cannot set property '{}' of {}",
                to_str(key),
                to_str(target)
            ))),
            Val::Object(map) => {
                let name = to_str(key);
                let mut map = map.borrow_mut();
                match map.iter_mut().find(|(k, _)| *k == name) {
                    Some(slot) => slot.1 = value,
                    None => map.push((name, value)),
                }
                Ok(())
            }
            Val::Array(items) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                let (index, is_length) = match as_index(key) {
                    Some(i) => (i, false),
                    None if to_str(key) == "length" => match as_index(&value) {
                        Some(n) => (n, true),
                        None => return Err(eval_err("invalid array length")),
                    },
                    None => return Ok(()),
                };
                if index > len + MAX_ARRAY_GROWTH {
                    return Err(eval_err("array index out of range"));
                }
                if is_length {
                    items.resize(index, Val::Undefined);
                } else {
                    if index >= len {
                        items.resize(index + 1, Val::Undefined);
                    }
                    items[index] = value;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    fn eval_args(&mut self, args: &[Expr], scope: &Rc<Scope>) -> Result<Vec<Val>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, scope)?);
        }
        Ok(values)
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr], scope: &Rc<Scope>) -> Result<Val> {
        if let Expr::Member { object, property } = callee {
            let this = self.eval(object, scope)?;
            let key = self.eval(property, scope)?;
            let own = match &this {
                Val::Object(_) => self.get_member(&this, &key)?,
                _ => Val::Undefined,
            };
            let args = self.eval_args(args, scope)?;
            if matches!(own, Val::Closure(_) | Val::Native(_)) {
                return self.call(&own, args);
            }
            return self.call_method(&this, &to_str(&key), args);
        }
        let function = self.eval(callee, scope)?;
        let args = self.eval_args(args, scope)?;
        self.call(&function, args)
    }

    fn call(&mut self, function: &Val, args: Vec<Val>) -> Result<Val> {
        match function {
            Val::Closure(closure) => self.call_closure(closure, args),
            Val::Native(native) => self.call_native(*native, args),
            other => Err(eval_err(format!("{} is not a function", type_of(other)))),
        }
    }

    fn call_closure(&mut self, closure: &Rc<Closure>, args: Vec<Val>) -> Result<Val> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(eval_err("maximum call depth exceeded"));
        }
        self.depth += 1;
        let scope = self.child_scope(&closure.env);
        let mut args = args.into_iter();
        for param in &closure.def.params {
            scope.declare(param, args.next().unwrap_or(Val::Undefined));
        }
        let flow = self.exec_block(&closure.def.body, &scope);
        self.depth -= 1;
        match flow? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Val::Undefined),
        }
    }

    fn call_native(&mut self, native: Native, args: Vec<Val>) -> Result<Val> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Val::Undefined);
        let num = |i: usize| to_number(&arg(i));
        Ok(match native {
            Native::Emit => {
                let key = self.to_json(&arg(0))?;
                let value = self.to_json(&arg(1))?;
                self.emitted.push((key, value));
                Val::Undefined
            }
            Native::Sum => match arg(0) {
                Val::Array(items) => Val::Num(items.borrow().iter().map(to_number).sum()),
                _ => Val::Num(0.0),
            },
            Native::Log => {
                let message = match arg(0) {
                    Val::Str(s) => s.to_string(),
                    other => self.to_json(&other)?.to_string(),
                };
                info!(target: "sofadb::script", "{message}");
                Val::Undefined
            }
            Native::IsArray => Val::Bool(matches!(arg(0), Val::Array(_))),
            Native::JsonParse => {
                let text = to_str(&arg(0));
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| eval_err(format!("JSON.parse: {e}")))?;
                self.from_json(&value)
            }
            Native::JsonStringify => match arg(0) {
                Val::Undefined | Val::Closure(_) | Val::Native(_) => Val::Undefined,
                value => string(self.to_json(&value)?.to_string()),
            },
            Native::MathMax => Val::Num(
                args.iter().map(to_number).fold(f64::NEG_INFINITY, |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) }),
            ),
            Native::MathMin => Val::Num(
                args.iter().map(to_number).fold(f64::INFINITY, |a, b| if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) }),
            ),
            Native::MathFloor => Val::Num(num(0).floor()),
            Native::MathCeil => Val::Num(num(0).ceil()),
            Native::MathRound => Val::Num((num(0) + 0.5).floor()),
            Native::MathAbs => Val::Num(num(0).abs()),
            Native::MathSqrt => Val::Num(num(0).sqrt()),
            Native::MathPow => Val::Num(num(0).powf(num(1))),
            Native::ObjectKeys | Native::ObjectValues => {
                let entries: Vec<(String, Val)> = match arg(0) {
                    Val::Object(map) => map.borrow().clone(),
                    Val::Array(items) => items
                        .borrow()
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (i.to_string(), v.clone()))
                        .collect(),
                    _ => Vec::new(),
                };
                let items = entries
                    .into_iter()
                    .map(|(k, v)| if native == Native::ObjectKeys { string(k) } else { v })
                    .collect();
                self.new_array(items)
            }
            Native::ToStr => match args.first() {
                None => string(""),
                Some(value) => string(to_str(value)),
            },
            Native::ToNum => match args.first() {
                None => Val::Num(0.0),
                Some(value) => Val::Num(to_number(value)),
            },
            Native::ToBool => Val::Bool(truthy(&arg(0))),
            Native::ParseInt => {
                let radix = match arg(1) {
                    Val::Undefined => None,
                    other => Some(to_number(&other) as u32),
                };
                Val::Num(parse_int(&to_str(&arg(0)), radix))
            }
            Native::ParseFloat => Val::Num(parse_float(&to_str(&arg(0)))),
            Native::IsNaN => Val::Bool(num(0).is_nan()),
        })
    }

    fn call_method(&mut self, this: &Val, name: &str, args: Vec<Val>) -> Result<Val> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Val::Undefined);
        match (this, name) {
            (_, "toString") if !matches!(this, Val::Num(_)) => Ok(string(to_str(this))),
            (Val::Object(map), "hasOwnProperty") => {
                let key = to_str(&arg(0));
                Ok(Val::Bool(map.borrow().iter().any(|(k, _)| *k == key)))
            }
            (Val::Array(items), _) => self.array_method(items, name, args),
            (Val::Str(s), _) => self.string_method(s, name, &args),
            (Val::Num(n), "toFixed") => {
                let digits = to_number(&arg(0)).clamp(0.0, 20.0) as usize;
                Ok(string(format!("{n:.digits$}")))
            }
            (Val::Num(n), "toString") => Ok(string(number_to_string(*n))),
            (Val::Undefined | Val::Null, _) => Err(eval_err(format!(
                "cannot read property '{name}' of {}",
                to_str(this)
            ))),
            _ => Err(eval_err(format!("{name} is not a function"))),
        }
    }

    fn array_method(&mut self, cell: &ArrayCell, name: &str, args: Vec<Val>) -> Result<Val> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Val::Undefined);
        let this = Val::Array(Rc::clone(cell));
        match name {
            "push" => {
                let mut items = cell.borrow_mut();
                items.extend(args);
                Ok(Val::Num(items.len() as f64))
            }
            "pop" => Ok(cell.borrow_mut().pop().unwrap_or(Val::Undefined)),
            "shift" => {
                let mut items = cell.borrow_mut();
                Ok(if items.is_empty() { Val::Undefined } else { items.remove(0) })
            }
            "unshift" => {
                let mut items = cell.borrow_mut();
                items.splice(0..0, args);
                Ok(Val::Num(items.len() as f64))
            }
            "indexOf" => {
                let needle = arg(0);
                let position = cell.borrow().iter().position(|v| strict_eq(v, &needle));
                Ok(Val::Num(position.map(|p| p as f64).unwrap_or(-1.0)))
            }
            "includes" => {
                let needle = arg(0);
                Ok(Val::Bool(cell.borrow().iter().any(|v| strict_eq(v, &needle))))
            }
            "join" => {
                let sep = match arg(0) {
                    Val::Undefined => ",".to_string(),
                    other => to_str(&other),
                };
                let parts: Vec<String> = cell
                    .borrow()
                    .iter()
                    .map(|v| match v {
                        Val::Undefined | Val::Null => String::new(),
                        other => to_str(other),
                    })
                    .collect();
                Ok(string(parts.join(&sep)))
            }
            "slice" => {
                let items = cell.borrow().clone();
                let start = relative_index(args.first(), items.len(), 0);
                let end = relative_index(args.get(1), items.len(), items.len());
                let slice = if start < end { items[start..end].to_vec() } else { Vec::new() };
                Ok(self.new_array(slice))
            }
            "concat" => {
                let mut items = cell.borrow().clone();
                for value in args {
                    match value {
                        Val::Array(other) => items.extend(other.borrow().iter().cloned()),
                        other => items.push(other),
                    }
                }
                Ok(self.new_array(items))
            }
            "reverse" => {
                cell.borrow_mut().reverse();
                Ok(this)
            }
            "sort" => {
                let items = cell.borrow().clone();
                let comparator = args.first().filter(|f| matches!(f, Val::Closure(_) | Val::Native(_)));
                let sorted = self.merge_sort(items, comparator)?;
                *cell.borrow_mut() = sorted;
                Ok(this)
            }
            "forEach" | "map" | "filter" | "some" | "every" | "find" | "findIndex" => {
                let callback = arg(0);
                let items = cell.borrow().clone();
                let mut mapped = Vec::new();
                for (index, item) in items.into_iter().enumerate() {
                    let result = self.call(
                        &callback,
                        vec![item.clone(), Val::Num(index as f64), this.clone()],
                    )?;
                    match name {
                        "map" => mapped.push(result),
                        "filter" if truthy(&result) => mapped.push(item),
                        "some" if truthy(&result) => return Ok(Val::Bool(true)),
                        "every" if !truthy(&result) => return Ok(Val::Bool(false)),
                        "find" if truthy(&result) => return Ok(item),
                        "findIndex" if truthy(&result) => return Ok(Val::Num(index as f64)),
                        _ => {}
                    }
                }
                Ok(match name {
                    "map" | "filter" => self.new_array(mapped),
                    "some" => Val::Bool(false),
                    "every" => Val::Bool(true),
                    "findIndex" => Val::Num(-1.0),
                    _ => Val::Undefined,
                })
            }
            "reduce" => {
                let callback = arg(0);
                let mut items = cell.borrow().clone().into_iter().enumerate();
                let mut acc = match args.get(1) {
                    Some(initial) => initial.clone(),
                    None => match items.next() {
                        Some((_, first)) => first,
                        None => return Err(eval_err("reduce of empty array with no initial value")),
                    },
                };
                for (index, item) in items {
                    acc = self.call(&callback, vec![acc, item, Val::Num(index as f64), this.clone()])?;
                }
                Ok(acc)
            }
            _ => Err(eval_err(format!("array has no method {name}"))),
        }
    }

    fn string_method(&mut self, s: &Rc<str>, name: &str, args: &[Val]) -> Result<Val> {
        let arg_str = |i: usize| args.get(i).map(to_str).unwrap_or_default();
        let chars: Vec<char> = s.chars().collect();
        let len = chars.len();
        let substring = |start: usize, end: usize| -> Val {
            if start < end {
                string(chars[start..end].iter().collect::<String>())
            } else {
                string("")
            }
        };
        let char_index = |byte: Option<usize>| -> f64 {
            byte.map(|b| s[..b].chars().count() as f64).unwrap_or(-1.0)
        };
        Ok(match name {
            "indexOf" => Val::Num(char_index(s.find(arg_str(0).as_str()))),
            "lastIndexOf" => Val::Num(char_index(s.rfind(arg_str(0).as_str()))),
            "includes" => Val::Bool(s.contains(arg_str(0).as_str())),
            "startsWith" => Val::Bool(s.starts_with(arg_str(0).as_str())),
            "endsWith" => Val::Bool(s.ends_with(arg_str(0).as_str())),
            "toLowerCase" => string(s.to_lowercase()),
            "toUpperCase" => string(s.to_uppercase()),
            "trim" => string(s.trim()),
            "charAt" => {
                let i = relative_index(args.first(), len, 0);
                substring(i, (i + 1).min(len))
            }
            "charCodeAt" => {
                let i = relative_index(args.first(), len, 0);
                Val::Num(chars.get(i).map(|c| f64::from(u32::from(*c))).unwrap_or(f64::NAN))
            }
            "slice" => {
                let start = relative_index(args.first(), len, 0);
                let end = relative_index(args.get(1), len, len);
                substring(start, end)
            }
            "substring" => {
                let clamp = |v: Option<&Val>, default: usize| match v {
                    None | Some(Val::Undefined) => default,
                    Some(v) => to_number(v).max(0.0).min(len as f64) as usize,
                };
                let (a, b) = (clamp(args.first(), 0), clamp(args.get(1), len));
                substring(a.min(b), a.max(b))
            }
            "substr" => {
                let start = relative_index(args.first(), len, 0);
                let count = match args.get(1) {
                    None | Some(Val::Undefined) => len,
                    Some(v) => to_number(v).max(0.0) as usize,
                };
                substring(start, start.saturating_add(count).min(len))
            }
            "split" => {
                let parts: Vec<Val> = match args.first() {
                    None | Some(Val::Undefined) => vec![string(s)],
                    Some(sep) => {
                        let sep = to_str(sep);
                        if sep.is_empty() {
                            chars.iter().map(|c| string(c.to_string())).collect()
                        } else {
                            s.split(sep.as_str()).map(string).collect()
                        }
                    }
                };
                self.new_array(parts)
            }
            "replace" => string(s.replacen(arg_str(0).as_str(), &arg_str(1), 1)),
            "concat" => {
                let mut out = s.to_string();
                for value in args {
                    out.push_str(&to_str(value));
                }
                string(out)
            }
            _ => return Err(eval_err(format!("string has no method {name}"))),
        })
    }

    fn merge_sort(&mut self, mut items: Vec<Val>, comparator: Option<&Val>) -> Result<Vec<Val>> {
        if items.len() <= 1 {
            return Ok(items);
        }
        let right = items.split_off(items.len() / 2);
        let left = self.merge_sort(items, comparator)?;
        let right = self.merge_sort(right, comparator)?;

        let mut merged = Vec::with_capacity(left.len() + right.len());
        let mut left = left.into_iter().peekable();
        let mut right = right.into_iter().peekable();
        while let (Some(l), Some(r)) = (left.peek(), right.peek()) {
            let take_right = self.sort_compare(l, r, comparator)? == Ordering::Greater;
            let next = if take_right { right.next() } else { left.next() };
            merged.extend(next);
        }
        merged.extend(left);
        merged.extend(right);
        Ok(merged)
    }

    fn sort_compare(&mut self, a: &Val, b: &Val, comparator: Option<&Val>) -> Result<Ordering> {
        self.tick()?;
        match (a, b) {
            (Val::Undefined, Val::Undefined) => return Ok(Ordering::Equal),
            (Val::Undefined, _) => return Ok(Ordering::Greater),
            (_, Val::Undefined) => return Ok(Ordering::Less),
            _ => {}
        }
        match comparator {
            Some(f) => {
                let result = to_number(&self.call(f, vec![a.clone(), b.clone()])?);
                Ok(result.partial_cmp(&0.0).unwrap_or(Ordering::Equal))
            }
            None => Ok(to_str(a).cmp(&to_str(b))),
        }
    }
}

fn binary(op: BinOp, left: &Val, right: &Val) -> Val {
    match op {
        BinOp::Add => {
            let stringy = |v: &Val| matches!(v, Val::Str(_) | Val::Array(_) | Val::Object(_));
            if stringy(left) || stringy(right) {
                string(format!("{}{}", to_str(left), to_str(right)))
            } else {
                Val::Num(to_number(left) + to_number(right))
            }
        }
        BinOp::Sub => Val::Num(to_number(left) - to_number(right)),
        BinOp::Mul => Val::Num(to_number(left) * to_number(right)),
        BinOp::Div => Val::Num(to_number(left) / to_number(right)),
        BinOp::Mod => Val::Num(to_number(left) % to_number(right)),
        BinOp::Eq => Val::Bool(loose_eq(left, right)),
        BinOp::NotEq => Val::Bool(!loose_eq(left, right)),
        BinOp::StrictEq => Val::Bool(strict_eq(left, right)),
        BinOp::StrictNotEq => Val::Bool(!strict_eq(left, right)),
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
            let ordering = match (left, right) {
                (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
                _ => to_number(left).partial_cmp(&to_number(right)),
            };
            Val::Bool(match (op, ordering) {
                (_, None) => false,
                (BinOp::Lt, Some(o)) => o.is_lt(),
                (BinOp::Gt, Some(o)) => o.is_gt(),
                (BinOp::Le, Some(o)) => o.is_le(),
                (_, Some(o)) => o.is_ge(),
            })
        }
    }
}

fn to_json_nested(value: &Val, depth: usize) -> Result<Value> {
    if depth > MAX_VALUE_DEPTH {
        return Err(eval_err("value nested too deep (cyclic?)"));
    }
    Ok(match value {
        Val::Undefined | Val::Null | Val::Closure(_) | Val::Native(_) => Value::Null,
        Val::Bool(b) => Value::Bool(*b),
        Val::Num(n) => number_to_json(*n),
        Val::Str(s) => Value::String(s.to_string()),
        Val::Array(items) => Value::Array(
            items
                .borrow()
                .iter()
                .map(|v| to_json_nested(v, depth + 1))
                .collect::<Result<_>>()?,
        ),
        Val::Object(entries) => {
            let mut map = Map::new();
            for (key, value) in entries.borrow().iter() {
                if matches!(value, Val::Undefined | Val::Closure(_) | Val::Native(_)) {
                    continue;
                }
                map.insert(key.clone(), to_json_nested(value, depth + 1)?);
            }
            Value::Object(map)
        }
    })
}

/// Integral values become JSON integers so `1` stays `1`, not `1.0`.
fn number_to_json(n: f64) -> Value {
    if n.is_finite() && n == n.trunc() && n.abs() < 9.007_199_254_740_992e15 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn parse_int(text: &str, radix: Option<u32>) -> f64 {
    let text = text.trim();
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, text) = match radix {
        Some(16) | None if text.starts_with("0x") || text.starts_with("0X") => (16, &text[2..]),
        Some(r) if (2..=36).contains(&r) => (r, text),
        Some(0) | None => (10, text),
        Some(_) => return f64::NAN,
    };
    let digits: String = text.chars().take_while(|c| c.is_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let value = digits
        .chars()
        .filter_map(|c| c.to_digit(radix))
        .fold(0.0, |acc, d| acc * f64::from(radix) + f64::from(d));
    if negative {
        -value
    } else {
        value
    }
}

fn parse_float(text: &str) -> f64 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => {}
            b'+' | b'-' if end == 0 || matches!(bytes[end - 1], b'e' | b'E') => {}
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if !seen_exp && end > 0 => seen_exp = true,
            _ => break,
        }
        end += 1;
    }
    // Back off until the prefix parses ("1e" -> "1").
    while end > 0 {
        if let Ok(value) = text[..end].parse::<f64>() {
            return value;
        }
        end -= 1;
    }
    if text.starts_with("Infinity") {
        return f64::INFINITY;
    }
    f64::NAN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::parse;
    use serde_json::json;

    fn run(source: &str, args: Vec<Value>) -> Result<(Value, Vec<(Value, Value)>)> {
        let program = parse(source)?;
        let entry = program.entry().unwrap();
        let mut interp = Interp::new(10_000, Capabilities::MAP.union(Capabilities::REDUCE));
        let args = args.iter().map(|a| interp.from_json(a)).collect();
        let result = interp.run(&program, &entry, args)?;
        let json = interp.to_json(&result)?;
        Ok((json, interp.take_emitted()))
    }

    #[test]
    fn test_emit_and_control_flow() {
        let source = r#"
            function (doc) {
                for (var i = 0; i < doc.tags.length; i++) {
                    if (doc.tags[i] === "skip") continue;
                    emit([doc.type, doc.tags[i]], i);
                }
                for (var key in doc.meta) emit(key, doc.meta[key] * 2);
            }
        "#;
        let doc = json!({"type": "post", "tags": ["a", "skip", "b"], "meta": {"x": 2}});
        let (_, emitted) = run(source, vec![doc]).unwrap();
        assert_eq!(
            emitted,
            vec![
                (json!(["post", "a"]), json!(0)),
                (json!(["post", "b"]), json!(2)),
                (json!("x"), json!(4)),
            ]
        );
    }

    #[test]
    fn test_closures_and_helpers() {
        let source = r#"
            function twice(f, x) { return f(f(x)); }
            function (values) {
                var add = 0;
                values.forEach(function (v) { add += v; });
                return { total: add, doubled: twice(x => x * 2, 3), sorted: values.slice().sort(function (a, b) { return a - b; }) };
            }
        "#;
        let (result, _) = run(source, vec![json!([3, 1, 2])]).unwrap();
        assert_eq!(result, json!({"total": 6, "doubled": 12, "sorted": [1, 2, 3]}));
    }

    #[test]
    fn test_coercions() {
        let source = r#"
            function () {
                return [1 + "2", "3" * 2, 1 == "1", 1 === "1", null == undefined, typeof nope,
                        [1, 2] + "", parseInt("42px"), parseFloat("3.5e1x"), (0.1).toFixed(2)];
            }
        "#;
        let (result, _) = run(source, vec![]).unwrap();
        assert_eq!(
            result,
            json!(["12", 6, true, false, true, "undefined", "1,2", 42, 35, "0.10"])
        );
    }

    #[test]
    fn test_step_limit_stops_infinite_loop() {
        let err = run("function () { while (true) {} }", vec![]).unwrap_err();
        assert!(matches!(err, Error::Eval(msg) if msg.contains("step limit")));
    }

    #[test]
    fn test_runaway_recursion_fails() {
        let err = run("function f(n) { return f(n + 1); }", vec![json!(0)]).unwrap_err();
        assert!(matches!(err, Error::Eval(_)));
    }

    #[test]
    fn test_errors_surface() {
        assert!(matches!(run("function (doc) { return doc.a.b; }", vec![json!({})]), Err(Error::Eval(_))));
        assert!(matches!(run("function () { throw 'nope'; }", vec![]), Err(Error::Eval(m)) if m.contains("nope")));
        assert!(matches!(run("function () { return require('fs'); }", vec![]), Err(Error::Eval(_))));
    }

    #[test]
    fn test_cyclic_value_is_rejected() {
        let err = run("function () { var a = []; a.push(a); return a; }", vec![]).unwrap_err();
        assert!(matches!(err, Error::Eval(_)));
    }
}
