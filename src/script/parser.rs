//! Recursive-descent parser producing the script AST.
//!
//! ```text
//! statement  := var | if | for | while | return | break | continue
//!             | throw | function | block | expression ';'?
//! expression := assignment
//! assignment := conditional (('=' | '+=' | ...) assignment)?
//! conditional:= or ('?' assignment ':' assignment)?
//! or         := and ('||' and)*          ...down to unary, postfix, call/member, primary
//! ```
//!
//! Semicolons are optional wherever a statement ends.

use std::sync::Arc;

use super::lexer::{syntax, tokenize, Spanned, Token};
use crate::error::Result;

const MAX_NESTING: usize = 128;

// =============================================================================
// AST
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    TypeOf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Member { object: Box<Expr>, property: Box<Expr> },
    Call { callee: Box<Expr>, args: Vec<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    /// `&&` when `and`, `||` otherwise.
    Logical { and: bool, left: Box<Expr>, right: Box<Expr> },
    Conditional { test: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
    Assign { target: Box<Expr>, op: Option<BinOp>, value: Box<Expr> },
    Update { target: Box<Expr>, delta: f64, prefix: bool },
    Function(Arc<FuncDef>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncDef {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Var(Vec<(String, Option<Expr>)>),
    If { test: Expr, then: Box<Stmt>, otherwise: Option<Box<Stmt>> },
    Block(Vec<Stmt>),
    For { init: Option<Box<Stmt>>, test: Option<Expr>, update: Option<Expr>, body: Box<Stmt> },
    /// `for (x in obj)` iterates keys; `for (x of arr)` iterates values.
    ForEach { name: String, of: bool, iterable: Expr, body: Box<Stmt> },
    While { test: Expr, body: Box<Stmt> },
    Return(Option<Expr>),
    Break,
    Continue,
    Throw(Expr),
    Function(Arc<FuncDef>),
    Empty,
}

/// A parsed script.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}

impl Program {
    /// The function the host invokes: the last top-level function
    /// expression or declaration.
    pub fn entry(&self) -> Option<Arc<FuncDef>> {
        self.body.iter().rev().find_map(|stmt| match stmt {
            Stmt::Expr(Expr::Function(def)) | Stmt::Function(def) => Some(Arc::clone(def)),
            _ => None,
        })
    }
}

pub fn parse(source: &str) -> Result<Program> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.statement()?);
    }
    Ok(Program { body })
}

// =============================================================================
// Parser
// =============================================================================

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].token
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Token::Punct(q) if *q == p)
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Token::Ident(name) if name == kw)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.is_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{p}'")))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.advance() {
            Token::Ident(name) if !is_reserved(&name) => Ok(name),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("expected identifier"))
            }
        }
    }

    fn unexpected(&self, msg: &str) -> crate::error::Error {
        syntax(self.line(), &format!("{msg}, found {:?}", self.peek()))
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(syntax(self.line(), "nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn end_statement(&mut self) {
        self.eat_punct(";");
    }

    // -------------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------------

    fn statement(&mut self) -> Result<Stmt> {
        self.enter()?;
        let stmt = self.statement_inner();
        self.leave();
        stmt
    }

    fn statement_inner(&mut self) -> Result<Stmt> {
        if self.eat_punct(";") {
            return Ok(Stmt::Empty);
        }
        if self.is_punct("{") {
            return Ok(Stmt::Block(self.block()?));
        }
        if let Token::Ident(word) = self.peek().clone() {
            match word.as_str() {
                "var" | "let" | "const" => {
                    let stmt = self.var_decl()?;
                    self.end_statement();
                    return Ok(stmt);
                }
                "if" => {
                    self.advance();
                    self.expect_punct("(")?;
                    let test = self.expression()?;
                    self.expect_punct(")")?;
                    let then = Box::new(self.statement()?);
                    let otherwise = if self.eat_keyword("else") {
                        Some(Box::new(self.statement()?))
                    } else {
                        None
                    };
                    return Ok(Stmt::If { test, then, otherwise });
                }
                "for" => return self.for_statement(),
                "while" => {
                    self.advance();
                    self.expect_punct("(")?;
                    let test = self.expression()?;
                    self.expect_punct(")")?;
                    let body = Box::new(self.statement()?);
                    return Ok(Stmt::While { test, body });
                }
                "return" => {
                    self.advance();
                    let value = if self.is_punct(";") || self.is_punct("}") || self.at_eof() {
                        None
                    } else {
                        Some(self.expression()?)
                    };
                    self.end_statement();
                    return Ok(Stmt::Return(value));
                }
                "break" => {
                    self.advance();
                    self.end_statement();
                    return Ok(Stmt::Break);
                }
                "continue" => {
                    self.advance();
                    self.end_statement();
                    return Ok(Stmt::Continue);
                }
                "throw" => {
                    self.advance();
                    let value = self.expression()?;
                    self.end_statement();
                    return Ok(Stmt::Throw(value));
                }
                "function" => {
                    let def = self.function()?;
                    self.end_statement();
                    return Ok(if def.name.is_some() {
                        Stmt::Function(def)
                    } else {
                        Stmt::Expr(Expr::Function(def))
                    });
                }
                _ => {}
            }
        }
        let expr = self.expression()?;
        self.end_statement();
        Ok(Stmt::Expr(expr))
    }

    fn block(&mut self) -> Result<Vec<Stmt>> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected("expected '}'"));
            }
            body.push(self.statement()?);
        }
        self.advance();
        Ok(body)
    }

    fn var_decl(&mut self) -> Result<Stmt> {
        self.advance();
        let mut decls = Vec::new();
        loop {
            let name = self.ident()?;
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            decls.push((name, init));
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(Stmt::Var(decls))
    }

    fn for_statement(&mut self) -> Result<Stmt> {
        self.advance();
        self.expect_punct("(")?;

        // for (var x in/of expr)
        let declared = matches!(self.peek(), Token::Ident(w) if matches!(w.as_str(), "var" | "let" | "const"));
        let name_offset = usize::from(declared);
        if let (Token::Ident(name), Token::Ident(kw)) = (self.peek_at(name_offset).clone(), self.peek_at(name_offset + 1).clone()) {
            if kw == "in" || kw == "of" {
                self.pos += name_offset + 2;
                let iterable = self.expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.statement()?);
                return Ok(Stmt::ForEach { name, of: kw == "of", iterable, body });
            }
        }

        let init = if self.eat_punct(";") {
            None
        } else {
            let init = if declared {
                self.var_decl()?
            } else {
                Stmt::Expr(self.expression()?)
            };
            self.expect_punct(";")?;
            Some(Box::new(init))
        };
        let test = if self.is_punct(";") { None } else { Some(self.expression()?) };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") { None } else { Some(self.expression()?) };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For { init, test, update, body })
    }

    fn function(&mut self) -> Result<Arc<FuncDef>> {
        self.advance();
        let name = match self.peek() {
            Token::Ident(_) => Some(self.ident()?),
            _ => None,
        };
        self.expect_punct("(")?;
        let mut params = Vec::new();
        while !self.eat_punct(")") {
            params.push(self.ident()?);
            if !self.is_punct(")") {
                self.expect_punct(",")?;
            }
        }
        let body = self.block()?;
        Ok(Arc::new(FuncDef { name, params, body }))
    }

    // -------------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------------

    fn expression(&mut self) -> Result<Expr> {
        self.enter()?;
        let expr = self.assignment();
        self.leave();
        expr
    }

    fn assignment(&mut self) -> Result<Expr> {
        if let Some(arrow) = self.arrow_function()? {
            return Ok(arrow);
        }
        let target = self.conditional()?;
        let op = match self.peek() {
            Token::Punct("=") => None,
            Token::Punct("+=") => Some(BinOp::Add),
            Token::Punct("-=") => Some(BinOp::Sub),
            Token::Punct("*=") => Some(BinOp::Mul),
            Token::Punct("/=") => Some(BinOp::Div),
            Token::Punct("%=") => Some(BinOp::Mod),
            _ => return Ok(target),
        };
        if !matches!(target, Expr::Ident(_) | Expr::Member { .. }) {
            return Err(self.unexpected("invalid assignment target"));
        }
        self.advance();
        let value = self.assignment()?;
        Ok(Expr::Assign { target: Box::new(target), op, value: Box::new(value) })
    }

    /// `x => ...` or `(a, b) => ...`, detected by scanning ahead.
    fn arrow_function(&mut self) -> Result<Option<Expr>> {
        let params = match (self.peek().clone(), self.peek_at(1).clone()) {
            (Token::Ident(name), Token::Punct("=>")) if !is_reserved(&name) => {
                self.pos += 1;
                vec![name]
            }
            (Token::Punct("("), _) => {
                let mut offset = 1;
                let mut params = Vec::new();
                loop {
                    match self.peek_at(offset) {
                        Token::Punct(")") => break,
                        Token::Ident(name) if !is_reserved(name) => {
                            params.push(name.clone());
                            offset += 1;
                            match self.peek_at(offset) {
                                Token::Punct(",") => offset += 1,
                                Token::Punct(")") => {}
                                _ => return Ok(None),
                            }
                        }
                        _ => return Ok(None),
                    }
                }
                if self.peek_at(offset + 1) != &Token::Punct("=>") {
                    return Ok(None);
                }
                self.pos += offset + 1;
                params
            }
            _ => return Ok(None),
        };
        self.expect_punct("=>")?;
        let body = if self.is_punct("{") {
            self.block()?
        } else {
            vec![Stmt::Return(Some(self.assignment()?))]
        };
        Ok(Some(Expr::Function(Arc::new(FuncDef { name: None, params, body }))))
    }

    fn conditional(&mut self) -> Result<Expr> {
        let test = self.logical_or()?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let then = self.assignment()?;
        self.expect_punct(":")?;
        let otherwise = self.assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn logical_or(&mut self) -> Result<Expr> {
        let mut left = self.logical_and()?;
        let mut nested = 0;
        while self.eat_punct("||") {
            self.enter()?;
            nested += 1;
            let right = self.logical_and()?;
            left = Expr::Logical { and: false, left: Box::new(left), right: Box::new(right) };
        }
        self.depth -= nested;
        Ok(left)
    }

    fn logical_and(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        let mut nested = 0;
        while self.eat_punct("&&") {
            self.enter()?;
            nested += 1;
            let right = self.equality()?;
            left = Expr::Logical { and: true, left: Box::new(left), right: Box::new(right) };
        }
        self.depth -= nested;
        Ok(left)
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        // Left-associative chains nest the tree, so each link counts as depth.
        let mut left = next(self)?;
        let mut nested = 0;
        'outer: loop {
            for (punct, op) in ops {
                if self.eat_punct(punct) {
                    self.enter()?;
                    nested += 1;
                    let right = next(self)?;
                    left = Expr::Binary { op: *op, left: Box::new(left), right: Box::new(right) };
                    continue 'outer;
                }
            }
            self.depth -= nested;
            return Ok(left);
        }
    }

    fn equality(&mut self) -> Result<Expr> {
        self.binary_level(
            &[
                ("===", BinOp::StrictEq),
                ("!==", BinOp::StrictNotEq),
                ("==", BinOp::Eq),
                ("!=", BinOp::NotEq),
            ],
            Self::relational,
        )
    }

    fn relational(&mut self) -> Result<Expr> {
        self.binary_level(
            &[("<=", BinOp::Le), (">=", BinOp::Ge), ("<", BinOp::Lt), (">", BinOp::Gt)],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr> {
        self.binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        self.binary_level(
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Mod)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Token::Punct("!") => Some(UnaryOp::Not),
            Token::Punct("-") => Some(UnaryOp::Neg),
            Token::Punct("+") => Some(UnaryOp::Plus),
            Token::Ident(w) if w == "typeof" => Some(UnaryOp::TypeOf),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            self.enter()?;
            let expr = self.unary();
            self.leave();
            return Ok(Expr::Unary { op, expr: Box::new(expr?) });
        }
        for (punct, delta) in [("++", 1.0), ("--", -1.0)] {
            if self.eat_punct(punct) {
                self.enter()?;
                let target = self.unary();
                self.leave();
                return Ok(Expr::Update { target: Box::new(target?), delta, prefix: true });
            }
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let expr = self.call_member()?;
        for (punct, delta) in [("++", 1.0), ("--", -1.0)] {
            if self.eat_punct(punct) {
                return Ok(Expr::Update { target: Box::new(expr), delta, prefix: false });
            }
        }
        Ok(expr)
    }

    fn call_member(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        let mut nested = 0;
        loop {
            if self.is_punct(".") || self.is_punct("[") || self.is_punct("(") {
                self.enter()?;
                nested += 1;
            }
            if self.eat_punct(".") {
                let name = match self.advance() {
                    Token::Ident(name) => name,
                    _ => return Err(self.unexpected("expected property name")),
                };
                expr = Expr::Member { object: Box::new(expr), property: Box::new(Expr::Str(name)) };
            } else if self.eat_punct("[") {
                let property = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Member { object: Box::new(expr), property: Box::new(property) };
            } else if self.eat_punct("(") {
                let mut args = Vec::new();
                while !self.eat_punct(")") {
                    args.push(self.assignment()?);
                    if !self.is_punct(")") {
                        self.expect_punct(",")?;
                    }
                }
                expr = Expr::Call { callee: Box::new(expr), args };
            } else {
                self.depth -= nested;
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.peek().clone() {
            Token::Num(n) => {
                self.advance();
                Ok(Expr::Num(n))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Token::Punct("(") => {
                self.advance();
                let expr = self.expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Token::Punct("[") => {
                self.advance();
                let mut items = Vec::new();
                while !self.eat_punct("]") {
                    items.push(self.assignment()?);
                    if !self.is_punct("]") {
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::Punct("{") => {
                self.advance();
                let mut entries = Vec::new();
                while !self.eat_punct("}") {
                    let key = match self.advance() {
                        Token::Ident(name) | Token::Str(name) => name,
                        Token::Num(n) => super::interp::number_to_string(n),
                        _ => return Err(self.unexpected("expected property key")),
                    };
                    let value = if self.eat_punct(":") {
                        self.assignment()?
                    } else {
                        Expr::Ident(key.clone())
                    };
                    entries.push((key, value));
                    if !self.is_punct("}") {
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::Object(entries))
            }
            Token::Ident(word) => match word.as_str() {
                "true" => {
                    self.advance();
                    Ok(Expr::Bool(true))
                }
                "false" => {
                    self.advance();
                    Ok(Expr::Bool(false))
                }
                "null" => {
                    self.advance();
                    Ok(Expr::Null)
                }
                "undefined" => {
                    self.advance();
                    Ok(Expr::Undefined)
                }
                "function" => Ok(Expr::Function(self.function()?)),
                _ => Ok(Expr::Ident(self.ident()?)),
            },
            _ => Err(self.unexpected("unexpected token")),
        }
    }
}

fn is_reserved(word: &str) -> bool {
    matches!(
        word,
        "var" | "let" | "const" | "if" | "else" | "for" | "while" | "return" | "break"
            | "continue" | "function" | "throw" | "typeof" | "in" | "of" | "true" | "false"
            | "null" | "new" | "this" | "delete" | "class"
    )
}
