//! Condition atoms and the boolean expression language over them.
//!
//! An atom is `name[:argument]`, dispatched through a [`ConditionRegistry`].
//! Expressions combine atoms with `not`, `and`, `or` (in that precedence order)
//! and parentheses. They are parsed once when a policy is compiled.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AppError, AppResult};

use super::model::Subject;

/// What a condition callable can look at.
pub struct ConditionContext<'a> {
    pub subject: &'a Subject,
    pub method: &'a str,
    pub action: &'a str,
}

pub type ConditionFn = Arc<dyn Fn(&ConditionContext<'_>, Option<&str>) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ConditionRegistry {
    methods: HashMap<String, ConditionFn>,
}

impl Default for ConditionRegistry {
    fn default() -> Self { Self::builtin() }
}

impl ConditionRegistry {
    pub fn empty() -> Self { Self { methods: HashMap::new() } }

    pub fn builtin() -> Self {
        let mut r = Self::empty();
        r.register("is_authenticated", |c, _| !c.subject.member.is_anonymous());
        r.register("is_anonymous", |c, _| c.subject.member.is_anonymous());
        r.register("is_staff", |c, _| c.subject.member.is_staff);
        r.register("is_admin", |c, _| c.subject.member.is_admin);
        r.register("is_superuser", |c, _| c.subject.member.is_superuser);
        r.register("is_method", |c, arg| arg.map(|m| m.eq_ignore_ascii_case(c.method)).unwrap_or(false));
        r.register("is_action", |c, arg| arg.map(|a| a == c.action).unwrap_or(false));
        r.register("has_group", |c, arg| arg.map(|g| c.subject.in_group(g)).unwrap_or(false));
        r
    }

    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&ConditionContext<'_>, Option<&str>) -> bool + Send + Sync + 'static,
    {
        self.methods.insert(name.to_string(), Arc::new(f));
    }

    pub fn contains(&self, name: &str) -> bool { self.methods.contains_key(name) }

    /// `POLICY_UNKNOWN_CONDITION` unless `atom` names a registered method.
    pub fn require(&self, atom: &Atom) -> AppResult<()> {
        if self.contains(&atom.name) {
            return Ok(());
        }
        Err(AppError::policy_unknown_condition(
            "unknown_condition".to_string(),
            format!("condition method '{}' is not registered", atom.name),
        ))
    }

    pub fn call(&self, atom: &Atom, ctx: &ConditionContext<'_>) -> AppResult<bool> {
        match self.methods.get(&atom.name) {
            Some(f) => Ok(f(ctx, atom.arg.as_deref())),
            None => self.require(atom).map(|_| false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    pub name: String,
    pub arg: Option<String>,
}

impl Atom {
    pub fn parse(raw: &str) -> AppResult<Atom> {
        let raw = raw.trim();
        let (name, arg) = match raw.split_once(':') {
            Some((n, a)) => (n, Some(a.to_string())),
            None => (raw, None),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(AppError::policy_parse("bad_condition".to_string(), format!("invalid condition '{}'", raw)));
        }
        Ok(Atom { name: name.to_string(), arg })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Atom(Atom),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn eval(&self, reg: &ConditionRegistry, ctx: &ConditionContext<'_>) -> AppResult<bool> {
        match self {
            Expr::Atom(a) => reg.call(a, ctx),
            Expr::Not(e) => Ok(!e.eval(reg, ctx)?),
            Expr::And(l, r) => Ok(l.eval(reg, ctx)? && r.eval(reg, ctx)?),
            Expr::Or(l, r) => Ok(l.eval(reg, ctx)? || r.eval(reg, ctx)?),
        }
    }

    /// Every atom in the expression, left to right.
    pub fn atoms(&self) -> Vec<&Atom> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Atom>) {
        match self {
            Expr::Atom(a) => out.push(a),
            Expr::Not(e) => e.collect(out),
            Expr::And(l, r) | Expr::Or(l, r) => {
                l.collect(out);
                r.collect(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Word(String),
}

fn tokenize(src: &str) -> Vec<Tok> {
    let mut out = Vec::new();
    let mut word = String::new();
    let flush = |word: &mut String, out: &mut Vec<Tok>| {
        if word.is_empty() {
            return;
        }
        let tok = match word.as_str() {
            "and" => Tok::And,
            "or" => Tok::Or,
            "not" => Tok::Not,
            _ => Tok::Word(word.clone()),
        };
        out.push(tok);
        word.clear();
    };
    for ch in src.chars() {
        match ch {
            '(' | ')' => {
                flush(&mut word, &mut out);
                out.push(if ch == '(' { Tok::LParen } else { Tok::RParen });
            }
            c if c.is_whitespace() => flush(&mut word, &mut out),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut out);
    out
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
    src: String,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> { self.toks.get(self.pos) }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn fail(&self, what: &str) -> AppError {
        AppError::policy_parse("bad_condition_expression".to_string(), format!("{} in condition expression '{}'", what, self.src))
    }

    fn or(&mut self) -> AppResult<Expr> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Tok::Or) {
            self.bump();
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> AppResult<Expr> {
        let mut lhs = self.not()?;
        while self.peek() == Some(&Tok::And) {
            self.bump();
            let rhs = self.not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> AppResult<Expr> {
        if self.peek() == Some(&Tok::Not) {
            self.bump();
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> AppResult<Expr> {
        match self.bump() {
            Some(Tok::LParen) => {
                let e = self.or()?;
                match self.bump() {
                    Some(Tok::RParen) => Ok(e),
                    _ => Err(self.fail("missing ')'")),
                }
            }
            Some(Tok::Word(w)) => Ok(Expr::Atom(Atom::parse(&w)?)),
            Some(t) => Err(self.fail(&format!("unexpected {:?}", t))),
            None => Err(self.fail("unexpected end")),
        }
    }
}

/// Parse a boolean condition expression.
pub fn parse_expression(src: &str) -> AppResult<Expr> {
    let mut p = Parser { toks: tokenize(src), pos: 0, src: src.to_string() };
    let e = p.or()?;
    if p.pos < p.toks.len() {
        return Err(p.fail("trailing input"));
    }
    Ok(e)
}
