use std::time::Duration;

use crate::metric::{MetricKind, Sink};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid threshold expression `{expr_source}`: {detail}")]
    Parse { expr_source: String, detail: String },

    #[error("unknown symbol `{0}` in threshold expression")]
    UnknownSymbol(String),

    #[error("`{symbol}` is not defined for {kind} metrics")]
    SymbolUnavailable { symbol: String, kind: MetricKind },
}

/// Aggregate statistics a threshold expression may reference. Which of them
/// resolve depends on the sink kind the expression is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symbol {
    Min,
    Max,
    Avg,
    Med,
    Count,
    Rate,
    Value,
}

impl Symbol {
    fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            "min" => Some(Symbol::Min),
            "max" => Some(Symbol::Max),
            "avg" => Some(Symbol::Avg),
            "med" => Some(Symbol::Med),
            "count" => Some(Symbol::Count),
            "rate" => Some(Symbol::Rate),
            "value" => Some(Symbol::Value),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Symbol::Min => "min",
            Symbol::Max => "max",
            Symbol::Avg => "avg",
            Symbol::Med => "med",
            Symbol::Count => "count",
            Symbol::Rate => "rate",
            Symbol::Value => "value",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    Ident(Symbol),
    Percentile(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
}

#[derive(Debug, Clone)]
enum Expr {
    Num(f64),
    Sym(Symbol),
    Percentile(f64),
    Neg(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

fn lex(src: &str) -> std::result::Result<Vec<Token>, String> {
    let mut out = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                out.push(Token::Plus);
                i += 1;
            }
            '-' => {
                out.push(Token::Minus);
                i += 1;
            }
            '*' => {
                out.push(Token::Star);
                i += 1;
            }
            '/' => {
                out.push(Token::Slash);
                i += 1;
            }
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            '<' | '>' => {
                let eq = bytes.get(i + 1) == Some(&b'=');
                out.push(match (c, eq) {
                    ('<', false) => Token::Lt,
                    ('<', true) => Token::Le,
                    ('>', false) => Token::Gt,
                    (_, true) => Token::Ge,
                    _ => unreachable!(),
                });
                i += if eq { 2 } else { 1 };
            }
            '=' => {
                if bytes.get(i + 1) != Some(&b'=') {
                    return Err("expected `==`".to_string());
                }
                out.push(Token::EqEq);
                i += 2;
            }
            '!' => {
                if bytes.get(i + 1) != Some(&b'=') {
                    return Err("expected `!=`".to_string());
                }
                out.push(Token::Ne);
                i += 2;
            }
            '&' => {
                if bytes.get(i + 1) != Some(&b'&') {
                    return Err("expected `&&`".to_string());
                }
                out.push(Token::AndAnd);
                i += 2;
            }
            '|' => {
                if bytes.get(i + 1) != Some(&b'|') {
                    return Err("expected `||`".to_string());
                }
                out.push(Token::OrOr);
                i += 2;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < bytes.len() && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &src[start..i];
                let value: f64 = text.parse().map_err(|_| format!("invalid number `{text}`"))?;
                out.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let ident = &src[start..i];

                // `p(<num>)` is the percentile form, not a symbol reference.
                if ident == "p" && bytes.get(i) == Some(&b'(') {
                    i += 1;
                    let num_start = i;
                    while i < bytes.len()
                        && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                    {
                        i += 1;
                    }
                    let text = &src[num_start..i];
                    let pct: f64 = text
                        .parse()
                        .map_err(|_| format!("invalid percentile `p({text})`"))?;
                    if !(0.0..=100.0).contains(&pct) {
                        return Err(format!("percentile out of range `p({text})`"));
                    }
                    if bytes.get(i) != Some(&b')') {
                        return Err("unclosed percentile, expected `)`".to_string());
                    }
                    i += 1;
                    out.push(Token::Percentile(pct));
                    continue;
                }

                let symbol =
                    Symbol::from_ident(ident).ok_or_else(|| format!("unknown symbol `{ident}`"))?;
                out.push(Token::Ident(symbol));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }

    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.and()?;
        while self.eat(Token::OrOr) {
            let rhs = self.and()?;
            lhs = Expr::Bin(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.comparison()?;
        while self.eat(Token::AndAnd) {
            let rhs = self.comparison()?;
            lhs = Expr::Bin(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> std::result::Result<Expr, String> {
        let lhs = self.sum()?;
        let op = match self.peek() {
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.sum()?;
        Ok(Expr::Bin(op, Box::new(lhs), Box::new(rhs)))
    }

    fn sum(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn factor(&mut self) -> std::result::Result<Expr, String> {
        match self.bump() {
            Some(Token::Num(value)) => Ok(Expr::Num(value)),
            Some(Token::Ident(symbol)) => Ok(Expr::Sym(symbol)),
            Some(Token::Percentile(pct)) => Ok(Expr::Percentile(pct)),
            Some(Token::Minus) => Ok(Expr::Neg(Box::new(self.factor()?))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                if !self.eat(Token::RParen) {
                    return Err("expected `)`".to_string());
                }
                Ok(inner)
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

fn compile(source: &str) -> Result<Expr> {
    let parse_err = |detail: String| Error::Parse {
        expr_source: source.to_string(),
        detail,
    };

    let tokens = lex(source).map_err(parse_err)?;
    if tokens.is_empty() {
        return Err(parse_err("empty expression".to_string()));
    }

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr().map_err(parse_err)?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::Parse {
            expr_source: source.to_string(),
            detail: "trailing input after expression".to_string(),
        });
    }
    Ok(expr)
}

/// Per-evaluation symbol binding: one sink snapshot plus the run window used
/// to derive counter rates.
struct Binding<'a> {
    sink: &'a mut Sink,
    elapsed: Duration,
}

impl Binding<'_> {
    fn symbol(&mut self, symbol: Symbol) -> Result<f64> {
        let kind = self.sink.kind();
        let unavailable = move || Error::SymbolUnavailable {
            symbol: symbol.name().to_string(),
            kind,
        };

        match (&mut *self.sink, symbol) {
            (Sink::Trend(t), Symbol::Min) => Ok(t.min()),
            (Sink::Trend(t), Symbol::Max) => Ok(t.max()),
            (Sink::Trend(t), Symbol::Avg) => Ok(t.avg()),
            (Sink::Trend(t), Symbol::Med) => Ok(t.med()),
            (Sink::Counter(c), Symbol::Count) => Ok(c.sum),
            (Sink::Counter(c), Symbol::Rate) => Ok(c.rate(self.elapsed)),
            (Sink::Rate(r), Symbol::Rate) => Ok(r.rate()),
            (Sink::Gauge(g), Symbol::Value) => Ok(g.value),
            _ => Err(unavailable()),
        }
    }

    fn percentile(&mut self, pct: f64) -> Result<f64> {
        match &mut *self.sink {
            Sink::Trend(t) => Ok(t.percentile(pct)),
            other => Err(Error::SymbolUnavailable {
                symbol: format!("p({pct})"),
                kind: other.kind(),
            }),
        }
    }
}

/// Booleans are carried as 0.0 / 1.0; any nonzero result is truthy.
fn eval(expr: &Expr, binding: &mut Binding<'_>) -> Result<f64> {
    Ok(match expr {
        Expr::Num(value) => *value,
        Expr::Sym(symbol) => binding.symbol(*symbol)?,
        Expr::Percentile(pct) => binding.percentile(*pct)?,
        Expr::Neg(inner) => -eval(inner, binding)?,
        Expr::Bin(op, lhs, rhs) => {
            let l = eval(lhs, binding)?;
            let r = eval(rhs, binding)?;
            match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
                BinOp::Lt => bool_val(l < r),
                BinOp::Le => bool_val(l <= r),
                BinOp::Gt => bool_val(l > r),
                BinOp::Ge => bool_val(l >= r),
                BinOp::Eq => bool_val(l == r),
                BinOp::Ne => bool_val(l != r),
                BinOp::And => bool_val(l != 0.0 && r != 0.0),
                BinOp::Or => bool_val(l != 0.0 || r != 0.0),
            }
        }
    })
}

fn bool_val(v: bool) -> f64 {
    if v { 1.0 } else { 0.0 }
}

/// A single compiled threshold predicate.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub source: String,
    expr: Expr,
    pub abort_on_fail: bool,
    pub last_failed: bool,
}

impl Threshold {
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let expr = compile(&source)?;
        Ok(Self {
            source,
            expr,
            abort_on_fail: false,
            last_failed: false,
        })
    }

    /// Evaluate against a sink snapshot. An evaluation error counts as a
    /// failure before it is reported.
    pub fn run(&mut self, sink: &mut Sink, elapsed: Duration) -> Result<bool> {
        let mut binding = Binding { sink, elapsed };
        match eval(&self.expr, &mut binding) {
            Ok(value) => {
                let passed = value != 0.0;
                self.last_failed = !passed;
                Ok(passed)
            }
            Err(err) => {
                self.last_failed = true;
                Err(err)
            }
        }
    }
}

/// All thresholds configured under one metric key.
#[derive(Debug, Clone, Default)]
pub struct Thresholds {
    pub thresholds: Vec<Threshold>,
}

impl Thresholds {
    pub fn new<S: AsRef<str>>(sources: &[S]) -> Result<Self> {
        let thresholds = sources
            .iter()
            .map(|s| Threshold::new(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { thresholds })
    }

    /// Evaluate every expression; each records its own `last_failed`.
    pub fn run(&mut self, sink: &mut Sink, elapsed: Duration) -> Result<bool> {
        let mut passed = true;
        for threshold in &mut self.thresholds {
            passed &= threshold.run(sink, elapsed)?;
        }
        Ok(passed)
    }

    /// True when a threshold marked abort-on-fail has failed.
    pub fn abort_on_fail(&self) -> bool {
        self.thresholds
            .iter()
            .any(|t| t.abort_on_fail && t.last_failed)
    }
}

// Thresholds travel in option sets as their source strings; deserializing
// compiles them, so a malformed expression is rejected at configuration time.
impl serde::Serialize for Thresholds {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.thresholds.iter().map(|t| t.source.as_str()))
    }
}

impl<'de> serde::Deserialize<'de> for Thresholds {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let sources = Vec::<String>::deserialize(deserializer)?;
        Thresholds::new(&sources).map_err(serde::de::Error::custom)
    }
}
