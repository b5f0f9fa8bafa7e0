//! Sandboxed arithmetic formulas.
//!
//! Source form: `bid = <expr>; ask = <expr>`
//!
//! Expressions support:
//! - numeric literals
//! - `+ - * /`, unary minus, parentheses
//! - field references `NAME.bid`, `NAME.ask`, `NAME.mid`
//! - `avg(..)`, `min(..)`, `max(..)` (one or more arguments) and `abs(x)`
//!
//! Nothing else resolves: there are no variables, loops, or host calls.

use std::collections::HashMap;

use crate::errors::FormulaError;
use crate::schema::Quote;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Bid,
    Ask,
    Mid,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Avg,
    Min,
    Max,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Ref(String, Field),
    Neg(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

impl Expr {
    /// `None` when a referenced instrument is absent.
    fn eval(&self, deps: &HashMap<String, Quote>) -> Option<f64> {
        match self {
            Expr::Num(n) => Some(*n),
            Expr::Ref(name, field) => {
                let quote = deps.get(name)?;
                Some(match field {
                    Field::Bid => quote.bid,
                    Field::Ask => quote.ask,
                    Field::Mid => quote.mid(),
                })
            }
            Expr::Neg(inner) => Some(-inner.eval(deps)?),
            Expr::Bin(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(deps)?, rhs.eval(deps)?);
                Some(match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                })
            }
            Expr::Call(func, args) => {
                let values = args
                    .iter()
                    .map(|arg| arg.eval(deps))
                    .collect::<Option<Vec<f64>>>()?;

                match func {
                    Func::Avg => Some(values.iter().sum::<f64>() / values.len() as f64),
                    Func::Min => values.into_iter().reduce(f64::min),
                    Func::Max => values.into_iter().reduce(f64::max),
                    Func::Abs => values.first().map(|v| v.abs()),
                }
            }
        }
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Num(_) => {}
            Expr::Ref(name, _) => out.push(name),
            Expr::Neg(inner) => inner.collect_refs(out),
            Expr::Bin(_, lhs, rhs) => {
                lhs.collect_refs(out);
                rhs.collect_refs(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_refs(out)),
        }
    }
}

/// A compiled `bid`/`ask` expression pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprFormula {
    bid: Expr,
    ask: Expr,
}

impl ExprFormula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let tokens = tokenize(source)?;
        Parser { tokens, pos: 0, end: source.len() }.program()
    }

    /// Evaluates both sides; `None` when an input is missing.
    pub fn evaluate(&self, deps: &HashMap<String, Quote>) -> Option<(f64, f64)> {
        Some((self.bid.eval(deps)?, self.ask.eval(deps)?))
    }

    /// Instrument names referenced by either side.
    pub fn references(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        self.bid.collect_refs(&mut refs);
        self.ask.collect_refs(&mut refs);
        refs.sort_unstable();
        refs.dedup();
        refs
    }
}

// ------------------------------------------------------------
// Lexer
// ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Assign,
    Semi,
}

fn parse_error(position: usize, message: impl Into<String>) -> FormulaError {
    FormulaError::Parse {
        position,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Tok)>, FormulaError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        let tok = match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'0'..=b'9' => {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let text = &source[start..i];
                let value = text
                    .parse::<f64>()
                    .map_err(|_| parse_error(start, format!("invalid number '{}'", text)))?;
                tokens.push((start, Tok::Num(value)));
                continue;
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push((start, Tok::Ident(source[start..i].to_string())));
                continue;
            }
            b'.' => Tok::Dot,
            b'+' => Tok::Plus,
            b'-' => Tok::Minus,
            b'*' => Tok::Star,
            b'/' => Tok::Slash,
            b'(' => Tok::LParen,
            b')' => Tok::RParen,
            b',' => Tok::Comma,
            b'=' => Tok::Assign,
            b';' => Tok::Semi,
            _ => {
                let ch = source[start..].chars().next().unwrap_or('?');
                return Err(parse_error(start, format!("unexpected character '{}'", ch)));
            }
        };

        tokens.push((start, tok));
        i += 1;
    }

    Ok(tokens)
}

// ------------------------------------------------------------
// Recursive-descent parser
// ------------------------------------------------------------
//
// program    := assignment (';' assignment)* ';'?
// assignment := ("bid" | "ask") '=' expr
// expr       := term (('+' | '-') term)*
// term       := unary (('*' | '/') unary)*
// unary      := '-' unary | primary
// primary    := NUM | '(' expr ')' | FUNC '(' expr (',' expr)* ')' | NAME '.' FIELD
//
struct Parser {
    tokens: Vec<(usize, Tok)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(p, _)| *p)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Tok, what: &str) -> Result<(), FormulaError> {
        let at = self.position();
        match self.next() {
            Some(tok) if tok == want => Ok(()),
            _ => Err(parse_error(at, format!("expected {}", what))),
        }
    }

    fn program(mut self) -> Result<ExprFormula, FormulaError> {
        let mut bid = None;
        let mut ask = None;

        while self.peek().is_some() {
            let at = self.position();
            let side = match self.next() {
                Some(Tok::Ident(name)) => name,
                _ => return Err(parse_error(at, "expected 'bid' or 'ask'")),
            };

            self.expect(Tok::Assign, "'='")?;
            let expr = self.expr()?;

            let slot = match side.as_str() {
                "bid" => &mut bid,
                "ask" => &mut ask,
                other => return Err(parse_error(at, format!("unknown output '{}'", other))),
            };
            if slot.replace(expr).is_some() {
                return Err(parse_error(at, format!("'{}' defined twice", side)));
            }

            match self.peek() {
                Some(Tok::Semi) => {
                    self.pos += 1;
                }
                None => {}
                Some(_) => return Err(parse_error(self.position(), "expected ';'")),
            }
        }

        match (bid, ask) {
            (Some(bid), Some(ask)) => Ok(ExprFormula { bid, ask }),
            _ => Err(FormulaError::MissingSide),
        }
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;

        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;

        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if self.peek() == Some(&Tok::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        let at = self.position();

        match self.next() {
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::LParen) => {
                let inner = self.expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Some(Tok::Ident(name)) => match self.peek() {
                Some(Tok::LParen) => self.call(at, &name),
                Some(Tok::Dot) => {
                    self.pos += 1;
                    let field_at = self.position();
                    let field = match self.next() {
                        Some(Tok::Ident(f)) if f == "bid" => Field::Bid,
                        Some(Tok::Ident(f)) if f == "ask" => Field::Ask,
                        Some(Tok::Ident(f)) if f == "mid" => Field::Mid,
                        _ => return Err(parse_error(field_at, "expected bid, ask or mid")),
                    };
                    Ok(Expr::Ref(name, field))
                }
                _ => Err(parse_error(at, format!("unresolved name '{}'", name))),
            },
            _ => Err(parse_error(at, "expected expression")),
        }
    }

    fn call(&mut self, at: usize, name: &str) -> Result<Expr, FormulaError> {
        let func = match name {
            "avg" => Func::Avg,
            "min" => Func::Min,
            "max" => Func::Max,
            "abs" => Func::Abs,
            other => return Err(parse_error(at, format!("unknown function '{}'", other))),
        };

        self.expect(Tok::LParen, "'('")?;
        let mut args = vec![self.expr()?];
        while self.peek() == Some(&Tok::Comma) {
            self.pos += 1;
            args.push(self.expr()?);
        }
        self.expect(Tok::RParen, "')'")?;

        if func == Func::Abs && args.len() != 1 {
            return Err(parse_error(at, "abs takes exactly one argument"));
        }

        Ok(Expr::Call(func, args))
    }
}
