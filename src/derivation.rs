//! Restricted derivation-expression grammar (spec §4.7, §9).
//!
//! Parsed once per mapping into a small AST and evaluated by a
//! tree-walking evaluator. No filesystem, network, or reflection access —
//! the evaluator only ever reads from the row of already-fetched source
//! values handed to it.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Decimal(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Value),
    BinaryOp(Box<Expr>, BinOp, Box<Expr>),
    Call(String, Vec<Expr>),
    IfThenElse(Box<Expr>, Box<Expr>, Box<Expr>),
}

const ALLOWED_FUNCTIONS: &[&str] = &[
    "coalesce", "concat", "substring", "trim", "upper", "lower", "cast", "date_diff",
];

/// Tokens the lexer recognizes. Deliberately tiny: identifiers, numbers,
/// single-quoted strings, operators, parens, and comma.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Comma,
    LParen,
    RParen,
    Op(String),
}

fn lex(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c == ',' {
            tokens.push(Token::Comma);
            i += 1;
        } else if c == '\'' {
            let mut s = String::new();
            i += 1;
            loop {
                if i >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                if chars[i] == '\'' {
                    if i + 1 < chars.len() && chars[i + 1] == '\'' {
                        s.push('\'');
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                s.push(chars[i]);
                i += 1;
            }
            tokens.push(Token::Str(s));
        } else if c.is_ascii_digit() || (c == '-' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit() && starts_number_context(&tokens))
        {
            let start = i;
            if c == '-' {
                i += 1;
            }
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n: f64 = text
                .parse()
                .map_err(|_| format!("invalid numeric literal '{text}'"))?;
            tokens.push(Token::Number(n));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Ident(text));
        } else if "+-*/=<>!".contains(c) {
            let start = i;
            i += 1;
            if i < chars.len() && chars[i] == '=' && (c == '<' || c == '>' || c == '!' || c == '=') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Op(text));
        } else {
            return Err(format!("unexpected character '{c}'"));
        }
    }

    Ok(tokens)
}

fn starts_number_context(tokens: &[Token]) -> bool {
    !matches!(tokens.last(), Some(Token::Ident(_)) | Some(Token::Number(_)) | Some(Token::RParen))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect_op(&mut self, op: &str) -> Result<(), String> {
        match self.next() {
            Some(Token::Op(o)) if o == op => Ok(()),
            other => Err(format!("expected operator '{op}', found {other:?}")),
        }
    }

    fn expect_lparen(&mut self) -> Result<(), String> {
        match self.next() {
            Some(Token::LParen) => Ok(()),
            other => Err(format!("expected '(', found {other:?}")),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), String> {
        match self.next() {
            Some(Token::RParen) => Ok(()),
            other => Err(format!("expected ')', found {other:?}")),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_additive()?;
        while let Some(Token::Op(op)) = self.peek().cloned() {
            let binop = match op.as_str() {
                "=" => Some(BinOp::Eq),
                "!=" | "<>" => Some(BinOp::Ne),
                "<" => Some(BinOp::Lt),
                "<=" => Some(BinOp::Le),
                ">" => Some(BinOp::Gt),
                ">=" => Some(BinOp::Ge),
                _ => None,
            };
            let Some(binop) = binop else { break };
            self.next();
            let rhs = self.parse_additive()?;
            lhs = Expr::BinaryOp(Box::new(lhs), binop, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            match self.peek() {
                Some(Token::Op(op)) if op == "+" => {
                    self.next();
                    let rhs = self.parse_multiplicative()?;
                    lhs = Expr::BinaryOp(Box::new(lhs), BinOp::Add, Box::new(rhs));
                }
                Some(Token::Op(op)) if op == "-" => {
                    self.next();
                    let rhs = self.parse_multiplicative()?;
                    lhs = Expr::BinaryOp(Box::new(lhs), BinOp::Sub, Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Op(op)) if op == "*" => {
                    self.next();
                    let rhs = self.parse_primary()?;
                    lhs = Expr::BinaryOp(Box::new(lhs), BinOp::Mul, Box::new(rhs));
                }
                Some(Token::Op(op)) if op == "/" => {
                    self.next();
                    let rhs = self.parse_primary()?;
                    lhs = Expr::BinaryOp(Box::new(lhs), BinOp::Div, Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Number(n)) => {
                if n.fract() == 0.0 {
                    Ok(Expr::Literal(Value::Integer(n as i64)))
                } else {
                    Ok(Expr::Literal(Value::Decimal(n)))
                }
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Text(s))),
            Some(Token::LParen) => {
                let e = self.parse_expr()?;
                self.expect_rparen()?;
                Ok(e)
            }
            Some(Token::Ident(name)) => {
                if name.eq_ignore_ascii_case("if") {
                    self.expect_lparen()?;
                    let cond = self.parse_expr()?;
                    self.expect_comma()?;
                    let then_ = self.parse_expr()?;
                    self.expect_comma()?;
                    let else_ = self.parse_expr()?;
                    self.expect_rparen()?;
                    return Ok(Expr::IfThenElse(Box::new(cond), Box::new(then_), Box::new(else_)));
                }
                if name.eq_ignore_ascii_case("true") {
                    return Ok(Expr::Literal(Value::Boolean(true)));
                }
                if name.eq_ignore_ascii_case("false") {
                    return Ok(Expr::Literal(Value::Boolean(false)));
                }
                if name.eq_ignore_ascii_case("null") {
                    return Ok(Expr::Literal(Value::Null));
                }
                if matches!(self.peek(), Some(Token::LParen)) {
                    let lowered = name.to_ascii_lowercase();
                    if !ALLOWED_FUNCTIONS.contains(&lowered.as_str()) {
                        return Err(format!("function '{name}' is not in the allowed function set"));
                    }
                    self.next();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        args.push(self.parse_expr()?);
                        while matches!(self.peek(), Some(Token::Comma)) {
                            self.next();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect_rparen()?;
                    Ok(Expr::Call(lowered, args))
                } else {
                    Ok(Expr::Column(name))
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn expect_comma(&mut self) -> Result<(), String> {
        match self.next() {
            Some(Token::Comma) => Ok(()),
            other => Err(format!("expected ',', found {other:?}")),
        }
    }
}

/// Parse a derivation expression once. Called at mapping-validation time
/// and cached on the immutable mapping snapshot for the duration of a run
/// (spec §3, §9).
pub fn parse(src: &str) -> Result<Expr, String> {
    let tokens = lex(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("trailing tokens after expression".to_string());
    }
    Ok(expr)
}

/// Evaluate a parsed expression over a row of already-fetched source
/// values. Total and side-effect-free: no I/O, no reflection, bounded
/// recursion depth equal to the expression's own nesting.
pub fn eval(expr: &Expr, row: &HashMap<String, Value>) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column(name) => Ok(row.get(name).cloned().unwrap_or(Value::Null)),
        Expr::BinaryOp(lhs, op, rhs) => eval_binop(eval(lhs, row)?, op, eval(rhs, row)?),
        Expr::IfThenElse(cond, then_, else_) => {
            if is_truthy(&eval(cond, row)?) {
                eval(then_, row)
            } else {
                eval(else_, row)
            }
        }
        Expr::Call(name, args) => {
            let values: Result<Vec<Value>, String> = args.iter().map(|a| eval(a, row)).collect();
            eval_call(name, values?)
        }
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Boolean(b) => *b,
        Value::Null => false,
        Value::Integer(i) => *i != 0,
        _ => true,
    }
}

fn as_f64(v: &Value) -> Result<f64, String> {
    match v {
        Value::Integer(i) => Ok(*i as f64),
        Value::Decimal(d) => Ok(*d),
        _ => Err(format!("expected a numeric value, found {v}")),
    }
}

fn eval_binop(lhs: Value, op: &BinOp, rhs: Value) -> Result<Value, String> {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
            let (a, b) = (as_f64(&lhs)?, as_f64(&rhs)?);
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => {
                    if b == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    a / b
                }
                _ => unreachable!(),
            };
            if matches!(lhs, Value::Integer(_)) && matches!(rhs, Value::Integer(_)) && result.fract() == 0.0 {
                Ok(Value::Integer(result as i64))
            } else {
                Ok(Value::Decimal(result))
            }
        }
        BinOp::Eq => Ok(Value::Boolean(values_equal(&lhs, &rhs))),
        BinOp::Ne => Ok(Value::Boolean(!values_equal(&lhs, &rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let (a, b) = (as_f64(&lhs)?, as_f64(&rhs)?);
            let result = match op {
                BinOp::Lt => a < b,
                BinOp::Le => a <= b,
                BinOp::Gt => a > b,
                BinOp::Ge => a >= b,
                _ => unreachable!(),
            };
            Ok(Value::Boolean(result))
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Integer(x), Value::Integer(y)) => x == y,
        (Value::Decimal(x), Value::Decimal(y)) => x == y,
        (Value::Integer(x), Value::Decimal(y)) | (Value::Decimal(y), Value::Integer(x)) => *x as f64 == *y,
        (Value::Text(x), Value::Text(y)) => x == y,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::Timestamp(x), Value::Timestamp(y)) => x == y,
        _ => false,
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn eval_call(name: &str, args: Vec<Value>) -> Result<Value, String> {
    match name {
        "coalesce" => Ok(args
            .into_iter()
            .find(|v| !matches!(v, Value::Null))
            .unwrap_or(Value::Null)),
        "concat" => Ok(Value::Text(args.iter().map(as_text).collect::<String>())),
        "substring" => {
            if args.len() != 3 {
                return Err("substring expects 3 arguments: (value, start, length)".to_string());
            }
            let s = as_text(&args[0]);
            let start = as_f64(&args[1])? as usize;
            let len = as_f64(&args[2])? as usize;
            let chars: Vec<char> = s.chars().collect();
            let begin = start.saturating_sub(1).min(chars.len());
            let end = (begin + len).min(chars.len());
            Ok(Value::Text(chars[begin..end].iter().collect()))
        }
        "trim" => {
            if args.len() != 1 {
                return Err("trim expects 1 argument".to_string());
            }
            Ok(Value::Text(as_text(&args[0]).trim().to_string()))
        }
        "upper" => {
            if args.len() != 1 {
                return Err("upper expects 1 argument".to_string());
            }
            Ok(Value::Text(as_text(&args[0]).to_uppercase()))
        }
        "lower" => {
            if args.len() != 1 {
                return Err("lower expects 1 argument".to_string());
            }
            Ok(Value::Text(as_text(&args[0]).to_lowercase()))
        }
        "cast" => {
            if args.len() != 2 {
                return Err("cast expects (value, 'target_type')".to_string());
            }
            cast_value(&args[0], &as_text(&args[1]))
        }
        "date_diff" => {
            if args.len() != 2 {
                return Err("date_diff expects (end_timestamp, start_timestamp)".to_string());
            }
            let (Value::Timestamp(end), Value::Timestamp(start)) = (&args[0], &args[1]) else {
                return Err("date_diff requires two timestamp arguments".to_string());
            };
            Ok(Value::Integer((*end - *start).num_seconds()))
        }
        other => Err(format!("function '{other}' is not in the allowed function set")),
    }
}

fn cast_value(value: &Value, target: &str) -> Result<Value, String> {
    match target.to_ascii_lowercase().as_str() {
        "integer" => match value {
            Value::Integer(i) => Ok(Value::Integer(*i)),
            Value::Decimal(d) => Ok(Value::Integer(*d as i64)),
            Value::Text(s) => s
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| format!("cannot cast '{s}' to integer")),
            _ => Err(format!("cannot cast {value} to integer")),
        },
        "decimal" => match value {
            Value::Integer(i) => Ok(Value::Decimal(*i as f64)),
            Value::Decimal(d) => Ok(Value::Decimal(*d)),
            Value::Text(s) => s
                .parse::<f64>()
                .map(Value::Decimal)
                .map_err(|_| format!("cannot cast '{s}' to decimal")),
            _ => Err(format!("cannot cast {value} to decimal")),
        },
        "text" => Ok(Value::Text(as_text(value))),
        other => Err(format!("unsupported cast target '{other}'")),
    }
}
