// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Target expression evaluation for stores that cannot run SQL.
//!
//! Action targets are SQL boolean expressions over the `agents` table. The
//! PostgreSQL store pastes them into a read-only query. The in-memory store
//! compiles the common subset here and evaluates it against an agent's JSON
//! form:
//!
//! ```text
//! expr    := and ( OR and )*
//! and     := unary ( AND unary )*
//! unary   := NOT unary | '(' expr ')' | column cmp
//! cmp     := op value | [NOT] (LIKE | ILIKE) 'pattern' | [NOT] IN ( value, ... )
//! op      := = | != | <> | < | <= | > | >= | ~ | ~*
//! column  := name ( ->> 'key' | -> 'key' )*
//! ```

use regex::{Regex, RegexBuilder};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
#[error("invalid target expression: {0}")]
pub struct TargetError(String);

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, TargetError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(TargetError("unterminated string".to_string())),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Num(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' || c == '"' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.' || chars[i] == '"')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().filter(|c| **c != '"').collect();
                tokens.push(Token::Ident(ident));
            }
            _ => {
                let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
                let op = ["->>", "->", "<=", ">=", "!=", "<>", "~*", "=", "<", ">", "~"]
                    .into_iter()
                    .find(|op| rest.starts_with(op))
                    .ok_or_else(|| TargetError(format!("unexpected character '{}'", c)))?;
                tokens.push(Token::Op(op));
                i += op.len();
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp { path: Vec<String>, op: CmpOp, value: String },
    Match { path: Vec<String>, regex: Regex, negated: bool },
    In { path: Vec<String>, values: Vec<String>, negated: bool },
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

    fn keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn or(&mut self) -> Result<Expr, TargetError> {
        let mut left = self.and()?;
        while self.keyword("or") {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, TargetError> {
        let mut left = self.unary()?;
        while self.keyword("and") {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, TargetError> {
        if self.keyword("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or()?;
            if self.next() != Some(Token::RParen) {
                return Err(TargetError("missing closing parenthesis".to_string()));
            }
            return Ok(inner);
        }
        self.comparison()
    }

    fn column(&mut self) -> Result<Vec<String>, TargetError> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            other => return Err(TargetError(format!("expected column, found {:?}", other))),
        };
        let name = name.rsplit('.').next().unwrap_or(&name).to_lowercase();
        let mut path = vec![name];
        while matches!(self.peek(), Some(Token::Op("->>")) | Some(Token::Op("->"))) {
            self.pos += 1;
            match self.next() {
                Some(Token::Str(key)) => path.push(key),
                other => return Err(TargetError(format!("expected json key, found {:?}", other))),
            }
        }
        Ok(path)
    }

    fn value(&mut self) -> Result<String, TargetError> {
        match self.next() {
            Some(Token::Str(s)) | Some(Token::Num(s)) => Ok(s),
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false") => {
                Ok(s.to_lowercase())
            }
            other => Err(TargetError(format!("expected value, found {:?}", other))),
        }
    }

    fn comparison(&mut self) -> Result<Expr, TargetError> {
        let path = self.column()?;
        let negated = if self.keyword("not") {
            self.pos += 1;
            true
        } else {
            false
        };

        if self.keyword("like") || self.keyword("ilike") {
            let insensitive = self.keyword("ilike");
            self.pos += 1;
            let pattern = self.value()?;
            return Ok(Expr::Match { path, regex: like_regex(&pattern, insensitive)?, negated });
        }
        if self.keyword("in") {
            self.pos += 1;
            if self.next() != Some(Token::LParen) {
                return Err(TargetError("expected '(' after IN".to_string()));
            }
            let mut values = vec![self.value()?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                values.push(self.value()?);
            }
            if self.next() != Some(Token::RParen) {
                return Err(TargetError("missing closing parenthesis".to_string()));
            }
            return Ok(Expr::In { path, values, negated });
        }
        if negated {
            return Err(TargetError("NOT must precede LIKE, ILIKE or IN".to_string()));
        }

        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => return Err(TargetError(format!("expected operator, found {:?}", other))),
        };
        let value = self.value()?;
        let cmp = match op {
            "=" => CmpOp::Eq,
            "!=" | "<>" => CmpOp::Ne,
            "<" => CmpOp::Lt,
            "<=" => CmpOp::Le,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::Ge,
            "~" | "~*" => {
                let regex = RegexBuilder::new(&value)
                    .case_insensitive(op == "~*")
                    .build()
                    .map_err(|e| TargetError(e.to_string()))?;
                return Ok(Expr::Match { path, regex, negated: false });
            }
            other => return Err(TargetError(format!("unsupported operator '{}'", other))),
        };
        Ok(Expr::Cmp { path, op: cmp, value })
    }
}

fn like_regex(pattern: &str, insensitive: bool) -> Result<Regex, TargetError> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    RegexBuilder::new(&re)
        .case_insensitive(insensitive)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| TargetError(e.to_string()))
}

fn lookup<'a>(doc: &'a Value, path: &[String]) -> Option<String> {
    let mut cur: &'a Value = doc.get(&path[0])?;
    for key in &path[1..] {
        cur = match cur {
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            other => other.get(key)?,
        };
    }
    match cur {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn compare(left: &str, op: CmpOp, right: &str) -> bool {
    let ordering = match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r),
        _ => Some(left.cmp(right)),
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        CmpOp::Eq => ordering.is_eq(),
        CmpOp::Ne => ordering.is_ne(),
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
    }
}

/// A compiled target expression.
#[derive(Debug)]
pub struct TargetFilter {
    expr: Expr,
}

impl TargetFilter {
    pub fn parse(target: &str) -> Result<Self, TargetError> {
        let tokens = tokenize(target)?;
        if tokens.is_empty() {
            return Err(TargetError("empty target".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if parser.pos != parser.tokens.len() {
            return Err(TargetError(format!("unexpected trailing input at token {}", parser.pos)));
        }
        Ok(Self { expr })
    }

    /// Evaluates against a JSON document. NULL comparisons are false, as in SQL.
    pub fn matches(&self, doc: &Value) -> bool {
        eval(&self.expr, doc)
    }
}

fn eval(expr: &Expr, doc: &Value) -> bool {
    match expr {
        Expr::And(l, r) => eval(l, doc) && eval(r, doc),
        Expr::Or(l, r) => eval(l, doc) || eval(r, doc),
        Expr::Not(inner) => !eval(inner, doc),
        Expr::Cmp { path, op, value } => lookup(doc, path).is_some_and(|v| compare(&v, *op, value)),
        Expr::Match { path, regex, negated } => {
            lookup(doc, path).is_some_and(|v| regex.is_match(&v) != *negated)
        }
        Expr::In { path, values, negated } => {
            lookup(doc, path).is_some_and(|v| values.iter().any(|x| compare(&v, CmpOp::Eq, x)) != *negated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent() -> Value {
        json!({
            "id": 42,
            "name": "db1.example.net",
            "queueloc": "linux.db1.abc",
            "mode": "daemon",
            "version": "20260101-0.abc",
            "status": "online",
            "environment": {"os": "linux", "arch": "amd64", "isproxied": false},
            "tags": {"operator": "IT"}
        })
    }

    #[test]
    fn test_simple_predicates() {
        let a = agent();
        assert!(TargetFilter::parse("name='db1.example.net'").unwrap().matches(&a));
        assert!(TargetFilter::parse("agents.name like 'db%'").unwrap().matches(&a));
        assert!(!TargetFilter::parse("name NOT LIKE 'db%'").unwrap().matches(&a));
        assert!(TargetFilter::parse("environment->>'os'='linux' AND mode='daemon'").unwrap().matches(&a));
        assert!(TargetFilter::parse("id > 10 and id <= 42").unwrap().matches(&a));
        assert!(TargetFilter::parse("tags->>'operator' IN ('IT', 'ops')").unwrap().matches(&a));
        assert!(TargetFilter::parse("name ~* '^DB[0-9]'").unwrap().matches(&a));
    }

    #[test]
    fn test_boolean_structure() {
        let a = agent();
        let f = TargetFilter::parse("(environment->>'os'='darwin' OR environment->>'os'='linux') AND NOT status='offline'")
            .unwrap();
        assert!(f.matches(&a));
        assert!(!TargetFilter::parse("environment->>'os'='darwin' or queueloc='x'").unwrap().matches(&a));
    }

    #[test]
    fn test_missing_keys_never_match() {
        let a = agent();
        assert!(!TargetFilter::parse("tags->>'missing'='x'").unwrap().matches(&a));
        assert!(!TargetFilter::parse("tags->>'missing'!='x'").unwrap().matches(&a));
    }

    #[test]
    fn test_quoted_strings() {
        let a = json!({"name": "o'brien"});
        assert!(TargetFilter::parse("name='o''brien'").unwrap().matches(&a));
    }

    #[test]
    fn test_malformed_targets() {
        assert!(TargetFilter::parse("").is_err());
        assert!(TargetFilter::parse("name=").is_err());
        assert!(TargetFilter::parse("name='x' and").is_err());
        assert!(TargetFilter::parse("(name='x'").is_err());
        assert!(TargetFilter::parse("name='x'; drop table agents").is_err());
    }
}
