//! Boolean filter expressions for the storage query APIs.
//!
//! ```text
//! Host.address >= "10.2.1.0" AND Host.tags not_any "reviewed"
//! (Host.address <= "10.2.1.0" OR Host.address >= "10.2.1.255")
//! Service.state ilike "open:%"
//! ```
//!
//! `OR` binds weaker than `AND`; parenthesised subexpressions are allowed.
//! Criteria are `Model.field OP value` with double-quoted string values,
//! numbers, or arrays thereof.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::errors::{SnerError, SnerResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Or(Vec<Filter>),
    And(Vec<Filter>),
    Criterion(Criterion),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub model: String,
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
    Array(Vec<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Ilike,
    NotIlike,
    AstextIlike,
    AstextNotIlike,
    IsNull,
    IsNotNull,
    In,
    NotIn,
    Any,
    NotAny,
    InetIn,
    InetNotIn,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "==",
            FilterOp::Ne => "!=",
            FilterOp::Ge => ">=",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Ilike => "ilike",
            FilterOp::NotIlike => "not_ilike",
            FilterOp::AstextIlike => "astext_ilike",
            FilterOp::AstextNotIlike => "astext_not_ilike",
            FilterOp::IsNull => "is_null",
            FilterOp::IsNotNull => "is_not_null",
            FilterOp::In => "in",
            FilterOp::NotIn => "not_in",
            FilterOp::Any => "any",
            FilterOp::NotAny => "not_any",
            FilterOp::InetIn => "inet_in",
            FilterOp::InetNotIn => "inet_not_in",
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        match word {
            "ilike" => Some(FilterOp::Ilike),
            "not_ilike" => Some(FilterOp::NotIlike),
            "astext_ilike" => Some(FilterOp::AstextIlike),
            "astext_not_ilike" => Some(FilterOp::AstextNotIlike),
            "is_null" => Some(FilterOp::IsNull),
            "is_not_null" => Some(FilterOp::IsNotNull),
            "in" => Some(FilterOp::In),
            "not_in" => Some(FilterOp::NotIn),
            "any" => Some(FilterOp::Any),
            "not_any" => Some(FilterOp::NotAny),
            "inet_in" => Some(FilterOp::InetIn),
            "inet_not_in" => Some(FilterOp::InetNotIn),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::String(s) => serializer.serialize_str(s),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Filter::Or(items) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("or", items)?;
                map.end()
            }
            Filter::And(items) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("and", items)?;
                map.end()
            }
            Filter::Criterion(criterion) => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("model", &criterion.model)?;
                map.serialize_entry("field", &criterion.field)?;
                map.serialize_entry("op", criterion.op.as_str())?;
                map.serialize_entry("value", &criterion.value)?;
                map.end()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Word(String),
    SymbolOp(FilterOp),
    Str(String),
    Num(f64),
}

fn tokenize(input: &str) -> SnerResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => pos += 1,
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                pos += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '=' | '!' | '>' | '<' => {
                let two = input.get(pos..pos + 2).unwrap_or("");
                let (op, len) = match two {
                    "==" => (FilterOp::Eq, 2),
                    "!=" => (FilterOp::Ne, 2),
                    ">=" => (FilterOp::Ge, 2),
                    "<=" => (FilterOp::Le, 2),
                    _ => match c {
                        '>' => (FilterOp::Gt, 1),
                        '<' => (FilterOp::Lt, 1),
                        _ => return Err(SnerError::Parse(format!("invalid operator at {pos}"))),
                    },
                };
                tokens.push(Token::SymbolOp(op));
                pos += len;
            }
            '"' => {
                // find the closing quote, honoring backslash escapes
                let mut end = pos + 1;
                while end < bytes.len() {
                    match bytes[end] as char {
                        '\\' => end += 2,
                        '"' => break,
                        _ => end += 1,
                    }
                }
                if end >= bytes.len() {
                    return Err(SnerError::Parse("unterminated string".to_string()));
                }
                let literal = &input[pos..=end];
                let value: String = serde_json::from_str(literal)
                    .map_err(|_| SnerError::Parse(format!("invalid string literal {literal}")))?;
                tokens.push(Token::Str(value));
                pos = end + 1;
            }
            _ if c.is_ascii_digit() || c == '-' || c == '+' => {
                let start = pos;
                pos += 1;
                while pos < bytes.len()
                    && ((bytes[pos] as char).is_ascii_digit()
                        || bytes[pos] == b'.'
                        || bytes[pos] == b'e'
                        || bytes[pos] == b'E')
                {
                    pos += 1;
                }
                let literal = &input[start..pos];
                let value: f64 = literal
                    .parse()
                    .map_err(|_| SnerError::Parse(format!("invalid number {literal}")))?;
                tokens.push(Token::Num(value));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                while pos < bytes.len()
                    && ((bytes[pos] as char).is_ascii_alphanumeric()
                        || bytes[pos] == b'_'
                        || bytes[pos] == b'.')
                {
                    pos += 1;
                }
                tokens.push(Token::Word(input[start..pos].to_string()));
            }
            _ => return Err(SnerError::Parse(format!("unexpected character {c:?}"))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> SnerResult<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| SnerError::Parse("unexpected end of filter".to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn expression(&mut self) -> SnerResult<Filter> {
        let mut terms = vec![self.term()?];
        while matches!(self.peek(), Some(Token::Word(w)) if w == "OR") {
            self.pos += 1;
            terms.push(self.term()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Filter::Or(terms)
        })
    }

    fn term(&mut self) -> SnerResult<Filter> {
        let mut factors = vec![self.factor()?];
        while matches!(self.peek(), Some(Token::Word(w)) if w == "AND") {
            self.pos += 1;
            factors.push(self.factor()?);
        }
        Ok(if factors.len() == 1 {
            factors.pop().unwrap()
        } else {
            Filter::And(factors)
        })
    }

    fn factor(&mut self) -> SnerResult<Filter> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.pos += 1;
            let inner = self.expression()?;
            match self.next()? {
                Token::RParen => Ok(inner),
                other => Err(SnerError::Parse(format!("expected ), got {other:?}"))),
            }
        } else {
            self.criterion()
        }
    }

    fn criterion(&mut self) -> SnerResult<Filter> {
        let colspec = match self.next()? {
            Token::Word(word) => word,
            other => return Err(SnerError::Parse(format!("expected colspec, got {other:?}"))),
        };
        let (model, field) = colspec
            .split_once('.')
            .ok_or_else(|| SnerError::Parse(format!("invalid colspec {colspec}")))?;
        if model.is_empty() || field.is_empty() || field.contains('.') {
            return Err(SnerError::Parse(format!("invalid colspec {colspec}")));
        }

        let op = match self.next()? {
            Token::SymbolOp(op) => op,
            Token::Word(word) => FilterOp::from_word(&word)
                .ok_or_else(|| SnerError::Parse(format!("invalid operator {word}")))?,
            other => return Err(SnerError::Parse(format!("expected operator, got {other:?}"))),
        };

        let value = self.value()?;

        Ok(Filter::Criterion(Criterion {
            model: model.to_string(),
            field: field.to_string(),
            op,
            value,
        }))
    }

    fn value(&mut self) -> SnerResult<Value> {
        match self.next()? {
            Token::Str(s) => Ok(Value::String(s)),
            Token::Num(n) => Ok(Value::Number(n)),
            Token::LBracket => {
                let mut items = Vec::new();
                if matches!(self.peek(), Some(Token::RBracket)) {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                loop {
                    items.push(self.value()?);
                    match self.next()? {
                        Token::Comma => continue,
                        Token::RBracket => break,
                        other => {
                            return Err(SnerError::Parse(format!("expected , or ], got {other:?}")))
                        }
                    }
                }
                Ok(Value::Array(items))
            }
            other => Err(SnerError::Parse(format!("expected value, got {other:?}"))),
        }
    }
}

/// Parse a filter expression into its AST.
pub fn parse(input: &str) -> SnerResult<Filter> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
    };
    let filter = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(SnerError::Parse("trailing tokens in filter".to_string()));
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criterion(model: &str, field: &str, op: FilterOp, value: &str) -> Filter {
        Filter::Criterion(Criterion {
            model: model.to_string(),
            field: field.to_string(),
            op,
            value: Value::String(value.to_string()),
        })
    }

    #[test]
    fn single_criterion() {
        assert_eq!(
            parse(r#"Vuln.name=="x""#).unwrap(),
            criterion("Vuln", "name", FilterOp::Eq, "x")
        );
    }

    #[test]
    fn and_binds_stronger_than_or() {
        assert_eq!(
            parse(r#"A.a=="a" OR B.b=="b" AND C.c=="c""#).unwrap(),
            Filter::Or(vec![
                criterion("A", "a", FilterOp::Eq, "a"),
                Filter::And(vec![
                    criterion("B", "b", FilterOp::Eq, "b"),
                    criterion("C", "c", FilterOp::Eq, "c"),
                ]),
            ])
        );
    }

    #[test]
    fn conjunction_shape() {
        let parsed = parse(r#"A.a=="x" AND B.b=="y""#).unwrap();
        assert_eq!(
            serde_json::to_value(&parsed).unwrap(),
            serde_json::json!({"and": [
                {"model": "A", "field": "a", "op": "==", "value": "x"},
                {"model": "B", "field": "b", "op": "==", "value": "y"},
            ]})
        );
    }

    #[test]
    fn parenthesised_expression() {
        assert_eq!(
            parse(r#"(A.a=="a" OR B.b=="b") AND C.c=="c""#).unwrap(),
            Filter::And(vec![
                Filter::Or(vec![
                    criterion("A", "a", FilterOp::Eq, "a"),
                    criterion("B", "b", FilterOp::Eq, "b"),
                ]),
                criterion("C", "c", FilterOp::Eq, "c"),
            ])
        );
    }

    #[test]
    fn word_operators_and_arrays() {
        let parsed = parse(r#"Host.tags not_any "reviewed""#).unwrap();
        assert_eq!(
            parsed,
            criterion("Host", "tags", FilterOp::NotAny, "reviewed")
        );

        let parsed = parse(r#"Service.port in [80, 443]"#).unwrap();
        match parsed {
            Filter::Criterion(c) => {
                assert_eq!(c.op, FilterOp::In);
                assert_eq!(
                    c.value,
                    Value::Array(vec![Value::Number(80.0), Value::Number(443.0)])
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn comparison_operators() {
        let parsed =
            parse(r#"Host.address >= "10.2.1.0" AND Host.address <= "10.2.1.255""#).unwrap();
        match parsed {
            Filter::And(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("Vuln.name").is_err());
        assert!(parse(r#"name == "x""#).is_err());
        assert!(parse(r#"Vuln.name bogus_op "x""#).is_err());
        assert!(parse(r#"Vuln.name == "x" trailing"#).is_err());
        assert!(parse(r#"Vuln.name == "unterminated"#).is_err());
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            parse(r#"Vuln.name=="quo\"ted""#).unwrap(),
            criterion("Vuln", "name", FilterOp::Eq, "quo\"ted")
        );
    }
}
