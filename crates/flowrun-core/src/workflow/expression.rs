//! Condition evaluator: a small tokenizer plus recursive-descent parser.
//!
//! Grammar:
//! ```text
//! expr     := and ( "||" and )*
//! and      := unary ( "&&" unary )*
//! unary    := "!" unary | compare
//! compare  := operand ( ("==" | "!=" | ">=" | "<=" | ">" | "<") operand )?
//! operand  := "(" expr ")" | literal
//! literal  := number | 'string' | "string" | true | false | null | ${var} | word
//! ```
//!
//! `${var}` tokens are resolved straight to typed values, so an operator
//! character inside a variable value never changes how the expression
//! parses. Comparisons are numeric when both sides are numbers (or numeric
//! strings) and textual otherwise. A bare operand falls back to truthiness.

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

use super::resolver::{self, Variables};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("unterminated placeholder starting at offset {0}")]
    UnterminatedPlaceholder(usize),

    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Evaluate `expression` to a boolean.
pub fn evaluate(expression: &str, vars: &dyn Variables) -> Result<bool, ExpressionError> {
    let tokens = tokenize(expression, vars)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Empty);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(ExpressionError::UnexpectedToken(token.describe()));
    }
    Ok(is_truthy(&value))
}

/// Truthiness used for bare operands and loop/wait conditions.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let s = s.trim();
            !(s.is_empty()
                || s.eq_ignore_ascii_case("false")
                || s == "0"
                || s.eq_ignore_ascii_case("null")
                || s.eq_ignore_ascii_case("undefined"))
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Compare(CompareOp),
    Literal(Value),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::And => "&&".into(),
            Token::Or => "||".into(),
            Token::Not => "!".into(),
            Token::Compare(op) => format!("{op:?}"),
            Token::Literal(v) => resolver::value_to_string(v),
        }
    }
}

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '=' | '!' | '<' | '>' | '&' | '|' | '"' | '\'')
}

fn tokenize(input: &str, vars: &dyn Variables) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
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
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Compare(CompareOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Compare(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Compare(CompareOp::Ge));
                i += 2;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Compare(CompareOp::Le));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Compare(CompareOp::Gt));
                i += 1;
            }
            '<' => {
                tokens.push(Token::Compare(CompareOp::Lt));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let end = (start..chars.len())
                    .find(|&j| chars[j].1 == quote)
                    .ok_or(ExpressionError::UnterminatedString(offset))?;
                let raw: String = chars[start..end].iter().map(|(_, c)| *c).collect();
                tokens.push(Token::Literal(Value::String(resolver::substitute(&raw, vars))));
                i = end + 1;
            }
            '$' if next == Some('{') => {
                let start = i + 2;
                let end = (start..chars.len())
                    .find(|&j| chars[j].1 == '}')
                    .ok_or(ExpressionError::UnterminatedPlaceholder(offset))?;
                let name: String = chars[start..end].iter().map(|(_, c)| *c).collect();
                let value = resolver::lookup(vars, name.trim())
                    .cloned()
                    .unwrap_or_else(|| Value::String(format!("${{{name}}}")));
                tokens.push(Token::Literal(value));
                i = end + 1;
            }
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i].1) {
                    // A placeholder glued to a word ends the word.
                    if chars[i].1 == '$' && chars.get(i + 1).map(|(_, c)| *c) == Some('{') && i > start {
                        break;
                    }
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                tokens.push(Token::Literal(word_literal(&word)));
            }
            other => return Err(ExpressionError::UnexpectedChar { ch: other, offset }),
        }
    }

    Ok(tokens)
}

fn word_literal(word: &str) -> Value {
    match word {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => parse_number(word)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(word.to_string())),
    }
}

fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    let first = s.chars().next()?;
    if !(first.is_ascii_digit() || first == '-' || first == '+' || first == '.') {
        return None;
    }
    s.parse::<f64>().ok().filter(|f| f.is_finite())
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Value::Bool(is_truthy(&left) || is_truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value, ExpressionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Value::Bool(is_truthy(&left) && is_truthy(&right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Value, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Value::Bool(!is_truthy(&inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Value, ExpressionError> {
        let left = self.parse_operand()?;
        if let Some(Token::Compare(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Value::Bool(compare(op, &left, &right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Value, ExpressionError> {
        match self.advance() {
            Some(Token::LParen) => {
                let value = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    Some(other) => Err(ExpressionError::UnexpectedToken(other.describe())),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some(Token::Literal(value)) => Ok(value),
            Some(other) => Err(ExpressionError::UnexpectedToken(other.describe())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    let ordering = match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => match (left, right) {
            (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
            _ => Some(resolver::value_to_string(left).cmp(&resolver::value_to_string(right))),
        },
    };
    let Some(ordering) = ordering else {
        return op == CompareOp::Ne;
    };
    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Lt => ordering == Ordering::Less,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn eval(expr: &str, vars: &HashMap<String, Value>) -> bool {
        evaluate(expr, vars).unwrap()
    }

    fn vars() -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        vars.insert("count".to_string(), json!(5));
        vars.insert("status".to_string(), json!("active"));
        vars.insert("label".to_string(), json!("a > b"));
        vars.insert("ready".to_string(), json!(true));
        vars.insert("empty".to_string(), json!(""));
        vars
    }

    #[test]
    fn test_numeric_comparisons() {
        let v = vars();
        assert!(eval("5 > 3", &v));
        assert!(!eval("5 < 3", &v));
        assert!(eval("${count} >= 5", &v));
        assert!(eval("${count} <= 5.0", &v));
        assert!(eval("${count} == '5'", &v));
        assert!(eval("10 > 9", &v), "numeric, not lexicographic");
    }

    #[test]
    fn test_string_comparisons() {
        let v = vars();
        assert!(eval("${status} == active", &v));
        assert!(eval("${status} != 'inactive'", &v));
        assert!(eval("'${status}' == \"active\"", &v));
        assert!(eval("${empty} == ''", &v));
    }

    #[test]
    fn test_operator_inside_value_does_not_split() {
        let v = vars();
        assert!(eval("${label} == 'a > b'", &v));
        assert!(!eval("${label} == 'a'", &v));
    }

    #[test]
    fn test_literals_and_truthiness() {
        let v = vars();
        assert!(eval("true", &v));
        assert!(!eval("false", &v));
        assert!(eval("${ready}", &v));
        assert!(!eval("${empty}", &v));
        assert!(!eval("0", &v));
        assert!(eval("yes", &v));
        assert!(!eval("null", &v));
    }

    #[test]
    fn test_boolean_connectives() {
        let v = vars();
        assert!(eval("${count} > 3 && ${status} == active", &v));
        assert!(eval("${count} > 10 || ${ready}", &v));
        assert!(eval("!(${count} > 10)", &v));
        assert!(!eval("!${ready}", &v));
    }

    #[test]
    fn test_unresolved_placeholder_compares_as_text() {
        let v = vars();
        assert!(eval("${missing} == '${missing}'", &v));
        assert!(!eval("${missing} == 1", &v));
    }

    #[test]
    fn test_malformed_expressions() {
        let v = vars();
        assert_eq!(evaluate("", &v), Err(ExpressionError::Empty));
        assert_eq!(evaluate("5 >", &v), Err(ExpressionError::UnexpectedEnd));
        assert!(matches!(evaluate("'open", &v), Err(ExpressionError::UnterminatedString(0))));
        assert!(matches!(evaluate("(1 == 1", &v), Err(ExpressionError::UnexpectedEnd)));
        assert!(matches!(evaluate("1 == 1 2", &v), Err(ExpressionError::UnexpectedToken(_))));
    }
}
