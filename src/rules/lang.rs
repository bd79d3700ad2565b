//! # Rule Predicate Language
//!
//! A small boolean expression language over the fields of a failure:
//!
//! ```text
//! expr      := and_expr (OR and_expr)*
//! and_expr  := not_expr (AND not_expr)*
//! not_expr  := NOT not_expr | primary
//! primary   := '(' expr ')' | predicate
//! predicate := REGEXP_CONTAINS '(' value ',' string ')'
//!            | value [NOT] LIKE string
//!            | value [NOT] IN '(' string (',' string)* ')'
//!            | value ('=' | '!=' | '<>') value
//! value     := test | reason | string
//! ```
//!
//! Keywords and field names are case-insensitive. Strings are single- or
//! double-quoted with backslash escapes. `LIKE` patterns use `%` for any
//! sequence, `_` for any character and `\` to escape the next character.

use regex::Regex;
use std::fmt;

/// Failure fields a predicate can inspect.
#[derive(Debug, Clone, Copy)]
pub struct Features<'a> {
    pub test: &'a str,
    pub reason: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Test,
    Reason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Field(Field),
    Literal(String),
}

impl Value {
    fn resolve<'a>(&'a self, features: &Features<'a>) -> &'a str {
        match self {
            Value::Field(Field::Test) => features.test,
            Value::Field(Field::Reason) => features.reason,
            Value::Literal(literal) => literal,
        }
    }
}

/// A compiled predicate.
#[derive(Debug, Clone)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Equals {
        left: Value,
        right: Value,
        negated: bool,
    },
    Like {
        value: Value,
        pattern: Regex,
        negated: bool,
    },
    In {
        value: Value,
        list: Vec<String>,
        negated: bool,
    },
    RegexpContains {
        value: Value,
        pattern: Regex,
    },
}

impl Expr {
    pub fn evaluate(&self, features: &Features<'_>) -> bool {
        match self {
            Expr::And(items) => items.iter().all(|item| item.evaluate(features)),
            Expr::Or(items) => items.iter().any(|item| item.evaluate(features)),
            Expr::Not(inner) => !inner.evaluate(features),
            Expr::Equals {
                left,
                right,
                negated,
            } => (left.resolve(features) == right.resolve(features)) != *negated,
            Expr::Like {
                value,
                pattern,
                negated,
            } => pattern.is_match(value.resolve(features)) != *negated,
            Expr::In {
                value,
                list,
                negated,
            } => {
                let value = value.resolve(features);
                list.iter().any(|item| item == value) != *negated
            }
            Expr::RegexpContains { value, pattern } => pattern.is_match(value.resolve(features)),
        }
    }
}

/// Error raised when a predicate cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "syntax error at offset {}: {}", self.position, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parse and compile a predicate.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
        depth: 0,
    };
    let expr = parser.expr()?;
    if let Some(token) = parser.peek() {
        return Err(parser.error_at(token.offset, format!("unexpected {}", token.kind)));
    }
    Ok(expr)
}

/// Translate a `LIKE` pattern into an anchored regular expression.
pub fn like_to_regex(pattern: &str) -> Result<Regex, String> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?s)^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&regex::escape(escaped.encode_utf8(&mut [0; 4]))),
                None => return Err("LIKE pattern ends with an unescaped backslash".to_string()),
            },
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|err| err.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Eq,
    NotEq,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "identifier {name:?}"),
            TokenKind::Str(value) => write!(f, "string {value:?}"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::Comma => f.write_str("','"),
            TokenKind::Eq => f.write_str("'='"),
            TokenKind::NotEq => f.write_str("'!='"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(offset, c)) = chars.peek() {
        let kind = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '(' => {
                chars.next();
                TokenKind::LParen
            }
            ')' => {
                chars.next();
                TokenKind::RParen
            }
            ',' => {
                chars.next();
                TokenKind::Comma
            }
            '=' => {
                chars.next();
                TokenKind::Eq
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => TokenKind::NotEq,
                    _ => {
                        return Err(ParseError {
                            position: offset,
                            message: "expected '=' after '!'".to_string(),
                        })
                    }
                }
            }
            '<' => {
                chars.next();
                match chars.next() {
                    Some((_, '>')) => TokenKind::NotEq,
                    _ => {
                        return Err(ParseError {
                            position: offset,
                            message: "expected '>' after '<'".to_string(),
                        })
                    }
                }
            }
            '"' | '\'' => {
                chars.next();
                TokenKind::Str(read_string(&mut chars, c, offset)?)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                TokenKind::Ident(ident)
            }
            other => {
                return Err(ParseError {
                    position: offset,
                    message: format!("unexpected character {other:?}"),
                })
            }
        };
        tokens.push(Token { kind, offset });
    }
    Ok(tokens)
}

fn read_string(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    quote: char,
    start: usize,
) -> Result<String, ParseError> {
    let mut value = String::new();
    loop {
        match chars.next() {
            None => {
                return Err(ParseError {
                    position: start,
                    message: "unterminated string literal".to_string(),
                })
            }
            Some((_, c)) if c == quote => return Ok(value),
            Some((offset, '\\')) => match chars.next() {
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, '\'')) => value.push('\''),
                Some((_, 'n')) => value.push('\n'),
                Some((_, 'r')) => value.push('\r'),
                Some((_, 't')) => value.push('\t'),
                Some((_, other)) => {
                    return Err(ParseError {
                        position: offset,
                        message: format!("unsupported escape sequence \\{other}"),
                    })
                }
                None => {
                    return Err(ParseError {
                        position: start,
                        message: "unterminated string literal".to_string(),
                    })
                }
            },
            Some((_, c)) => value.push(c),
        }
    }
}

/// Deepest nesting of parentheses and `NOT` a predicate may use.
pub const MAX_NESTING_DEPTH: usize = 100;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error_at(&self, position: usize, message: impl Into<String>) -> ParseError {
        ParseError {
            position,
            message: message.into(),
        }
    }

    fn offset(&self) -> usize {
        self.peek().map(|token| token.offset).unwrap_or(self.end)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token { kind: TokenKind::Ident(name), .. }) if name.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(self.error_at(offset, format!("expected {kind}, found {}", token.kind))),
            None => Err(self.error_at(offset, format!("expected {kind}, found end of input"))),
        }
    }

    fn expect_string(&mut self) -> Result<(String, usize), ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token {
                kind: TokenKind::Str(value),
                ..
            }) => Ok((value, offset)),
            Some(token) => Err(self.error_at(offset, format!("expected string, found {}", token.kind))),
            None => Err(self.error_at(offset, "expected string, found end of input")),
        }
    }

    fn nested<T>(
        &mut self,
        offset: usize,
        parse: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.error_at(offset, format!("predicate nested deeper than {MAX_NESTING_DEPTH} levels")));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let mut items = vec![self.and_expr()?];
        while self.eat_keyword("OR") {
            items.push(self.and_expr()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut items = vec![self.not_expr()?];
        while self.eat_keyword("AND") {
            items.push(self.not_expr()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn not_expr(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        if self.eat_keyword("NOT") {
            let inner = self.nested(offset, |parser| parser.not_expr())?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek(), Some(Token { kind: TokenKind::LParen, .. })) {
            let offset = self.offset();
            self.pos += 1;
            let inner = self.nested(offset, |parser| parser.expr())?;
            self.expect(TokenKind::RParen)?;
            return Ok(inner);
        }
        if self.peek_keyword("REGEXP_CONTAINS") {
            self.pos += 1;
            self.expect(TokenKind::LParen)?;
            let value = self.value()?;
            self.expect(TokenKind::Comma)?;
            let (pattern, offset) = self.expect_string()?;
            self.expect(TokenKind::RParen)?;
            let pattern = Regex::new(&pattern)
                .map_err(|err| self.error_at(offset, format!("invalid regular expression: {err}")))?;
            return Ok(Expr::RegexpContains { value, pattern });
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expr, ParseError> {
        let value = self.value()?;
        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("LIKE") {
            let (pattern, offset) = self.expect_string()?;
            let pattern = like_to_regex(&pattern).map_err(|message| self.error_at(offset, message))?;
            return Ok(Expr::Like {
                value,
                pattern,
                negated,
            });
        }
        if self.eat_keyword("IN") {
            self.expect(TokenKind::LParen)?;
            let mut list = vec![self.expect_string()?.0];
            while matches!(self.peek(), Some(Token { kind: TokenKind::Comma, .. })) {
                self.pos += 1;
                list.push(self.expect_string()?.0);
            }
            self.expect(TokenKind::RParen)?;
            return Ok(Expr::In {
                value,
                list,
                negated,
            });
        }
        if negated {
            return Err(self.error_at(self.offset(), "expected LIKE or IN after NOT"));
        }
        let offset = self.offset();
        let negated = match self.next() {
            Some(Token {
                kind: TokenKind::Eq, ..
            }) => false,
            Some(Token {
                kind: TokenKind::NotEq,
                ..
            }) => true,
            Some(token) => {
                return Err(self.error_at(offset, format!("expected comparison, found {}", token.kind)))
            }
            None => return Err(self.error_at(offset, "expected comparison, found end of input")),
        };
        let right = self.value()?;
        Ok(Expr::Equals {
            left: value,
            right,
            negated,
        })
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token {
                kind: TokenKind::Str(literal),
                ..
            }) => Ok(Value::Literal(literal)),
            Some(Token {
                kind: TokenKind::Ident(name),
                ..
            }) => {
                if name.eq_ignore_ascii_case("test") {
                    Ok(Value::Field(Field::Test))
                } else if name.eq_ignore_ascii_case("reason") {
                    Ok(Value::Field(Field::Reason))
                } else {
                    Err(self.error_at(offset, format!("unknown field {name:?}; expected test or reason")))
                }
            }
            Some(token) => Err(self.error_at(offset, format!("expected value, found {}", token.kind))),
            None => Err(self.error_at(offset, "expected value, found end of input")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(predicate: &str, test: &str, reason: &str) -> bool {
        parse(predicate)
            .unwrap_or_else(|err| panic!("{predicate}: {err}"))
            .evaluate(&Features { test, reason })
    }

    #[test]
    fn equality_and_inequality() {
        assert!(eval(r#"test = "ninja://a""#, "ninja://a", ""));
        assert!(!eval(r#"test = "ninja://a""#, "ninja://b", ""));
        assert!(eval(r#"test != "ninja://a""#, "ninja://b", ""));
        assert!(eval(r#"test <> "ninja://a""#, "ninja://b", ""));
        assert!(eval(r#""x" = "x""#, "", ""));
    }

    #[test]
    fn like_patterns() {
        assert!(eval(r#"reason LIKE "%timed out%""#, "", "step timed out after 60s"));
        assert!(!eval(r#"reason LIKE "timed out%""#, "", "step timed out"));
        assert!(eval(r#"test LIKE "ninja://browser_tests/_""#, "ninja://browser_tests/7", ""));
        assert!(!eval(r#"test LIKE "ninja://browser_tests/_""#, "ninja://browser_tests/77", ""));
        assert!(eval(r#"reason NOT LIKE "%crash%""#, "", "assertion failed"));
    }

    #[test]
    fn like_escapes_metacharacters() {
        assert!(eval(r#"reason LIKE "100\\% done""#, "", "100% done"));
        assert!(!eval(r#"reason LIKE "100\\% done""#, "", "1000 done"));
        assert!(eval(r#"reason LIKE "a.b(c)""#, "", "a.b(c)"));
        assert!(!eval(r#"reason LIKE "a.b""#, "", "axb"));
        assert!(eval(r#"reason LIKE "%line%""#, "", "first\nline"));
    }

    #[test]
    fn in_lists() {
        assert!(eval(r#"test IN ("a", "b", 'c')"#, "c", ""));
        assert!(!eval(r#"test IN ("a", "b")"#, "c", ""));
        assert!(eval(r#"test NOT IN ("a", "b")"#, "c", ""));
    }

    #[test]
    fn regexp_contains() {
        assert!(eval(r#"REGEXP_CONTAINS(test, "^ninja://.*/Flaky")"#, "ninja://suite/FlakyTest", ""));
        assert!(!eval(r#"regexp_contains(reason, "segfault")"#, "", "clean exit"));
    }

    #[test]
    fn boolean_structure_and_precedence() {
        let predicate = r#"test = "a" OR test = "b" AND reason = "x""#;
        assert!(eval(predicate, "a", "y"));
        assert!(!eval(predicate, "b", "y"));
        assert!(eval(predicate, "b", "x"));

        let grouped = r#"(test = "a" OR test = "b") AND reason = "x""#;
        assert!(!eval(grouped, "a", "y"));
        assert!(eval(grouped, "a", "x"));

        assert!(eval(r#"NOT test = "a""#, "b", ""));
        assert!(eval(r#"not not test = "a""#, "a", ""));
    }

    #[test]
    fn string_escapes() {
        assert!(eval(r#"reason = "say \"hi\"""#, "", "say \"hi\""));
        assert!(eval(r#"reason = 'it\'s'"#, "", "it's"));
        assert!(eval(r#"reason = "tab\there""#, "", "tab\there"));
    }

    #[test]
    fn syntax_errors_are_reported() {
        for bad in [
            "",
            "test",
            r#"test = "unterminated"#,
            r#"test LIKE"#,
            r#"build = "x""#,
            r#"test = "a" AND"#,
            r#"(test = "a""#,
            r#"test NOT = "a""#,
            r#"test LIKE "trailing\\""#,
            r#"REGEXP_CONTAINS(test, "(")"#,
            r#"test = "a" test = "b""#,
            r#"test = "\q""#,
            r#"test # "a""#,
        ] {
            assert!(parse(bad).is_err(), "expected error for {bad:?}");
        }
    }

    #[test]
    fn parse_error_positions() {
        let err = parse(r#"test = "a" AND build = "b""#).unwrap_err();
        assert_eq!(err.position, 15);
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn nesting_is_bounded() {
        let nested = |depth: usize| format!("{}test = \"a\"{}", "(".repeat(depth), ")".repeat(depth));
        assert!(eval(&nested(MAX_NESTING_DEPTH), "a", ""));

        let err = parse(&nested(20_000)).unwrap_err();
        assert!(err.message.contains("nested deeper"));
        assert_eq!(err.position, MAX_NESTING_DEPTH);

        let nots = format!("{}test = \"a\"", "NOT ".repeat(20_000));
        assert!(parse(&nots).is_err());
        assert!(eval(&format!("{}test = \"a\"", "NOT ".repeat(2)), "a", ""));
    }
}
