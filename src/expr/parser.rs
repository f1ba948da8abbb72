use serde_json::{Number, Value};

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Eq,
    Ne,
    And,
    Or,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Number),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Bang,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
}

pub(crate) fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or()?;
    if let Some((offset, token)) = parser.tokens.get(parser.pos) {
        return Err(ExprError::Syntax {
            offset: *offset,
            message: format!("unexpected {token:?}"),
        });
    }
    Ok(expr)
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '.' => Token::Dot,
            ',' => Token::Comma,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '=' if next == Some('=') => {
                i += 1;
                Token::EqEq
            }
            '!' if next == Some('=') => {
                i += 1;
                Token::NotEq
            }
            '!' => Token::Bang,
            '&' if next == Some('&') => {
                i += 1;
                Token::AndAnd
            }
            '|' if next == Some('|') => {
                i += 1;
                Token::OrOr
            }
            '\'' | '"' => {
                let (text, consumed) = read_string(&chars[i..], offset)?;
                i += consumed;
                tokens.push((offset, Token::Str(text)));
                continue;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                tokens.push((offset, Token::Num(parse_number(&text, offset)?)));
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                tokens.push((offset, Token::Ident(text)));
                continue;
            }
            other => {
                return Err(ExprError::Syntax {
                    offset,
                    message: format!("unexpected character {other:?}"),
                })
            }
        };
        tokens.push((offset, token));
        i += 1;
    }

    Ok(tokens)
}

/// Reads a quoted string starting at `chars[0]`; returns the text and the
/// number of characters consumed including both quotes.
fn read_string(chars: &[(usize, char)], offset: usize) -> Result<(String, usize), ExprError> {
    let quote = chars[0].1;
    let mut out = String::new();
    let mut i = 1;
    while i < chars.len() {
        match chars[i].1 {
            '\\' => {
                let escaped = chars.get(i + 1).map(|(_, c)| *c).ok_or(ExprError::Syntax {
                    offset,
                    message: "unterminated string".into(),
                })?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(ExprError::Syntax {
        offset,
        message: "unterminated string".into(),
    })
}

fn parse_number(text: &str, offset: usize) -> Result<Number, ExprError> {
    let invalid = || ExprError::Syntax {
        offset,
        message: format!("invalid number {text:?}"),
    };
    if text.contains('.') {
        let value: f64 = text.parse().map_err(|_| invalid())?;
        Number::from_f64(value).ok_or_else(invalid)
    } else {
        let value: i64 = text.parse().map_err(|_| invalid())?;
        Ok(Number::from(value))
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(0, |(offset, _)| *offset)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(ExprError::Syntax {
                offset: self.offset(),
                message: format!("expected {token:?}, found {:?}", self.peek()),
            })
        }
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) {
            let right = self.and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.comparison()?;
        while self.eat(&Token::AndAnd) {
            let right = self.comparison()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.unary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Ident(word)) if word == "in" => BinaryOp::In,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.unary()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.ident()?;
                if self.eat(&Token::LParen) {
                    // Method syntax: `a.f(b)` is `f(a, b)`.
                    let mut args = vec![expr];
                    args.extend(self.arguments()?);
                    expr = Expr::Call(name, args);
                } else {
                    expr = Expr::Member(Box::new(expr), name);
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.or()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        match token {
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::Num(number)) => Ok(Expr::Literal(Value::Number(number))),
            Some(Token::Ident(word)) => {
                let literal = match word.as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    "null" | "nil" => Some(Value::Null),
                    _ => None,
                };
                if let Some(value) = literal {
                    Ok(Expr::Literal(value))
                } else if self.eat(&Token::LParen) {
                    Ok(Expr::Call(word, self.arguments()?))
                } else {
                    Ok(Expr::Ident(word))
                }
            }
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.or()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::List(items))
            }
            other => Err(ExprError::Syntax {
                offset,
                message: match other {
                    Some(token) => format!("unexpected {token:?}"),
                    None => "unexpected end of expression".into(),
                },
            }),
        }
    }

    /// Parses call arguments after the opening parenthesis.
    fn arguments(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.or()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
        }
    }

    fn ident(&mut self) -> Result<String, ExprError> {
        match self.tokens.get(self.pos) {
            Some((_, Token::Ident(name))) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(ExprError::Syntax {
                offset: self.offset(),
                message: "expected identifier".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_binds_comparison_tighter_than_logic() {
        let expr = parse("a == 'x' || !b && c").unwrap();
        let Expr::Binary(BinaryOp::Or, left, right) = expr else {
            panic!("expected top-level ||");
        };
        assert!(matches!(*left, Expr::Binary(BinaryOp::Eq, _, _)));
        assert!(matches!(*right, Expr::Binary(BinaryOp::And, _, _)));
    }

    #[test]
    fn method_syntax_becomes_call_with_receiver() {
        let expr = parse("request.header('X-Event')").unwrap();
        assert_eq!(
            expr,
            Expr::Call(
                "header".into(),
                vec![
                    Expr::Ident("request".into()),
                    Expr::Literal(Value::String("X-Event".into())),
                ]
            )
        );
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(matches!(parse("a b"), Err(ExprError::Syntax { .. })));
        assert!(matches!(parse("'open"), Err(ExprError::Syntax { .. })));
    }
}
