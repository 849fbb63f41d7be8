//! hstore literal parsing.
//!
//! PostgreSQL renders hstore values as `"key"=>"value", "other"=>NULL`.
//! Destinations store them as JSON, so the literal is converted once here
//! before Avro encoding. Malformed input is an error, not a passthrough.

use crate::error::{ModelError, Result};

/// Parse an hstore literal into its JSON object representation.
pub fn parse_hstore(input: &str) -> Result<String> {
    let mut map = serde_json::Map::new();
    let mut chars = input.chars().peekable();

    loop {
        skip_whitespace(&mut chars);
        if chars.peek().is_none() {
            break;
        }

        let key = match parse_token(&mut chars)? {
            Token::Quoted(s) => s,
            Token::Bare(s) => s,
            Token::Null => {
                return Err(ModelError::hstore("NULL is not a valid hstore key"));
            }
        };

        skip_whitespace(&mut chars);
        expect_arrow(&mut chars)?;
        skip_whitespace(&mut chars);

        let value = match parse_token(&mut chars)? {
            Token::Quoted(s) | Token::Bare(s) => serde_json::Value::String(s),
            Token::Null => serde_json::Value::Null,
        };
        map.insert(key, value);

        skip_whitespace(&mut chars);
        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(c) => {
                return Err(ModelError::hstore(format!(
                    "expected ',' between pairs, found {:?}",
                    c
                )));
            }
        }
    }

    serde_json::to_string(&serde_json::Value::Object(map))
        .map_err(|e| ModelError::hstore(e.to_string()))
}

enum Token {
    Quoted(String),
    Bare(String),
    Null,
}

fn skip_whitespace(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }
}

fn expect_arrow(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<()> {
    match (chars.next(), chars.next()) {
        (Some('='), Some('>')) => Ok(()),
        other => Err(ModelError::hstore(format!(
            "expected '=>', found {:?}",
            other
        ))),
    }
}

fn parse_token(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<Token> {
    match chars.peek() {
        Some('"') => {
            chars.next();
            let mut out = String::new();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(escaped @ ('"' | '\\')) => out.push(escaped),
                        Some(other) => {
                            return Err(ModelError::hstore(format!(
                                "invalid escape sequence \\{}",
                                other
                            )));
                        }
                        None => {
                            return Err(ModelError::hstore("unterminated escape sequence"));
                        }
                    },
                    Some('"') => return Ok(Token::Quoted(out)),
                    Some(c) => out.push(c),
                    None => return Err(ModelError::hstore("unterminated quoted token")),
                }
            }
        }
        Some(_) => {
            let mut out = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == ',' || c == '=' {
                    break;
                }
                out.push(c);
                chars.next();
            }
            if out.is_empty() {
                return Err(ModelError::hstore("empty token"));
            }
            if out.eq_ignore_ascii_case("null") {
                Ok(Token::Null)
            } else {
                Ok(Token::Bare(out))
            }
        }
        None => Err(ModelError::hstore("unexpected end of input")),
    }
}
