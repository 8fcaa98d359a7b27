//! Tokenizer for view and filter scripts.

use crate::error::{Error, Result};

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Num(f64),
    Str(String),
    /// Identifier or keyword.
    Ident(String),
    Punct(&'static str),
    Eof,
}

/// A token and the line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

// Longest first so `===` wins over `==` and `=`.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "++", "--", "+=", "-=", "*=", "/=", "%=",
    "=>", "{", "}", "(", ")", "[", "]", ";", ",", ".", "?", ":", "+", "-", "*", "/", "%", "<",
    ">", "=", "!",
];

pub fn tokenize(source: &str) -> Result<Vec<Spanned>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;
    let mut line = 1;

    while pos < chars.len() {
        let c = chars[pos];

        if c == '\n' {
            line += 1;
            pos += 1;
            continue;
        }
        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        // Comments.
        if c == '/' && chars.get(pos + 1) == Some(&'/') {
            while pos < chars.len() && chars[pos] != '\n' {
                pos += 1;
            }
            continue;
        }
        if c == '/' && chars.get(pos + 1) == Some(&'*') {
            pos += 2;
            loop {
                match chars.get(pos) {
                    None => return Err(syntax(line, "unterminated comment")),
                    Some('*') if chars.get(pos + 1) == Some(&'/') => {
                        pos += 2;
                        break;
                    }
                    Some('\n') => {
                        line += 1;
                        pos += 1;
                    }
                    Some(_) => pos += 1,
                }
            }
            continue;
        }

        let start_line = line;

        if c.is_ascii_digit() || (c == '.' && chars.get(pos + 1).is_some_and(char::is_ascii_digit)) {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '.') {
                // Exponent sign.
                if matches!(chars[pos], 'e' | 'E') && matches!(chars.get(pos + 1), Some('+' | '-')) {
                    pos += 1;
                }
                pos += 1;
            }
            let text: String = chars[start..pos].iter().collect();
            let value = parse_number(&text).ok_or_else(|| syntax(line, &format!("bad number {text}")))?;
            tokens.push(Spanned { token: Token::Num(value), line: start_line });
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_' || chars[pos] == '$') {
                pos += 1;
            }
            let ident: String = chars[start..pos].iter().collect();
            tokens.push(Spanned { token: Token::Ident(ident), line: start_line });
            continue;
        }

        if c == '"' || c == '\'' {
            let (text, next) = read_string(&chars, pos, line)?;
            pos = next;
            tokens.push(Spanned { token: Token::Str(text), line: start_line });
            continue;
        }

        let punct = PUNCTUATORS.iter().find(|p| {
            p.chars()
                .enumerate()
                .all(|(i, pc)| chars.get(pos + i) == Some(&pc))
        });
        match punct {
            Some(p) => {
                pos += p.chars().count();
                tokens.push(Spanned { token: Token::Punct(p), line: start_line });
            }
            None => return Err(syntax(line, &format!("unexpected character '{c}'"))),
        }
    }

    tokens.push(Spanned { token: Token::Eof, line });
    Ok(tokens)
}

fn parse_number(text: &str) -> Option<f64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    text.parse::<f64>().ok()
}

fn read_string(chars: &[char], start: usize, line: usize) -> Result<(String, usize)> {
    let quote = chars[start];
    let mut out = String::new();
    let mut pos = start + 1;
    loop {
        let Some(&c) = chars.get(pos) else {
            return Err(syntax(line, "unterminated string"));
        };
        pos += 1;
        match c {
            '\n' => return Err(syntax(line, "unterminated string")),
            c if c == quote => return Ok((out, pos)),
            '\\' => {
                let Some(&esc) = chars.get(pos) else {
                    return Err(syntax(line, "unterminated string"));
                };
                pos += 1;
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'b' => out.push('\u{8}'),
                    'f' => out.push('\u{c}'),
                    '0' => out.push('\0'),
                    'u' => {
                        let hex: String = chars.iter().skip(pos).take(4).collect();
                        let code = u32::from_str_radix(&hex, 16)
                            .ok()
                            .filter(|_| hex.len() == 4)
                            .ok_or_else(|| syntax(line, "bad unicode escape"))?;
                        out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                        pos += 4;
                    }
                    other => out.push(other),
                }
            }
            c => out.push(c),
        }
    }
}

pub(crate) fn syntax(line: usize, msg: &str) -> Error {
    Error::Eval(format!("syntax error on line {line}: {msg}"))
}
