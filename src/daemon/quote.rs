//! Quoting for saved-state log fields.
//!
//! A field is wrapped in double quotes; `"` and `\` inside it are escaped
//! with a backslash so fields containing whitespace survive a round trip.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnquoteError {
    #[error("quoted string doesn't begin with a quotation mark")]
    NotQuoted,
    #[error("quoted string doesn't end with a quotation mark")]
    Unterminated,
}

pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Parse one quoted field at the start of `input`, returning it and the
/// text after the closing quote.
pub fn unquote(input: &str) -> Result<(String, &str), UnquoteError> {
    let body = input.strip_prefix('"').ok_or(UnquoteError::NotQuoted)?;

    let mut out = String::with_capacity(body.len());
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, &body[i + 1..])),
            '\\' => match chars.next() {
                Some((_, escaped)) => out.push(escaped),
                None => return Err(UnquoteError::Unterminated),
            },
            other => out.push(other),
        }
    }
    Err(UnquoteError::Unterminated)
}
