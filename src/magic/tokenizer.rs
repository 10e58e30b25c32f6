//! Splits a cell-magic argument line into words.
//!
//! Words are separated by whitespace. Single- or double-quoted runs may
//! contain whitespace and are kept verbatim, quotes included, so that
//! `name='O Brien'` reaches the template as the SQL literal `'O Brien'`.

use crate::error::{ConnectorError, Result};

/// A word parsed from the argument line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A word without a top-level `=`.
    Word(String),
    /// A `key=value` pair, split at the first top-level `=`.
    KeyValue { key: String, value: String },
}

/// Tokenizes an argument line.
///
/// An unterminated quote is a [`ConnectorError::Template`] error.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let (word, split_at) = collect_word(&mut chars, true)?;
        tokens.push(into_token(word, split_at));
    }

    Ok(tokens)
}

/// Turns one argument that is already split off, such as a shell argument,
/// into a token. Whitespace inside it is kept.
pub fn classify(arg: &str) -> Result<Token> {
    let (word, split_at) = collect_word(&mut arg.chars().peekable(), false)?;
    Ok(into_token(word, split_at))
}

fn into_token(word: String, split_at: Option<usize>) -> Token {
    match split_at {
        Some(pos) => Token::KeyValue {
            key: word[..pos].to_string(),
            value: word[pos + 1..].to_string(),
        },
        None => Token::Word(word),
    }
}

/// Collects one word, returning it with the byte offset of its first
/// `=` outside quotes.
fn collect_word(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    stop_at_whitespace: bool,
) -> Result<(String, Option<usize>)> {
    let mut word = String::new();
    let mut split_at = None;

    while let Some(&c) = chars.peek() {
        if stop_at_whitespace && c.is_whitespace() {
            break;
        }
        chars.next();

        match c {
            '"' | '\'' => {
                word.push(c);
                collect_quoted(chars, c, &mut word)?;
            }
            '=' if split_at.is_none() => {
                split_at = Some(word.len());
                word.push(c);
            }
            _ => word.push(c),
        }
    }

    Ok((word, split_at))
}

/// Copies a quoted run into `word`, through the closing quote.
fn collect_quoted(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    quote: char,
    word: &mut String,
) -> Result<()> {
    for c in chars.by_ref() {
        word.push(c);
        if c == quote {
            return Ok(());
        }
    }
    Err(ConnectorError::template(format!(
        "Unterminated {quote} quote in: {word}"
    )))
}
