//! Line and cell magic semantics.
//!
//! The line form turns a fragment into a `select`; the cell form runs a
//! multi-line statement, optionally naming where the result goes and
//! filling `{key}` placeholders from `key=value` arguments.

mod tokenizer;

use std::collections::BTreeMap;

use crate::error::{ConnectorError, Result};

pub use tokenizer::{classify, tokenize, Token};

/// Wraps a line-magic fragment into a full statement.
pub fn select_statement(fragment: &str) -> String {
    format!("select {}", fragment.trim())
}

/// Parsed cell-magic argument line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellArgs {
    /// Name the result is stored under.
    pub target: Option<String>,
    /// Template parameters.
    pub params: BTreeMap<String, String>,
}

impl CellArgs {
    /// Parses `target key=value ...`.
    ///
    /// The first word names the result; every following word must be a
    /// `key=value` pair.
    pub fn parse(line: &str) -> Result<Self> {
        Self::from_tokens(tokenize(line)?)
    }

    /// Parses arguments that are already split, one token per argument.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let tokens = args
            .iter()
            .map(|arg| classify(arg.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::from_tokens(tokens)
    }

    fn from_tokens(tokens: Vec<Token>) -> Result<Self> {
        let mut tokens = tokens.into_iter();

        let target = match tokens.next() {
            None => return Ok(Self::default()),
            Some(Token::Word(word)) => word,
            Some(Token::KeyValue { key, value }) => {
                return Err(ConnectorError::template(format!(
                    "Expected a result name before parameters, got '{key}={value}'"
                )))
            }
        };

        let mut params = BTreeMap::new();
        for token in tokens {
            match token {
                Token::KeyValue { key, .. } if key.is_empty() => {
                    return Err(ConnectorError::template(
                        "Parameter with an empty name".to_string(),
                    ))
                }
                Token::KeyValue { key, value } => {
                    params.insert(key, value);
                }
                Token::Word(word) => {
                    return Err(ConnectorError::template(format!(
                        "Expected key=value, got '{word}'"
                    )))
                }
            }
        }

        Ok(Self {
            target: Some(target),
            params,
        })
    }

    /// Produces the statement to run for `cell`.
    ///
    /// Without a target the cell runs verbatim, braces and all.
    pub fn statement(&self, cell: &str) -> Result<String> {
        match self.target {
            Some(_) => render_template(cell, &self.params),
            None => Ok(cell.to_string()),
        }
    }
}

/// Replaces `{key}` placeholders in `template` with `params[key]`.
///
/// `{{` and `}}` stand for literal braces.
pub fn render_template(template: &str, params: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for k in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                if !closed {
                    return Err(ConnectorError::template("Unclosed '{' in cell"));
                }
                let value = params.get(key.trim()).ok_or_else(|| {
                    ConnectorError::template(format!("No value for placeholder '{{{key}}}'"))
                })?;
                out.push_str(value);
            }
            '}' => return Err(ConnectorError::template("Single '}' in cell")),
            _ => out.push(c),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_select_statement() {
        assert_eq!(select_statement(" 1 as one "), "select 1 as one");
    }

    #[test]
    fn test_parse_target_and_params() {
        let args = CellArgs::parse("df day='2024-01-01' n=10").unwrap();
        assert_eq!(args.target.as_deref(), Some("df"));
        assert_eq!(args.params, params(&[("day", "'2024-01-01'"), ("n", "10")]));
    }

    #[test]
    fn test_from_args_keeps_each_argument_whole() {
        let args = CellArgs::from_args(&["df", "name='O Brien'", "note=a b"]).unwrap();
        assert_eq!(args.target.as_deref(), Some("df"));
        assert_eq!(args.params["name"], "'O Brien'");
        assert_eq!(args.params["note"], "a b");

        let none: [&str; 0] = [];
        assert_eq!(CellArgs::from_args(&none).unwrap(), CellArgs::default());
        assert!(CellArgs::from_args(&["df", "oops"]).is_err());
    }

    #[test]
    fn test_parse_empty_line() {
        assert_eq!(CellArgs::parse("").unwrap(), CellArgs::default());
    }

    #[test]
    fn test_parse_rejects_bare_word_after_target() {
        let err = CellArgs::parse("df oops").unwrap_err();
        assert!(matches!(err, ConnectorError::Template(_)));
    }

    #[test]
    fn test_parse_rejects_params_without_target() {
        assert!(CellArgs::parse("n=10").is_err());
        assert!(CellArgs::parse("df =10").is_err());
    }

    #[test]
    fn test_render_template() {
        let rendered = render_template(
            "select * from t where day = {day} and tags = '{{}}' limit {n}",
            &params(&[("day", "'2024-01-01'"), ("n", "10")]),
        )
        .unwrap();
        assert_eq!(
            rendered,
            "select * from t where day = '2024-01-01' and tags = '{}' limit 10"
        );
    }

    #[test]
    fn test_render_unknown_key() {
        let err = render_template("select {missing}", &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_render_unbalanced_braces() {
        assert!(render_template("select {oops", &BTreeMap::new()).is_err());
        assert!(render_template("select oops}", &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_statement_without_target_is_verbatim() {
        let args = CellArgs::default();
        assert_eq!(args.statement("select '{x}'").unwrap(), "select '{x}'");

        let args = CellArgs::parse("df").unwrap();
        assert!(args.statement("select '{x}'").is_err());
    }
}
