//! In-memory engine for testing.
//!
//! Holds tables and canned results in a shared [`MemoryStore`] so a test can
//! inspect what a session did after the fact.

use super::{
    BackendKind, ColumnInfo, Connection, Engine, ExecResult, PageBuffer, PageSink, Row, Table,
    Value,
};
use crate::error::{ConnectorError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::{Arc, Mutex, MutexGuard};

/// `select * from <table> [limit <n>]`
const SELECT_ALL: &str = r"(?is)^\s*select\s+\*\s+from\s+([\w.]+)(?:\s+limit\s+(\d+))?\s*;?\s*$";

/// `drop table if exists <table>`
const DROP_TABLE: &str = r"(?is)^\s*drop\s+table\s+if\s+exists\s+([\w.]+)\s*;?\s*$";

/// `create table <table> (<column> <type>, ...)`
const CREATE_TABLE: &str = r"(?is)^\s*create\s+table\s+([\w.]+)\s*\((.*)\)\s*;?\s*$";

/// `insert into <table> (<columns>) values (<literals>), ...`
const INSERT_INTO: &str =
    r"(?is)^\s*insert\s+into\s+([\w.]+)\s*\((.*?)\)\s*values\s*(.*?)\s*;?\s*$";

fn pattern(source: &str) -> Result<Regex> {
    Regex::new(source).map_err(|e| ConnectorError::internal(format!("Invalid pattern: {e}")))
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .trim()
        .to_lowercase()
}

#[derive(Debug, Default)]
struct StoreInner {
    tables: HashMap<String, Table>,
    results: HashMap<String, Table>,
    statements: Vec<String>,
    fail_connect: bool,
    connects: usize,
    closes: usize,
}

/// Shared state behind every [`MemoryEngine`] and connection made from it.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores `table` under `name` (e.g. `schema.table`), replacing any previous one.
    pub fn put_table(&self, name: &str, table: Table) {
        self.lock().tables.insert(name.to_lowercase(), table);
    }

    /// Returns a copy of the named table.
    pub fn table(&self, name: &str) -> Option<Table> {
        self.lock().tables.get(&name.to_lowercase()).cloned()
    }

    /// Answers `sql` (compared whitespace- and case-insensitively) with `table`.
    pub fn set_result(&self, sql: &str, table: Table) {
        self.lock().results.insert(normalize(sql), table);
    }

    /// Makes every following connect attempt fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    /// Returns every statement seen so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// Returns the number of connections opened.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Returns the number of connections closed.
    pub fn closes(&self) -> usize {
        self.lock().closes
    }
}

/// An engine answering from a [`MemoryStore`], posing as any backend.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    kind: BackendKind,
    store: MemoryStore,
}

impl MemoryEngine {
    /// Creates an engine posing as Redshift.
    pub fn new(store: MemoryStore) -> Self {
        Self {
            kind: BackendKind::Redshift,
            store,
        }
    }

    /// Poses as `kind`, which selects introspection queries and SQL dialect.
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut inner = self.store.lock();
        if inner.fail_connect {
            return Err(ConnectorError::connection("Cannot connect to memory store"));
        }
        inner.connects += 1;
        Ok(Box::new(MemoryConnection {
            kind: self.kind,
            store: self.store.clone(),
            open: true,
        }))
    }
}

/// A connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    kind: BackendKind,
    store: MemoryStore,
    open: bool,
}

impl MemoryConnection {
    fn answer(&self, sql: &str) -> Result<Table> {
        let inner = self.store.lock();
        if let Some(table) = inner.results.get(&normalize(sql)) {
            return Ok(table.clone());
        }

        let captures = pattern(SELECT_ALL)?
            .captures(sql)
            .ok_or_else(|| ConnectorError::query(format!("Unsupported statement: {sql}")))?;
        let name = captures[1].to_lowercase();
        let table = inner.tables.get(&name).ok_or_else(|| {
            ConnectorError::query(format!("ERROR: relation \"{name}\" does not exist"))
        })?;

        let mut table = table.clone();
        if let Some(limit) = captures.get(2).and_then(|m| m.as_str().parse::<usize>().ok()) {
            table.rows.truncate(limit);
        }
        Ok(table)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn query_pages(
        &mut self,
        sql: &str,
        page_size: Option<usize>,
        on_page: PageSink<'_>,
    ) -> Result<()> {
        self.store.lock().statements.push(sql.to_string());
        let table = self.answer(sql)?;

        let mut buffer = PageBuffer::new(page_size);
        buffer.set_columns(table.columns);
        for row in table.rows {
            buffer.push(row, &mut *on_page);
        }
        buffer.finish(on_page);
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<ExecResult> {
        let mut inner = self.store.lock();
        inner.statements.push(sql.to_string());

        if let Some(captures) = pattern(DROP_TABLE)?.captures(sql) {
            let removed = inner.tables.remove(&captures[1].to_lowercase());
            return Ok(ExecResult {
                rows_affected: removed.map(|t| t.row_count() as u64),
            });
        }

        if let Some(captures) = pattern(CREATE_TABLE)?.captures(sql) {
            let name = captures[1].to_lowercase();
            if inner.tables.contains_key(&name) {
                return Err(ConnectorError::query(format!(
                    "ERROR: relation \"{name}\" already exists"
                )));
            }
            let columns = parse_definitions(&captures[2])?;
            inner.tables.insert(name, Table::with_data(columns, Vec::new()));
            return Ok(ExecResult::default());
        }

        if let Some(captures) = pattern(INSERT_INTO)?.captures(sql) {
            let name = captures[1].to_lowercase();
            let listed = parse_identifiers(&captures[2])?;
            let rows = parse_tuples(&captures[3])?;
            let table = inner.tables.get_mut(&name).ok_or_else(|| {
                ConnectorError::query(format!("ERROR: relation \"{name}\" does not exist"))
            })?;
            if listed != table.column_names() {
                return Err(ConnectorError::query(format!(
                    "Column list of insert does not match {name}"
                )));
            }
            if let Some(row) = rows.iter().find(|row| row.len() != listed.len()) {
                return Err(ConnectorError::query(format!(
                    "INSERT has {} values for {} columns",
                    row.len(),
                    listed.len()
                )));
            }
            let inserted = rows.len() as u64;
            table.rows.extend(rows);
            return Ok(ExecResult {
                rows_affected: Some(inserted),
            });
        }

        Ok(ExecResult::default())
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.store.lock().closes += 1;
        }
        Ok(())
    }
}

fn unsupported(what: &str, text: &str) -> ConnectorError {
    ConnectorError::query(format!("Cannot parse {what}: {text}"))
}

/// Cursor over the column definitions and literals that table writes emit.
struct SqlCursor<'a> {
    text: &'a str,
    chars: Peekable<Chars<'a>>,
}

impl<'a> SqlCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            chars: text.chars().peekable(),
        }
    }

    fn error(&self, what: &str) -> ConnectorError {
        unsupported(what, self.text)
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_whitespace();
        self.chars.next_if_eq(&expected).is_some()
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{expected}'")))
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_whitespace();
        self.chars.peek().is_none()
    }

    fn word(&mut self) -> String {
        self.skip_whitespace();
        let mut word = String::new();
        while let Some(c) = self
            .chars
            .next_if(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '+'))
        {
            word.push(c);
        }
        word
    }

    /// Reads a column name: `"double ""quoted"""`, `` `backticked` `` or bare.
    fn identifier(&mut self) -> Result<String> {
        if self.eat('"') {
            let mut name = String::new();
            loop {
                match self.chars.next() {
                    Some('"') if self.chars.next_if_eq(&'"').is_some() => name.push('"'),
                    Some('"') => return Ok(name),
                    Some(c) => name.push(c),
                    None => return Err(self.error("unterminated identifier")),
                }
            }
        }
        if self.eat('`') {
            let mut name = String::new();
            loop {
                match self.chars.next() {
                    Some('\\') => name.extend(self.chars.next()),
                    Some('`') => return Ok(name),
                    Some(c) => name.push(c),
                    None => return Err(self.error("unterminated identifier")),
                }
            }
        }
        let word = self.word();
        if word.is_empty() {
            Err(self.error("expected a column name"))
        } else {
            Ok(word)
        }
    }

    /// Reads a type up to the next top-level `,` or `)`.
    fn type_name(&mut self) -> String {
        let mut name = String::new();
        let mut depth = 0usize;
        while let Some(&c) = self.chars.peek() {
            match c {
                ',' if depth == 0 => break,
                ')' if depth == 0 => break,
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
            name.push(c);
            self.chars.next();
        }
        name.trim().to_string()
    }

    /// Reads the body of a string literal whose opening quote is consumed.
    /// Accepts both doubled quotes and backslash escapes.
    fn string(&mut self) -> Result<String> {
        let mut text = String::new();
        loop {
            match self.chars.next() {
                Some('\\') => match self.chars.next() {
                    Some('n') => text.push('\n'),
                    Some('r') => text.push('\r'),
                    Some(c) => text.push(c),
                    None => return Err(self.error("unterminated string")),
                },
                Some('\'') if self.chars.next_if_eq(&'\'').is_some() => text.push('\''),
                Some('\'') => return Ok(text),
                Some(c) => text.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn value(&mut self) -> Result<Value> {
        if self.eat('\'') {
            let text = self.string()?;
            if self.eat(':') {
                self.expect(':')?;
                let cast_to = self.type_name();
                return self.cast(Value::String(text), &cast_to);
            }
            return Ok(Value::String(text));
        }

        let word = self.word();
        match word.to_uppercase().as_str() {
            "NULL" => Ok(Value::Null),
            "TRUE" => Ok(Value::Bool(true)),
            "FALSE" => Ok(Value::Bool(false)),
            "FROM_HEX" => {
                self.expect('(')?;
                self.expect('\'')?;
                let hex = self.string()?;
                self.expect(')')?;
                decode_hex(&hex)
                    .map(Value::Bytes)
                    .ok_or_else(|| self.error("invalid hex"))
            }
            "CAST" => {
                self.expect('(')?;
                let value = self.value()?;
                if !self.word().eq_ignore_ascii_case("as") {
                    return Err(self.error("expected AS"));
                }
                let cast_to = self.type_name();
                self.expect(')')?;
                self.cast(value, &cast_to)
            }
            _ => {
                if let Ok(i) = word.parse::<i64>() {
                    Ok(Value::Int(i))
                } else if let Ok(f) = word.parse::<f64>() {
                    Ok(Value::Float(f))
                } else {
                    Err(self.error(&format!("unknown literal '{word}'")))
                }
            }
        }
    }

    fn cast(&self, value: Value, type_name: &str) -> Result<Value> {
        let type_name = type_name.to_lowercase();
        if !(type_name.contains("double") || type_name.contains("float")) {
            return Ok(value);
        }
        match &value {
            Value::String(s) => s
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| self.error(&format!("'{s}' is not a float"))),
            _ => Ok(value),
        }
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

/// Parses `name TYPE, ...` into columns typed with the lowercased SQL type.
fn parse_definitions(text: &str) -> Result<Vec<ColumnInfo>> {
    let mut cursor = SqlCursor::new(text);
    let mut columns = Vec::new();
    loop {
        let name = cursor.identifier()?;
        let data_type = cursor.type_name().to_lowercase();
        columns.push(ColumnInfo::new(name, data_type));
        if !cursor.eat(',') {
            break;
        }
    }
    if cursor.at_end() {
        Ok(columns)
    } else {
        Err(unsupported("column definitions", text))
    }
}

fn parse_identifiers(text: &str) -> Result<Vec<String>> {
    let mut cursor = SqlCursor::new(text);
    let mut names = vec![cursor.identifier()?];
    while cursor.eat(',') {
        names.push(cursor.identifier()?);
    }
    if cursor.at_end() {
        Ok(names)
    } else {
        Err(unsupported("column list", text))
    }
}

/// Parses `(literal, ...), (literal, ...)` into rows.
fn parse_tuples(text: &str) -> Result<Vec<Row>> {
    let mut cursor = SqlCursor::new(text);
    let mut rows = Vec::new();
    loop {
        cursor.expect('(')?;
        let mut row = vec![cursor.value()?];
        while cursor.eat(',') {
            row.push(cursor.value()?);
        }
        cursor.expect(')')?;
        rows.push(row);
        if !cursor.eat(',') {
            break;
        }
    }
    if cursor.at_end() {
        Ok(rows)
    } else {
        Err(unsupported("values", text))
    }
}
