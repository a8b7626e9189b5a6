//! A small in-memory SQL engine behind the bridge traits. It backs the
//! `iris.mode = memory` configuration for development and carries the
//! whole test suite; it is not a general SQL implementation. Supported:
//! literal SELECT projections, CREATE/DROP TABLE, INSERT .. VALUES,
//! DELETE FROM, SELECT <cols|*> FROM <table> with a trailing LIMIT, and a
//! SLEEP(ms) function for exercising cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::iriswire::iris::bridge::{
    Column, ExecOutcome, Interrupt, IrisConnector, IrisSession,
};
use crate::iriswire::pg::protocol::error_codes;
use crate::iriswire::sql::tokenizer::{tokenize, Token, TokenKind};
use crate::iriswire::{Error, Result};

#[derive(Clone, Default)]
struct MemoryDb {
    tables: HashMap<String, Table>,
}

#[derive(Clone)]
struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Option<String>>>,
}

pub struct MemoryEngine {
    db: Arc<Mutex<MemoryDb>>,
    users: Vec<String>,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryEngine {
            db: Arc::new(Mutex::new(MemoryDb::default())),
            users: Vec::new(),
        })
    }

    /// Restrict user_exists to the given names. An empty list accepts all.
    pub fn with_users(users: &[&str]) -> Arc<Self> {
        Arc::new(MemoryEngine {
            db: Arc::new(Mutex::new(MemoryDb::default())),
            users: users.iter().map(|s| s.to_string()).collect(),
        })
    }
}

impl IrisConnector for MemoryEngine {
    fn connect(&self) -> Result<Box<dyn IrisSession>> {
        Ok(Box::new(MemorySession {
            db: self.db.clone(),
            snapshot: None,
            canceled: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn user_exists(&self, name: &str) -> Result<bool> {
        Ok(self.users.is_empty() || self.users.iter().any(|u| u == name))
    }
}

struct MemorySession {
    db: Arc<Mutex<MemoryDb>>,
    // transaction snapshot for rollback
    snapshot: Option<MemoryDb>,
    canceled: Arc<AtomicBool>,
}

struct CancelFlag(Arc<AtomicBool>);

impl Interrupt for CancelFlag {
    fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn unsupported(sql: &str) -> Error {
    Error::sql(
        error_codes::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION,
        format!("memory engine does not support: {}", sql.trim()),
    )
}

struct Stmt<'a> {
    sql: &'a str,
    tokens: Vec<Token>,
    sig: Vec<usize>,
}

impl<'a> Stmt<'a> {
    fn new(sql: &'a str) -> Self {
        let tokens = tokenize(sql);
        let sig = tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                !matches!(
                    t.kind,
                    TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
                )
            })
            .map(|(i, _)| i)
            .collect();
        Stmt { sql, tokens, sig }
    }

    fn tok(&self, pos: usize) -> Option<Token> {
        self.sig.get(pos).map(|&i| self.tokens[i])
    }

    fn word(&self, pos: usize) -> Option<String> {
        self.tok(pos).and_then(|t| {
            if t.kind == TokenKind::Word {
                Some(t.text(self.sql).to_ascii_uppercase())
            } else {
                None
            }
        })
    }

    fn ident(&self, pos: usize) -> Option<String> {
        self.tok(pos).and_then(|t| match t.kind {
            TokenKind::Word => Some(t.text(self.sql).to_ascii_lowercase()),
            TokenKind::QuotedIdent => {
                let text = t.text(self.sql);
                Some(text[1..text.len() - 1].replace("\"\"", "\"").to_lowercase())
            }
            _ => None,
        })
    }

    /// position of the first top-level occurrence of the given keyword
    fn find_word(&self, word: &str) -> Option<usize> {
        let mut depth = 0i32;
        for (pos, &i) in self.sig.iter().enumerate() {
            match self.tokens[i].kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => depth -= 1,
                TokenKind::Word if depth == 0 && self.tokens[i].is_word(self.sql, word) => {
                    return Some(pos)
                }
                _ => (),
            }
        }
        None
    }

    fn literal(&self, pos: usize) -> Option<(Option<String>, &'static str)> {
        let t = self.tok(pos)?;
        match t.kind {
            TokenKind::Number => {
                let text = t.text(self.sql);
                let iris_type = if text.contains('.') || text.contains('e') || text.contains('E') {
                    "NUMERIC"
                } else {
                    "INTEGER"
                };
                Some((Some(text.to_string()), iris_type))
            }
            TokenKind::Str => {
                let text = t.text(self.sql);
                Some((Some(text[1..text.len() - 1].replace("''", "'")), "VARCHAR"))
            }
            TokenKind::Word if t.is_word(self.sql, "NULL") => Some((None, "VARCHAR")),
            TokenKind::Word if t.is_word(self.sql, "TRUE") => {
                Some((Some("t".to_string()), "BOOLEAN"))
            }
            TokenKind::Word if t.is_word(self.sql, "FALSE") => {
                Some((Some("f".to_string()), "BOOLEAN"))
            }
            TokenKind::Op if t.text(self.sql) == "-" => {
                // negative number literal
                let (value, iris_type) = self.literal(pos + 1)?;
                value.map(|v| (Some(format!("-{}", v)), iris_type))
            }
            _ => None,
        }
    }
}

impl MemorySession {
    fn check_canceled(&self) -> Result<()> {
        if self.canceled.swap(false, Ordering::SeqCst) {
            return Err(Error::query_canceled());
        }
        Ok(())
    }

    fn select_without_from(&self, stmt: &Stmt) -> Result<ExecOutcome> {
        let mut columns = Vec::new();
        let mut row = Vec::new();
        let mut pos = 1usize; // after SELECT
        let mut index = 1usize;
        loop {
            // SLEEP(ms) blocks, checking the cancel flag as it waits
            if stmt.word(pos).as_deref() == Some("SLEEP")
                && stmt.tok(pos + 1).map(|t| t.kind) == Some(TokenKind::LParen)
            {
                let (value, _) = stmt
                    .literal(pos + 2)
                    .ok_or_else(|| unsupported(stmt.sql))?;
                let ms: u64 = value
                    .as_deref()
                    .unwrap_or("0")
                    .parse()
                    .map_err(|_| unsupported(stmt.sql))?;
                let mut waited = 0u64;
                while waited < ms {
                    if self.canceled.swap(false, Ordering::SeqCst) {
                        return Err(Error::query_canceled());
                    }
                    std::thread::sleep(Duration::from_millis(10));
                    waited += 10;
                }
                columns.push(Column::new(&format!("column{}", index), "INTEGER"));
                row.push(Some("0".to_string()));
                pos += 4; // SLEEP ( n )
            } else {
                let (value, iris_type) =
                    stmt.literal(pos).ok_or_else(|| unsupported(stmt.sql))?;
                columns.push(Column::new(&format!("column{}", index), iris_type));
                row.push(value);
                pos += 1;
            }
            index += 1;
            match stmt.tok(pos).map(|t| t.kind) {
                Some(TokenKind::Comma) => pos += 1,
                None | Some(TokenKind::Semicolon) => break,
                _ => return Err(unsupported(stmt.sql)),
            }
        }
        Ok(ExecOutcome {
            columns,
            rows: vec![row],
            affected: 0,
        })
    }

    fn select_from(&self, stmt: &Stmt, from_pos: usize) -> Result<ExecOutcome> {
        let table_name = stmt
            .ident(from_pos + 1)
            .ok_or_else(|| unsupported(stmt.sql))?;
        let db = self.db.lock().unwrap();
        let table = db.tables.get(&table_name).ok_or_else(|| {
            Error::sql(
                error_codes::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION,
                format!("Table '{}' not found", table_name),
            )
        })?;

        // projection: * or a list of column names
        let star = stmt
            .tok(1)
            .map(|t| t.kind == TokenKind::Op && t.text(stmt.sql) == "*")
            .unwrap_or(false);
        let projection: Vec<usize> = if star {
            (0..table.columns.len()).collect()
        } else {
            let mut cols = Vec::new();
            let mut pos = 1usize;
            while pos < from_pos {
                let name = stmt.ident(pos).ok_or_else(|| unsupported(stmt.sql))?;
                let idx = table
                    .columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(&name))
                    .ok_or_else(|| {
                        Error::sql(
                            error_codes::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION,
                            format!("Column '{}' not found", name),
                        )
                    })?;
                cols.push(idx);
                pos += 1;
                if stmt.tok(pos).map(|t| t.kind) == Some(TokenKind::Comma) {
                    pos += 1;
                } else {
                    break;
                }
            }
            cols
        };

        let limit = stmt.find_word("LIMIT").and_then(|pos| {
            stmt.literal(pos + 1)
                .and_then(|(v, _)| v)
                .and_then(|v| v.parse::<usize>().ok())
        });

        let mut rows: Vec<Vec<Option<String>>> = table
            .rows
            .iter()
            .map(|row| projection.iter().map(|&i| row[i].clone()).collect())
            .collect();
        if let Some(n) = limit {
            rows.truncate(n);
        }
        let columns = projection
            .iter()
            .map(|&i| table.columns[i].clone())
            .collect();
        Ok(ExecOutcome {
            columns,
            rows,
            affected: 0,
        })
    }

    fn create_table(&self, stmt: &Stmt) -> Result<ExecOutcome> {
        // CREATE TABLE name ( col type [...], ... )
        let name = stmt.ident(2).ok_or_else(|| unsupported(stmt.sql))?;
        let lparen = stmt.find_kind(3, TokenKind::LParen)?;
        let mut columns = Vec::new();
        let mut pos = lparen + 1;
        let mut depth = 1i32;
        let mut item_start = pos;
        loop {
            let Some(tok) = stmt.tok(pos) else { break };
            match tok.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        Self::push_column(stmt, item_start, pos, &mut columns);
                        break;
                    }
                }
                TokenKind::Comma if depth == 1 => {
                    Self::push_column(stmt, item_start, pos, &mut columns);
                    item_start = pos + 1;
                }
                _ => (),
            }
            pos += 1;
        }
        if columns.is_empty() {
            return Err(unsupported(stmt.sql));
        }
        self.db.lock().unwrap().tables.insert(
            name,
            Table {
                columns,
                rows: Vec::new(),
            },
        );
        Ok(ExecOutcome::default())
    }

    fn push_column(stmt: &Stmt, start: usize, end: usize, columns: &mut Vec<Column>) {
        let Some(name) = stmt.ident(start) else { return };
        // skip table constraints
        let upper = name.to_ascii_uppercase();
        if matches!(upper.as_str(), "PRIMARY" | "UNIQUE" | "FOREIGN" | "CHECK" | "CONSTRAINT") {
            return;
        }
        let iris_type = if start + 1 < end {
            stmt.word(start + 1).unwrap_or_else(|| "VARCHAR".to_string())
        } else {
            "VARCHAR".to_string()
        };
        columns.push(Column::new(&name, &iris_type));
    }

    fn insert(&self, stmt: &Stmt, batches: Option<&[Vec<Option<String>>]>) -> Result<ExecOutcome> {
        // INSERT INTO name [(cols)] VALUES (..),(..)
        let name = stmt.ident(2).ok_or_else(|| unsupported(stmt.sql))?;
        let mut db = self.db.lock().unwrap();
        let table = db.tables.get_mut(&name).ok_or_else(|| {
            Error::sql(
                error_codes::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION,
                format!("Table '{}' not found", name),
            )
        })?;

        // optional explicit column list
        let mut pos = 3usize;
        let mut target: Vec<usize> = (0..table.columns.len()).collect();
        if stmt.tok(pos).map(|t| t.kind) == Some(TokenKind::LParen) {
            let mut cols = Vec::new();
            pos += 1;
            loop {
                match stmt.tok(pos).map(|t| t.kind) {
                    Some(TokenKind::RParen) => {
                        pos += 1;
                        break;
                    }
                    Some(TokenKind::Comma) => pos += 1,
                    _ => {
                        let col = stmt.ident(pos).ok_or_else(|| unsupported(stmt.sql))?;
                        let idx = table
                            .columns
                            .iter()
                            .position(|c| c.name.eq_ignore_ascii_case(&col))
                            .ok_or_else(|| {
                                Error::sql(
                                    error_codes::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION,
                                    format!("Column '{}' not found", col),
                                )
                            })?;
                        cols.push(idx);
                        pos += 1;
                    }
                }
            }
            target = cols;
        }

        if stmt.word(pos).as_deref() != Some("VALUES") {
            return Err(unsupported(stmt.sql));
        }
        pos += 1;

        let width = table.columns.len();
        let mut affected = 0u64;

        if let Some(batches) = batches {
            // positional placeholders bound per batch row
            for batch in batches {
                if batch.len() != target.len() {
                    return Err(Error::sql(
                        error_codes::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION,
                        "parameter count does not match column count",
                    ));
                }
                let mut row = vec![None; width];
                for (slot, value) in target.iter().zip(batch.iter()) {
                    row[*slot] = value.clone();
                }
                table.rows.push(row);
                affected += 1;
            }
            return Ok(ExecOutcome {
                affected,
                ..Default::default()
            });
        }

        // literal VALUES groups
        while stmt.tok(pos).map(|t| t.kind) == Some(TokenKind::LParen) {
            pos += 1;
            let mut values = Vec::new();
            loop {
                match stmt.tok(pos).map(|t| t.kind) {
                    Some(TokenKind::RParen) => {
                        pos += 1;
                        break;
                    }
                    Some(TokenKind::Comma) => pos += 1,
                    _ => {
                        let consumed = if stmt
                            .tok(pos)
                            .map(|t| t.kind == TokenKind::Op && t.text(stmt.sql) == "-")
                            .unwrap_or(false)
                        {
                            2
                        } else {
                            1
                        };
                        let (value, _) = stmt.literal(pos).ok_or_else(|| unsupported(stmt.sql))?;
                        values.push(value);
                        pos += consumed;
                    }
                }
            }
            if values.len() != target.len() {
                return Err(Error::sql(
                    error_codes::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION,
                    "value count does not match column count",
                ));
            }
            let mut row = vec![None; width];
            for (slot, value) in target.iter().zip(values.into_iter()) {
                row[*slot] = value;
            }
            table.rows.push(row);
            affected += 1;
            if stmt.tok(pos).map(|t| t.kind) == Some(TokenKind::Comma) {
                pos += 1;
            } else {
                break;
            }
        }
        Ok(ExecOutcome {
            affected,
            ..Default::default()
        })
    }

    fn run(&mut self, sql: &str, batches: Option<&[Vec<Option<String>>]>) -> Result<ExecOutcome> {
        self.check_canceled()?;
        let stmt = Stmt::new(sql);
        match stmt.word(0).as_deref() {
            Some("SELECT") => match stmt.find_word("FROM") {
                Some(from_pos) => self.select_from(&stmt, from_pos),
                None => self.select_without_from(&stmt),
            },
            Some("CREATE") => self.create_table(&stmt),
            Some("DROP") => {
                let name = stmt.ident(2).ok_or_else(|| unsupported(sql))?;
                self.db.lock().unwrap().tables.remove(&name);
                Ok(ExecOutcome::default())
            }
            Some("INSERT") => self.insert(&stmt, batches),
            Some("DELETE") => {
                let from_pos = stmt.find_word("FROM").ok_or_else(|| unsupported(sql))?;
                let name = stmt.ident(from_pos + 1).ok_or_else(|| unsupported(sql))?;
                let mut db = self.db.lock().unwrap();
                let table = db.tables.get_mut(&name).ok_or_else(|| {
                    Error::sql(
                        error_codes::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION,
                        format!("Table '{}' not found", name),
                    )
                })?;
                let affected = table.rows.len() as u64;
                table.rows.clear();
                Ok(ExecOutcome {
                    affected,
                    ..Default::default()
                })
            }
            Some("START") => {
                self.begin()?;
                Ok(ExecOutcome::default())
            }
            Some("COMMIT") => {
                self.commit()?;
                Ok(ExecOutcome::default())
            }
            Some("ROLLBACK") => {
                self.rollback()?;
                Ok(ExecOutcome::default())
            }
            _ => Err(unsupported(sql)),
        }
    }
}

impl Stmt<'_> {
    fn find_kind(&self, from: usize, kind: TokenKind) -> Result<usize> {
        for pos in from..self.sig.len() {
            if self.tok(pos).map(|t| t.kind) == Some(kind) {
                return Ok(pos);
            }
        }
        Err(unsupported(self.sql))
    }
}

impl IrisSession for MemorySession {
    fn execute(&mut self, sql: &str, params: &[Option<String>]) -> Result<ExecOutcome> {
        if !params.is_empty() {
            // the handler substitutes parameters before the bridge
            return Err(unsupported(sql));
        }
        self.run(sql, None)
    }

    fn execute_many(&mut self, sql: &str, batches: &[Vec<Option<String>>]) -> Result<u64> {
        self.check_canceled()?;
        let stmt = Stmt::new(sql);
        if stmt.word(0).as_deref() != Some("INSERT") {
            return Err(unsupported(sql));
        }
        Ok(self.insert(&stmt, Some(batches))?.affected)
    }

    fn begin(&mut self) -> Result<()> {
        self.snapshot = Some(self.db.lock().unwrap().clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(snapshot) = self.snapshot.take() {
            *self.db.lock().unwrap() = snapshot;
        }
        Ok(())
    }

    fn ping(&mut self) -> bool {
        true
    }

    fn interrupt_handle(&self) -> Arc<dyn Interrupt> {
        Arc::new(CancelFlag(self.canceled.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Box<dyn IrisSession> {
        MemoryEngine::new().connect().unwrap()
    }

    #[test]
    fn test_literal_select() {
        let mut s = session();
        let out = s.execute("SELECT 1", &[]).unwrap();
        assert_eq!(out.columns.len(), 1);
        assert_eq!(out.columns[0].iris_type, "INTEGER");
        assert_eq!(out.rows, vec![vec![Some("1".to_string())]]);
    }

    #[test]
    fn test_create_insert_select() {
        let mut s = session();
        s.execute("CREATE TABLE users (id INTEGER, name VARCHAR(50))", &[])
            .unwrap();
        let out = s
            .execute("INSERT INTO users VALUES (1, 'ada'), (2, 'grace')", &[])
            .unwrap();
        assert_eq!(out.affected, 2);
        let out = s.execute("SELECT name FROM users LIMIT 1", &[]).unwrap();
        assert_eq!(out.rows, vec![vec![Some("ada".to_string())]]);
    }

    #[test]
    fn test_rollback_restores_rows() {
        let engine = MemoryEngine::new();
        let mut s = engine.connect().unwrap();
        s.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
        s.begin().unwrap();
        s.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        s.rollback().unwrap();
        let out = s.execute("SELECT * FROM t", &[]).unwrap();
        assert!(out.rows.is_empty());
    }

    #[test]
    fn test_execute_many_batches() {
        let mut s = session();
        s.execute("CREATE TABLE t (id INTEGER, v VARCHAR(10))", &[])
            .unwrap();
        let batches = vec![
            vec![Some("1".to_string()), Some("a".to_string())],
            vec![Some("2".to_string()), Some("b".to_string())],
        ];
        let affected = s
            .execute_many("INSERT INTO t (id, v) VALUES (?, ?)", &batches)
            .unwrap();
        assert_eq!(affected, 2);
    }

    #[test]
    fn test_interrupt_cancels_sleep() {
        let mut s = session();
        let interrupt = s.interrupt_handle();
        interrupt.interrupt();
        let err = s.execute("SELECT SLEEP(5000)", &[]).unwrap_err();
        assert_eq!(err.sqlstate(), "57014");
    }
}
