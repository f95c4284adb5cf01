//! SQL script loading, hashing, and statement splitting.
//!
//! Statement splitting is engine-aware: a naive split on `;` breaks on
//! trigger bodies, so the splitter tracks quoting, comments, and
//! `BEGIN … END` block depth and only terminates a statement on a `;` at
//! depth zero. A `BEGIN` immediately followed by `;`, `TRANSACTION`,
//! `DEFERRED`, `IMMEDIATE`, or `EXCLUSIVE` opens a transaction, not a block.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};

/// A loaded SQL script.
#[derive(Debug, Clone)]
pub struct Script {
    pub path: PathBuf,
    pub content: String,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            content,
        })
    }
}

/// How a script's transactions are managed during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// The adapter wraps the whole script in one transaction that rolls
    /// back on any error.
    Wrap,
    /// The script contains explicit `BEGIN`/`COMMIT`/`ROLLBACK` and manages
    /// its own transactions; the adapter must not add an outer one.
    SelfManaged,
}

/// SHA-1 of the script with trailing whitespace trimmed per line.
pub fn script_hash(content: &str) -> String {
    let normalized: Vec<&str> = content.lines().map(str::trim_end).collect();
    let mut hasher = Sha1::new();
    hasher.update(normalized.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// Decide how a script's transactions are managed by scanning for top-level
/// `BEGIN`/`COMMIT`/`ROLLBACK`, tolerant of whitespace and comments.
pub fn transaction_mode(sql: &str) -> TransactionMode {
    for stmt in split_statements(sql) {
        if let Some(keyword) = first_keyword(&stmt)
            && matches!(keyword.as_str(), "BEGIN" | "COMMIT" | "ROLLBACK")
        {
            return TransactionMode::SelfManaged;
        }
    }
    TransactionMode::Wrap
}

/// First SQL keyword of a statement, skipping whitespace and comments.
pub fn first_keyword(stmt: &str) -> Option<String> {
    let mut scanner = Scanner::new(stmt);
    scanner.next_word().map(|w| w.to_ascii_uppercase())
}

/// Split a script into complete statements.
///
/// Each returned statement retains its terminating `;` (when present) but
/// is trimmed of surrounding whitespace; blank and comment-only trailing
/// content is dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0usize;
    let mut depth = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        let rest = &sql[i..];
        match bytes[i] {
            b'\'' | b'"' | b'`' => {
                i = skip_quoted(sql, i, bytes[i] as char);
            }
            b'[' => {
                i = skip_until(bytes, i + 1, b']');
            }
            b'-' if rest.starts_with("--") => {
                i = skip_until(bytes, i, b'\n');
            }
            b'/' if rest.starts_with("/*") => {
                i = match sql[i + 2..].find("*/") {
                    Some(end) => i + 2 + end + 2,
                    None => bytes.len(),
                };
            }
            b';' if depth == 0 => {
                let stmt = sql[start..=i].trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                start = i + 1;
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let word_end = word_end(bytes, i);
                let word = sql[i..word_end].to_ascii_uppercase();
                match word.as_str() {
                    "BEGIN" => {
                        if !begins_transaction(sql, word_end) {
                            depth += 1;
                        }
                    }
                    "CASE" => depth += 1,
                    "END" => depth = depth.saturating_sub(1),
                    _ => {}
                }
                i = word_end;
            }
            _ => i += 1,
        }
    }

    let tail = sql[start..].trim();
    if !tail.is_empty() && first_keyword(tail).is_some() {
        statements.push(tail.to_string());
    }
    statements
}

/// Whether a `BEGIN` ending at `pos` starts a transaction rather than a
/// compound block.
fn begins_transaction(sql: &str, pos: usize) -> bool {
    let mut scanner = Scanner::new(&sql[pos..]);
    match scanner.next_token() {
        Some(Token::Symbol(';')) | None => true,
        Some(Token::Word(word)) => matches!(
            word.to_ascii_uppercase().as_str(),
            "TRANSACTION" | "DEFERRED" | "IMMEDIATE" | "EXCLUSIVE"
        ),
        Some(Token::Symbol(_)) => false,
    }
}

fn skip_quoted(sql: &str, start: usize, quote: char) -> usize {
    let bytes = sql.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote as u8 {
            // Doubled quote escapes itself.
            if i + 1 < bytes.len() && bytes[i + 1] == quote as u8 {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_until(bytes: &[u8], start: usize, stop: u8) -> usize {
    let mut i = start;
    while i < bytes.len() && bytes[i] != stop {
        i += 1;
    }
    (i + 1).min(bytes.len())
}

fn word_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    i
}

enum Token<'a> {
    Word(&'a str),
    Symbol(char),
}

/// Minimal lookahead scanner over SQL text, skipping whitespace and
/// comments.
struct Scanner<'a> {
    sql: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(sql: &'a str) -> Self {
        Self { sql, pos: 0 }
    }

    fn next_token(&mut self) -> Option<Token<'a>> {
        let bytes = self.sql.as_bytes();
        while self.pos < bytes.len() {
            let rest = &self.sql[self.pos..];
            let c = bytes[self.pos];
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else if rest.starts_with("--") {
                self.pos = skip_until(bytes, self.pos, b'\n');
            } else if rest.starts_with("/*") {
                self.pos = match self.sql[self.pos + 2..].find("*/") {
                    Some(end) => self.pos + 2 + end + 2,
                    None => bytes.len(),
                };
            } else if c.is_ascii_alphabetic() || c == b'_' {
                let end = word_end(bytes, self.pos);
                let word = &self.sql[self.pos..end];
                self.pos = end;
                return Some(Token::Word(word));
            } else {
                self.pos += 1;
                return Some(Token::Symbol(c as char));
            }
        }
        None
    }

    fn next_word(&mut self) -> Option<&'a str> {
        match self.next_token()? {
            Token::Word(word) => Some(word),
            Token::Symbol(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_trims_trailing_whitespace_per_line() {
        let a = script_hash("CREATE TABLE x (id INT);\n");
        let b = script_hash("CREATE TABLE x (id INT);   \n");
        let c = script_hash("CREATE TABLE x (id INT) ;\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn splits_simple_statements() {
        let stmts = split_statements("CREATE TABLE a (id INT);\nCREATE TABLE b (id INT);\n");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], "CREATE TABLE a (id INT);");
    }

    #[test]
    fn trigger_bodies_are_not_split_on_inner_semicolons() {
        let sql = "\
CREATE TABLE logs (msg TEXT);
CREATE TRIGGER trg AFTER INSERT ON logs
BEGIN
    INSERT INTO logs (msg) VALUES ('one');
    INSERT INTO logs (msg) VALUES ('two');
END;
CREATE TABLE more (id INT);
";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 3);
        assert!(stmts[1].contains("VALUES ('two');"));
        assert!(stmts[1].ends_with("END;"));
    }

    #[test]
    fn quoted_semicolons_do_not_terminate_statements() {
        let stmts = split_statements("INSERT INTO t VALUES ('a;b');\nSELECT 1;\n");
        assert_eq!(stmts.len(), 2);

        let stmts = split_statements("INSERT INTO t VALUES ('it''s; fine');");
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn comments_are_ignored_by_the_splitter() {
        let sql = "\
-- leading; comment
CREATE TABLE a (id INT); /* mid; comment */
CREATE TABLE b (id INT);
";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn transaction_mode_detects_self_managed_scripts() {
        assert_eq!(
            transaction_mode("BEGIN;\nCREATE TABLE a (id INT);\nCOMMIT;\n"),
            TransactionMode::SelfManaged
        );
        assert_eq!(
            transaction_mode("-- comment first\nBEGIN;\nSELECT 1;\nCOMMIT;\n"),
            TransactionMode::SelfManaged
        );
        assert_eq!(
            transaction_mode("CREATE TABLE a (id INT);\n"),
            TransactionMode::Wrap
        );
    }

    #[test]
    fn trigger_begin_blocks_do_not_count_as_transactions() {
        let sql = "\
CREATE TRIGGER trg AFTER INSERT ON t
BEGIN
    SELECT 1;
END;
";
        assert_eq!(transaction_mode(sql), TransactionMode::Wrap);
    }

    #[test]
    fn begin_variants_count_as_transactions() {
        for begin in ["BEGIN;", "BEGIN TRANSACTION;", "BEGIN IMMEDIATE;"] {
            let sql = format!("{begin}\nSELECT 1;\nCOMMIT;\n");
            assert_eq!(transaction_mode(&sql), TransactionMode::SelfManaged);
        }
    }

    #[test]
    fn case_expressions_do_not_unbalance_the_depth() {
        let sql = "SELECT CASE WHEN x THEN 1 ELSE 2 END FROM t;\nSELECT 2;\n";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn trailing_statement_without_semicolon_is_kept() {
        let stmts = split_statements("SELECT 1;\nSELECT 2");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1], "SELECT 2");

        let stmts = split_statements("SELECT 1;\n-- just a comment\n");
        assert_eq!(stmts.len(), 1);
    }
}
