//! Replicated command payloads.
//!
//! A log entry carries a [`RawCommand`]: the submitted text plus the
//! encoding it was submitted in. Entries are decoded into a [`Command`] only
//! when the state machine applies them, so a malformed payload still commits
//! and is recorded as applied-with-error instead of stalling the log.

use crate::errors::StoreError;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref USE_DIRECTIVE: Regex =
        Regex::new(r"(?i)^\s*USE\s+([a-zA-Z0-9_]+)\s*;").expect("valid USE directive pattern");
}

/// Payload convention of a raw command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandEncoding {
    /// A JSON record `{"SQL": "<statement>"}` holding one statement.
    Structured,
    /// Text of the form `USE <db>; <stmt1>; <stmt2>; ...`.
    Directive,
}

/// An undecoded command as it travels through the replicated log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawCommand {
    /// How `payload` is to be decoded.
    pub encoding: CommandEncoding,
    /// The submitted text.
    pub payload: String,
}

/// The structured command record.
#[derive(Debug, Serialize, Deserialize)]
pub struct StructuredRecord {
    /// The statement to execute.
    #[serde(rename = "SQL")]
    pub sql: String,
}

/// A decoded command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// One statement against the group's database.
    Structured {
        /// The statement.
        sql: String,
    },
    /// Statements against a named database.
    Directive {
        /// Database named by the `USE` directive.
        database: String,
        /// Statements in submission order.
        statements: Vec<String>,
    },
}

impl RawCommand {
    /// Builds a structured command for a single statement.
    pub fn structured<S: AsRef<str>>(sql: S) -> Self {
        let payload = serde_json::json!({ "SQL": sql.as_ref() }).to_string();
        Self {
            encoding: CommandEncoding::Structured,
            payload,
        }
    }

    /// Builds a directive command from `USE <db>; ...` text.
    pub fn directive<S: Into<String>>(text: S) -> Self {
        Self {
            encoding: CommandEncoding::Directive,
            payload: text.into(),
        }
    }

    /// Engine no-op payload.
    pub(crate) fn empty() -> Self {
        Self {
            encoding: CommandEncoding::Structured,
            payload: String::new(),
        }
    }

    /// Decodes the payload according to its encoding.
    pub fn decode(&self) -> Result<Command, StoreError> {
        match self.encoding {
            CommandEncoding::Structured => {
                let record: StructuredRecord = serde_json::from_str(&self.payload)
                    .map_err(|e| StoreError::ParseError(e.to_string()))?;
                Ok(Command::Structured { sql: record.sql })
            }
            CommandEncoding::Directive => {
                let (database, statements) = parse_use_query(&self.payload)?;
                Ok(Command::Directive {
                    database,
                    statements,
                })
            }
        }
    }
}

impl Command {
    /// Database named by the command, if any.
    pub fn database(&self) -> Option<&str> {
        match self {
            Command::Structured { .. } => None,
            Command::Directive { database, .. } => Some(database),
        }
    }

    /// Statements to execute, in order.
    pub fn statements(&self) -> Vec<&str> {
        match self {
            Command::Structured { sql } => vec![sql.as_str()],
            Command::Directive { statements, .. } => {
                statements.iter().map(String::as_str).collect()
            }
        }
    }
}

/// Parses `USE db; SQL1; SQL2;` into the database name and its statements.
///
/// Statements are split on `;`, trimmed, and empty pieces are dropped, so a
/// missing trailing semicolon is tolerated.
pub fn parse_use_query(sql: &str) -> Result<(String, Vec<String>), StoreError> {
    let captures = USE_DIRECTIVE
        .captures(sql)
        .ok_or(StoreError::NoDatabaseDirective)?;
    let (directive, database) = match (captures.get(0), captures.get(1)) {
        (Some(directive), Some(database)) => (directive, database),
        _ => return Err(StoreError::NoDatabaseDirective),
    };
    let statements = sql[directive.end()..]
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    Ok((database.as_str().to_string(), statements))
}
