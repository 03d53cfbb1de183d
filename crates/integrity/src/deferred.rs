//! Deferred actions - raw statements scheduled to run right before commit
//!
//! Used when a policy has to act on rows that were never fetched into the
//! object graph. Statements run in registration order; consuming the list
//! on execution guarantees each one runs at most once.

use std::fmt;
use tracing::debug;

use crate::entity::EntityId;
use crate::error::{IntegrityError, IntegrityResult};
use crate::gateway::PersistenceGateway;
use crate::metadata::JoinTable;

/// Bound parameter of a deferred statement
pub type SqlParam = EntityId;

/// Identifier characters accepted in generated statements
const ALLOWED_IDENTIFIER_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_$";

/// PostgreSQL identifier length limit
const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate and quote a table or column name
pub fn quote_identifier(identifier: &str) -> IntegrityResult<String> {
    if identifier.is_empty() {
        return Err(IntegrityError::IllegalState(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(IntegrityError::IllegalState(format!(
            "Identifier '{}' is too long (max {} characters)",
            identifier, MAX_IDENTIFIER_LEN
        )));
    }

    if let Some(c) = identifier.chars().find(|c| !ALLOWED_IDENTIFIER_CHARS.contains(*c)) {
        return Err(IntegrityError::IllegalState(format!(
            "Identifier '{}' contains invalid character '{}'",
            identifier, c
        )));
    }

    if identifier.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(IntegrityError::IllegalState(format!(
            "Identifier '{}' cannot start with a number",
            identifier
        )));
    }

    Ok(format!("\"{}\"", identifier.replace('"', "\"\"")))
}

/// Shape of a generated statement, kept next to its SQL text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// `UPDATE table SET column = NULL WHERE primary_key = $1`
    NullColumn { table: String, column: String, primary_key: String },
    /// `DELETE FROM table WHERE primary_key = $1`
    DeleteRow { table: String, primary_key: String },
    /// One link row, params are `[owner, target]`
    DeleteLink(JoinTable),
    /// Every link row of one owner
    DeleteLinks(JoinTable),
    /// Hand-written SQL
    Raw,
}

/// A raw, idempotent statement with positional parameters
///
/// Two statements are equal when their SQL and parameters are.
#[derive(Debug, Clone)]
pub struct DeferredStatement {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub kind: StatementKind,
}

impl PartialEq for DeferredStatement {
    fn eq(&self, other: &Self) -> bool {
        self.sql == other.sql && self.params == other.params
    }
}

impl Eq for DeferredStatement {}

impl DeferredStatement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
            kind: StatementKind::Raw,
        }
    }

    fn with_kind(mut self, kind: StatementKind) -> Self {
        self.kind = kind;
        self
    }

    /// `UPDATE table SET column = NULL WHERE pk = $1`
    pub fn null_column(table: &str, column: &str, primary_key: &str, id: EntityId) -> IntegrityResult<Self> {
        Ok(Self::new(
            format!(
                "UPDATE {} SET {} = NULL WHERE {} = $1",
                quote_identifier(table)?,
                quote_identifier(column)?,
                quote_identifier(primary_key)?
            ),
            vec![id],
        )
        .with_kind(StatementKind::NullColumn {
            table: table.to_string(),
            column: column.to_string(),
            primary_key: primary_key.to_string(),
        }))
    }

    /// `DELETE FROM table WHERE pk = $1`
    pub fn delete_row(table: &str, primary_key: &str, id: EntityId) -> IntegrityResult<Self> {
        Ok(Self::new(
            format!(
                "DELETE FROM {} WHERE {} = $1",
                quote_identifier(table)?,
                quote_identifier(primary_key)?
            ),
            vec![id],
        )
        .with_kind(StatementKind::DeleteRow {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
        }))
    }

    /// Remove one link row from a join table
    pub fn delete_link(join: &JoinTable, owner_id: EntityId, target_id: EntityId) -> IntegrityResult<Self> {
        Ok(Self::new(
            format!(
                "DELETE FROM {} WHERE {} = $1 AND {} = $2",
                quote_identifier(&join.table)?,
                quote_identifier(&join.owner_column)?,
                quote_identifier(&join.target_column)?
            ),
            vec![owner_id, target_id],
        )
        .with_kind(StatementKind::DeleteLink(join.clone())))
    }

    /// Remove every link row of one owner from a join table
    pub fn delete_links(join: &JoinTable, owner_id: EntityId) -> IntegrityResult<Self> {
        Ok(Self::new(
            format!(
                "DELETE FROM {} WHERE {} = $1",
                quote_identifier(&join.table)?,
                quote_identifier(&join.owner_column)?
            ),
            vec![owner_id],
        )
        .with_kind(StatementKind::DeleteLinks(join.clone())))
    }
}

impl fmt::Display for DeferredStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        write!(f, "{} [{}]", self.sql, params.join(", "))
    }
}

/// FIFO list of statements to run immediately before the enclosing commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferredActions {
    statements: Vec<DeferredStatement>,
}

impl DeferredActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, statement: DeferredStatement) {
        debug!("Registering deferred statement: {}", statement.sql);
        self.statements.push(statement);
    }

    pub fn extend(&mut self, other: DeferredActions) {
        self.statements.extend(other.statements);
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> &[DeferredStatement] {
        &self.statements
    }

    pub fn into_statements(self) -> Vec<DeferredStatement> {
        self.statements
    }

    /// Execute every statement through the gateway, stopping at the first failure
    pub async fn run(self, gateway: &dyn PersistenceGateway) -> IntegrityResult<u64> {
        let mut affected = 0;
        for statement in self.statements {
            debug!("Running deferred statement: {}", statement);
            affected += gateway.execute_statement(&statement).await?;
        }
        Ok(affected)
    }
}
