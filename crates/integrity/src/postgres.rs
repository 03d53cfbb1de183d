//! PostgreSQL execution of deferred actions
//!
//! Runs registered statements on the enclosing sqlx transaction right
//! before it commits.

use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{Postgres, Transaction};
use tracing::debug;

use crate::deferred::{DeferredActions, DeferredStatement, SqlParam};
use crate::entity::EntityId;
use crate::error::IntegrityResult;

fn bind_param<'q>(query: Query<'q, Postgres, PgArguments>, param: &'q SqlParam) -> Query<'q, Postgres, PgArguments> {
    match param {
        EntityId::Int(value) => query.bind(*value),
        EntityId::Uuid(value) => query.bind(*value),
        EntityId::Text(value) => query.bind(value.as_str()),
    }
}

async fn execute_statement(
    tx: &mut Transaction<'_, Postgres>,
    statement: &DeferredStatement,
) -> IntegrityResult<u64> {
    let mut query = sqlx::query(&statement.sql);
    for param in &statement.params {
        query = bind_param(query, param);
    }
    let result = query.execute(&mut **tx).await?;
    Ok(result.rows_affected())
}

/// Run every deferred statement on `tx` in registration order
pub async fn run_before_commit(
    actions: DeferredActions,
    tx: &mut Transaction<'_, Postgres>,
) -> IntegrityResult<u64> {
    let mut affected = 0;
    for statement in actions.into_statements() {
        debug!("Running deferred statement before commit: {}", statement);
        affected += execute_statement(tx, &statement).await?;
    }
    Ok(affected)
}

/// Run the deferred statements, then commit the transaction
///
/// The transaction is dropped (and rolled back) if any statement fails.
pub async fn commit_with(
    actions: DeferredActions,
    mut tx: Transaction<'_, Postgres>,
) -> IntegrityResult<u64> {
    let affected = run_before_commit(actions, &mut tx).await?;
    tx.commit().await?;
    debug!("Committed transaction after {} deferred row updates", affected);
    Ok(affected)
}
