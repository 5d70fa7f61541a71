//! Relative-update helpers over the three account ledger fields.
//!
//! Every mutation of `total_commission`, `available_balance` or
//! `total_withdrawn` goes through this module, always as an
//! increment-by-delta executed on the caller's transaction. No caller reads
//! a balance, computes an absolute value in memory and writes it back;
//! concurrent mutations against the same account serialize at the row.

use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::CoreError;

/// Accrues earned commission. Does not touch the spendable balance.
pub async fn add_total_commission(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    delta: Decimal,
) -> Result<(), CoreError> {
    let res = sqlx::query(
        r#"UPDATE accounts SET total_commission = total_commission + $2 WHERE id = $1"#,
    )
    .bind(account_id)
    .bind(delta)
    .execute(tx.as_mut())
    .await?;

    if res.rows_affected() == 0 {
        return Err(CoreError::AccountNotFound);
    }
    Ok(())
}

/// Credits the spendable balance.
pub async fn add_available(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    delta: Decimal,
) -> Result<(), CoreError> {
    let res = sqlx::query(
        r#"UPDATE accounts SET available_balance = available_balance + $2 WHERE id = $1"#,
    )
    .bind(account_id)
    .bind(delta)
    .execute(tx.as_mut())
    .await?;

    if res.rows_affected() == 0 {
        return Err(CoreError::AccountNotFound);
    }
    Ok(())
}

/// Debits the spendable balance, guarded: the update only matches when the
/// balance covers the delta, so a debit that would go negative affects zero
/// rows and fails the whole transaction with `InsufficientBalance`.
pub async fn sub_available(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    delta: Decimal,
) -> Result<(), CoreError> {
    let res = sqlx::query(
        r#"UPDATE accounts
           SET available_balance = available_balance - $2
           WHERE id = $1 AND available_balance >= $2"#,
    )
    .bind(account_id)
    .bind(delta)
    .execute(tx.as_mut())
    .await?;

    if res.rows_affected() == 0 {
        let exists: Option<(Uuid,)> =
            sqlx::query_as(r#"SELECT id FROM accounts WHERE id = $1"#)
                .bind(account_id)
                .fetch_optional(tx.as_mut())
                .await?;
        return Err(match exists {
            Some(_) => CoreError::InsufficientBalance,
            None => CoreError::AccountNotFound,
        });
    }
    Ok(())
}

/// Books a completed payout. Only ever increases.
pub async fn add_total_withdrawn(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
    delta: Decimal,
) -> Result<(), CoreError> {
    let res = sqlx::query(
        r#"UPDATE accounts SET total_withdrawn = total_withdrawn + $2 WHERE id = $1"#,
    )
    .bind(account_id)
    .bind(delta)
    .execute(tx.as_mut())
    .await?;

    if res.rows_affected() == 0 {
        return Err(CoreError::AccountNotFound);
    }
    Ok(())
}
