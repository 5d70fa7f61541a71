//! The withdrawal workflow: reserves funds from the available balance at
//! request time and resolves each request to a terminal state with the
//! matching ledger effect.

use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::config::AffiliateSettings;
use crate::error::CoreError;
use crate::ledger;
use crate::types::{Withdrawal, WithdrawalStatus};

const WITHDRAWAL_COLUMNS: &str = "id, account_id, bank_account_id, amount, fee, status, \
     cancelled_by_owner, note, requested_at, processed_at";

/// The fee shown to the requester: a fraction of the amount with a floor.
/// Display only; the ledger always moves the full `amount`.
pub fn fee_for(amount: Decimal, settings: &AffiliateSettings) -> Decimal {
    let rated = amount * settings.withdrawal_fee_rate;
    rated.max(settings.withdrawal_fee_minimum)
}

/// The ledger effect of a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionEffect {
    /// Return the reserved amount to the available balance.
    RefundBalance,
    /// Book the reserved amount as withdrawn; the balance already moved at
    /// creation.
    BookWithdrawn,
    /// No ledger movement (the processing intermediate).
    None,
}

/// Which transitions are legal, and what each does to the ledger.
pub fn resolution_effect(
    from: WithdrawalStatus,
    to: WithdrawalStatus,
) -> Result<ResolutionEffect, CoreError> {
    use WithdrawalStatus::*;
    match (from, to) {
        (Pending, Processing) => Ok(ResolutionEffect::None),
        (Pending | Processing, Rejected) => Ok(ResolutionEffect::RefundBalance),
        (Pending | Processing, Completed) => Ok(ResolutionEffect::BookWithdrawn),
        (Completed | Rejected, _) => Err(CoreError::AlreadyProcessed),
        (Pending | Processing, Pending) | (Processing, Processing) => Err(
            CoreError::Validation("withdrawal cannot return to an earlier state".into()),
        ),
    }
}

/// Creates a withdrawal request, reserving `amount` from the account's
/// available balance in the same transaction as the insert. The partial
/// unique index on pending withdrawals turns a concurrent duplicate request
/// into a clean conflict instead of a double reservation.
pub async fn create(
    pool: &PgPool,
    settings: &AffiliateSettings,
    account_id: Uuid,
    bank_account_id: Uuid,
    amount: Decimal,
) -> Result<Withdrawal, CoreError> {
    if amount <= Decimal::ZERO {
        return Err(CoreError::Validation("amount must be positive".into()));
    }
    if amount < settings.min_withdrawal {
        return Err(CoreError::BelowMinimumWithdrawal {
            minimum: settings.min_withdrawal,
        });
    }

    let bank: Option<(Uuid,)> = sqlx::query_as(
        r#"SELECT id FROM bank_accounts WHERE id = $1 AND account_id = $2"#,
    )
    .bind(bank_account_id)
    .bind(account_id)
    .fetch_optional(pool)
    .await?;
    if bank.is_none() {
        return Err(CoreError::BankAccountNotFound);
    }

    let fee = fee_for(amount, settings);

    let mut tx = pool.begin().await?;
    ledger::sub_available(&mut tx, account_id, amount).await?;

    let query = format!(
        "INSERT INTO withdrawals (id, account_id, bank_account_id, amount, fee, status)
         VALUES ($1, $2, $3, $4, $5, 'pending')
         RETURNING {WITHDRAWAL_COLUMNS}"
    );
    let row: Withdrawal = sqlx::query_as(&query)
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(bank_account_id)
        .bind(amount)
        .bind(fee)
        .fetch_one(tx.as_mut())
        .await
        .map_err(|e| {
            if CoreError::is_unique_violation(&e) {
                CoreError::PendingWithdrawalConflict
            } else {
                CoreError::Db(e)
            }
        })?;

    tx.commit().await?;

    info!(
        withdrawal_id = %row.id,
        account_id = %account_id,
        amount = %amount,
        fee = %fee,
        "withdrawal requested, balance reserved"
    );
    Ok(row)
}

/// Operator resolution: moves a pending/processing withdrawal forward and
/// applies the ledger effect atomically with the status change.
pub async fn resolve(
    pool: &PgPool,
    withdrawal_id: Uuid,
    new_status: WithdrawalStatus,
    note: Option<String>,
) -> Result<Withdrawal, CoreError> {
    let mut tx = pool.begin().await?;

    let query = format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE id = $1 FOR UPDATE"
    );
    let row: Option<Withdrawal> = sqlx::query_as(&query)
        .bind(withdrawal_id)
        .fetch_optional(tx.as_mut())
        .await?;
    let current = row.ok_or(CoreError::WithdrawalNotFound)?;
    let from = WithdrawalStatus::from_str(&current.status)?;

    match resolution_effect(from, new_status)? {
        ResolutionEffect::RefundBalance => {
            ledger::add_available(&mut tx, current.account_id, current.amount).await?;
        }
        ResolutionEffect::BookWithdrawn => {
            ledger::add_total_withdrawn(&mut tx, current.account_id, current.amount).await?;
        }
        ResolutionEffect::None => {}
    }

    let processed_at = match new_status {
        WithdrawalStatus::Completed | WithdrawalStatus::Rejected => Some(Utc::now()),
        WithdrawalStatus::Pending | WithdrawalStatus::Processing => None,
    };

    let query = format!(
        "UPDATE withdrawals SET status = $2, note = COALESCE($3, note), processed_at = $4
         WHERE id = $1
         RETURNING {WITHDRAWAL_COLUMNS}"
    );
    let updated: Withdrawal = sqlx::query_as(&query)
        .bind(withdrawal_id)
        .bind(new_status.as_str())
        .bind(note)
        .bind(processed_at)
        .fetch_one(tx.as_mut())
        .await?;

    tx.commit().await?;

    info!(
        withdrawal_id = %withdrawal_id,
        from = from.as_str(),
        to = new_status.as_str(),
        amount = %current.amount,
        "withdrawal resolved"
    );
    Ok(updated)
}

/// Owner cancellation. Same ledger effect as a rejection, recorded
/// distinctly for audit.
pub async fn cancel(
    pool: &PgPool,
    withdrawal_id: Uuid,
    account_id: Uuid,
) -> Result<Withdrawal, CoreError> {
    let mut tx = pool.begin().await?;

    let query = format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE id = $1 FOR UPDATE"
    );
    let row: Option<Withdrawal> = sqlx::query_as(&query)
        .bind(withdrawal_id)
        .fetch_optional(tx.as_mut())
        .await?;
    let current = row.ok_or(CoreError::WithdrawalNotFound)?;
    if current.account_id != account_id {
        return Err(CoreError::NotOwner);
    }
    if WithdrawalStatus::from_str(&current.status)? != WithdrawalStatus::Pending {
        return Err(CoreError::AlreadyProcessed);
    }

    ledger::add_available(&mut tx, current.account_id, current.amount).await?;

    let query = format!(
        "UPDATE withdrawals
         SET status = 'rejected', cancelled_by_owner = TRUE, processed_at = $2
         WHERE id = $1
         RETURNING {WITHDRAWAL_COLUMNS}"
    );
    let updated: Withdrawal = sqlx::query_as(&query)
        .bind(withdrawal_id)
        .bind(Utc::now())
        .fetch_one(tx.as_mut())
        .await?;

    tx.commit().await?;

    info!(
        withdrawal_id = %withdrawal_id,
        account_id = %account_id,
        amount = %current.amount,
        "withdrawal cancelled by owner, balance refunded"
    );
    Ok(updated)
}

/// Removes a pending request, refunding the reservation exactly like a
/// rejection before the row disappears.
pub async fn delete(pool: &PgPool, withdrawal_id: Uuid) -> Result<(), CoreError> {
    let mut tx = pool.begin().await?;

    let query = format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE id = $1 FOR UPDATE"
    );
    let row: Option<Withdrawal> = sqlx::query_as(&query)
        .bind(withdrawal_id)
        .fetch_optional(tx.as_mut())
        .await?;
    let current = row.ok_or(CoreError::WithdrawalNotFound)?;
    if WithdrawalStatus::from_str(&current.status)? != WithdrawalStatus::Pending {
        return Err(CoreError::AlreadyProcessed);
    }

    ledger::add_available(&mut tx, current.account_id, current.amount).await?;

    sqlx::query(r#"DELETE FROM withdrawals WHERE id = $1"#)
        .bind(withdrawal_id)
        .execute(tx.as_mut())
        .await?;

    tx.commit().await?;

    info!(
        withdrawal_id = %withdrawal_id,
        amount = %current.amount,
        "pending withdrawal deleted, balance refunded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn settings() -> AffiliateSettings {
        AffiliateSettings {
            withdrawal_fee_rate: dec("0.01"),
            withdrawal_fee_minimum: dec("5000"),
            ..AffiliateSettings::default()
        }
    }

    #[test]
    fn fee_uses_rate_above_the_floor() {
        // 1% of 2,000,000 = 20,000 > 5,000 floor
        assert_eq!(fee_for(dec("2000000"), &settings()), dec("20000"));
    }

    #[test]
    fn fee_floor_applies_to_small_amounts() {
        // 1% of 100,000 = 1,000, below the 5,000 floor
        assert_eq!(fee_for(dec("100000"), &settings()), dec("5000"));
    }

    #[test]
    fn legal_resolutions_and_their_effects() {
        use WithdrawalStatus::*;
        assert_eq!(
            resolution_effect(Pending, Processing).unwrap(),
            ResolutionEffect::None
        );
        assert_eq!(
            resolution_effect(Pending, Rejected).unwrap(),
            ResolutionEffect::RefundBalance
        );
        assert_eq!(
            resolution_effect(Processing, Rejected).unwrap(),
            ResolutionEffect::RefundBalance
        );
        assert_eq!(
            resolution_effect(Pending, Completed).unwrap(),
            ResolutionEffect::BookWithdrawn
        );
        assert_eq!(
            resolution_effect(Processing, Completed).unwrap(),
            ResolutionEffect::BookWithdrawn
        );
    }

    #[test]
    fn terminal_states_reject_further_resolution() {
        use WithdrawalStatus::*;
        for to in [Pending, Processing, Completed, Rejected] {
            assert!(matches!(
                resolution_effect(Completed, to),
                Err(CoreError::AlreadyProcessed)
            ));
            assert!(matches!(
                resolution_effect(Rejected, to),
                Err(CoreError::AlreadyProcessed)
            ));
        }
    }

    #[test]
    fn no_backwards_transitions() {
        use WithdrawalStatus::*;
        assert!(resolution_effect(Processing, Pending).is_err());
        assert!(resolution_effect(Pending, Pending).is_err());
        assert!(resolution_effect(Processing, Processing).is_err());
    }
}
