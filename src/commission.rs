//! The commission engine: turns an attributed order into level-1 and
//! (when the upline qualifies) level-2 commission rows, and drives the
//! pending/paid/cancelled lifecycle with its ledger effects.

use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::config::AffiliateSettings;
use crate::error::CoreError;
use crate::ledger;
use crate::types::{AccountRole, AccountStatus, Commission, CommissionStatus};

/// The slice of an account the engine needs to decide payout eligibility.
#[derive(Debug, Clone)]
pub struct PayeeProfile {
    pub account_id: Uuid,
    pub status: AccountStatus,
    pub role: AccountRole,
    pub commission_rate: Option<Decimal>,
    pub referred_by: Option<Uuid>,
}

/// One commission the engine decided to create. Rates are snapshotted here;
/// later settings changes never alter recorded rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionDraft {
    pub account_id: Uuid,
    pub level: i32,
    pub rate: Decimal,
    pub amount: Decimal,
}

/// Level-1 rate precedence: link override, then the payee's account default,
/// then the settings-wide default.
pub fn level_one_rate(
    link_rate: Option<Decimal>,
    owner: &PayeeProfile,
    settings: &AffiliateSettings,
) -> Decimal {
    link_rate
        .or(owner.commission_rate)
        .unwrap_or(settings.default_commission_rate)
}

/// Decides which commissions an order produces. Pure; the caller loads the
/// profiles and executes the drafts inside its transaction.
///
/// The level-2 amount is a fraction of the upline's own rate applied to the
/// order value, an override/markup, not a second full-rate commission.
pub fn plan(
    order_value: Decimal,
    link_rate: Option<Decimal>,
    owner: &PayeeProfile,
    upline: Option<&PayeeProfile>,
    settings: &AffiliateSettings,
) -> Vec<CommissionDraft> {
    let mut drafts = Vec::with_capacity(2);

    // Fail closed: a suspended owner earns nothing, and without a level-1
    // payee there is no chain to walk.
    if owner.status != AccountStatus::Active {
        return drafts;
    }

    let rate = level_one_rate(link_rate, owner, settings);
    let amount = order_value * rate;
    if amount > Decimal::ZERO {
        drafts.push(CommissionDraft {
            account_id: owner.account_id,
            level: 1,
            rate,
            amount,
        });
    }

    if let Some(up) = upline {
        if up.status == AccountStatus::Active && up.role.referrer_eligible() {
            let up_rate = up
                .commission_rate
                .unwrap_or(settings.default_commission_rate)
                * settings.level_two_factor;
            let up_amount = order_value * up_rate;
            if up_amount > Decimal::ZERO {
                drafts.push(CommissionDraft {
                    account_id: up.account_id,
                    level: 2,
                    rate: up_rate,
                    amount: up_amount,
                });
            }
        }
    }

    drafts
}

/// Loads the payout-relevant slice of an account inside the caller's
/// transaction.
pub async fn load_profile(
    tx: &mut Transaction<'_, Postgres>,
    account_id: Uuid,
) -> Result<Option<PayeeProfile>, CoreError> {
    let row: Option<(Uuid, String, String, Option<Decimal>, Option<Uuid>)> = sqlx::query_as(
        r#"SELECT id, status, role, commission_rate, referred_by FROM accounts WHERE id = $1"#,
    )
    .bind(account_id)
    .fetch_optional(tx.as_mut())
    .await?;

    let Some((id, status, role, commission_rate, referred_by)) = row else {
        return Ok(None);
    };

    Ok(Some(PayeeProfile {
        account_id: id,
        status: AccountStatus::from_str(&status)?,
        role: AccountRole::from_str(&role)?,
        commission_rate,
        referred_by,
    }))
}

/// Inserts the drafted commission rows (`pending`) and accrues each payee's
/// `total_commission` by the same amount, all on the caller's transaction.
/// The spendable balance only moves when a commission is later paid.
pub async fn record(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
    order_value: Decimal,
    drafts: &[CommissionDraft],
) -> Result<Vec<Commission>, CoreError> {
    let mut rows = Vec::with_capacity(drafts.len());

    for draft in drafts {
        let row: Commission = sqlx::query_as(
            r#"INSERT INTO commissions (id, account_id, order_id, level, order_value, rate, amount, status)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
               RETURNING id, account_id, order_id, level, order_value, rate, amount, status, created_at, paid_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(draft.account_id)
        .bind(order_id)
        .bind(draft.level)
        .bind(order_value)
        .bind(draft.rate)
        .bind(draft.amount)
        .fetch_one(tx.as_mut())
        .await?;

        ledger::add_total_commission(tx, draft.account_id, draft.amount).await?;

        info!(
            commission_id = %row.id,
            account_id = %draft.account_id,
            order_id = %order_id,
            level = draft.level,
            amount = %draft.amount,
            "commission recorded"
        );
        rows.push(row);
    }

    Ok(rows)
}

/// The spendable-balance delta of moving a commission between statuses:
/// the difference between what each status has paid out.
pub fn rebalance_delta(
    from: CommissionStatus,
    to: CommissionStatus,
    amount: Decimal,
) -> Decimal {
    paid_portion(to, amount) - paid_portion(from, amount)
}

fn paid_portion(status: CommissionStatus, amount: Decimal) -> Decimal {
    match status {
        CommissionStatus::Paid => amount,
        CommissionStatus::Pending | CommissionStatus::Cancelled => Decimal::ZERO,
    }
}

/// Moves a commission to a new status and applies the matching ledger
/// effect in one transaction. The row is locked for the duration so
/// concurrent status changes against the same commission serialize.
pub async fn set_status(
    pool: &PgPool,
    commission_id: Uuid,
    new_status: CommissionStatus,
) -> Result<Commission, CoreError> {
    let mut tx = pool.begin().await?;

    let row: Option<Commission> = sqlx::query_as(
        r#"SELECT id, account_id, order_id, level, order_value, rate, amount, status, created_at, paid_at
           FROM commissions WHERE id = $1 FOR UPDATE"#,
    )
    .bind(commission_id)
    .fetch_optional(tx.as_mut())
    .await?;

    let current = row.ok_or(CoreError::CommissionNotFound)?;
    let from = CommissionStatus::from_str(&current.status)?;
    if from == new_status {
        return Err(CoreError::AlreadyProcessed);
    }

    let delta = rebalance_delta(from, new_status, current.amount);
    if delta > Decimal::ZERO {
        ledger::add_available(&mut tx, current.account_id, delta).await?;
    } else if delta < Decimal::ZERO {
        ledger::sub_available(&mut tx, current.account_id, -delta).await?;
    }

    let paid_at = match new_status {
        CommissionStatus::Paid => Some(Utc::now()),
        CommissionStatus::Pending | CommissionStatus::Cancelled => None,
    };

    let updated: Commission = sqlx::query_as(
        r#"UPDATE commissions SET status = $2, paid_at = $3 WHERE id = $1
           RETURNING id, account_id, order_id, level, order_value, rate, amount, status, created_at, paid_at"#,
    )
    .bind(commission_id)
    .bind(new_status.as_str())
    .bind(paid_at)
    .fetch_one(tx.as_mut())
    .await?;

    tx.commit().await?;

    info!(
        commission_id = %commission_id,
        from = from.as_str(),
        to = new_status.as_str(),
        balance_delta = %delta,
        "commission status changed"
    );

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn profile(
        status: AccountStatus,
        role: AccountRole,
        rate: Option<&str>,
    ) -> PayeeProfile {
        PayeeProfile {
            account_id: Uuid::new_v4(),
            status,
            role,
            commission_rate: rate.map(dec),
            referred_by: None,
        }
    }

    fn settings() -> AffiliateSettings {
        AffiliateSettings {
            default_commission_rate: dec("0.05"),
            level_two_factor: dec("0.30"),
            ..AffiliateSettings::default()
        }
    }

    #[test]
    fn two_level_payout_amounts() {
        // order 1,000,000 at link rate 0.15; upline agent at 0.10 with
        // factor 0.30 -> 150,000 and 30,000
        let owner = profile(AccountStatus::Active, AccountRole::Agent, Some("0.08"));
        let upline = profile(AccountStatus::Active, AccountRole::Agent, Some("0.10"));
        let drafts = plan(
            dec("1000000"),
            Some(dec("0.15")),
            &owner,
            Some(&upline),
            &settings(),
        );

        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].level, 1);
        assert_eq!(drafts[0].amount, dec("150000.00"));
        assert_eq!(drafts[0].rate, dec("0.15"));
        assert_eq!(drafts[1].level, 2);
        assert_eq!(drafts[1].amount, dec("30000.0000"));
        assert_eq!(drafts[1].account_id, upline.account_id);
    }

    #[test]
    fn rate_precedence_link_then_account_then_default() {
        let owner = profile(AccountStatus::Active, AccountRole::Agent, Some("0.08"));
        let s = settings();

        assert_eq!(level_one_rate(Some(dec("0.15")), &owner, &s), dec("0.15"));
        assert_eq!(level_one_rate(None, &owner, &s), dec("0.08"));

        let bare = profile(AccountStatus::Active, AccountRole::Agent, None);
        assert_eq!(level_one_rate(None, &bare, &s), dec("0.05"));
    }

    #[test]
    fn no_upline_means_single_commission() {
        let owner = profile(AccountStatus::Active, AccountRole::Agent, Some("0.10"));
        let drafts = plan(dec("500000"), None, &owner, None, &settings());
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].level, 1);
    }

    #[test]
    fn ineligible_upline_gets_nothing() {
        let owner = profile(AccountStatus::Active, AccountRole::Agent, Some("0.10"));

        let customer = profile(AccountStatus::Active, AccountRole::Customer, Some("0.10"));
        let drafts = plan(dec("500000"), None, &owner, Some(&customer), &settings());
        assert_eq!(drafts.len(), 1);

        let suspended = profile(AccountStatus::Suspended, AccountRole::Agent, Some("0.10"));
        let drafts = plan(dec("500000"), None, &owner, Some(&suspended), &settings());
        assert_eq!(drafts.len(), 1);
    }

    #[test]
    fn suspended_owner_earns_nothing() {
        let owner = profile(AccountStatus::Suspended, AccountRole::Agent, Some("0.10"));
        let upline = profile(AccountStatus::Active, AccountRole::Agent, Some("0.10"));
        let drafts = plan(dec("500000"), None, &owner, Some(&upline), &settings());
        assert!(drafts.is_empty());
    }

    #[test]
    fn rebalance_delta_matrix() {
        let amt = dec("150000");
        use CommissionStatus::*;

        // paying releases the amount to the balance
        assert_eq!(rebalance_delta(Pending, Paid, amt), amt);
        // cancelling a pending commission never touched the balance
        assert_eq!(rebalance_delta(Pending, Cancelled, amt), Decimal::ZERO);
        // cancelling a paid commission claws the amount back
        assert_eq!(rebalance_delta(Paid, Cancelled, amt), -amt);
        // operator correction back to paid re-credits
        assert_eq!(rebalance_delta(Cancelled, Paid, amt), amt);
        // un-paying reverses the payment
        assert_eq!(rebalance_delta(Paid, Pending, amt), -amt);
    }
}
