use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// The role of an account. Anything other than `Customer` is eligible to
/// receive upline (level-2) commissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    Customer,
    Agent,
    Distributor,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Customer => "customer",
            AccountRole::Agent => "agent",
            AccountRole::Distributor => "distributor",
        }
    }

    /// Whether this role may earn referral commissions at all.
    pub fn referrer_eligible(&self) -> bool {
        !matches!(self, AccountRole::Customer)
    }
}

impl FromStr for AccountRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(AccountRole::Customer),
            "agent" => Ok(AccountRole::Agent),
            "distributor" => Ok(AccountRole::Distributor),
            other => Err(CoreError::Validation(format!(
                "unknown account role: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Suspended,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "suspended" => Ok(AccountStatus::Suspended),
            other => Err(CoreError::Validation(format!(
                "unknown account status: {other}"
            ))),
        }
    }
}

/// What an affiliate link points at. The matching target reference
/// (`product_id` / `category_id`) must be set for the scoped types and
/// absent for `Generic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Generic,
    Product,
    Category,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Generic => "generic",
            LinkType::Product => "product",
            LinkType::Category => "category",
        }
    }
}

impl FromStr for LinkType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic" => Ok(LinkType::Generic),
            "product" => Ok(LinkType::Product),
            "category" => Ok(LinkType::Category),
            other => Err(CoreError::Validation(format!("unknown link type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    Inactive,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Active => "active",
            LinkStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for LinkStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LinkStatus::Active),
            "inactive" => Ok(LinkStatus::Inactive),
            other => Err(CoreError::Validation(format!(
                "unknown link status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommissionStatus {
    Pending,
    Paid,
    Cancelled,
}

impl CommissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionStatus::Pending => "pending",
            CommissionStatus::Paid => "paid",
            CommissionStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for CommissionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommissionStatus::Pending),
            "paid" => Ok(CommissionStatus::Paid),
            "cancelled" => Ok(CommissionStatus::Cancelled),
            other => Err(CoreError::Validation(format!(
                "unknown commission status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for WithdrawalStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WithdrawalStatus::Pending),
            "processing" => Ok(WithdrawalStatus::Processing),
            "completed" => Ok(WithdrawalStatus::Completed),
            "rejected" => Ok(WithdrawalStatus::Rejected),
            other => Err(CoreError::Validation(format!(
                "unknown withdrawal status: {other}"
            ))),
        }
    }
}

/// An account as the ledger sees it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Account {
    /// The ID of the account.
    pub id: Uuid,
    /// The role of the account (stored lowercase).
    pub role: String,
    /// The status of the account (stored lowercase).
    pub status: String,
    /// The account that referred this one, if any. Set once at registration.
    pub referred_by: Option<Uuid>,
    /// The account-level default commission rate.
    pub commission_rate: Option<Decimal>,
    /// Lifetime earned commission (accrual).
    pub total_commission: Decimal,
    /// Spendable balance.
    pub available_balance: Decimal,
    /// Lifetime paid out.
    pub total_withdrawn: Decimal,
    /// The timestamp when the account was created.
    pub created_at: DateTime<Utc>,
}

/// A bank account a withdrawal pays out to.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BankAccount {
    pub id: Uuid,
    pub account_id: Uuid,
    pub bank_name: String,
    pub number: String,
    pub holder_name: String,
    pub created_at: DateTime<Utc>,
}

/// An affiliate link.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AffiliateLink {
    /// The ID of the link.
    pub id: Uuid,
    /// The account that owns the link.
    pub owner_id: Uuid,
    /// The unique slug the link is visited by.
    pub slug: String,
    /// The type of the link (stored lowercase).
    pub link_type: String,
    /// The target product, when `link_type` is `product`.
    pub product_id: Option<Uuid>,
    /// The target category, when `link_type` is `category`.
    pub category_id: Option<Uuid>,
    /// The status of the link (stored lowercase).
    pub status: String,
    /// The per-link commission rate override.
    pub commission_rate: Option<Decimal>,
    /// When the link stops accepting clicks, if ever.
    pub expires_at: Option<DateTime<Utc>>,
    /// Denormalized click counter.
    pub click_count: i64,
    /// Denormalized conversion counter.
    pub conversion_count: i64,
    /// The timestamp of the most recent click.
    pub last_click_at: Option<DateTime<Utc>>,
    /// The timestamp when the link was created.
    pub created_at: DateTime<Utc>,
}

/// A single recorded link visit. Append-only.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AffiliateClick {
    pub id: Uuid,
    pub link_id: Uuid,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A commission-bearing purchase attributed to a link. At most one exists
/// per (link, order) pair.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Conversion {
    pub id: Uuid,
    pub link_id: Uuid,
    pub order_id: Uuid,
    pub order_value: Decimal,
    /// The level-1 rate in effect at conversion time, snapshotted.
    pub rate: Decimal,
    /// The derived commission amount for the direct link owner.
    pub commission_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// A commission owed to an account for one order at one level.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Commission {
    pub id: Uuid,
    /// The payee.
    pub account_id: Uuid,
    pub order_id: Uuid,
    /// 1 = direct referrer of the buyer, 2 = that referrer's own upline.
    pub level: i32,
    pub order_value: Decimal,
    /// The rate applied, snapshotted at conversion time.
    pub rate: Decimal,
    pub amount: Decimal,
    /// The status of the commission (stored lowercase).
    pub status: String,
    pub created_at: DateTime<Utc>,
    /// Stamped when the commission transitions to paid.
    pub paid_at: Option<DateTime<Utc>>,
}

/// A payout request against an account's available balance.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Withdrawal {
    pub id: Uuid,
    pub account_id: Uuid,
    pub bank_account_id: Uuid,
    /// The amount reserved from the balance at request time.
    pub amount: Decimal,
    /// Computed for display; the ledger moves `amount` only.
    pub fee: Decimal,
    /// The status of the withdrawal (stored lowercase).
    pub status: String,
    /// Whether the request reached `rejected` through owner cancellation.
    pub cancelled_by_owner: bool,
    pub note: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn customer_role_is_not_referrer_eligible() {
        assert!(!AccountRole::Customer.referrer_eligible());
        assert!(AccountRole::Agent.referrer_eligible());
        assert!(AccountRole::Distributor.referrer_eligible());
    }

    #[test]
    fn unknown_status_strings_are_rejected() {
        assert!(WithdrawalStatus::from_str("paid").is_err());
        assert!(CommissionStatus::from_str("processing").is_err());
        assert!(LinkType::from_str("site").is_err());
    }
}
