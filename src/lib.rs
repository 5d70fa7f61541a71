//! The affiliate ledger & attribution engine.
//!
//! Attributes completed orders to the affiliate link that drove them,
//! computes level-1 and level-2 commissions, keeps each account's running
//! balance fields consistent, and governs the withdrawal lifecycle.

mod api;
pub mod commission;
mod config;
mod error;
pub mod ledger;
pub mod links;
mod responses;
pub mod tracking;
mod types;
pub mod withdrawal;

use anyhow::Context;
use anyhow::Result;
pub use api::{AppState, init_router};
pub use config::{AffiliateSettings, Config};
pub use error::CoreError;
use sqlx::{PgPool, postgres::PgPoolOptions};
pub use tracking::{ConversionOutcome, TrackingStore};
pub use types::{
    Account, AccountRole, AccountStatus, AffiliateClick, AffiliateLink, BankAccount, Commission,
    CommissionStatus, Conversion, LinkStatus, LinkType, Withdrawal, WithdrawalStatus,
};

/// Initializes the database pool.
pub async fn init_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}
