use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }
}

/// The rate/limit table the commission engine and link registry consume.
///
/// Read once at startup and passed into each operation as an immutable
/// snapshot, so a single request never observes two different rate tables
/// and tests can run against a fixed one.
#[derive(Debug, Clone)]
pub struct AffiliateSettings {
    /// Fallback level-1 rate when neither the link nor the payee sets one.
    pub default_commission_rate: Decimal,
    /// Fraction of the upline's own rate paid as the level-2 override.
    pub level_two_factor: Decimal,
    /// Smallest withdrawal amount accepted.
    pub min_withdrawal: Decimal,
    /// Withdrawal fee as a fraction of the amount.
    pub withdrawal_fee_rate: Decimal,
    /// Floor for the withdrawal fee.
    pub withdrawal_fee_minimum: Decimal,
    /// Active-link cap per account.
    pub max_links_per_account: i64,
    /// How long a tracking session stays attributable, in seconds.
    pub tracking_window_secs: i64,
}

impl AffiliateSettings {
    pub fn from_env() -> Self {
        Self {
            default_commission_rate: env_or("DEFAULT_COMMISSION_RATE", dec("0.05")),
            level_two_factor: env_or("LEVEL_TWO_FACTOR", dec("0.30")),
            min_withdrawal: env_or("MIN_WITHDRAWAL", dec("100000")),
            withdrawal_fee_rate: env_or("WITHDRAWAL_FEE_RATE", dec("0.01")),
            withdrawal_fee_minimum: env_or("WITHDRAWAL_FEE_MINIMUM", dec("5000")),
            max_links_per_account: env_or("MAX_LINKS_PER_ACCOUNT", 10),
            tracking_window_secs: env_or("TRACKING_WINDOW_SECS", 7 * 24 * 3600),
        }
    }
}

impl Default for AffiliateSettings {
    fn default() -> Self {
        Self {
            default_commission_rate: dec("0.05"),
            level_two_factor: dec("0.30"),
            min_withdrawal: dec("100000"),
            withdrawal_fee_rate: dec("0.01"),
            withdrawal_fee_minimum: dec("5000"),
            max_links_per_account: 10,
            tracking_window_secs: 7 * 24 * 3600,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn dec(s: &str) -> Decimal {
    // Only called on literals above; a typo there is a programming error.
    Decimal::from_str(s).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = AffiliateSettings::default();
        assert!(s.default_commission_rate > Decimal::ZERO);
        assert!(s.level_two_factor < Decimal::ONE);
        assert!(s.min_withdrawal > Decimal::ZERO);
        assert!(s.max_links_per_account > 0);
    }
}
