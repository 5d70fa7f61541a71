//! The attribution tracker: records link visits, keeps short-lived tracking
//! sessions in memory, and resolves which link (if any) a completed order
//! belongs to.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::commission;
use crate::config::AffiliateSettings;
use crate::error::CoreError;
use crate::types::{AffiliateLink, Commission, Conversion, LinkStatus, LinkType};

/// Coarse client metadata stored with a click. Never used for attribution
/// decisions, only for read-side analytics.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

/// One tracking session: a buyer's browsing session tied to a link for a
/// bounded window.
#[derive(Debug, Clone)]
pub struct TrackingEntry {
    pub link_id: Uuid,
    pub owner_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Ephemeral tracking state. Deliberately outside the durable data model:
/// a lost entry only means an order attributes to nobody, which is normal.
/// Expiry is checked at read time; there is no background eviction.
#[derive(Debug, Default)]
pub struct TrackingStore {
    inner: RwLock<HashMap<Uuid, TrackingEntry>>,
}

impl TrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, link_id: Uuid, owner_id: Uuid, window: Duration) -> Uuid {
        let token = Uuid::new_v4();
        let entry = TrackingEntry {
            link_id,
            owner_id,
            expires_at: Utc::now() + window,
        };
        self.inner
            .write()
            .expect("tracking store lock poisoned")
            .insert(token, entry);
        token
    }

    /// Looks up a token, dropping it when the window has passed.
    pub fn resolve(&self, token: Uuid, now: DateTime<Utc>) -> Option<TrackingEntry> {
        let mut map = self.inner.write().expect("tracking store lock poisoned");
        match map.get(&token) {
            Some(entry) if entry.expires_at > now => Some(entry.clone()),
            Some(_) => {
                map.remove(&token);
                None
            }
            None => None,
        }
    }
}

/// The result of a recorded click.
#[derive(Debug, Clone)]
pub struct ClickOutcome {
    pub click_id: Uuid,
    pub redirect_to: String,
    pub tracking_token: Uuid,
}

/// Where a link sends its visitors. Resolved from the catalog at call time,
/// never cached on the link.
pub fn redirect_path(link_type: LinkType, target_slug: Option<&str>) -> String {
    match (link_type, target_slug) {
        (LinkType::Product, Some(slug)) => format!("/p/{slug}"),
        (LinkType::Category, Some(slug)) => format!("/c/{slug}"),
        // A scoped link whose target vanished from the catalog still
        // resolves; visitors land on the site root.
        (LinkType::Generic, _) | (LinkType::Product, None) | (LinkType::Category, None) => {
            "/".to_string()
        }
    }
}

pub fn link_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(expires_at, Some(at) if at <= now)
}

/// Records a visit to a link and opens a tracking session for the visitor.
///
/// Fails with `LinkNotFound` / `LinkInactive` / `LinkExpired` before any
/// write happens.
pub async fn record_click(
    pool: &PgPool,
    store: &TrackingStore,
    settings: &AffiliateSettings,
    slug: &str,
    meta: ClientMeta,
) -> Result<ClickOutcome, CoreError> {
    let link: Option<AffiliateLink> = sqlx::query_as(
        r#"SELECT id, owner_id, slug, link_type, product_id, category_id, status,
                  commission_rate, expires_at, click_count, conversion_count, last_click_at, created_at
           FROM affiliate_links WHERE slug = $1"#,
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;

    let link = link.ok_or(CoreError::LinkNotFound)?;
    if LinkStatus::from_str(&link.status)? != LinkStatus::Active {
        return Err(CoreError::LinkInactive);
    }
    let now = Utc::now();
    if link_expired(link.expires_at, now) {
        return Err(CoreError::LinkExpired);
    }

    let link_type = LinkType::from_str(&link.link_type)?;
    let target_slug = match link_type {
        LinkType::Generic => None,
        LinkType::Product => {
            let row: Option<(String,)> =
                sqlx::query_as(r#"SELECT slug FROM products WHERE id = $1"#)
                    .bind(link.product_id)
                    .fetch_optional(pool)
                    .await?;
            row.map(|r| r.0)
        }
        LinkType::Category => {
            let row: Option<(String,)> =
                sqlx::query_as(r#"SELECT slug FROM categories WHERE id = $1"#)
                    .bind(link.category_id)
                    .fetch_optional(pool)
                    .await?;
            row.map(|r| r.0)
        }
    };
    let redirect_to = redirect_path(link_type, target_slug.as_deref());

    let mut tx = pool.begin().await?;
    let click_id = Uuid::new_v4();
    sqlx::query(
        r#"INSERT INTO affiliate_clicks (id, link_id, ip, user_agent, referer)
           VALUES ($1, $2, $3, $4, $5)"#,
    )
    .bind(click_id)
    .bind(link.id)
    .bind(&meta.ip)
    .bind(&meta.user_agent)
    .bind(&meta.referer)
    .execute(tx.as_mut())
    .await?;

    sqlx::query(
        r#"UPDATE affiliate_links
           SET click_count = click_count + 1, last_click_at = $2
           WHERE id = $1"#,
    )
    .bind(link.id)
    .bind(now)
    .execute(tx.as_mut())
    .await?;
    tx.commit().await?;

    let tracking_token = store.begin(
        link.id,
        link.owner_id,
        Duration::seconds(settings.tracking_window_secs),
    );

    info!(link_id = %link.id, slug = %slug, click_id = %click_id, "click recorded");

    Ok(ClickOutcome {
        click_id,
        redirect_to,
        tracking_token,
    })
}

/// What attributing an order produced.
#[derive(Debug, Clone)]
pub enum ConversionOutcome {
    /// The order has no affiliate origin. Normal, not an error.
    NoAttribution,
    /// The order was attributed; `already_recorded` marks the idempotent
    /// replay of an earlier attribution.
    Attributed {
        conversion: Conversion,
        commissions: Vec<Commission>,
        already_recorded: bool,
    },
}

/// The order-completion hook. Called once per completed order by the
/// checkout flow; safe to retry because the conversion insert is anchored
/// on the (link, order) uniqueness constraint.
pub async fn attribute_order(
    pool: &PgPool,
    store: &TrackingStore,
    settings: &AffiliateSettings,
    token: Option<Uuid>,
    order_id: Uuid,
    order_value: Decimal,
    buyer_id: Uuid,
) -> Result<ConversionOutcome, CoreError> {
    if order_value <= Decimal::ZERO {
        return Err(CoreError::Validation("order value must be positive".into()));
    }

    let Some(token) = token else {
        return Ok(ConversionOutcome::NoAttribution);
    };
    let Some(entry) = store.resolve(token, Utc::now()) else {
        return Ok(ConversionOutcome::NoAttribution);
    };
    // Buying through your own link earns nothing.
    if entry.owner_id == buyer_id {
        return Ok(ConversionOutcome::NoAttribution);
    }

    let mut tx = pool.begin().await?;

    let link: Option<(Uuid, Uuid, Option<Decimal>)> = sqlx::query_as(
        r#"SELECT id, owner_id, commission_rate FROM affiliate_links WHERE id = $1"#,
    )
    .bind(entry.link_id)
    .fetch_optional(tx.as_mut())
    .await?;
    let Some((link_id, owner_id, link_rate)) = link else {
        // The link vanished between click and purchase.
        return Ok(ConversionOutcome::NoAttribution);
    };

    let owner = commission::load_profile(&mut tx, owner_id)
        .await?
        .ok_or(CoreError::AccountNotFound)?;
    let upline = match owner.referred_by {
        Some(up_id) => commission::load_profile(&mut tx, up_id).await?,
        None => None,
    };

    let drafts = commission::plan(order_value, link_rate, &owner, upline.as_ref(), settings);
    let (rate, direct_amount) = drafts
        .iter()
        .find(|d| d.level == 1)
        .map(|d| (d.rate, d.amount))
        .unwrap_or((
            link_rate.unwrap_or(settings.default_commission_rate),
            Decimal::ZERO,
        ));

    // The idempotency anchor: of two concurrent attributions for the same
    // order, exactly one inserts; the other observes zero rows and replays
    // the winner's result.
    let inserted: Option<Conversion> = sqlx::query_as(
        r#"INSERT INTO affiliate_conversions (id, link_id, order_id, order_value, rate, commission_amount)
           VALUES ($1, $2, $3, $4, $5, $6)
           ON CONFLICT (link_id, order_id) DO NOTHING
           RETURNING id, link_id, order_id, order_value, rate, commission_amount, created_at"#,
    )
    .bind(Uuid::new_v4())
    .bind(link_id)
    .bind(order_id)
    .bind(order_value)
    .bind(rate)
    .bind(direct_amount)
    .fetch_optional(tx.as_mut())
    .await?;

    let Some(conversion) = inserted else {
        let existing: Conversion = sqlx::query_as(
            r#"SELECT id, link_id, order_id, order_value, rate, commission_amount, created_at
               FROM affiliate_conversions WHERE link_id = $1 AND order_id = $2"#,
        )
        .bind(link_id)
        .bind(order_id)
        .fetch_one(tx.as_mut())
        .await?;
        let commissions: Vec<Commission> = sqlx::query_as(
            r#"SELECT id, account_id, order_id, level, order_value, rate, amount, status, created_at, paid_at
               FROM commissions WHERE order_id = $1 ORDER BY level"#,
        )
        .bind(order_id)
        .fetch_all(tx.as_mut())
        .await?;
        tx.commit().await?;
        return Ok(ConversionOutcome::Attributed {
            conversion: existing,
            commissions,
            already_recorded: true,
        });
    };

    let commissions = commission::record(&mut tx, order_id, order_value, &drafts).await?;

    sqlx::query(
        r#"UPDATE affiliate_links SET conversion_count = conversion_count + 1 WHERE id = $1"#,
    )
    .bind(link_id)
    .execute(tx.as_mut())
    .await?;

    tx.commit().await?;

    info!(
        order_id = %order_id,
        link_id = %link_id,
        order_value = %order_value,
        commissions = commissions.len(),
        "order attributed"
    );

    Ok(ConversionOutcome::Attributed {
        conversion,
        commissions,
        already_recorded: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_tokens_expire_at_read_time() {
        let store = TrackingStore::new();
        let link_id = Uuid::new_v4();
        let owner_id = Uuid::new_v4();
        let token = store.begin(link_id, owner_id, Duration::seconds(60));

        let now = Utc::now();
        let entry = store.resolve(token, now).expect("fresh token resolves");
        assert_eq!(entry.link_id, link_id);
        assert_eq!(entry.owner_id, owner_id);

        // Past the window the token is gone, and stays gone.
        assert!(store.resolve(token, now + Duration::seconds(120)).is_none());
        assert!(store.resolve(token, now).is_none());
    }

    #[test]
    fn unknown_token_resolves_to_nothing() {
        let store = TrackingStore::new();
        assert!(store.resolve(Uuid::new_v4(), Utc::now()).is_none());
    }

    #[test]
    fn redirect_targets_by_link_type() {
        assert_eq!(
            redirect_path(LinkType::Product, Some("blue-kettle")),
            "/p/blue-kettle"
        );
        assert_eq!(
            redirect_path(LinkType::Category, Some("kitchen")),
            "/c/kitchen"
        );
        assert_eq!(redirect_path(LinkType::Generic, None), "/");
        // scoped link whose catalog target was removed
        assert_eq!(redirect_path(LinkType::Product, None), "/");
    }

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let now = Utc::now();
        assert!(!link_expired(None, now));
        assert!(!link_expired(Some(now + Duration::hours(1)), now));
        assert!(link_expired(Some(now), now));
        assert!(link_expired(Some(now - Duration::hours(1)), now));
    }
}
