//! The link registry: CRUD over affiliate links with slug uniqueness, the
//! per-account active-link cap, and the no-delete-after-conversion rule.

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::config::AffiliateSettings;
use crate::error::CoreError;
use crate::types::{AffiliateLink, LinkStatus, LinkType};

const LINK_COLUMNS: &str = "id, owner_id, slug, link_type, product_id, category_id, status, \
     commission_rate, expires_at, click_count, conversion_count, last_click_at, created_at";

pub const SLUG_LEN: usize = 8;

/// How many generated slugs we try before giving up on an astronomically
/// unlucky run of collisions.
const SLUG_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct CreateLink {
    pub owner_id: Uuid,
    pub slug: Option<String>,
    pub link_type: LinkType,
    pub product_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub commission_rate: Option<Decimal>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateLink {
    pub status: Option<LinkStatus>,
    pub commission_rate: Option<Decimal>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub fn generate_slug() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..SLUG_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// The target reference must match the link type, and only that reference
/// may be set.
pub fn validate_target(
    link_type: LinkType,
    product_id: Option<Uuid>,
    category_id: Option<Uuid>,
) -> Result<(), CoreError> {
    let ok = match link_type {
        LinkType::Generic => product_id.is_none() && category_id.is_none(),
        LinkType::Product => product_id.is_some() && category_id.is_none(),
        LinkType::Category => product_id.is_none() && category_id.is_some(),
    };
    if ok {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "target reference does not match link type {}",
            link_type.as_str()
        )))
    }
}

/// Creates a link. The slug is generated with a collision-retry loop when
/// not supplied; an explicitly supplied slug that collides is the caller's
/// problem and surfaces as `SlugTaken`.
pub async fn create(
    pool: &PgPool,
    settings: &AffiliateSettings,
    req: CreateLink,
) -> Result<AffiliateLink, CoreError> {
    validate_target(req.link_type, req.product_id, req.category_id)?;
    if let Some(slug) = &req.slug {
        if slug.is_empty() || slug.len() > 64 {
            return Err(CoreError::Validation(
                "slug must be between 1 and 64 characters".into(),
            ));
        }
    }

    let (active_count,): (i64,) = sqlx::query_as(
        r#"SELECT COUNT(*) FROM affiliate_links WHERE owner_id = $1 AND status = 'active'"#,
    )
    .bind(req.owner_id)
    .fetch_one(pool)
    .await?;
    if active_count >= settings.max_links_per_account {
        return Err(CoreError::LinkLimitExceeded);
    }

    let explicit = req.slug.is_some();
    let attempts = if explicit { 1 } else { SLUG_ATTEMPTS };
    let mut last_err = CoreError::SlugTaken;

    for _ in 0..attempts {
        let slug = req.slug.clone().unwrap_or_else(generate_slug);
        let query = format!(
            "INSERT INTO affiliate_links
                 (id, owner_id, slug, link_type, product_id, category_id, status, commission_rate, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, $8)
             RETURNING {LINK_COLUMNS}"
        );
        let res: Result<AffiliateLink, sqlx::Error> = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(req.owner_id)
            .bind(&slug)
            .bind(req.link_type.as_str())
            .bind(req.product_id)
            .bind(req.category_id)
            .bind(req.commission_rate)
            .bind(req.expires_at)
            .fetch_one(pool)
            .await;

        match res {
            Ok(link) => {
                info!(link_id = %link.id, owner_id = %req.owner_id, slug = %slug, "link created");
                return Ok(link);
            }
            Err(e) if CoreError::is_unique_violation(&e) => {
                last_err = CoreError::SlugTaken;
            }
            Err(e) => return Err(CoreError::Db(e)),
        }
    }

    Err(last_err)
}

pub async fn get(pool: &PgPool, link_id: Uuid) -> Result<AffiliateLink, CoreError> {
    let query = format!("SELECT {LINK_COLUMNS} FROM affiliate_links WHERE id = $1");
    let link: Option<AffiliateLink> = sqlx::query_as(&query)
        .bind(link_id)
        .fetch_optional(pool)
        .await?;
    link.ok_or(CoreError::LinkNotFound)
}

/// Lists an owner's links, newest first.
pub async fn list_for_owner(
    pool: &PgPool,
    owner_id: Uuid,
    page: u32,
    per_page: u32,
) -> Result<(Vec<AffiliateLink>, u64), CoreError> {
    let (total,): (i64,) =
        sqlx::query_as(r#"SELECT COUNT(*) FROM affiliate_links WHERE owner_id = $1"#)
            .bind(owner_id)
            .fetch_one(pool)
            .await?;

    let offset = (page.saturating_sub(1) as i64) * per_page as i64;
    let query = format!(
        "SELECT {LINK_COLUMNS} FROM affiliate_links
         WHERE owner_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
    );
    let links: Vec<AffiliateLink> = sqlx::query_as(&query)
        .bind(owner_id)
        .bind(per_page as i64)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    Ok((links, total as u64))
}

/// Mutable fields only; ownership, slug and target are fixed at creation.
pub async fn update(
    pool: &PgPool,
    link_id: Uuid,
    changes: UpdateLink,
) -> Result<AffiliateLink, CoreError> {
    let query = format!(
        "UPDATE affiliate_links
         SET status = COALESCE($2, status),
             commission_rate = COALESCE($3, commission_rate),
             expires_at = COALESCE($4, expires_at)
         WHERE id = $1
         RETURNING {LINK_COLUMNS}"
    );
    let link: Option<AffiliateLink> = sqlx::query_as(&query)
        .bind(link_id)
        .bind(changes.status.map(|s| s.as_str()))
        .bind(changes.commission_rate)
        .bind(changes.expires_at)
        .fetch_optional(pool)
        .await?;
    link.ok_or(CoreError::LinkNotFound)
}

/// Deletes a link and its clicks. Refused once the link has conversions;
/// those are historical commission provenance and the link must be
/// deactivated instead.
pub async fn delete(pool: &PgPool, link_id: Uuid) -> Result<(), CoreError> {
    let mut tx = pool.begin().await?;

    let link: Option<(Uuid,)> =
        sqlx::query_as(r#"SELECT id FROM affiliate_links WHERE id = $1 FOR UPDATE"#)
            .bind(link_id)
            .fetch_optional(tx.as_mut())
            .await?;
    if link.is_none() {
        return Err(CoreError::LinkNotFound);
    }

    let (has_conversions,): (bool,) = sqlx::query_as(
        r#"SELECT EXISTS (SELECT 1 FROM affiliate_conversions WHERE link_id = $1)"#,
    )
    .bind(link_id)
    .fetch_one(tx.as_mut())
    .await?;
    if has_conversions {
        return Err(CoreError::HasConversions);
    }

    // Clicks cascade with the link.
    sqlx::query(r#"DELETE FROM affiliate_links WHERE id = $1"#)
        .bind(link_id)
        .execute(tx.as_mut())
        .await?;
    tx.commit().await?;

    info!(link_id = %link_id, "link deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_slugs_are_lowercase_alphanumeric() {
        for _ in 0..50 {
            let slug = generate_slug();
            assert_eq!(slug.len(), SLUG_LEN);
            assert!(
                slug.chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            );
        }
    }

    #[test]
    fn target_must_match_link_type() {
        let pid = Some(Uuid::new_v4());
        let cid = Some(Uuid::new_v4());

        assert!(validate_target(LinkType::Generic, None, None).is_ok());
        assert!(validate_target(LinkType::Product, pid, None).is_ok());
        assert!(validate_target(LinkType::Category, None, cid).is_ok());

        assert!(validate_target(LinkType::Generic, pid, None).is_err());
        assert!(validate_target(LinkType::Product, None, None).is_err());
        assert!(validate_target(LinkType::Product, pid, cid).is_err());
        assert!(validate_target(LinkType::Category, pid, None).is_err());
    }
}
