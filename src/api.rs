use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    middleware,
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
use uuid::Uuid;

use crate::commission;
use crate::config::{AffiliateSettings, Config};
use crate::error::{ApiError, ApiErrorWithMeta, E_DB_FAILURE};
use crate::links::{self, CreateLink, UpdateLink};
use crate::responses::{ApiOk, Pagination, RequestMeta, meta_middleware};
use crate::tracking::{self, ClientMeta, ConversionOutcome, TrackingStore};
use crate::types::{
    Account, AffiliateLink, Commission, CommissionStatus, Conversion, LinkType, Withdrawal,
    WithdrawalStatus,
};
use crate::withdrawal;

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The database pool.
    pub pool: PgPool,
    /// The application configuration.
    pub config: Config,
    /// The rate/limit snapshot consumed by the engine.
    pub settings: AffiliateSettings,
    /// Ephemeral tracking sessions.
    pub tracking: Arc<TrackingStore>,
}

#[derive(Deserialize)]
pub struct PageParams {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl PageParams {
    fn resolve(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self.per_page.unwrap_or(20).clamp(1, 100);
        (page, per_page)
    }
}

/// The response after a link visit: where to send the visitor, and the
/// token the view layer should set on the buyer's session.
#[derive(Serialize)]
pub struct VisitResponse {
    pub click_id: Uuid,
    pub redirect_to: String,
    pub tracking_token: Uuid,
}

/// The order-completion hook payload.
#[derive(Deserialize)]
pub struct AttributeOrderRequest {
    /// The ID of the completed order.
    pub order_id: Uuid,
    /// The order value.
    pub order_value: Decimal,
    /// The buyer, as identified by the auth layer.
    pub buyer_account_id: Uuid,
    /// The tracking token from the buyer's session, if any.
    pub tracking_token: Option<Uuid>,
}

#[derive(Serialize)]
pub struct AttributeOrderResponse {
    pub attributed: bool,
    pub already_recorded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion: Option<Conversion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commissions: Option<Vec<Commission>>,
}

#[derive(Deserialize)]
pub struct CreateLinkRequest {
    pub owner_id: Uuid,
    pub slug: Option<String>,
    pub link_type: LinkType,
    pub product_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub commission_rate: Option<Decimal>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct UpdateLinkRequest {
    pub status: Option<crate::types::LinkStatus>,
    pub commission_rate: Option<Decimal>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct CommissionStatusRequest {
    pub status: CommissionStatus,
}

#[derive(Deserialize)]
pub struct CreateWithdrawalRequest {
    pub account_id: Uuid,
    pub bank_account_id: Uuid,
    pub amount: Decimal,
}

#[derive(Deserialize)]
pub struct ResolveWithdrawalRequest {
    pub status: WithdrawalStatus,
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct CancelWithdrawalRequest {
    pub account_id: Uuid,
}

/// Ledger fields plus the aggregate counters dashboards show.
#[derive(Serialize)]
pub struct AccountSummaryResponse {
    pub account: Account,
    pub link_count: i64,
    pub total_clicks: i64,
    pub total_conversions: i64,
    pub pending_commission_total: Decimal,
}

#[derive(Serialize)]
pub struct LinkStatsResponse {
    pub link_id: Uuid,
    pub click_count: i64,
    pub conversion_count: i64,
    pub commission_total: Decimal,
    pub last_click_at: Option<DateTime<Utc>>,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/l/{slug}", get(visit_link_handler))
        .route("/orders/attribute", post(attribute_order_handler))
        .route("/links", post(create_link_handler))
        .route(
            "/links/{id}",
            get(get_link_handler)
                .patch(update_link_handler)
                .delete(delete_link_handler),
        )
        .route("/links/{id}/stats", get(link_stats_handler))
        .route("/commissions/{id}/status", post(commission_status_handler))
        .route("/withdrawals", post(create_withdrawal_handler))
        .route("/withdrawals/{id}/resolve", post(resolve_withdrawal_handler))
        .route("/withdrawals/{id}/cancel", post(cancel_withdrawal_handler))
        .route("/withdrawals/{id}", delete(delete_withdrawal_handler))
        .route("/accounts/{id}/summary", get(account_summary_handler))
        .route("/accounts/{id}/links", get(list_links_handler))
        .route("/accounts/{id}/commissions", get(list_commissions_handler))
        .route("/accounts/{id}/withdrawals", get(list_withdrawals_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

fn client_meta(headers: &HeaderMap) -> ClientMeta {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ClientMeta {
        ip: header("x-forwarded-for"),
        user_agent: header("user-agent"),
        referer: header("referer"),
    }
}

async fn visit_link_handler(
    State(st): State<AppState>,
    Path(slug): Path<String>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> Result<ApiOk<VisitResponse>, ApiErrorWithMeta> {
    let outcome = tracking::record_click(
        &st.pool,
        &st.tracking,
        &st.settings,
        &slug,
        client_meta(&headers),
    )
    .await
    .map_err(|e| e.into_api(meta.clone()))?;

    Ok(ApiOk::ok(
        "click recorded",
        VisitResponse {
            click_id: outcome.click_id,
            redirect_to: outcome.redirect_to,
            tracking_token: outcome.tracking_token,
        },
        meta,
    ))
}

async fn attribute_order_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<AttributeOrderRequest>,
) -> Result<ApiOk<AttributeOrderResponse>, ApiErrorWithMeta> {
    let outcome = tracking::attribute_order(
        &st.pool,
        &st.tracking,
        &st.settings,
        req.tracking_token,
        req.order_id,
        req.order_value,
        req.buyer_account_id,
    )
    .await
    .map_err(|e| e.into_api(meta.clone()))?;

    let body = match outcome {
        ConversionOutcome::NoAttribution => AttributeOrderResponse {
            attributed: false,
            already_recorded: false,
            conversion: None,
            commissions: None,
        },
        ConversionOutcome::Attributed {
            conversion,
            commissions,
            already_recorded,
        } => AttributeOrderResponse {
            attributed: true,
            already_recorded,
            conversion: Some(conversion),
            commissions: Some(commissions),
        },
    };

    Ok(ApiOk::ok("order attribution resolved", body, meta))
}

async fn create_link_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CreateLinkRequest>,
) -> Result<ApiOk<AffiliateLink>, ApiErrorWithMeta> {
    let link = links::create(
        &st.pool,
        &st.settings,
        CreateLink {
            owner_id: req.owner_id,
            slug: req.slug,
            link_type: req.link_type,
            product_id: req.product_id,
            category_id: req.category_id,
            commission_rate: req.commission_rate,
            expires_at: req.expires_at,
        },
    )
    .await
    .map_err(|e| e.into_api(meta.clone()))?;

    Ok(ApiOk::created("link created", link, meta))
}

async fn get_link_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<AffiliateLink>, ApiErrorWithMeta> {
    let link = links::get(&st.pool, id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("link fetched", link, meta))
}

async fn update_link_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<UpdateLinkRequest>,
) -> Result<ApiOk<AffiliateLink>, ApiErrorWithMeta> {
    let link = links::update(
        &st.pool,
        id,
        UpdateLink {
            status: req.status,
            commission_rate: req.commission_rate,
            expires_at: req.expires_at,
        },
    )
    .await
    .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("link updated", link, meta))
}

async fn delete_link_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<serde_json::Value>, ApiErrorWithMeta> {
    links::delete(&st.pool, id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok(
        "link deleted",
        serde_json::json!({ "deleted": id }),
        meta,
    ))
}

async fn list_links_handler(
    State(st): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(params): Query<PageParams>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<AffiliateLink>>, ApiErrorWithMeta> {
    let (page, per_page) = params.resolve();
    let (rows, total) = links::list_for_owner(&st.pool, account_id, page, per_page)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;

    Ok(ApiOk::ok_paginated(
        "links fetched",
        rows,
        Pagination::new(page, per_page, total),
        meta,
    ))
}

async fn link_stats_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<LinkStatsResponse>, ApiErrorWithMeta> {
    let link = links::get(&st.pool, id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;

    let (commission_total,): (Decimal,) = sqlx::query_as(
        r#"SELECT COALESCE(SUM(commission_amount), 0)
           FROM affiliate_conversions WHERE link_id = $1"#,
    )
    .bind(id)
    .fetch_one(&st.pool)
    .await
    .map_err(|e| {
        ApiError::Internal(e.into())
            .with_meta(meta.clone())
            .with_code(E_DB_FAILURE)
    })?;

    Ok(ApiOk::ok(
        "link stats fetched",
        LinkStatsResponse {
            link_id: link.id,
            click_count: link.click_count,
            conversion_count: link.conversion_count,
            commission_total,
            last_click_at: link.last_click_at,
        },
        meta,
    ))
}

async fn commission_status_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CommissionStatusRequest>,
) -> Result<ApiOk<Commission>, ApiErrorWithMeta> {
    let row = commission::set_status(&st.pool, id, req.status)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("commission status updated", row, meta))
}

async fn create_withdrawal_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CreateWithdrawalRequest>,
) -> Result<ApiOk<Withdrawal>, ApiErrorWithMeta> {
    let row = withdrawal::create(
        &st.pool,
        &st.settings,
        req.account_id,
        req.bank_account_id,
        req.amount,
    )
    .await
    .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::created("withdrawal requested", row, meta))
}

async fn resolve_withdrawal_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<ResolveWithdrawalRequest>,
) -> Result<ApiOk<Withdrawal>, ApiErrorWithMeta> {
    let row = withdrawal::resolve(&st.pool, id, req.status, req.note)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("withdrawal resolved", row, meta))
}

async fn cancel_withdrawal_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CancelWithdrawalRequest>,
) -> Result<ApiOk<Withdrawal>, ApiErrorWithMeta> {
    let row = withdrawal::cancel(&st.pool, id, req.account_id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("withdrawal cancelled", row, meta))
}

async fn delete_withdrawal_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<serde_json::Value>, ApiErrorWithMeta> {
    withdrawal::delete(&st.pool, id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok(
        "withdrawal deleted",
        serde_json::json!({ "deleted": id }),
        meta,
    ))
}

async fn account_summary_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<AccountSummaryResponse>, ApiErrorWithMeta> {
    let db_err = |e: sqlx::Error| {
        ApiError::Internal(e.into())
            .with_meta(meta.clone())
            .with_code(E_DB_FAILURE)
    };

    let account: Option<Account> = sqlx::query_as(
        r#"SELECT id, role, status, referred_by, commission_rate,
                  total_commission, available_balance, total_withdrawn, created_at
           FROM accounts WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(&st.pool)
    .await
    .map_err(db_err)?;
    let account = account.ok_or_else(|| {
        crate::error::CoreError::AccountNotFound.into_api(meta.clone())
    })?;

    let (link_count, total_clicks, total_conversions): (i64, i64, i64) = sqlx::query_as(
        r#"SELECT COUNT(*),
                  COALESCE(SUM(click_count), 0)::BIGINT,
                  COALESCE(SUM(conversion_count), 0)::BIGINT
           FROM affiliate_links WHERE owner_id = $1"#,
    )
    .bind(id)
    .fetch_one(&st.pool)
    .await
    .map_err(db_err)?;

    let (pending_commission_total,): (Decimal,) = sqlx::query_as(
        r#"SELECT COALESCE(SUM(amount), 0)
           FROM commissions WHERE account_id = $1 AND status = 'pending'"#,
    )
    .bind(id)
    .fetch_one(&st.pool)
    .await
    .map_err(db_err)?;

    Ok(ApiOk::ok(
        "account summary fetched",
        AccountSummaryResponse {
            account,
            link_count,
            total_clicks,
            total_conversions,
            pending_commission_total,
        },
        meta,
    ))
}

async fn list_commissions_handler(
    State(st): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(params): Query<PageParams>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Commission>>, ApiErrorWithMeta> {
    let db_err = |e: sqlx::Error| {
        ApiError::Internal(e.into())
            .with_meta(meta.clone())
            .with_code(E_DB_FAILURE)
    };
    let (page, per_page) = params.resolve();

    let (total,): (i64,) =
        sqlx::query_as(r#"SELECT COUNT(*) FROM commissions WHERE account_id = $1"#)
            .bind(account_id)
            .fetch_one(&st.pool)
            .await
            .map_err(db_err)?;

    let rows: Vec<Commission> = sqlx::query_as(
        r#"SELECT id, account_id, order_id, level, order_value, rate, amount, status, created_at, paid_at
           FROM commissions WHERE account_id = $1
           ORDER BY created_at DESC LIMIT $2 OFFSET $3"#,
    )
    .bind(account_id)
    .bind(per_page as i64)
    .bind(((page.saturating_sub(1)) as i64) * per_page as i64)
    .fetch_all(&st.pool)
    .await
    .map_err(db_err)?;

    Ok(ApiOk::ok_paginated(
        "commissions fetched",
        rows,
        Pagination::new(page, per_page, total as u64),
        meta,
    ))
}

async fn list_withdrawals_handler(
    State(st): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(params): Query<PageParams>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Withdrawal>>, ApiErrorWithMeta> {
    let db_err = |e: sqlx::Error| {
        ApiError::Internal(e.into())
            .with_meta(meta.clone())
            .with_code(E_DB_FAILURE)
    };
    let (page, per_page) = params.resolve();

    let (total,): (i64,) =
        sqlx::query_as(r#"SELECT COUNT(*) FROM withdrawals WHERE account_id = $1"#)
            .bind(account_id)
            .fetch_one(&st.pool)
            .await
            .map_err(db_err)?;

    let rows: Vec<Withdrawal> = sqlx::query_as(
        r#"SELECT id, account_id, bank_account_id, amount, fee, status,
                  cancelled_by_owner, note, requested_at, processed_at
           FROM withdrawals WHERE account_id = $1
           ORDER BY requested_at DESC LIMIT $2 OFFSET $3"#,
    )
    .bind(account_id)
    .bind(per_page as i64)
    .bind(((page.saturating_sub(1)) as i64) * per_page as i64)
    .fetch_all(&st.pool)
    .await
    .map_err(db_err)?;

    Ok(ApiOk::ok_paginated(
        "withdrawals fetched",
        rows,
        Pagination::new(page, per_page, total as u64),
        meta,
    ))
}
