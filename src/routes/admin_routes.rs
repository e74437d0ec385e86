// src/routes/admin_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    dispatch::{self, RequestStatus},
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{
        onboarding_to_string, parse_onboarding, ApiOk, AppState, DriverRow, PartnerRow,
        RequestRow, DRIVER_COLUMNS, ONBOARDING_APPROVED, ONBOARDING_REJECTED, PARTNER_COLUMNS,
        REQUEST_COLUMNS,
    },
    routes::partner_routes::PartnerProfile,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/partners", get(list_partners))
        .route("/partners/{partner_id}/approve", post(approve_partner))
        .route("/partners/{partner_id}/reject", post(reject_partner))
        .route("/partners/{partner_id}/commission", patch(set_commission))
        .route("/drivers", get(list_drivers))
        .route("/drivers/{driver_id}/verify", post(verify_driver))
        .route("/requests", get(list_requests))
        .route("/reports/summary", get(summary_report))
        .route("/reports/commissions", get(commission_report))
}

/* ============================================================
   Partners
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct PartnerFilter {
    pub onboarding: Option<String>,
}

pub async fn list_partners(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(f): Query<PartnerFilter>,
) -> Result<Json<ApiOk<Vec<PartnerProfile>>>, ApiError> {
    auth.require_admin()?;

    let onboarding = match f.onboarding.as_deref() {
        Some(s) => Some(parse_onboarding(s).ok_or_else(|| {
            ApiError::validation("onboarding must be pending, approved or rejected")
        })?),
        None => None,
    };

    let sql = format!(
        r#"
        SELECT {PARTNER_COLUMNS}
        FROM partner
        WHERE ($1::SMALLINT IS NULL OR onboarding_status = $1)
        ORDER BY created_at DESC
        "#
    );
    let rows = sqlx::query_as::<_, PartnerRow>(&sql)
        .bind(onboarding)
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    Ok(Json(ApiOk {
        data: rows.into_iter().map(PartnerProfile::from).collect(),
    }))
}

async fn set_onboarding(
    state: &AppState,
    partner_id: Uuid,
    status: i16,
) -> Result<PartnerRow, ApiError> {
    let sql = format!(
        r#"
        UPDATE partner
        SET onboarding_status = $2, updated_at = now()
        WHERE partner_id = $1
        RETURNING {PARTNER_COLUMNS}
        "#
    );
    sqlx::query_as::<_, PartnerRow>(&sql)
        .bind(partner_id)
        .bind(status)
        .fetch_optional(&state.db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("partner"))
}

pub async fn approve_partner(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(partner_id): Path<Uuid>,
) -> Result<Json<ApiOk<PartnerProfile>>, ApiError> {
    auth.require_admin()?;
    let row = set_onboarding(&state, partner_id, ONBOARDING_APPROVED).await?;
    tracing::info!(admin = %auth.user_id, partner = %partner_id, "partner approved");
    Ok(Json(ApiOk { data: row.into() }))
}

pub async fn reject_partner(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(partner_id): Path<Uuid>,
) -> Result<Json<ApiOk<PartnerProfile>>, ApiError> {
    auth.require_admin()?;
    let row = set_onboarding(&state, partner_id, ONBOARDING_REJECTED).await?;
    tracing::info!(admin = %auth.user_id, partner = %partner_id, "partner onboarding rejected");
    Ok(Json(ApiOk { data: row.into() }))
}

#[derive(Debug, Deserialize)]
pub struct CommissionRequest {
    pub commission_percent: f64,
}

/// Applies to trips completed after the change; ledger rows keep the rate
/// they were booked at.
pub async fn set_commission(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(partner_id): Path<Uuid>,
    Json(req): Json<CommissionRequest>,
) -> Result<Json<ApiOk<PartnerProfile>>, ApiError> {
    auth.require_admin()?;
    let pct = dispatch::validate_commission_percent(req.commission_percent)?;

    let sql = format!(
        r#"
        UPDATE partner
        SET commission_percent = $2, updated_at = now()
        WHERE partner_id = $1
        RETURNING {PARTNER_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, PartnerRow>(&sql)
        .bind(partner_id)
        .bind(pct)
        .fetch_optional(&state.db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("partner"))?;

    tracing::info!(admin = %auth.user_id, partner = %partner_id, commission_percent = pct, "commission updated");
    Ok(Json(ApiOk { data: row.into() }))
}

/* ============================================================
   Drivers
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct DriverFilter {
    pub verified: Option<bool>,
}

pub async fn list_drivers(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(f): Query<DriverFilter>,
) -> Result<Json<ApiOk<Vec<DriverRow>>>, ApiError> {
    auth.require_admin()?;

    let sql = format!(
        r#"
        SELECT {DRIVER_COLUMNS}
        FROM driver
        WHERE ($1::BOOLEAN IS NULL OR is_verified = $1)
        ORDER BY created_at DESC
        "#
    );
    let rows = sqlx::query_as::<_, DriverRow>(&sql)
        .bind(f.verified)
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    Ok(Json(ApiOk { data: rows }))
}

pub async fn verify_driver(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(driver_id): Path<Uuid>,
) -> Result<Json<ApiOk<DriverRow>>, ApiError> {
    auth.require_admin()?;

    let sql = format!(
        r#"
        UPDATE driver
        SET is_verified = true, updated_at = now()
        WHERE driver_id = $1
        RETURNING {DRIVER_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DriverRow>(&sql)
        .bind(driver_id)
        .fetch_optional(&state.db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("driver"))?;

    tracing::info!(admin = %auth.user_id, driver_id = %driver_id, "driver verified");
    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Requests + reports
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct RequestFilter {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AdminRequestRow {
    pub booking_id: String,
    pub patient_user_id: Uuid,
    pub status: RequestStatus,
    pub emergency_type: String,
    pub pickup_address: String,
    pub current_partner_id: Option<Uuid>,
    pub ambulances_requested: i32,
    pub ambulances_remaining: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RequestRow> for AdminRequestRow {
    type Error = ApiError;

    fn try_from(r: RequestRow) -> Result<Self, Self::Error> {
        Ok(AdminRequestRow {
            status: r.status()?,
            booking_id: r.booking_id,
            patient_user_id: r.patient_user_id,
            emergency_type: r.emergency_type,
            pickup_address: r.pickup_address,
            current_partner_id: r.current_partner_id,
            ambulances_requested: r.ambulances_requested,
            ambulances_remaining: r.ambulances_remaining,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

pub async fn list_requests(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(f): Query<RequestFilter>,
) -> Result<Json<ApiOk<Vec<AdminRequestRow>>>, ApiError> {
    auth.require_admin()?;

    let status = match f.status.as_deref() {
        Some(s) => Some(s.parse::<RequestStatus>().map_err(ApiError::validation)?),
        None => None,
    };

    let sql = format!(
        r#"
        SELECT {REQUEST_COLUMNS}
        FROM ambulance_request
        WHERE ($1::TEXT IS NULL OR status = $1)
        ORDER BY created_at DESC
        LIMIT 200
        "#
    );
    let rows = sqlx::query_as::<_, RequestRow>(&sql)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    let data = rows
        .into_iter()
        .map(AdminRequestRow::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ApiOk { data }))
}

#[derive(Debug, Serialize)]
pub struct StatusCount {
    pub status: RequestStatus,
    pub count: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct TripTotals {
    pub completed_trips: i64,
    pub total_fare_cents: i64,
    pub total_commission_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct SummaryReport {
    pub requests_by_status: Vec<StatusCount>,
    pub partners_pending: i64,
    pub drivers_unverified: i64,
    #[serde(flatten)]
    pub trips: TripTotals,
}

/// Every status is listed, zero counts included.
fn fill_status_counts(rows: &[(String, i64)]) -> Vec<StatusCount> {
    RequestStatus::ALL
        .into_iter()
        .map(|status| StatusCount {
            status,
            count: rows
                .iter()
                .find(|(s, _)| s == status.as_str())
                .map_or(0, |(_, n)| *n),
        })
        .collect()
}

pub async fn summary_report(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<SummaryReport>>, ApiError> {
    auth.require_admin()?;

    let by_status: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, count(*)::BIGINT FROM ambulance_request GROUP BY status",
    )
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    let (partners_pending, drivers_unverified): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
          (SELECT count(*) FROM partner WHERE onboarding_status = 0)::BIGINT,
          (SELECT count(*) FROM driver WHERE is_verified = false)::BIGINT
        "#,
    )
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    let trips = sqlx::query_as::<_, TripTotals>(
        r#"
        SELECT
          count(*)::BIGINT AS completed_trips,
          COALESCE(sum(fare_cents), 0)::BIGINT AS total_fare_cents,
          COALESCE((SELECT sum(commission_cents) FROM commission_ledger), 0)::BIGINT
            AS total_commission_cents
        FROM request_assignment
        WHERE status = 'completed'
        "#,
    )
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk {
        data: SummaryReport {
            requests_by_status: fill_status_counts(&by_status),
            partners_pending,
            drivers_unverified,
            trips,
        },
    }))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PartnerCommissionRow {
    pub partner_id: Uuid,
    pub hospital_name: String,
    pub commission_percent: f64,
    pub onboarding_status: i16,
    pub completed_trips: i64,
    pub total_fare_cents: i64,
    pub total_commission_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct PartnerCommission {
    #[serde(flatten)]
    pub row: PartnerCommissionRow,
    pub onboarding: &'static str,
}

pub async fn commission_report(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<PartnerCommission>>>, ApiError> {
    auth.require_admin()?;

    let rows = sqlx::query_as::<_, PartnerCommissionRow>(
        r#"
        SELECT
          p.partner_id,
          p.hospital_name,
          p.commission_percent,
          p.onboarding_status,
          count(l.assignment_id)::BIGINT AS completed_trips,
          COALESCE(sum(l.fare_cents), 0)::BIGINT AS total_fare_cents,
          COALESCE(sum(l.commission_cents), 0)::BIGINT AS total_commission_cents
        FROM partner p
        LEFT JOIN commission_ledger l ON l.partner_id = p.partner_id
        GROUP BY p.partner_id
        ORDER BY total_commission_cents DESC, p.hospital_name ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    let data = rows
        .into_iter()
        .map(|row| PartnerCommission {
            onboarding: onboarding_to_string(row.onboarding_status),
            row,
        })
        .collect();
    Ok(Json(ApiOk { data }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_counts_cover_every_status() {
        let rows = vec![
            ("requested".to_string(), 3),
            ("rejected & reassigned".to_string(), 1),
            ("completed".to_string(), 12),
        ];
        let counts = fill_status_counts(&rows);
        assert_eq!(counts.len(), RequestStatus::ALL.len());

        let get = |st: RequestStatus| counts.iter().find(|c| c.status == st).unwrap().count;
        assert_eq!(get(RequestStatus::Requested), 3);
        assert_eq!(get(RequestStatus::RejectedReassigned), 1);
        assert_eq!(get(RequestStatus::Completed), 12);
        assert_eq!(get(RequestStatus::Cancelled), 0);
    }

    #[test]
    fn status_filter_parses_wire_names() {
        assert_eq!(
            "rejected & reassigned".parse::<RequestStatus>().unwrap(),
            RequestStatus::RejectedReassigned
        );
        assert!("pending".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn commission_bounds_enforced() {
        assert!(dispatch::validate_commission_percent(2.9).is_err());
        assert!(dispatch::validate_commission_percent(3.0).is_ok());
        assert!(dispatch::validate_commission_percent(5.0).is_ok());
        assert!(dispatch::validate_commission_percent(f64::NAN).is_err());
    }
}
