// src/routes/partner_routes.rs

use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    dispatch::{self, store, RejectionReason, RequestStatus, SkippedDriver},
    error::{db_error, ApiError},
    geo::GeoPoint,
    middleware::auth_context::AuthContext,
    models::{
        onboarding_to_string, ApiOk, AppState, DriverRow, PartnerRow, RequestRow, RequestView,
        DRIVER_COLUMNS, PARTNER_COLUMNS, REQUEST_COLUMNS, ROLE_DRIVER,
    },
    routes::auth_routes::{
        insert_driver, insert_user, validate_account, validate_driver_fields, AccountFields,
    },
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/me", get(get_me).patch(update_me))
        .route("/requests/pending", get(list_pending))
        .route("/requests", get(list_handled))
        .route("/requests/{booking_id}/accept", post(accept_request))
        .route("/requests/{booking_id}/reject", post(reject_request))
        .route("/requests/{booking_id}/assign", post(assign_drivers))
        .route("/drivers", get(list_drivers).post(create_driver))
        .route("/drivers/{driver_id}", patch(update_driver))
        .route("/earnings", get(earnings))
        .route("/notifications", get(super::driver_routes::list_notifications))
}

/* ============================================================
   Helpers
   ============================================================ */

async fn load_my_partner(conn: &mut PgConnection, user_id: Uuid) -> Result<PartnerRow, ApiError> {
    let sql = format!("SELECT {PARTNER_COLUMNS} FROM partner WHERE user_id = $1");
    sqlx::query_as::<_, PartnerRow>(&sql)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?
        .ok_or_else(|| {
            ApiError::BadRequest("NO_PARTNER_PROFILE", "This user has no partner profile".into())
        })
}

async fn my_partner(state: &AppState, auth: &AuthContext) -> Result<PartnerRow, ApiError> {
    auth.require_partner()?;
    let mut conn = state.db.acquire().await.map_err(db_error)?;
    load_my_partner(&mut conn, auth.user_id).await
}

fn ensure_approved(p: &PartnerRow) -> Result<(), ApiError> {
    if p.is_approved() {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "NOT_APPROVED",
            "Partner onboarding has not been approved yet".into(),
        ))
    }
}

/* ============================================================
   Profile
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct PartnerProfile {
    #[serde(flatten)]
    pub partner: PartnerRow,
    pub onboarding: &'static str,
}

impl From<PartnerRow> for PartnerProfile {
    fn from(partner: PartnerRow) -> Self {
        let onboarding = onboarding_to_string(partner.onboarding_status);
        PartnerProfile { partner, onboarding }
    }
}

pub async fn get_me(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<PartnerProfile>>, ApiError> {
    let p = my_partner(&state, &auth).await?;
    Ok(Json(ApiOk { data: p.into() }))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePartnerRequest {
    pub hospital_name: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_accepting: Option<bool>,
}

pub async fn update_me(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<UpdatePartnerRequest>,
) -> Result<Json<ApiOk<PartnerProfile>>, ApiError> {
    let current = my_partner(&state, &auth).await?;

    let hospital_name = match req.hospital_name.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::validation("hospital_name cannot be empty")),
        Some(s) => s.to_string(),
        None => current.hospital_name.clone(),
    };
    let address = match req.address.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::validation("address cannot be empty")),
        Some(s) => s.to_string(),
        None => current.address.clone(),
    };
    let loc = GeoPoint::new(
        req.latitude.unwrap_or(current.latitude),
        req.longitude.unwrap_or(current.longitude),
    );
    if !loc.is_valid() {
        return Err(ApiError::validation("latitude/longitude out of range"));
    }

    let sql = format!(
        r#"
        UPDATE partner
        SET hospital_name = $2,
            address = $3,
            latitude = $4,
            longitude = $5,
            is_accepting = $6,
            updated_at = now()
        WHERE partner_id = $1
        RETURNING {PARTNER_COLUMNS}
        "#
    );
    let updated = sqlx::query_as::<_, PartnerRow>(&sql)
        .bind(current.partner_id)
        .bind(hospital_name)
        .bind(address)
        .bind(loc.latitude)
        .bind(loc.longitude)
        .bind(req.is_accepting.unwrap_or(current.is_accepting))
        .fetch_one(&state.db)
        .await
        .map_err(db_error)?;

    Ok(Json(ApiOk { data: updated.into() }))
}

/* ============================================================
   Requests
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct PendingOffer {
    pub booking_id: String,
    pub status: RequestStatus,
    pub emergency_type: String,
    pub pickup: GeoPoint,
    pub pickup_address: String,
    pub notes: Option<String>,
    pub ambulances_requested: i32,
    /// Lower than `ambulances_requested` when independents already claimed slots.
    pub ambulances_remaining: i32,
    pub distance_km: f64,
    pub offer_expires_at: Option<DateTime<Utc>>,
    pub seconds_left: Option<i64>,
}

fn to_pending_offer(p: &PartnerRow, r: RequestRow, now: DateTime<Utc>) -> Result<PendingOffer, ApiError> {
    Ok(PendingOffer {
        status: r.status()?,
        distance_km: r.pickup().distance_km(&p.location()),
        pickup: r.pickup(),
        seconds_left: dispatch::offer_seconds_left(r.offer_expires_at, now),
        booking_id: r.booking_id,
        emergency_type: r.emergency_type,
        pickup_address: r.pickup_address,
        notes: r.notes,
        ambulances_requested: r.ambulances_requested,
        ambulances_remaining: r.ambulances_remaining,
        offer_expires_at: r.offer_expires_at,
    })
}

/// Offers currently addressed to this partner (the countdown list).
pub async fn list_pending(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<PendingOffer>>>, ApiError> {
    let p = my_partner(&state, &auth).await?;

    let sql = format!(
        r#"
        SELECT {REQUEST_COLUMNS}
        FROM ambulance_request
        WHERE current_partner_id = $1
          AND status IN ('requested', 'rejected & reassigned')
          AND offer_expires_at > now()
        ORDER BY offer_expires_at ASC
        "#
    );
    let rows = sqlx::query_as::<_, RequestRow>(&sql)
        .bind(p.partner_id)
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    let now = Utc::now();
    let data = rows
        .into_iter()
        .map(|r| to_pending_offer(&p, r, now))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ApiOk { data }))
}

#[derive(Debug, Serialize)]
pub struct HandledRequest {
    pub booking_id: String,
    pub status: RequestStatus,
    pub emergency_type: String,
    pub pickup_address: String,
    pub ambulances_requested: i32,
    pub ambulances_remaining: i32,
    pub updated_at: DateTime<Utc>,
}

/// Requests this partner accepted (or sent drivers to), newest first.
pub async fn list_handled(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<HandledRequest>>>, ApiError> {
    let p = my_partner(&state, &auth).await?;

    let sql = format!(
        r#"
        SELECT {REQUEST_COLUMNS}
        FROM ambulance_request r
        WHERE (r.current_partner_id = $1
               AND r.status NOT IN ('requested', 'rejected & reassigned', 'no_partner_available'))
           OR EXISTS (
               SELECT 1 FROM request_assignment a
               WHERE a.request_id = r.request_id AND a.partner_id = $1
           )
        ORDER BY r.updated_at DESC
        LIMIT 200
        "#
    );
    let rows = sqlx::query_as::<_, RequestRow>(&sql)
        .bind(p.partner_id)
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    let mut data = Vec::with_capacity(rows.len());
    for r in rows {
        data.push(HandledRequest {
            status: r.status()?,
            booking_id: r.booking_id,
            emergency_type: r.emergency_type,
            pickup_address: r.pickup_address,
            ambulances_requested: r.ambulances_requested,
            ambulances_remaining: r.ambulances_remaining,
            updated_at: r.updated_at,
        });
    }
    Ok(Json(ApiOk { data }))
}

async fn view_of(state: &AppState, booking_id: &str) -> Result<Json<ApiOk<RequestView>>, ApiError> {
    let req = store::fetch_request(&state.db, booking_id).await?;
    let view = store::build_request_view(&state.db, &req, Utc::now()).await?;
    Ok(Json(ApiOk { data: view }))
}

pub async fn accept_request(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(booking_id): Path<String>,
) -> Result<Json<ApiOk<RequestView>>, ApiError> {
    auth.require_partner()?;

    let mut tx = state.db.begin().await.map_err(db_error)?;
    let p = load_my_partner(&mut tx, auth.user_id).await?;
    ensure_approved(&p)?;

    let req = store::lock_request(&mut *tx, &booking_id).await?;
    store::accept_offer(&mut *tx, &req, p.partner_id, Utc::now()).await?;
    tx.commit().await.map_err(db_error)?;

    view_of(&state, &booking_id).await
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequestBody {
    pub reason: Option<String>,
}

/// Reject and hand the booking to the next nearest partner.
pub async fn reject_request(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(booking_id): Path<String>,
    body: Bytes,
) -> Result<Json<ApiOk<RequestView>>, ApiError> {
    auth.require_partner()?;
    // body is optional
    let reason = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<RejectRequestBody>(&body)
            .map_err(|e| ApiError::validation(format!("invalid body: {e}")))?
            .reason
    };

    let mut tx = state.db.begin().await.map_err(db_error)?;
    let p = load_my_partner(&mut tx, auth.user_id).await?;

    let req = store::lock_request(&mut *tx, &booking_id).await?;
    dispatch::ensure_offer_held(req.status()?, req.current_partner_id, p.partner_id)?;

    let outcome = store::reassign_away_from(
        &mut *tx,
        &req,
        p.partner_id,
        RejectionReason::Rejected,
        state.dispatch,
        Utc::now(),
    )
    .await?;
    tx.commit().await.map_err(db_error)?;

    tracing::info!(
        booking_id = %booking_id,
        partner = %p.partner_id,
        reason = reason.as_deref().unwrap_or(""),
        next_status = %outcome.status,
        "partner rejected request"
    );
    store::notify_routing(state.notifier.as_ref(), &outcome, &req).await;

    view_of(&state, &booking_id).await
}

#[derive(Debug, Deserialize)]
pub struct AssignDriversBody {
    pub driver_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct AssignDriversResult {
    pub request: RequestView,
    pub assigned: Vec<Uuid>,
    pub skipped: Vec<SkippedDriver>,
}

/// Sends one or more fleet drivers. Drivers that cannot go are reported in
/// `skipped`; the call fails only when nobody could be assigned.
pub async fn assign_drivers(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(booking_id): Path<String>,
    Json(body): Json<AssignDriversBody>,
) -> Result<Json<ApiOk<AssignDriversResult>>, ApiError> {
    auth.require_partner()?;
    if body.driver_ids.is_empty() {
        return Err(ApiError::validation("driver_ids must not be empty"));
    }

    let mut tx = state.db.begin().await.map_err(db_error)?;
    let p = load_my_partner(&mut tx, auth.user_id).await?;
    ensure_approved(&p)?;

    let req = store::lock_request(&mut *tx, &booking_id).await?;
    let status = req.status()?;
    if req.current_partner_id != Some(p.partner_id)
        || !matches!(status, RequestStatus::Accepted | RequestStatus::PartiallyAssigned)
    {
        return Err(ApiError::Conflict(
            "NOT_ACCEPTED",
            "accept the request before assigning drivers".into(),
        ));
    }

    let sql = format!(
        "SELECT {DRIVER_COLUMNS} FROM driver WHERE driver_id = ANY($1) FOR UPDATE"
    );
    let found = sqlx::query_as::<_, DriverRow>(&sql)
        .bind(&body.driver_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;
    let on_request = store::drivers_on_request(&mut *tx, req.request_id).await?;

    let screen = dispatch::screen_drivers(
        &body.driver_ids,
        &found,
        p.partner_id,
        &on_request,
        req.ambulances_remaining,
    );
    let outcome = store::assign_drivers(&mut *tx, &req, &screen.eligible, Some(p.partner_id)).await?;
    tx.commit().await.map_err(db_error)?;

    if !screen.skipped.is_empty() {
        tracing::warn!(
            booking_id = %booking_id,
            skipped = screen.skipped.len(),
            "some drivers could not be assigned"
        );
    }
    store::notify_assigned(state.notifier.as_ref(), &req, &outcome).await;

    let assigned = outcome.assigned.iter().map(|(a, _)| a.driver_id).collect();
    let Json(ApiOk { data: request }) = view_of(&state, &booking_id).await?;
    Ok(Json(ApiOk {
        data: AssignDriversResult {
            request,
            assigned,
            skipped: screen.skipped,
        },
    }))
}

/* ============================================================
   Fleet
   ============================================================ */

pub async fn list_drivers(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<DriverRow>>>, ApiError> {
    let p = my_partner(&state, &auth).await?;

    let sql = format!(
        "SELECT {DRIVER_COLUMNS} FROM driver WHERE partner_id = $1 ORDER BY full_name ASC"
    );
    let rows = sqlx::query_as::<_, DriverRow>(&sql)
        .bind(p.partner_id)
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    Ok(Json(ApiOk { data: rows }))
}

#[derive(Debug, Deserialize)]
pub struct CreateFleetDriverRequest {
    #[serde(flatten)]
    pub account: AccountFields,
    pub full_name: String,
    pub license_number: String,
    pub vehicle_number: String,
    pub ambulance_type: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Creates a driver login under this hospital. Fleet drivers are verified
/// on creation.
pub async fn create_driver(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateFleetDriverRequest>,
) -> Result<Json<ApiOk<DriverRow>>, ApiError> {
    let p = my_partner(&state, &auth).await?;
    let fields = validate_driver_fields(
        &req.full_name,
        &req.license_number,
        &req.vehicle_number,
        req.ambulance_type.as_deref(),
        req.latitude,
        req.longitude,
    )?;

    let acct = validate_account(&req.account)?;

    let mut tx = state.db.begin().await.map_err(db_error)?;
    let user = insert_user(&mut tx, &acct, ROLE_DRIVER).await?;
    let driver_id = insert_driver(&mut tx, user.user_id, Some(p.partner_id), &fields, true).await?;

    let sql = format!("SELECT {DRIVER_COLUMNS} FROM driver WHERE driver_id = $1");
    let row = sqlx::query_as::<_, DriverRow>(&sql)
        .bind(driver_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

    tx.commit().await.map_err(db_error)?;

    tracing::info!(partner = %p.partner_id, driver_id = %driver_id, "fleet driver added");
    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateFleetDriverRequest {
    pub is_available: Option<bool>,
    pub vehicle_number: Option<String>,
    pub ambulance_type: Option<String>,
}

pub async fn update_driver(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(driver_id): Path<Uuid>,
    Json(req): Json<UpdateFleetDriverRequest>,
) -> Result<Json<ApiOk<DriverRow>>, ApiError> {
    let p = my_partner(&state, &auth).await?;

    let vehicle_number = req.vehicle_number.as_deref().map(str::trim);
    if vehicle_number == Some("") {
        return Err(ApiError::validation("vehicle_number cannot be empty"));
    }
    let ambulance_type = req.ambulance_type.as_deref().map(str::trim);
    if ambulance_type == Some("") {
        return Err(ApiError::validation("ambulance_type cannot be empty"));
    }

    // a driver out on a trip stays unavailable until the trip ends
    let sql = format!(
        r#"
        UPDATE driver d
        SET is_available = CASE
                WHEN EXISTS (
                  SELECT 1 FROM request_assignment a
                  WHERE a.driver_id = d.driver_id
                    AND a.status IN ('assigned', 'en_route', 'arrived')
                ) THEN false
                ELSE COALESCE($3, d.is_available)
            END,
            vehicle_number = COALESCE($4, d.vehicle_number),
            ambulance_type = COALESCE($5, d.ambulance_type),
            updated_at = now()
        WHERE d.driver_id = $1 AND d.partner_id = $2
        RETURNING {DRIVER_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DriverRow>(&sql)
        .bind(driver_id)
        .bind(p.partner_id)
        .bind(req.is_available)
        .bind(vehicle_number)
        .bind(ambulance_type)
        .fetch_optional(&state.db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("driver"))?;

    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Earnings
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct EarningsSummary {
    pub completed_trips: i64,
    pub total_fare_cents: i64,
    pub total_commission_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct EarningsData {
    pub commission_percent: f64,
    #[serde(flatten)]
    pub summary: EarningsSummary,
}

pub async fn earnings(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<EarningsData>>, ApiError> {
    let p = my_partner(&state, &auth).await?;

    let summary = sqlx::query_as::<_, EarningsSummary>(
        r#"
        SELECT
          count(*)::BIGINT AS completed_trips,
          COALESCE(sum(fare_cents), 0)::BIGINT AS total_fare_cents,
          COALESCE(sum(commission_cents), 0)::BIGINT AS total_commission_cents
        FROM commission_ledger
        WHERE partner_id = $1
        "#,
    )
    .bind(p.partner_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk {
        data: EarningsData {
            commission_percent: p.commission_percent,
            summary,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ONBOARDING_APPROVED, ONBOARDING_PENDING};

    fn partner(onboarding: i16) -> PartnerRow {
        let now = Utc::now();
        PartnerRow {
            partner_id: Uuid::from_u128(5),
            user_id: Uuid::from_u128(6),
            hospital_name: "St. Martha's".into(),
            address: "Nrupathunga Rd".into(),
            latitude: 12.9650,
            longitude: 77.5900,
            commission_percent: 4.0,
            onboarding_status: onboarding,
            is_accepting: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn only_approved_partners_act() {
        assert!(ensure_approved(&partner(ONBOARDING_APPROVED)).is_ok());
        assert!(ensure_approved(&partner(ONBOARDING_PENDING)).is_err());
    }

    #[test]
    fn pending_offer_carries_distance_and_countdown() {
        let p = partner(ONBOARDING_APPROVED);
        let now = Utc::now();
        let r = RequestRow {
            request_id: Uuid::from_u128(1),
            booking_id: "AMB-20260101-BBBBBB".into(),
            patient_user_id: Uuid::from_u128(2),
            pickup_latitude: 12.9716,
            pickup_longitude: 77.5946,
            pickup_address: "MG Road".into(),
            emergency_type: "trauma".into(),
            notes: None,
            ambulances_requested: 3,
            ambulances_remaining: 2,
            status: "requested".into(),
            current_partner_id: Some(p.partner_id),
            offered_at: Some(now),
            offer_expires_at: Some(now + chrono::Duration::seconds(45)),
            open_to_independent: true,
            created_at: now,
            updated_at: now,
        };

        let offer = to_pending_offer(&p, r, now).unwrap();
        assert!(offer.distance_km > 0.5 && offer.distance_km < 2.0, "{}", offer.distance_km);
        assert_eq!(offer.seconds_left, Some(45));
        assert_eq!(offer.status, RequestStatus::Requested);
        // one slot already claimed by an independent driver
        assert_eq!(offer.ambulances_requested, 3);
        assert_eq!(offer.ambulances_remaining, 2);
    }

    #[test]
    fn profile_reports_onboarding_name() {
        let prof = PartnerProfile::from(partner(ONBOARDING_PENDING));
        assert_eq!(prof.onboarding, "pending");
        let json = serde_json::to_value(&prof).unwrap();
        assert_eq!(json["hospital_name"], "St. Martha's");
        assert_eq!(json["onboarding"], "pending");
    }
}
