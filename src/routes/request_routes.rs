// src/routes/request_routes.rs

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    dispatch::{self, store, sweeper, DispatchError, RequestStatus},
    error::{db_error, ApiError},
    geo::GeoPoint,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, RequestRow, RequestView, REQUEST_COLUMNS, ROLE_DRIVER, ROLE_PARTNER},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_my_requests).post(create_request))
        // polled by the patient app while a booking is live
        .route("/{booking_id}", get(get_request))
        .route("/{booking_id}/cancel", post(cancel_request))
        .route("/{booking_id}/retry", post(retry_request))
        .route("/{booking_id}/expire", post(expire_offer))
}

/* ============================================================
   Authorization
   ============================================================ */

/// Patient owner, admin, the partner holding or serving it, or an assigned driver.
async fn ensure_can_view(state: &AppState, auth: &AuthContext, req: &RequestRow) -> Result<(), ApiError> {
    if auth.is_admin() || req.patient_user_id == auth.user_id {
        return Ok(());
    }

    let allowed: bool = match auth.role {
        ROLE_PARTNER => sqlx::query_scalar(
            r#"
            SELECT EXISTS (
              SELECT 1 FROM partner p
              WHERE p.user_id = $1
                AND (
                  p.partner_id = $2
                  OR EXISTS (
                    SELECT 1 FROM request_assignment a
                    WHERE a.request_id = $3 AND a.partner_id = p.partner_id
                  )
                )
            )
            "#,
        )
        .bind(auth.user_id)
        .bind(req.current_partner_id)
        .bind(req.request_id)
        .fetch_one(&state.db)
        .await
        .map_err(db_error)?,
        ROLE_DRIVER => sqlx::query_scalar(
            r#"
            SELECT EXISTS (
              SELECT 1
              FROM request_assignment a
              JOIN driver d ON d.driver_id = a.driver_id
              WHERE a.request_id = $1 AND d.user_id = $2
            )
            "#,
        )
        .bind(req.request_id)
        .bind(auth.user_id)
        .fetch_one(&state.db)
        .await
        .map_err(db_error)?,
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(ApiError::Forbidden("FORBIDDEN", "not your request".into()))
    }
}

fn ensure_owner(auth: &AuthContext, req: &RequestRow) -> Result<(), ApiError> {
    if req.patient_user_id == auth.user_id || auth.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("FORBIDDEN", "not your request".into()))
    }
}

/// Only the patient or the partner holding the offer may run its countdown out.
fn may_expire(auth: &AuthContext, req: &RequestRow, my_partner_id: Option<Uuid>) -> bool {
    if req.patient_user_id == auth.user_id {
        return true;
    }
    auth.role == ROLE_PARTNER && my_partner_id.is_some() && my_partner_id == req.current_partner_id
}

async fn ensure_can_expire(state: &AppState, auth: &AuthContext, req: &RequestRow) -> Result<(), ApiError> {
    let my_partner_id: Option<Uuid> = if auth.role == ROLE_PARTNER {
        sqlx::query_scalar("SELECT partner_id FROM partner WHERE user_id = $1")
            .bind(auth.user_id)
            .fetch_optional(&state.db)
            .await
            .map_err(db_error)?
    } else {
        None
    };

    if may_expire(auth, req, my_partner_id) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            "only the patient or the offered partner can expire this offer".into(),
        ))
    }
}

/* ============================================================
   POST /requests
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    pub pickup: GeoPoint,
    pub pickup_address: String,
    pub emergency_type: String,
    pub ambulances_requested: Option<i32>,
    pub notes: Option<String>,
    /// Let independent drivers claim slots too (default true).
    pub open_to_independent: Option<bool>,
}

struct ValidCreate<'a> {
    pickup: GeoPoint,
    pickup_address: &'a str,
    emergency_type: &'a str,
    ambulances: i32,
    notes: Option<&'a str>,
}

fn validate_create(body: &CreateRequestBody) -> Result<ValidCreate<'_>, ApiError> {
    dispatch::validate_pickup(&body.pickup)?;
    let ambulances = dispatch::validate_ambulance_count(body.ambulances_requested.unwrap_or(1))?;

    let pickup_address = body.pickup_address.trim();
    if pickup_address.is_empty() {
        return Err(ApiError::validation("pickup_address is required"));
    }
    let emergency_type = body.emergency_type.trim();
    if emergency_type.is_empty() {
        return Err(ApiError::validation("emergency_type is required"));
    }
    let notes = body.notes.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if notes.is_some_and(|n| n.len() > 1000) {
        return Err(ApiError::validation("notes is too long (max 1000)"));
    }

    Ok(ValidCreate {
        pickup: body.pickup,
        pickup_address,
        emergency_type,
        ambulances,
        notes,
    })
}

pub async fn create_request(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<CreateRequestBody>,
) -> Result<Json<ApiOk<RequestView>>, ApiError> {
    auth.require_patient()?;
    let v = validate_create(&body)?;

    let existing: Option<String> = sqlx::query_scalar(
        r#"
        SELECT booking_id
        FROM ambulance_request
        WHERE patient_user_id = $1
          AND status NOT IN ('completed', 'cancelled')
        LIMIT 1
        "#,
    )
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?;
    if let Some(booking_id) = existing {
        return Err(DispatchError::DuplicateRequest(booking_id).into());
    }

    let now = Utc::now();
    let booking_id = dispatch::generate_booking_id(now, &mut rand::thread_rng());

    let mut tx = state.db.begin().await.map_err(db_error)?;
    let (row, outcome) = store::insert_routed_request(
        &mut *tx,
        &store::NewRequest {
            booking_id: &booking_id,
            patient_user_id: auth.user_id,
            pickup: v.pickup,
            pickup_address: v.pickup_address,
            emergency_type: v.emergency_type,
            notes: v.notes,
            ambulances_requested: v.ambulances,
            open_to_independent: body.open_to_independent.unwrap_or(true),
        },
        state.dispatch,
        now,
    )
    .await?;
    tx.commit().await.map_err(db_error)?;

    store::notify_routing(state.notifier.as_ref(), &outcome, &row).await;

    let view = store::build_request_view(&state.db, &row, Utc::now()).await?;
    Ok(Json(ApiOk { data: view }))
}

/* ============================================================
   GET /requests, GET /requests/{booking_id}
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct RequestSummary {
    pub booking_id: String,
    pub status: RequestStatus,
    pub emergency_type: String,
    pub pickup_address: String,
    pub ambulances_requested: i32,
    pub ambulances_remaining: i32,
    pub created_at: chrono::DateTime<Utc>,
}

impl TryFrom<RequestRow> for RequestSummary {
    type Error = ApiError;

    fn try_from(r: RequestRow) -> Result<Self, Self::Error> {
        Ok(RequestSummary {
            status: r.status()?,
            booking_id: r.booking_id,
            emergency_type: r.emergency_type,
            pickup_address: r.pickup_address,
            ambulances_requested: r.ambulances_requested,
            ambulances_remaining: r.ambulances_remaining,
            created_at: r.created_at,
        })
    }
}

pub async fn list_my_requests(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<RequestSummary>>>, ApiError> {
    auth.require_patient()?;

    let sql = format!(
        r#"
        SELECT {REQUEST_COLUMNS}
        FROM ambulance_request
        WHERE patient_user_id = $1
        ORDER BY created_at DESC
        LIMIT 100
        "#
    );
    let rows = sqlx::query_as::<_, RequestRow>(&sql)
        .bind(auth.user_id)
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    let data = rows
        .into_iter()
        .map(RequestSummary::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ApiOk { data }))
}

pub async fn get_request(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(booking_id): Path<String>,
) -> Result<Json<ApiOk<RequestView>>, ApiError> {
    let req = store::fetch_request(&state.db, &booking_id).await?;
    ensure_can_view(&state, &auth, &req).await?;

    let view = store::build_request_view(&state.db, &req, Utc::now()).await?;
    Ok(Json(ApiOk { data: view }))
}

/* ============================================================
   POST /requests/{booking_id}/cancel | retry | expire
   ============================================================ */

pub async fn cancel_request(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(booking_id): Path<String>,
) -> Result<Json<ApiOk<RequestView>>, ApiError> {
    let mut tx = state.db.begin().await.map_err(db_error)?;
    let req = store::lock_request(&mut *tx, &booking_id).await?;
    ensure_owner(&auth, &req)?;

    let released = store::cancel_request(&mut *tx, &req).await?;
    tx.commit().await.map_err(db_error)?;

    store::notify_cancelled(state.notifier.as_ref(), &req.booking_id, &released).await;

    let req = store::fetch_request(&state.db, &booking_id).await?;
    let view = store::build_request_view(&state.db, &req, Utc::now()).await?;
    Ok(Json(ApiOk { data: view }))
}

/// Re-runs partner lookup for a booking nobody could take.
pub async fn retry_request(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(booking_id): Path<String>,
) -> Result<Json<ApiOk<RequestView>>, ApiError> {
    let mut tx = state.db.begin().await.map_err(db_error)?;
    let req = store::lock_request(&mut *tx, &booking_id).await?;
    ensure_owner(&auth, &req)?;

    let current = req.status()?;
    if current != RequestStatus::NoPartnerAvailable {
        return Err(DispatchError::InvalidTransition {
            from: current,
            to: RequestStatus::Requested,
        }
        .into());
    }

    let outcome = store::route_request(&mut *tx, &req, state.dispatch, false, Utc::now()).await?;
    tx.commit().await.map_err(db_error)?;

    store::notify_routing(state.notifier.as_ref(), &outcome, &req).await;

    let req = store::fetch_request(&state.db, &booking_id).await?;
    let view = store::build_request_view(&state.db, &req, Utc::now()).await?;
    Ok(Json(ApiOk { data: view }))
}

/// Explicit countdown expiry. Idempotent: a live or already-moved offer is
/// left as is and the current state is returned.
pub async fn expire_offer(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(booking_id): Path<String>,
) -> Result<Json<ApiOk<RequestView>>, ApiError> {
    let req = store::fetch_request(&state.db, &booking_id).await?;
    ensure_can_expire(&state, &auth, &req).await?;

    let moved = sweeper::expire_one(&state, &booking_id).await?;
    if moved {
        tracing::info!(booking_id = %booking_id, by = %auth.user_id, "offer expired on request");
    }

    let req = store::fetch_request(&state.db, &booking_id).await?;
    let view = store::build_request_view(&state.db, &req, Utc::now()).await?;
    Ok(Json(ApiOk { data: view }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(lat: f64, ambulances: Option<i32>) -> CreateRequestBody {
        CreateRequestBody {
            pickup: GeoPoint::new(lat, 77.59),
            pickup_address: " 12 MG Road ".into(),
            emergency_type: "cardiac".into(),
            ambulances_requested: ambulances,
            notes: Some("   ".into()),
            open_to_independent: None,
        }
    }

    #[test]
    fn create_defaults_to_one_ambulance() {
        let b = body(12.97, None);
        let v = validate_create(&b).unwrap();
        assert_eq!(v.ambulances, 1);
        assert_eq!(v.pickup_address, "12 MG Road");
        assert!(v.notes.is_none());
    }

    #[test]
    fn create_rejects_bad_input() {
        assert!(validate_create(&body(120.0, None)).is_err());
        assert!(validate_create(&body(12.97, Some(0))).is_err());
        assert!(validate_create(&body(12.97, Some(6))).is_err());

        let mut b = body(12.97, Some(2));
        b.emergency_type = "  ".into();
        assert!(validate_create(&b).is_err());
    }

    #[test]
    fn owner_check() {
        let now = Utc::now();
        let req = RequestRow {
            request_id: Uuid::from_u128(1),
            booking_id: "AMB-20260101-AAAAAA".into(),
            patient_user_id: Uuid::from_u128(7),
            pickup_latitude: 0.0,
            pickup_longitude: 0.0,
            pickup_address: "x".into(),
            emergency_type: "x".into(),
            notes: None,
            ambulances_requested: 1,
            ambulances_remaining: 1,
            status: "requested".into(),
            current_partner_id: None,
            offered_at: None,
            offer_expires_at: None,
            open_to_independent: true,
            created_at: now,
            updated_at: now,
        };
        let me = AuthContext {
            user_id: Uuid::from_u128(7),
            role: crate::models::ROLE_PATIENT,
            session_token_id: Uuid::nil(),
        };
        assert!(ensure_owner(&me, &req).is_ok());

        let other = AuthContext {
            user_id: Uuid::from_u128(8),
            ..me.clone()
        };
        assert!(ensure_owner(&other, &req).is_err());

        let summary = RequestSummary::try_from(req).unwrap();
        assert_eq!(summary.status, RequestStatus::Requested);
    }

    #[test]
    fn expiry_limited_to_patient_and_offered_partner() {
        let now = Utc::now();
        let offered = Uuid::from_u128(30);
        let req = RequestRow {
            request_id: Uuid::from_u128(1),
            booking_id: "AMB-20260101-CCCCCC".into(),
            patient_user_id: Uuid::from_u128(7),
            pickup_latitude: 0.0,
            pickup_longitude: 0.0,
            pickup_address: "x".into(),
            emergency_type: "x".into(),
            notes: None,
            ambulances_requested: 1,
            ambulances_remaining: 1,
            status: "requested".into(),
            current_partner_id: Some(offered),
            offered_at: Some(now),
            offer_expires_at: Some(now),
            open_to_independent: true,
            created_at: now,
            updated_at: now,
        };
        let as_role = |user: u128, role: i16| AuthContext {
            user_id: Uuid::from_u128(user),
            role,
            session_token_id: Uuid::nil(),
        };

        assert!(may_expire(&as_role(7, crate::models::ROLE_PATIENT), &req, None));
        assert!(may_expire(&as_role(31, ROLE_PARTNER), &req, Some(offered)));

        assert!(!may_expire(&as_role(32, ROLE_PARTNER), &req, Some(Uuid::from_u128(99))));
        assert!(!may_expire(&as_role(33, ROLE_PARTNER), &req, None));
        assert!(!may_expire(&as_role(1, crate::models::ROLE_ADMIN), &req, None));
        assert!(!may_expire(&as_role(40, ROLE_DRIVER), &req, None));

        let mut moved_on = req.clone();
        moved_on.current_partner_id = None;
        assert!(!may_expire(&as_role(31, ROLE_PARTNER), &moved_on, Some(offered)));
    }
}
