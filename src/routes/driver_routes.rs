// src/routes/driver_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    dispatch::{self, store, AssignmentStatus, RequestStatus},
    error::{db_error, ApiError},
    geo::{within_radius, GeoPoint},
    middleware::auth_context::AuthContext,
    models::{
        ApiOk, AppState, AssignmentRow, DriverRow, RequestRow, RequestView, ASSIGNMENT_COLUMNS,
        DRIVER_COLUMNS, REQUEST_COLUMNS,
    },
    notify::{self, NotificationRow},
};

const NOTIFICATION_PAGE: i64 = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/me", get(get_me))
        .route("/me/location", patch(update_location))
        .route("/me/availability", patch(update_availability))
        .route("/open_requests", get(list_open_requests))
        .route("/open_requests/{booking_id}/claim", post(claim_request))
        .route("/assignments/current", get(current_assignment))
        .route("/assignments/{assignment_id}/status", post(advance_assignment))
        .route("/notifications", get(list_notifications))
}

/* ============================================================
   Helpers
   ============================================================ */

async fn load_my_driver(
    conn: &mut PgConnection,
    user_id: Uuid,
    for_update: bool,
) -> Result<DriverRow, ApiError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!("SELECT {DRIVER_COLUMNS} FROM driver WHERE user_id = $1{lock}");
    sqlx::query_as::<_, DriverRow>(&sql)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?
        .ok_or_else(|| {
            ApiError::BadRequest("NO_DRIVER_PROFILE", "This user has no driver profile".into())
        })
}

async fn my_driver(state: &AppState, auth: &AuthContext) -> Result<DriverRow, ApiError> {
    auth.require_driver()?;
    let mut conn = state.db.acquire().await.map_err(db_error)?;
    load_my_driver(&mut conn, auth.user_id, false).await
}

async fn active_assignment(
    conn: &mut PgConnection,
    driver_id: Uuid,
) -> Result<Option<AssignmentRow>, ApiError> {
    let sql = format!(
        r#"
        SELECT {ASSIGNMENT_COLUMNS}
        FROM request_assignment
        WHERE driver_id = $1
          AND status IN ('assigned', 'en_route', 'arrived')
        ORDER BY assigned_at DESC
        LIMIT 1
        "#
    );
    sqlx::query_as::<_, AssignmentRow>(&sql)
        .bind(driver_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)
}

fn ensure_independent(d: &DriverRow) -> Result<(), ApiError> {
    if d.is_independent() {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "NOT_INDEPENDENT",
            "Fleet drivers are dispatched by their hospital".into(),
        ))
    }
}

/// Checks an independent driver can take a slot on `req` right now.
fn check_claim(
    driver: &DriverRow,
    has_active: bool,
    req: &RequestRow,
    on_request: bool,
    radius_km: f64,
) -> Result<(), ApiError> {
    ensure_independent(driver)?;
    if !driver.is_verified {
        return Err(ApiError::Forbidden(
            "NOT_VERIFIED",
            "Driver has not been verified by an admin".into(),
        ));
    }
    if !driver.is_available || has_active {
        return Err(ApiError::Conflict(
            "DRIVER_UNAVAILABLE",
            "finish the current trip before claiming another".into(),
        ));
    }
    let loc = driver.location().ok_or_else(|| {
        ApiError::BadRequest("LOCATION_REQUIRED", "update your location first".into())
    })?;

    let status = req.status()?;
    if !req.open_to_independent || !status.is_open_to_independent() {
        return Err(ApiError::Conflict(
            "NOT_OPEN",
            format!("request is {status} and cannot be claimed"),
        ));
    }
    if req.ambulances_remaining <= 0 {
        return Err(dispatch::DispatchError::NoAmbulancesRemaining.into());
    }
    if on_request {
        return Err(ApiError::Conflict(
            "ALREADY_ASSIGNED",
            "you are already on this request".into(),
        ));
    }
    if !within_radius(&loc, &req.pickup(), radius_km) {
        return Err(ApiError::Conflict(
            "OUT_OF_RANGE",
            "request is outside your dispatch radius".into(),
        ));
    }
    Ok(())
}

/* ============================================================
   Profile
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct DriverProfile {
    #[serde(flatten)]
    pub driver: DriverRow,
    pub independent: bool,
}

pub async fn get_me(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<DriverProfile>>, ApiError> {
    let driver = my_driver(&state, &auth).await?;
    Ok(Json(ApiOk {
        data: DriverProfile {
            independent: driver.is_independent(),
            driver,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateLocationRequest {
    pub latitude: f64,
    pub longitude: f64,
}

pub async fn update_location(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<UpdateLocationRequest>,
) -> Result<Json<ApiOk<DriverRow>>, ApiError> {
    auth.require_driver()?;
    let loc = GeoPoint::new(req.latitude, req.longitude);
    if !loc.is_valid() {
        return Err(ApiError::validation("latitude/longitude out of range"));
    }

    let sql = format!(
        r#"
        UPDATE driver
        SET latitude = $2, longitude = $3, updated_at = now()
        WHERE user_id = $1
        RETURNING {DRIVER_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DriverRow>(&sql)
        .bind(auth.user_id)
        .bind(loc.latitude)
        .bind(loc.longitude)
        .fetch_optional(&state.db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("driver"))?;

    tracing::debug!(driver_id = %row.driver_id, "driver location updated");
    Ok(Json(ApiOk { data: row }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAvailabilityRequest {
    pub is_available: bool,
}

pub async fn update_availability(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<UpdateAvailabilityRequest>,
) -> Result<Json<ApiOk<DriverRow>>, ApiError> {
    auth.require_driver()?;

    let mut tx = state.db.begin().await.map_err(db_error)?;
    let driver = load_my_driver(&mut tx, auth.user_id, true).await?;

    if req.is_available && active_assignment(&mut tx, driver.driver_id).await?.is_some() {
        return Err(ApiError::Conflict(
            "ON_TRIP",
            "cannot go available during an active trip".into(),
        ));
    }

    let sql = format!(
        r#"
        UPDATE driver
        SET is_available = $2, updated_at = now()
        WHERE driver_id = $1
        RETURNING {DRIVER_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DriverRow>(&sql)
        .bind(driver.driver_id)
        .bind(req.is_available)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

    tx.commit().await.map_err(db_error)?;

    tracing::info!(driver_id = %row.driver_id, available = row.is_available, "driver availability changed");
    Ok(Json(ApiOk { data: row }))
}

/* ============================================================
   Independent claims
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct OpenRequest {
    pub booking_id: String,
    pub status: RequestStatus,
    pub emergency_type: String,
    pub pickup: GeoPoint,
    pub pickup_address: String,
    pub ambulances_remaining: i32,
    pub distance_km: f64,
    pub created_at: DateTime<Utc>,
}

/// Open requests within `radius_km` of `from`, nearest first.
fn nearby_open(from: &GeoPoint, rows: Vec<RequestRow>, radius_km: f64) -> Result<Vec<OpenRequest>, ApiError> {
    let mut out = Vec::new();
    for r in rows {
        let status = r.status()?;
        if !r.open_to_independent || !status.is_open_to_independent() || r.ambulances_remaining <= 0 {
            continue;
        }
        let distance_km = from.distance_km(&r.pickup());
        if distance_km > radius_km {
            continue;
        }
        out.push(OpenRequest {
            pickup: r.pickup(),
            booking_id: r.booking_id,
            status,
            emergency_type: r.emergency_type,
            pickup_address: r.pickup_address,
            ambulances_remaining: r.ambulances_remaining,
            distance_km,
            created_at: r.created_at,
        });
    }
    out.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    Ok(out)
}

pub async fn list_open_requests(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<OpenRequest>>>, ApiError> {
    let driver = my_driver(&state, &auth).await?;
    ensure_independent(&driver)?;
    let loc = driver.location().ok_or_else(|| {
        ApiError::BadRequest("LOCATION_REQUIRED", "update your location first".into())
    })?;

    let sql = format!(
        r#"
        SELECT {REQUEST_COLUMNS}
        FROM ambulance_request r
        WHERE r.open_to_independent = true
          AND r.ambulances_remaining > 0
          AND r.status IN ('requested', 'rejected & reassigned', 'no_partner_available', 'partially_assigned')
          AND NOT EXISTS (
              SELECT 1 FROM request_assignment a
              WHERE a.request_id = r.request_id AND a.driver_id = $1
          )
        ORDER BY r.created_at ASC
        LIMIT 500
        "#
    );
    let rows = sqlx::query_as::<_, RequestRow>(&sql)
        .bind(driver.driver_id)
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    let data = nearby_open(&loc, rows, state.dispatch.radius_km)?;
    Ok(Json(ApiOk { data }))
}

/// An independent driver takes one ambulance slot on an open request.
pub async fn claim_request(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(booking_id): Path<String>,
) -> Result<Json<ApiOk<RequestView>>, ApiError> {
    auth.require_driver()?;

    let mut tx = state.db.begin().await.map_err(db_error)?;
    // lock order: request, then assignment, then driver
    let req = store::lock_request(&mut *tx, &booking_id).await?;
    let driver = load_my_driver(&mut tx, auth.user_id, true).await?;
    let has_active = active_assignment(&mut tx, driver.driver_id).await?.is_some();

    let on_request = store::drivers_on_request(&mut *tx, req.request_id)
        .await?
        .contains(&driver.driver_id);
    check_claim(&driver, has_active, &req, on_request, state.dispatch.radius_km)?;

    let outcome = store::assign_drivers(&mut *tx, &req, std::slice::from_ref(&driver), None).await?;
    tx.commit().await.map_err(db_error)?;

    tracing::info!(booking_id = %booking_id, driver_id = %driver.driver_id, "independent driver claimed request");
    store::notify_assigned(state.notifier.as_ref(), &req, &outcome).await;
    store::notify_withdrawn(state.notifier.as_ref(), &req, &outcome).await;

    let req = store::fetch_request(&state.db, &booking_id).await?;
    let view = store::build_request_view(&state.db, &req, Utc::now()).await?;
    Ok(Json(ApiOk { data: view }))
}

/* ============================================================
   Trips
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct CurrentAssignment {
    pub assignment_id: Uuid,
    pub status: AssignmentStatus,
    pub request: RequestView,
}

pub async fn current_assignment(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Option<CurrentAssignment>>>, ApiError> {
    let driver = my_driver(&state, &auth).await?;

    let mut conn = state.db.acquire().await.map_err(db_error)?;
    let Some(a) = active_assignment(&mut conn, driver.driver_id).await? else {
        return Ok(Json(ApiOk { data: None }));
    };
    drop(conn);

    let sql = format!("SELECT {REQUEST_COLUMNS} FROM ambulance_request WHERE request_id = $1");
    let req = sqlx::query_as::<_, RequestRow>(&sql)
        .bind(a.request_id)
        .fetch_one(&state.db)
        .await
        .map_err(db_error)?;
    let request = store::build_request_view(&state.db, &req, Utc::now()).await?;

    Ok(Json(ApiOk {
        data: Some(CurrentAssignment {
            assignment_id: a.assignment_id,
            status: a.status()?,
            request,
        }),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AdvanceAssignmentRequest {
    pub status: AssignmentStatus,
    pub fare_cents: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AdvanceAssignmentData {
    pub assignment_id: Uuid,
    pub status: AssignmentStatus,
    /// Set when this completion closed the whole request.
    pub request_status: Option<RequestStatus>,
}

fn check_advance(
    current: AssignmentStatus,
    next: AssignmentStatus,
    fare_cents: Option<i64>,
) -> Result<(), ApiError> {
    if !current.is_active() {
        return Err(ApiError::Conflict(
            "TRIP_CLOSED",
            format!("assignment is already {current}"),
        ));
    }
    if !current.can_advance_to(next) {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            format!("cannot move assignment from '{current}' to '{next}'"),
        ));
    }
    if next == AssignmentStatus::Completed {
        match fare_cents {
            None => return Err(ApiError::validation("fare_cents is required to complete a trip")),
            Some(f) if f < 0 => return Err(dispatch::DispatchError::InvalidFare(f).into()),
            Some(_) => {}
        }
    }
    Ok(())
}

pub async fn advance_assignment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(assignment_id): Path<Uuid>,
    Json(req): Json<AdvanceAssignmentRequest>,
) -> Result<Json<ApiOk<AdvanceAssignmentData>>, ApiError> {
    auth.require_driver()?;

    let mut tx = state.db.begin().await.map_err(db_error)?;
    let driver = load_my_driver(&mut tx, auth.user_id, false).await?;

    let (request, assignment) = store::lock_trip(&mut *tx, assignment_id, driver.driver_id).await?;

    let current = assignment.status()?;
    check_advance(current, req.status, req.fare_cents)?;

    let request_status = match (req.status, req.fare_cents) {
        (AssignmentStatus::Completed, Some(fare)) => {
            store::complete_assignment(&mut *tx, &request, &assignment, fare).await?
        }
        _ => {
            sqlx::query(
                r#"
                UPDATE request_assignment
                SET status = $2, updated_at = now()
                WHERE assignment_id = $1
                "#,
            )
            .bind(assignment_id)
            .bind(req.status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
            None
        }
    };

    tx.commit().await.map_err(db_error)?;

    tracing::info!(
        assignment_id = %assignment_id,
        from = %current,
        to = %req.status,
        "trip progressed"
    );

    Ok(Json(ApiOk {
        data: AdvanceAssignmentData {
            assignment_id,
            status: req.status,
            request_status,
        },
    }))
}

/* ============================================================
   Inbox
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    pub after: Option<i64>,
}

/// Polling inbox. Open to any signed-in user; partners mount it too.
pub async fn list_notifications(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<NotificationsQuery>,
) -> Result<Json<ApiOk<Vec<NotificationRow>>>, ApiError> {
    let rows = notify::list_for_user(
        &state.db,
        auth.user_id,
        q.after.unwrap_or(0).max(0),
        NOTIFICATION_PAGE,
    )
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk { data: rows }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(partner: Option<Uuid>) -> DriverRow {
        let now = Utc::now();
        DriverRow {
            driver_id: Uuid::from_u128(10),
            user_id: Uuid::from_u128(11),
            partner_id: partner,
            full_name: "Imran".into(),
            license_number: "KA-DL-0042".into(),
            vehicle_number: "KA01AB1234".into(),
            ambulance_type: "basic".into(),
            latitude: Some(12.9700),
            longitude: Some(77.5900),
            is_available: true,
            is_verified: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn request(status: &str, lat: f64, lng: f64) -> RequestRow {
        let now = Utc::now();
        RequestRow {
            request_id: Uuid::from_u128(1),
            booking_id: format!("AMB-20260101-{:0>6}", status.len()),
            patient_user_id: Uuid::from_u128(2),
            pickup_latitude: lat,
            pickup_longitude: lng,
            pickup_address: "Residency Rd".into(),
            emergency_type: "fall".into(),
            notes: None,
            ambulances_requested: 2,
            ambulances_remaining: 1,
            status: status.into(),
            current_partner_id: None,
            offered_at: None,
            offer_expires_at: None,
            open_to_independent: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn code(e: ApiError) -> &'static str {
        match e {
            ApiError::Unauthorized(c, _)
            | ApiError::Forbidden(c, _)
            | ApiError::BadRequest(c, _)
            | ApiError::NotFound(c, _)
            | ApiError::Conflict(c, _) => c,
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    #[test]
    fn claim_happy_path() {
        let d = driver(None);
        let r = request("no_partner_available", 12.9716, 77.5946);
        assert!(check_claim(&d, false, &r, false, 50.0).is_ok());
    }

    #[test]
    fn claim_refusals() {
        let r = request("partially_assigned", 12.9716, 77.5946);

        let fleet = driver(Some(Uuid::from_u128(5)));
        assert_eq!(code(check_claim(&fleet, false, &r, false, 50.0).unwrap_err()), "NOT_INDEPENDENT");

        let mut unverified = driver(None);
        unverified.is_verified = false;
        assert_eq!(code(check_claim(&unverified, false, &r, false, 50.0).unwrap_err()), "NOT_VERIFIED");

        let d = driver(None);
        assert_eq!(code(check_claim(&d, true, &r, false, 50.0).unwrap_err()), "DRIVER_UNAVAILABLE");
        assert_eq!(code(check_claim(&d, false, &r, true, 50.0).unwrap_err()), "ALREADY_ASSIGNED");

        let mut nowhere = driver(None);
        nowhere.latitude = None;
        nowhere.longitude = None;
        assert_eq!(code(check_claim(&nowhere, false, &r, false, 50.0).unwrap_err()), "LOCATION_REQUIRED");

        let accepted = request("accepted", 12.9716, 77.5946);
        assert_eq!(code(check_claim(&d, false, &accepted, false, 50.0).unwrap_err()), "NOT_OPEN");

        let mut closed = request("requested", 12.9716, 77.5946);
        closed.open_to_independent = false;
        assert_eq!(code(check_claim(&d, false, &closed, false, 50.0).unwrap_err()), "NOT_OPEN");

        let mut full = request("partially_assigned", 12.9716, 77.5946);
        full.ambulances_remaining = 0;
        assert_eq!(code(check_claim(&d, false, &full, false, 50.0).unwrap_err()), "NO_AMBULANCES_REMAINING");

        // Mysuru is ~130 km from Bengaluru
        let far = request("requested", 12.2958, 76.6394);
        assert_eq!(code(check_claim(&d, false, &far, false, 50.0).unwrap_err()), "OUT_OF_RANGE");
    }

    #[test]
    fn claim_on_three_ambulance_offer_leaves_partner_routing_intact() {
        let d = driver(None);
        let partner = Uuid::from_u128(5);
        let mut r = request("requested", 12.9716, 77.5946);
        r.ambulances_requested = 3;
        r.ambulances_remaining = 3;
        r.current_partner_id = Some(partner);
        r.offer_expires_at = Some(Utc::now() + chrono::Duration::seconds(40));
        assert!(check_claim(&d, false, &r, false, 50.0).is_ok());

        let allocation = dispatch::allocate(r.ambulances_remaining, 1).unwrap();
        let after = dispatch::after_assignment(r.status().unwrap(), r.current_partner_id, None, &allocation);
        assert_eq!(allocation.remaining, 2);
        assert_eq!(after.status, RequestStatus::Requested);
        assert_eq!(after.partner_id, Some(partner));
        assert!(after.offer_kept);
        assert_eq!(after.withdrawn, None);

        // the offered hospital can still accept, and the sweeper still sees the offer
        assert!(dispatch::ensure_offer_held(after.status, after.partner_id, partner).is_ok());
        let later = r.offer_expires_at.unwrap() + chrono::Duration::seconds(1);
        assert_eq!(
            dispatch::due_offer(after.status, after.partner_id, r.offer_expires_at, later),
            Some(partner)
        );
    }

    #[test]
    fn open_requests_sorted_and_filtered() {
        let here = GeoPoint::new(12.9700, 77.5900);
        let rows = vec![
            request("requested", 13.0200, 77.5500),
            request("no_partner_available", 12.9716, 77.5946),
            request("accepted", 12.9710, 77.5910),
            request("rejected & reassigned", 12.2958, 76.6394),
        ];

        let out = nearby_open(&here, rows, 50.0).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].status, RequestStatus::NoPartnerAvailable);
        assert_eq!(out[1].status, RequestStatus::Requested);
        assert!(out[0].distance_km < out[1].distance_km);
    }

    #[test]
    fn trip_steps_forward_only() {
        use AssignmentStatus::*;
        assert!(check_advance(Assigned, EnRoute, None).is_ok());
        assert!(check_advance(EnRoute, Arrived, None).is_ok());
        assert!(check_advance(Arrived, Completed, Some(150_000)).is_ok());

        assert_eq!(code(check_advance(Assigned, Arrived, None).unwrap_err()), "INVALID_TRANSITION");
        assert_eq!(code(check_advance(Cancelled, EnRoute, None).unwrap_err()), "TRIP_CLOSED");
        assert_eq!(code(check_advance(Completed, Completed, Some(1)).unwrap_err()), "TRIP_CLOSED");
        assert_eq!(code(check_advance(Arrived, Completed, None).unwrap_err()), "VALIDATION_ERROR");
        assert_eq!(code(check_advance(Arrived, Completed, Some(-1)).unwrap_err()), "VALIDATION_ERROR");
    }

    #[test]
    fn advance_body_uses_wire_names() {
        let body: AdvanceAssignmentRequest =
            serde_json::from_str(r#"{"status":"en_route"}"#).unwrap();
        assert_eq!(body.status, AssignmentStatus::EnRoute);
        assert!(body.fare_cents.is_none());
    }
}
