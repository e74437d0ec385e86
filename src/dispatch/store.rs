// src/dispatch/store.rs
//
// Transactional persistence for the request lifecycle. Callers open a
// transaction, lock the request row with `lock_request`, run one of the
// mutations below, commit, then fire notifications.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{
    after_assignment, allocate, commission_cents, due_offer, ensure_offer_held, nearest_partner,
    offer_seconds_left, route_decision, status_after_routing, Allocation, AssignmentStatus,
    PartnerCandidate, RejectionReason, RequestStatus, RoutedPartner,
};
use crate::error::{db_error, ApiError};
use crate::geo::GeoPoint;
use crate::models::{
    AssignmentRow, AssignmentView, DispatchSettings, DriverRow, PartnerBrief, RequestRow,
    RequestView, ASSIGNMENT_COLUMNS, REQUEST_COLUMNS,
};
use crate::notify::{notify_best_effort, NotificationKind, Notifier};

/* ============================================================
   Loading
   ============================================================ */

pub async fn fetch_request(db: &PgPool, booking_id: &str) -> Result<RequestRow, ApiError> {
    let sql = format!("SELECT {REQUEST_COLUMNS} FROM ambulance_request WHERE booking_id = $1");
    sqlx::query_as::<_, RequestRow>(&sql)
        .bind(booking_id)
        .fetch_optional(db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("request"))
}

/// Row-locks the request for the rest of the transaction.
pub async fn lock_request(conn: &mut PgConnection, booking_id: &str) -> Result<RequestRow, ApiError> {
    let sql = format!(
        "SELECT {REQUEST_COLUMNS} FROM ambulance_request WHERE booking_id = $1 FOR UPDATE"
    );
    sqlx::query_as::<_, RequestRow>(&sql)
        .bind(booking_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("request"))
}

pub async fn lock_request_by_id(
    conn: &mut PgConnection,
    request_id: Uuid,
) -> Result<RequestRow, ApiError> {
    let sql = format!(
        "SELECT {REQUEST_COLUMNS} FROM ambulance_request WHERE request_id = $1 FOR UPDATE"
    );
    sqlx::query_as::<_, RequestRow>(&sql)
        .bind(request_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("request"))
}

async fn load_assignment(
    conn: &mut PgConnection,
    assignment_id: Uuid,
    driver_id: Uuid,
    for_update: bool,
) -> Result<AssignmentRow, ApiError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let sql = format!(
        "SELECT {ASSIGNMENT_COLUMNS} FROM request_assignment \
         WHERE assignment_id = $1 AND driver_id = $2{lock}"
    );
    sqlx::query_as::<_, AssignmentRow>(&sql)
        .bind(assignment_id)
        .bind(driver_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("assignment"))
}

/// Locks a driver's assignment together with its request. Every path that
/// touches both takes the request first, then the assignment, then the
/// driver; the assignment is re-read after the request lock so a concurrent
/// cancellation is seen.
pub async fn lock_trip(
    conn: &mut PgConnection,
    assignment_id: Uuid,
    driver_id: Uuid,
) -> Result<(RequestRow, AssignmentRow), ApiError> {
    let unlocked = load_assignment(conn, assignment_id, driver_id, false).await?;
    let req = lock_request_by_id(conn, unlocked.request_id).await?;
    let assignment = load_assignment(conn, assignment_id, driver_id, true).await?;
    Ok((req, assignment))
}

pub async fn excluded_partners(
    conn: &mut PgConnection,
    request_id: Uuid,
) -> Result<HashSet<Uuid>, ApiError> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT partner_id
        FROM request_rejection
        WHERE request_id = $1
        "#,
    )
    .bind(request_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;

    Ok(ids.into_iter().collect())
}

/// Approved, accepting partners whose account is active.
pub async fn dispatchable_partners(
    conn: &mut PgConnection,
) -> Result<Vec<PartnerCandidate>, ApiError> {
    let rows: Vec<(Uuid, f64, f64)> = sqlx::query_as(
        r#"
        SELECT p.partner_id, p.latitude, p.longitude
        FROM partner p
        JOIN app_user u ON u.user_id = p.user_id
        WHERE p.onboarding_status = 1
          AND p.is_accepting = true
          AND u.is_active = true
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;

    Ok(rows
        .into_iter()
        .map(|(partner_id, lat, lng)| PartnerCandidate {
            partner_id,
            location: GeoPoint::new(lat, lng),
        })
        .collect())
}

pub async fn pick_partner(
    conn: &mut PgConnection,
    pickup: &GeoPoint,
    excluded: &HashSet<Uuid>,
    settings: DispatchSettings,
) -> Result<Option<RoutedPartner>, ApiError> {
    let candidates = dispatchable_partners(conn).await?;
    Ok(nearest_partner(pickup, &candidates, excluded, settings.radius_km))
}

async fn partner_user_id(conn: &mut PgConnection, partner_id: Uuid) -> Result<Uuid, ApiError> {
    sqlx::query_scalar("SELECT user_id FROM partner WHERE partner_id = $1")
        .bind(partner_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error)
}

/* ============================================================
   Routing / reassignment
   ============================================================ */

#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    pub booking_id: String,
    pub status: RequestStatus,
    pub partner: Option<RoutedPartner>,
    pub partner_user_id: Option<Uuid>,
    pub offer_expires_at: Option<DateTime<Utc>>,
}

pub struct NewRequest<'a> {
    pub booking_id: &'a str,
    pub patient_user_id: Uuid,
    pub pickup: GeoPoint,
    pub pickup_address: &'a str,
    pub emergency_type: &'a str,
    pub notes: Option<&'a str>,
    pub ambulances_requested: i32,
    pub open_to_independent: bool,
}

pub const ACTIVE_REQUEST_CONSTRAINT: &str = "ambulance_request_one_active_per_patient";

/// Inserts a booking already routed to its nearest partner (or to nobody).
pub async fn insert_routed_request(
    conn: &mut PgConnection,
    new: &NewRequest<'_>,
    settings: DispatchSettings,
    now: DateTime<Utc>,
) -> Result<(RequestRow, RoutingOutcome), ApiError> {
    let routed = pick_partner(conn, &new.pickup, &HashSet::new(), settings).await?;
    let status = status_after_routing(false, routed.is_some());
    let (offered_at, expires_at) = offer_window(routed.is_some(), settings, now);

    let sql = format!(
        r#"
        INSERT INTO ambulance_request (
          booking_id, patient_user_id, pickup_latitude, pickup_longitude,
          pickup_address, emergency_type, notes, ambulances_requested,
          ambulances_remaining, status, current_partner_id, offered_at, offer_expires_at,
          open_to_independent
        )
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$8,$9,$10,$11,$12,$13)
        RETURNING {REQUEST_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, RequestRow>(&sql)
        .bind(new.booking_id)
        .bind(new.patient_user_id)
        .bind(new.pickup.latitude)
        .bind(new.pickup.longitude)
        .bind(new.pickup_address)
        .bind(new.emergency_type)
        .bind(new.notes)
        .bind(new.ambulances_requested)
        .bind(status.as_str())
        .bind(routed.as_ref().map(|r| r.partner_id))
        .bind(offered_at)
        .bind(expires_at)
        .bind(new.open_to_independent)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            let is_dup = e
                .as_database_error()
                .and_then(|d| d.constraint())
                .is_some_and(|c| c == ACTIVE_REQUEST_CONSTRAINT);
            if is_dup {
                ApiError::from(super::DispatchError::DuplicateRequest(
                    "patient already has a live booking".into(),
                ))
            } else {
                db_error(e)
            }
        })?;

    let partner_user = match &routed {
        Some(r) => Some(partner_user_id(conn, r.partner_id).await?),
        None => None,
    };

    tracing::info!(
        booking_id = %row.booking_id,
        status = %status,
        partner = ?routed.as_ref().map(|r| r.partner_id),
        "booking created"
    );

    let outcome = RoutingOutcome {
        booking_id: row.booking_id.clone(),
        status,
        partner: routed,
        partner_user_id: partner_user,
        offer_expires_at: expires_at,
    };
    Ok((row, outcome))
}

fn offer_window(
    routed: bool,
    settings: DispatchSettings,
    now: DateTime<Utc>,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    if routed {
        (Some(now), Some(now + Duration::seconds(settings.offer_ttl_secs)))
    } else {
        (None, None)
    }
}

/// Re-runs the nearest-partner lookup for a locked request, honouring its
/// exclusion list. A request that stays unroutable while already in
/// `no_partner_available` is left untouched.
pub async fn route_request(
    conn: &mut PgConnection,
    req: &RequestRow,
    settings: DispatchSettings,
    is_reassignment: bool,
    now: DateTime<Utc>,
) -> Result<RoutingOutcome, ApiError> {
    let current = req.status()?;
    let excluded = excluded_partners(conn, req.request_id).await?;
    let routed = pick_partner(conn, &req.pickup(), &excluded, settings).await?;

    let Some(next) = route_decision(current, routed.is_some(), is_reassignment)? else {
        return Ok(RoutingOutcome {
            booking_id: req.booking_id.clone(),
            status: current,
            partner: None,
            partner_user_id: None,
            offer_expires_at: None,
        });
    };
    let (offered_at, expires_at) = offer_window(routed.is_some(), settings, now);

    sqlx::query(
        r#"
        UPDATE ambulance_request
        SET status = $2,
            current_partner_id = $3,
            offered_at = $4,
            offer_expires_at = $5,
            updated_at = now()
        WHERE request_id = $1
        "#,
    )
    .bind(req.request_id)
    .bind(next.as_str())
    .bind(routed.as_ref().map(|r| r.partner_id))
    .bind(offered_at)
    .bind(expires_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    let partner_user = match &routed {
        Some(r) => Some(partner_user_id(conn, r.partner_id).await?),
        None => None,
    };

    tracing::info!(
        booking_id = %req.booking_id,
        from = %current,
        to = %next,
        partner = ?routed.as_ref().map(|r| r.partner_id),
        excluded = excluded.len(),
        "request routed"
    );

    Ok(RoutingOutcome {
        booking_id: req.booking_id.clone(),
        status: next,
        partner: routed,
        partner_user_id: partner_user,
        offer_expires_at: expires_at,
    })
}

pub async fn record_exclusion(
    conn: &mut PgConnection,
    request_id: Uuid,
    partner_id: Uuid,
    reason: RejectionReason,
) -> Result<(), ApiError> {
    sqlx::query(
        r#"
        INSERT INTO request_rejection (request_id, partner_id, reason)
        VALUES ($1, $2, $3)
        ON CONFLICT (request_id, partner_id) DO NOTHING
        "#,
    )
    .bind(request_id)
    .bind(partner_id)
    .bind(reason as i16)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

/// Excludes `partner_id` and hands the request to the next nearest partner.
pub async fn reassign_away_from(
    conn: &mut PgConnection,
    req: &RequestRow,
    partner_id: Uuid,
    reason: RejectionReason,
    settings: DispatchSettings,
    now: DateTime<Utc>,
) -> Result<RoutingOutcome, ApiError> {
    record_exclusion(conn, req.request_id, partner_id, reason).await?;
    route_request(conn, req, settings, true, now).await
}

/// Reassigns when the partner let the countdown run out. `None` when the
/// offer is still live or no longer pending.
pub async fn expire_if_due(
    conn: &mut PgConnection,
    req: &RequestRow,
    settings: DispatchSettings,
    now: DateTime<Utc>,
) -> Result<Option<RoutingOutcome>, ApiError> {
    let status = req.status()?;
    let Some(partner_id) = due_offer(status, req.current_partner_id, req.offer_expires_at, now)
    else {
        return Ok(None);
    };

    tracing::info!(
        booking_id = %req.booking_id,
        partner = %partner_id,
        "partner offer expired"
    );
    let out =
        reassign_away_from(conn, req, partner_id, RejectionReason::Expired, settings, now).await?;
    Ok(Some(out))
}

pub async fn accept_offer(
    conn: &mut PgConnection,
    req: &RequestRow,
    partner_id: Uuid,
    now: DateTime<Utc>,
) -> Result<RequestStatus, ApiError> {
    let current = req.status()?;
    ensure_offer_held(current, req.current_partner_id, partner_id)?;
    if req.offer_expires_at.is_some_and(|exp| exp <= now) {
        return Err(super::DispatchError::OfferExpired.into());
    }
    let next = current.transition(RequestStatus::Accepted)?;

    sqlx::query(
        r#"
        UPDATE ambulance_request
        SET status = $2,
            offer_expires_at = NULL,
            updated_at = now()
        WHERE request_id = $1
        "#,
    )
    .bind(req.request_id)
    .bind(next.as_str())
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    tracing::info!(booking_id = %req.booking_id, partner = %partner_id, "request accepted");
    Ok(next)
}

/* ============================================================
   Driver assignment
   ============================================================ */

#[derive(Debug)]
pub struct AssignmentOutcome {
    pub allocation: Allocation,
    pub assigned: Vec<(AssignmentRow, DriverRow)>,
    /// User of the partner whose pending offer was filled by this claim.
    pub withdrawn_user_id: Option<Uuid>,
}

pub async fn drivers_on_request(
    conn: &mut PgConnection,
    request_id: Uuid,
) -> Result<HashSet<Uuid>, ApiError> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT driver_id
        FROM request_assignment
        WHERE request_id = $1
          AND status <> 'cancelled'
        "#,
    )
    .bind(request_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(ids.into_iter().collect())
}

/// Puts `eligible` drivers on the request. `assigning_partner` is `None` for
/// an independent driver's claim; see `after_assignment` for what happens to
/// a pending partner offer.
pub async fn assign_drivers(
    conn: &mut PgConnection,
    req: &RequestRow,
    eligible: &[DriverRow],
    assigning_partner: Option<Uuid>,
) -> Result<AssignmentOutcome, ApiError> {
    let current = req.status()?;
    let allocation = allocate(req.ambulances_remaining, eligible.len())?;
    let after = after_assignment(current, req.current_partner_id, assigning_partner, &allocation);
    let next = if after.status == current {
        current
    } else {
        current.transition(after.status)?
    };

    let mut assigned = Vec::with_capacity(allocation.assigned);
    let insert_sql = format!(
        r#"
        INSERT INTO request_assignment (request_id, driver_id, partner_id, status)
        VALUES ($1, $2, $3, $4)
        RETURNING {ASSIGNMENT_COLUMNS}
        "#
    );

    for driver in eligible.iter().take(allocation.assigned) {
        let row = sqlx::query_as::<_, AssignmentRow>(&insert_sql)
            .bind(req.request_id)
            .bind(driver.driver_id)
            .bind(driver.partner_id)
            .bind(AssignmentStatus::Assigned.as_str())
            .fetch_one(&mut *conn)
            .await
            .map_err(db_error)?;

        // guarded so a driver grabbed concurrently elsewhere aborts the transaction
        let freed = sqlx::query(
            r#"
            UPDATE driver
            SET is_available = false, updated_at = now()
            WHERE driver_id = $1 AND is_available = true
            "#,
        )
        .bind(driver.driver_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
        if freed.rows_affected() == 0 {
            return Err(ApiError::Conflict(
                "DRIVER_UNAVAILABLE",
                format!("driver {} was taken by another request", driver.driver_id),
            ));
        }

        assigned.push((row, driver.clone()));
    }

    let offer_expires_at = if after.offer_kept {
        req.offer_expires_at
    } else {
        None
    };

    sqlx::query(
        r#"
        UPDATE ambulance_request
        SET status = $2,
            ambulances_remaining = $3,
            current_partner_id = $4,
            offer_expires_at = $5,
            updated_at = now()
        WHERE request_id = $1
        "#,
    )
    .bind(req.request_id)
    .bind(next.as_str())
    .bind(allocation.remaining)
    .bind(after.partner_id)
    .bind(offer_expires_at)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    let withdrawn_user_id = match after.withdrawn {
        Some(pid) => Some(partner_user_id(conn, pid).await?),
        None => None,
    };

    tracing::info!(
        booking_id = %req.booking_id,
        assigned = allocation.assigned,
        remaining = allocation.remaining,
        status = %next,
        offer_withdrawn = after.withdrawn.is_some(),
        "drivers assigned"
    );

    Ok(AssignmentOutcome {
        allocation,
        assigned,
        withdrawn_user_id,
    })
}

/* ============================================================
   Cancellation + completion
   ============================================================ */

/// Cancels the request and every live assignment; returns the user ids of
/// drivers that were released.
pub async fn cancel_request(conn: &mut PgConnection, req: &RequestRow) -> Result<Vec<Uuid>, ApiError> {
    let current = req.status()?;
    if current.is_terminal() {
        return Err(ApiError::Conflict(
            "REQUEST_CLOSED",
            format!("request is already {current}"),
        ));
    }
    let next = current.transition(RequestStatus::Cancelled)?;

    sqlx::query(
        r#"
        UPDATE ambulance_request
        SET status = $2,
            offer_expires_at = NULL,
            updated_at = now()
        WHERE request_id = $1
        "#,
    )
    .bind(req.request_id)
    .bind(next.as_str())
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    let released: Vec<Uuid> = sqlx::query_scalar(
        r#"
        WITH cancelled AS (
            UPDATE request_assignment
            SET status = 'cancelled', updated_at = now()
            WHERE request_id = $1
              AND status IN ('assigned', 'en_route', 'arrived')
            RETURNING driver_id
        )
        UPDATE driver d
        SET is_available = true, updated_at = now()
        FROM cancelled c
        WHERE d.driver_id = c.driver_id
        RETURNING d.user_id
        "#,
    )
    .bind(req.request_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;

    tracing::info!(
        booking_id = %req.booking_id,
        released = released.len(),
        "request cancelled"
    );
    Ok(released)
}

/// Finishes one assignment, books the partner commission and closes the
/// request once nothing is left outstanding. `req` must already be locked.
pub async fn complete_assignment(
    conn: &mut PgConnection,
    req: &RequestRow,
    assignment: &AssignmentRow,
    fare_cents: i64,
) -> Result<Option<RequestStatus>, ApiError> {
    if fare_cents < 0 {
        return Err(super::DispatchError::InvalidFare(fare_cents).into());
    }

    let commission_pct: Option<f64> = match assignment.partner_id {
        Some(pid) => Some(
            sqlx::query_scalar("SELECT commission_percent FROM partner WHERE partner_id = $1")
                .bind(pid)
                .fetch_one(&mut *conn)
                .await
                .map_err(db_error)?,
        ),
        None => None,
    };
    let commission = match commission_pct {
        Some(pct) => Some((pct, commission_cents(fare_cents, pct)?)),
        None => None,
    };

    sqlx::query(
        r#"
        UPDATE request_assignment
        SET status = 'completed',
            fare_cents = $2,
            completed_at = now(),
            updated_at = now()
        WHERE assignment_id = $1
        "#,
    )
    .bind(assignment.assignment_id)
    .bind(fare_cents)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    sqlx::query("UPDATE driver SET is_available = true, updated_at = now() WHERE driver_id = $1")
        .bind(assignment.driver_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;

    if let (Some(partner_id), Some((pct, cents))) = (assignment.partner_id, commission) {
        sqlx::query(
            r#"
            INSERT INTO commission_ledger
              (assignment_id, partner_id, fare_cents, commission_percent, commission_cents)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(assignment.assignment_id)
        .bind(partner_id)
        .bind(fare_cents)
        .bind(pct)
        .bind(cents)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    }

    let outstanding: i64 = sqlx::query_scalar(
        r#"
        SELECT count(*)
        FROM request_assignment
        WHERE request_id = $1
          AND status IN ('assigned', 'en_route', 'arrived')
        "#,
    )
    .bind(assignment.request_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error)?;

    let current = req.status()?;
    if outstanding == 0 && req.ambulances_remaining == 0 && current == RequestStatus::Assigned {
        let next = current.transition(RequestStatus::Completed)?;
        sqlx::query(
            "UPDATE ambulance_request SET status = $2, updated_at = now() WHERE request_id = $1",
        )
        .bind(req.request_id)
        .bind(next.as_str())
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;

        tracing::info!(booking_id = %req.booking_id, "request completed");
        return Ok(Some(next));
    }

    Ok(None)
}

/* ============================================================
   Notifications
   ============================================================ */

pub async fn notify_routing(notifier: &dyn Notifier, outcome: &RoutingOutcome, req: &RequestRow) {
    let (Some(user_id), Some(partner)) = (outcome.partner_user_id, outcome.partner.as_ref()) else {
        return;
    };
    let kind = if outcome.status == RequestStatus::RejectedReassigned {
        NotificationKind::RequestReassigned
    } else {
        NotificationKind::RequestOffered
    };
    notify_best_effort(
        notifier,
        user_id,
        kind,
        json!({
            "booking_id": outcome.booking_id,
            "distance_km": partner.distance_km,
            "offer_expires_at": outcome.offer_expires_at,
            "emergency_type": req.emergency_type,
            "pickup_address": req.pickup_address,
            "ambulances_requested": req.ambulances_requested,
            "ambulances_remaining": req.ambulances_remaining,
        }),
    )
    .await;
}

pub async fn notify_assigned(notifier: &dyn Notifier, req: &RequestRow, outcome: &AssignmentOutcome) {
    for (assignment, driver) in &outcome.assigned {
        notify_best_effort(
            notifier,
            driver.user_id,
            NotificationKind::DriverAssigned,
            json!({
                "booking_id": req.booking_id,
                "assignment_id": assignment.assignment_id,
                "pickup": req.pickup(),
                "pickup_address": req.pickup_address,
                "emergency_type": req.emergency_type,
            }),
        )
        .await;
    }
}

/// Tells a partner its pending offer was filled by independent drivers.
pub async fn notify_withdrawn(notifier: &dyn Notifier, req: &RequestRow, outcome: &AssignmentOutcome) {
    let Some(user_id) = outcome.withdrawn_user_id else {
        return;
    };
    notify_best_effort(
        notifier,
        user_id,
        NotificationKind::OfferWithdrawn,
        json!({ "booking_id": req.booking_id }),
    )
    .await;
}

pub async fn notify_cancelled(notifier: &dyn Notifier, booking_id: &str, driver_user_ids: &[Uuid]) {
    for user_id in driver_user_ids {
        notify_best_effort(
            notifier,
            *user_id,
            NotificationKind::RequestCancelled,
            json!({ "booking_id": booking_id }),
        )
        .await;
    }
}

/* ============================================================
   Polling view
   ============================================================ */

#[derive(Debug, sqlx::FromRow)]
struct AssignmentJoinRow {
    assignment_id: Uuid,
    driver_id: Uuid,
    status: String,
    fare_cents: Option<i64>,
    assigned_at: DateTime<Utc>,
    full_name: String,
    vehicle_number: String,
    ambulance_type: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    driver_partner_id: Option<Uuid>,
}

pub async fn build_request_view(
    db: &PgPool,
    req: &RequestRow,
    now: DateTime<Utc>,
) -> Result<RequestView, ApiError> {
    let status = req.status()?;

    let current_partner = match req.current_partner_id {
        Some(pid) => {
            let row: Option<(String, f64, f64)> = sqlx::query_as(
                "SELECT hospital_name, latitude, longitude FROM partner WHERE partner_id = $1",
            )
            .bind(pid)
            .fetch_optional(db)
            .await
            .map_err(db_error)?;
            row.map(|(hospital_name, lat, lng)| PartnerBrief {
                partner_id: pid,
                hospital_name,
                distance_km: req.pickup().distance_km(&GeoPoint::new(lat, lng)),
            })
        }
        None => None,
    };

    let excluded_partners: i64 =
        sqlx::query_scalar("SELECT count(*) FROM request_rejection WHERE request_id = $1")
            .bind(req.request_id)
            .fetch_one(db)
            .await
            .map_err(db_error)?;

    let rows: Vec<AssignmentJoinRow> = sqlx::query_as::<_, AssignmentJoinRow>(
        r#"
        SELECT
          a.assignment_id,
          a.driver_id,
          a.status,
          a.fare_cents,
          a.assigned_at,
          d.full_name,
          d.vehicle_number,
          d.ambulance_type,
          d.latitude,
          d.longitude,
          d.partner_id AS driver_partner_id
        FROM request_assignment a
        JOIN driver d ON d.driver_id = a.driver_id
        WHERE a.request_id = $1
        ORDER BY a.assigned_at ASC
        "#,
    )
    .bind(req.request_id)
    .fetch_all(db)
    .await
    .map_err(db_error)?;

    let mut assignments = Vec::with_capacity(rows.len());
    for r in rows {
        assignments.push(AssignmentView {
            assignment_id: r.assignment_id,
            driver_id: r.driver_id,
            driver_name: r.full_name,
            vehicle_number: r.vehicle_number,
            ambulance_type: r.ambulance_type,
            driver_location: match (r.latitude, r.longitude) {
                (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
                _ => None,
            },
            independent: r.driver_partner_id.is_none(),
            status: r.status.parse().map_err(ApiError::Internal)?,
            fare_cents: r.fare_cents,
            assigned_at: r.assigned_at,
        });
    }

    let offer_expires_at = if status.is_awaiting_partner() {
        req.offer_expires_at
    } else {
        None
    };

    Ok(RequestView {
        request_id: req.request_id,
        booking_id: req.booking_id.clone(),
        status,
        pickup: req.pickup(),
        pickup_address: req.pickup_address.clone(),
        emergency_type: req.emergency_type.clone(),
        notes: req.notes.clone(),
        ambulances_requested: req.ambulances_requested,
        ambulances_remaining: req.ambulances_remaining,
        current_partner,
        offer_expires_at,
        offer_seconds_left: offer_seconds_left(offer_expires_at, now),
        excluded_partners,
        assignments,
        created_at: req.created_at,
        updated_at: req.updated_at,
    })
}
