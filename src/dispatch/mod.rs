// src/dispatch/mod.rs
//
// Request lifecycle rules. Everything here is pure; the SQL side lives in
// `store`, the offer timer in `sweeper`.

pub mod store;
pub mod sweeper;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::models::DriverRow;

pub const MAX_AMBULANCES_PER_REQUEST: i32 = 5;
pub const MIN_COMMISSION_PERCENT: f64 = 3.0;
pub const MAX_COMMISSION_PERCENT: f64 = 5.0;
pub const DEFAULT_COMMISSION_PERCENT: f64 = 4.0;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot move request from '{from}' to '{to}'")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },
    #[error("an active request already exists ({0})")]
    DuplicateRequest(String),
    #[error("this request is not currently offered to you")]
    OfferNotHeld,
    #[error("the offer for this request has expired")]
    OfferExpired,
    #[error("no ambulances remaining on this request")]
    NoAmbulancesRemaining,
    #[error("none of the given drivers could be assigned")]
    NoDriverAssigned,
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(String),
    #[error("ambulances_requested must be between 1 and 5, got {0}")]
    InvalidAmbulanceCount(i32),
    #[error("commission_percent must be between 3 and 5, got {0}")]
    InvalidCommission(f64),
    #[error("fare_cents must be >= 0, got {0}")]
    InvalidFare(i64),
}

/* ============================================================
   Request status
   ============================================================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    #[serde(rename = "requested")]
    Requested,
    #[serde(rename = "accepted")]
    Accepted,
    #[serde(rename = "assigned")]
    Assigned,
    #[serde(rename = "partially_assigned")]
    PartiallyAssigned,
    #[serde(rename = "rejected & reassigned")]
    RejectedReassigned,
    #[serde(rename = "no_partner_available")]
    NoPartnerAvailable,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "completed")]
    Completed,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 8] = [
        RequestStatus::Requested,
        RequestStatus::Accepted,
        RequestStatus::Assigned,
        RequestStatus::PartiallyAssigned,
        RequestStatus::RejectedReassigned,
        RequestStatus::NoPartnerAvailable,
        RequestStatus::Cancelled,
        RequestStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Requested => "requested",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Assigned => "assigned",
            RequestStatus::PartiallyAssigned => "partially_assigned",
            RequestStatus::RejectedReassigned => "rejected & reassigned",
            RequestStatus::NoPartnerAvailable => "no_partner_available",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Cancelled)
    }

    /// Waiting on the partner in `current_partner_id` to answer.
    pub fn is_awaiting_partner(&self) -> bool {
        matches!(
            self,
            RequestStatus::Requested | RequestStatus::RejectedReassigned
        )
    }

    /// Independent drivers may claim a slot on requests in these states.
    pub fn is_open_to_independent(&self) -> bool {
        matches!(
            self,
            RequestStatus::Requested
                | RequestStatus::RejectedReassigned
                | RequestStatus::NoPartnerAvailable
                | RequestStatus::PartiallyAssigned
        )
    }

    pub fn allowed_next(&self) -> &'static [RequestStatus] {
        use RequestStatus::*;
        match self {
            Requested | RejectedReassigned => &[
                Accepted,
                RejectedReassigned,
                NoPartnerAvailable,
                Assigned,
                PartiallyAssigned,
                Cancelled,
            ],
            NoPartnerAvailable => &[
                Requested,
                RejectedReassigned,
                Assigned,
                PartiallyAssigned,
                Cancelled,
            ],
            Accepted => &[Assigned, PartiallyAssigned, Cancelled],
            PartiallyAssigned => &[PartiallyAssigned, Assigned, Cancelled],
            Assigned => &[Completed, Cancelled],
            Completed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn transition(self, next: RequestStatus) -> Result<RequestStatus, DispatchError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            tracing::warn!(from = %self, to = %next, "rejected request status transition");
            Err(DispatchError::InvalidTransition { from: self, to: next })
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown request status: {s}"))
    }
}

/* ============================================================
   Assignment (per driver) status
   ============================================================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    EnRoute,
    Arrived,
    Completed,
    Cancelled,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::EnRoute => "en_route",
            AssignmentStatus::Arrived => "arrived",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, AssignmentStatus::Completed | AssignmentStatus::Cancelled)
    }

    /// Drivers move strictly forward; cancellation comes from the request side.
    pub fn can_advance_to(&self, next: AssignmentStatus) -> bool {
        matches!(
            (*self, next),
            (AssignmentStatus::Assigned, AssignmentStatus::EnRoute)
                | (AssignmentStatus::EnRoute, AssignmentStatus::Arrived)
                | (AssignmentStatus::Arrived, AssignmentStatus::Completed)
        )
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(AssignmentStatus::Assigned),
            "en_route" => Ok(AssignmentStatus::EnRoute),
            "arrived" => Ok(AssignmentStatus::Arrived),
            "completed" => Ok(AssignmentStatus::Completed),
            "cancelled" => Ok(AssignmentStatus::Cancelled),
            _ => Err(format!("unknown assignment status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum RejectionReason {
    Rejected = 0,
    Expired = 1,
}

/* ============================================================
   Partner routing
   ============================================================ */

#[derive(Debug, Clone, PartialEq)]
pub struct PartnerCandidate {
    pub partner_id: Uuid,
    pub location: GeoPoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedPartner {
    pub partner_id: Uuid,
    pub distance_km: f64,
}

/// Nearest candidate within `radius_km` that is not excluded.
/// Equal distances resolve to the lower partner id.
pub fn nearest_partner(
    pickup: &GeoPoint,
    candidates: &[PartnerCandidate],
    excluded: &HashSet<Uuid>,
    radius_km: f64,
) -> Option<RoutedPartner> {
    candidates
        .iter()
        .filter(|c| !excluded.contains(&c.partner_id))
        .map(|c| RoutedPartner {
            partner_id: c.partner_id,
            distance_km: pickup.distance_km(&c.location),
        })
        .filter(|r| r.distance_km <= radius_km)
        .min_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.partner_id.cmp(&b.partner_id))
        })
}

/// Status a request lands in after being (re)routed.
pub fn status_after_routing(is_reassignment: bool, routed: bool) -> RequestStatus {
    match (routed, is_reassignment) {
        (false, _) => RequestStatus::NoPartnerAvailable,
        (true, true) => RequestStatus::RejectedReassigned,
        (true, false) => RequestStatus::Requested,
    }
}

/// Status to write after a routing attempt, or `None` when a request already
/// in `no_partner_available` stays unroutable and nothing should change.
pub fn route_decision(
    current: RequestStatus,
    routed: bool,
    is_reassignment: bool,
) -> Result<Option<RequestStatus>, DispatchError> {
    if !routed && current == RequestStatus::NoPartnerAvailable {
        return Ok(None);
    }
    current
        .transition(status_after_routing(is_reassignment, routed))
        .map(Some)
}

/// The partner whose offer has run out, if the request is still waiting on
/// it at `now`.
pub fn due_offer(
    status: RequestStatus,
    current_partner_id: Option<Uuid>,
    offer_expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<Uuid> {
    if !status.is_awaiting_partner() {
        return None;
    }
    match (current_partner_id, offer_expires_at) {
        (Some(partner_id), Some(exp)) if exp <= now => Some(partner_id),
        _ => None,
    }
}

/// `partner_id` currently holds a pending offer on the request.
pub fn ensure_offer_held(
    status: RequestStatus,
    current_partner_id: Option<Uuid>,
    partner_id: Uuid,
) -> Result<(), DispatchError> {
    if status.is_awaiting_partner() && current_partner_id == Some(partner_id) {
        Ok(())
    } else {
        Err(DispatchError::OfferNotHeld)
    }
}

/* ============================================================
   Multi-ambulance allocation
   ============================================================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// How many of the eligible drivers get assigned.
    pub assigned: usize,
    pub remaining: i32,
    pub status: RequestStatus,
}

/// Assign up to `remaining` of `eligible` drivers.
pub fn allocate(remaining: i32, eligible: usize) -> Result<Allocation, DispatchError> {
    if remaining <= 0 {
        return Err(DispatchError::NoAmbulancesRemaining);
    }
    if eligible == 0 {
        return Err(DispatchError::NoDriverAssigned);
    }

    let assigned = eligible.min(remaining as usize);
    let left = remaining - assigned as i32;
    let status = if left == 0 {
        RequestStatus::Assigned
    } else {
        RequestStatus::PartiallyAssigned
    };

    Ok(Allocation {
        assigned,
        remaining: left,
        status,
    })
}

/// Request state once an allocation has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AfterAssignment {
    pub status: RequestStatus,
    pub partner_id: Option<Uuid>,
    /// The pending offer to `partner_id` stays live with its countdown.
    pub offer_kept: bool,
    /// Partner whose pending offer was filled by independent drivers.
    pub withdrawn: Option<Uuid>,
}

/// `assigning_partner` is `None` for an independent driver's claim. A claim
/// that leaves ambulances outstanding does not take the request away from
/// partner routing: the status and any live offer stay as they are.
pub fn after_assignment(
    current: RequestStatus,
    current_partner_id: Option<Uuid>,
    assigning_partner: Option<Uuid>,
    allocation: &Allocation,
) -> AfterAssignment {
    let routing = current.is_awaiting_partner() || current == RequestStatus::NoPartnerAvailable;

    match assigning_partner {
        Some(p) => AfterAssignment {
            status: allocation.status,
            partner_id: Some(p),
            offer_kept: false,
            withdrawn: None,
        },
        None if routing && allocation.remaining > 0 => AfterAssignment {
            status: current,
            partner_id: current_partner_id,
            offer_kept: current.is_awaiting_partner(),
            withdrawn: None,
        },
        None if current.is_awaiting_partner() => AfterAssignment {
            status: allocation.status,
            partner_id: None,
            offer_kept: false,
            withdrawn: current_partner_id,
        },
        None => AfterAssignment {
            status: allocation.status,
            partner_id: current_partner_id,
            offer_kept: false,
            withdrawn: None,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    NotInFleet,
    NotVerified,
    Unavailable,
    AlreadyOnRequest,
    Duplicate,
    NoAmbulancesRemaining,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedDriver {
    pub driver_id: Uuid,
    pub reason: SkipReason,
}

#[derive(Debug, Default)]
pub struct DriverScreen {
    pub eligible: Vec<DriverRow>,
    pub skipped: Vec<SkippedDriver>,
}

/// Split the partner's chosen drivers into those that can go out now and
/// those that cannot, keeping the caller's order. At most `remaining`
/// drivers are eligible.
pub fn screen_drivers(
    requested: &[Uuid],
    found: &[DriverRow],
    fleet_partner: Uuid,
    on_request: &HashSet<Uuid>,
    remaining: i32,
) -> DriverScreen {
    let mut screen = DriverScreen::default();
    let mut seen = HashSet::new();
    let cap = remaining.max(0) as usize;

    for id in requested {
        let reason = if !seen.insert(*id) {
            Some(SkipReason::Duplicate)
        } else {
            match found.iter().find(|d| d.driver_id == *id) {
                None => Some(SkipReason::NotFound),
                Some(d) if d.partner_id != Some(fleet_partner) => Some(SkipReason::NotInFleet),
                Some(d) if !d.is_verified => Some(SkipReason::NotVerified),
                Some(_) if on_request.contains(id) => Some(SkipReason::AlreadyOnRequest),
                Some(d) if !d.is_available => Some(SkipReason::Unavailable),
                Some(_) if screen.eligible.len() >= cap => Some(SkipReason::NoAmbulancesRemaining),
                Some(d) => {
                    screen.eligible.push(d.clone());
                    None
                }
            }
        };

        if let Some(reason) = reason {
            screen.skipped.push(SkippedDriver {
                driver_id: *id,
                reason,
            });
        }
    }

    screen
}

/* ============================================================
   Validation + helpers
   ============================================================ */

pub fn validate_pickup(p: &GeoPoint) -> Result<(), DispatchError> {
    if p.is_valid() {
        Ok(())
    } else {
        Err(DispatchError::InvalidCoordinates(format!(
            "({}, {})",
            p.latitude, p.longitude
        )))
    }
}

pub fn validate_ambulance_count(n: i32) -> Result<i32, DispatchError> {
    if (1..=MAX_AMBULANCES_PER_REQUEST).contains(&n) {
        Ok(n)
    } else {
        Err(DispatchError::InvalidAmbulanceCount(n))
    }
}

pub fn validate_commission_percent(pct: f64) -> Result<f64, DispatchError> {
    if pct.is_finite() && (MIN_COMMISSION_PERCENT..=MAX_COMMISSION_PERCENT).contains(&pct) {
        Ok(pct)
    } else {
        Err(DispatchError::InvalidCommission(pct))
    }
}

pub fn commission_cents(fare_cents: i64, percent: f64) -> Result<i64, DispatchError> {
    if fare_cents < 0 {
        return Err(DispatchError::InvalidFare(fare_cents));
    }
    Ok((fare_cents as f64 * percent / 100.0).round() as i64)
}

const BOOKING_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// `AMB-YYYYMMDD-XXXXXX`
pub fn generate_booking_id<R: Rng + ?Sized>(now: DateTime<Utc>, rng: &mut R) -> String {
    let suffix: String = (0..6)
        .map(|_| BOOKING_ALPHABET[rng.gen_range(0..BOOKING_ALPHABET.len())] as char)
        .collect();
    format!("AMB-{}-{suffix}", now.format("%Y%m%d"))
}

/// Seconds left before the partner offer lapses (never negative).
pub fn offer_seconds_left(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    expires_at.map(|exp| (exp - now).num_seconds().max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::{rngs::StdRng, SeedableRng};

    fn cand(n: u128, lat: f64, lng: f64) -> PartnerCandidate {
        PartnerCandidate {
            partner_id: Uuid::from_u128(n),
            location: GeoPoint::new(lat, lng),
        }
    }

    #[test]
    fn status_strings_round_trip_through_from_str() {
        for st in RequestStatus::ALL {
            assert_eq!(st.as_str().parse::<RequestStatus>().unwrap(), st);
        }
        assert!("pending".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn status_serializes_to_wire_strings() {
        let json = serde_json::to_string(&RequestStatus::RejectedReassigned).unwrap();
        assert_eq!(json, "\"rejected & reassigned\"");
        let st: RequestStatus = serde_json::from_str("\"partially_assigned\"").unwrap();
        assert_eq!(st, RequestStatus::PartiallyAssigned);
    }

    #[test]
    fn terminal_states_allow_nothing() {
        for next in RequestStatus::ALL {
            assert!(!RequestStatus::Completed.can_transition_to(next));
            assert!(!RequestStatus::Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn accepted_cannot_go_back_to_partner_routing() {
        assert!(RequestStatus::Accepted
            .transition(RequestStatus::RejectedReassigned)
            .is_err());
        assert!(RequestStatus::Accepted
            .transition(RequestStatus::PartiallyAssigned)
            .is_ok());
    }

    #[test]
    fn reassigned_request_can_be_reassigned_again() {
        assert!(RequestStatus::RejectedReassigned.can_transition_to(RequestStatus::RejectedReassigned));
        assert!(RequestStatus::NoPartnerAvailable.can_transition_to(RequestStatus::Requested));
        assert!(!RequestStatus::NoPartnerAvailable.can_transition_to(RequestStatus::Accepted));
    }

    #[test]
    fn assigned_only_completes_or_cancels() {
        assert_eq!(
            RequestStatus::Assigned.allowed_next(),
            &[RequestStatus::Completed, RequestStatus::Cancelled]
        );
    }

    #[test]
    fn nearest_partner_picks_closest_within_radius() {
        let pickup = GeoPoint::new(12.9716, 77.5946);
        let candidates = vec![
            cand(1, 13.0827, 80.2707), // ~290 km
            cand(2, 12.9352, 77.6245), // ~5 km
            cand(3, 13.0200, 77.5500), // ~7 km
        ];
        let r = nearest_partner(&pickup, &candidates, &HashSet::new(), 50.0).unwrap();
        assert_eq!(r.partner_id, Uuid::from_u128(2));
        assert!(r.distance_km < 10.0);
    }

    #[test]
    fn nearest_partner_skips_excluded() {
        let pickup = GeoPoint::new(12.9716, 77.5946);
        let candidates = vec![cand(2, 12.9352, 77.6245), cand(3, 13.0200, 77.5500)];
        let excluded: HashSet<Uuid> = [Uuid::from_u128(2)].into_iter().collect();
        let r = nearest_partner(&pickup, &candidates, &excluded, 50.0).unwrap();
        assert_eq!(r.partner_id, Uuid::from_u128(3));

        let all: HashSet<Uuid> = [Uuid::from_u128(2), Uuid::from_u128(3)].into_iter().collect();
        assert!(nearest_partner(&pickup, &candidates, &all, 50.0).is_none());
    }

    #[test]
    fn nearest_partner_respects_radius() {
        let pickup = GeoPoint::new(12.9716, 77.5946);
        let candidates = vec![cand(1, 13.0827, 80.2707)];
        assert!(nearest_partner(&pickup, &candidates, &HashSet::new(), 50.0).is_none());
        assert!(nearest_partner(&pickup, &candidates, &HashSet::new(), 400.0).is_some());
    }

    #[test]
    fn nearest_partner_ties_break_on_id() {
        let pickup = GeoPoint::new(0.0, 0.0);
        let candidates = vec![cand(9, 0.1, 0.0), cand(4, 0.1, 0.0)];
        let r = nearest_partner(&pickup, &candidates, &HashSet::new(), 50.0).unwrap();
        assert_eq!(r.partner_id, Uuid::from_u128(4));
    }

    #[test]
    fn routing_status() {
        assert_eq!(status_after_routing(false, true), RequestStatus::Requested);
        assert_eq!(status_after_routing(true, true), RequestStatus::RejectedReassigned);
        assert_eq!(status_after_routing(true, false), RequestStatus::NoPartnerAvailable);
        assert_eq!(status_after_routing(false, false), RequestStatus::NoPartnerAvailable);
    }

    #[test]
    fn allocation_partial_and_full() {
        let a = allocate(3, 2).unwrap();
        assert_eq!(a.assigned, 2);
        assert_eq!(a.remaining, 1);
        assert_eq!(a.status, RequestStatus::PartiallyAssigned);

        let a = allocate(1, 1).unwrap();
        assert_eq!(a.remaining, 0);
        assert_eq!(a.status, RequestStatus::Assigned);

        // surplus drivers are not assigned
        let a = allocate(2, 5).unwrap();
        assert_eq!(a.assigned, 2);
        assert_eq!(a.status, RequestStatus::Assigned);
    }

    #[test]
    fn allocation_errors() {
        assert!(matches!(allocate(0, 3), Err(DispatchError::NoAmbulancesRemaining)));
        assert!(matches!(allocate(2, 0), Err(DispatchError::NoDriverAssigned)));
    }

    #[test]
    fn unroutable_request_is_left_alone() {
        use RequestStatus::*;
        assert_eq!(route_decision(NoPartnerAvailable, false, false).unwrap(), None);
        assert_eq!(route_decision(NoPartnerAvailable, false, true).unwrap(), None);
        assert_eq!(route_decision(NoPartnerAvailable, true, false).unwrap(), Some(Requested));
        assert_eq!(route_decision(Requested, false, true).unwrap(), Some(NoPartnerAvailable));
        assert_eq!(route_decision(Requested, true, true).unwrap(), Some(RejectedReassigned));
        assert_eq!(
            route_decision(RejectedReassigned, true, true).unwrap(),
            Some(RejectedReassigned)
        );
        assert!(matches!(
            route_decision(Accepted, true, true),
            Err(DispatchError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn offer_due_only_once_expired_and_pending() {
        let p = Uuid::from_u128(7);
        let exp = Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap();
        let before = exp - chrono::Duration::seconds(1);

        assert_eq!(due_offer(RequestStatus::Requested, Some(p), Some(exp), exp), Some(p));
        assert_eq!(
            due_offer(RequestStatus::RejectedReassigned, Some(p), Some(exp), exp + chrono::Duration::seconds(30)),
            Some(p)
        );
        // still live
        assert_eq!(due_offer(RequestStatus::Requested, Some(p), Some(exp), before), None);
        // accepted, moved on, or never offered
        assert_eq!(due_offer(RequestStatus::Accepted, Some(p), None, exp), None);
        assert_eq!(due_offer(RequestStatus::Accepted, Some(p), Some(exp), exp), None);
        assert_eq!(due_offer(RequestStatus::NoPartnerAvailable, None, None, exp), None);
        assert_eq!(due_offer(RequestStatus::PartiallyAssigned, Some(p), Some(exp), exp), None);
        assert_eq!(due_offer(RequestStatus::Requested, None, Some(exp), exp), None);
    }

    #[test]
    fn only_the_offered_partner_holds_the_offer() {
        let p = Uuid::from_u128(7);
        let other = Uuid::from_u128(8);
        assert!(ensure_offer_held(RequestStatus::Requested, Some(p), p).is_ok());
        assert!(ensure_offer_held(RequestStatus::RejectedReassigned, Some(p), p).is_ok());
        assert!(matches!(
            ensure_offer_held(RequestStatus::Requested, Some(p), other),
            Err(DispatchError::OfferNotHeld)
        ));
        assert!(matches!(
            ensure_offer_held(RequestStatus::Accepted, Some(p), p),
            Err(DispatchError::OfferNotHeld)
        ));
        assert!(matches!(
            ensure_offer_held(RequestStatus::NoPartnerAvailable, None, p),
            Err(DispatchError::OfferNotHeld)
        ));
    }

    #[test]
    fn partial_claim_keeps_the_partner_offer() {
        let p = Uuid::from_u128(7);
        let alloc = allocate(3, 1).unwrap();
        let after = after_assignment(RequestStatus::Requested, Some(p), None, &alloc);
        assert_eq!(
            after,
            AfterAssignment {
                status: RequestStatus::Requested,
                partner_id: Some(p),
                offer_kept: true,
                withdrawn: None,
            }
        );
        assert_eq!(alloc.remaining, 2);

        // the partner can still accept and send the other two
        assert!(ensure_offer_held(after.status, after.partner_id, p).is_ok());
        assert!(after.status.can_transition_to(RequestStatus::Accepted));
    }

    #[test]
    fn last_slot_claimed_withdraws_the_offer() {
        let p = Uuid::from_u128(7);
        let alloc = allocate(1, 1).unwrap();
        let after = after_assignment(RequestStatus::RejectedReassigned, Some(p), None, &alloc);
        assert_eq!(after.status, RequestStatus::Assigned);
        assert_eq!(after.partner_id, None);
        assert!(!after.offer_kept);
        assert_eq!(after.withdrawn, Some(p));
    }

    #[test]
    fn claim_on_unrouted_request_stays_retryable() {
        let alloc = allocate(2, 1).unwrap();
        let after = after_assignment(RequestStatus::NoPartnerAvailable, None, None, &alloc);
        assert_eq!(after.status, RequestStatus::NoPartnerAvailable);
        assert!(!after.offer_kept);
        assert_eq!(after.withdrawn, None);

        let full = allocate(1, 1).unwrap();
        let after = after_assignment(RequestStatus::NoPartnerAvailable, None, None, &full);
        assert_eq!(after.status, RequestStatus::Assigned);
    }

    #[test]
    fn partner_and_later_claims_keep_the_partner() {
        let p = Uuid::from_u128(7);
        let alloc = allocate(3, 1).unwrap();
        let after = after_assignment(RequestStatus::Accepted, Some(p), Some(p), &alloc);
        assert_eq!(after.status, RequestStatus::PartiallyAssigned);
        assert_eq!(after.partner_id, Some(p));

        let last = allocate(1, 1).unwrap();
        let after = after_assignment(RequestStatus::PartiallyAssigned, Some(p), None, &last);
        assert_eq!(after.status, RequestStatus::Assigned);
        assert_eq!(after.partner_id, Some(p));
        assert_eq!(after.withdrawn, None);
    }

    fn driver(n: u128, partner: Option<u128>, verified: bool, available: bool) -> DriverRow {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        DriverRow {
            driver_id: Uuid::from_u128(n),
            user_id: Uuid::from_u128(1000 + n),
            partner_id: partner.map(Uuid::from_u128),
            full_name: format!("Driver {n}"),
            license_number: format!("DL-{n}"),
            vehicle_number: format!("KA-01-{n}"),
            ambulance_type: "basic".into(),
            latitude: None,
            longitude: None,
            is_available: available,
            is_verified: verified,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn screening_reports_each_failure() {
        let fleet = 50u128;
        let found = vec![
            driver(1, Some(fleet), true, true),
            driver(2, Some(99), true, true),
            driver(3, Some(fleet), false, true),
            driver(4, Some(fleet), true, false),
            driver(5, Some(fleet), true, true),
            driver(6, None, true, true),
        ];
        let on_request: HashSet<Uuid> = [Uuid::from_u128(5)].into_iter().collect();
        let requested: Vec<Uuid> = [1, 1, 2, 3, 4, 5, 6, 7]
            .into_iter()
            .map(Uuid::from_u128)
            .collect();

        let s = screen_drivers(&requested, &found, Uuid::from_u128(fleet), &on_request, 3);
        assert_eq!(s.eligible.len(), 1);
        assert_eq!(s.eligible[0].driver_id, Uuid::from_u128(1));

        let reasons: Vec<(u128, SkipReason)> = s
            .skipped
            .iter()
            .map(|k| (k.driver_id.as_u128(), k.reason))
            .collect();
        assert_eq!(
            reasons,
            vec![
                (1, SkipReason::Duplicate),
                (2, SkipReason::NotInFleet),
                (3, SkipReason::NotVerified),
                (4, SkipReason::Unavailable),
                (5, SkipReason::AlreadyOnRequest),
                (6, SkipReason::NotInFleet),
                (7, SkipReason::NotFound),
            ]
        );
    }

    #[test]
    fn screening_caps_at_remaining() {
        let fleet = 50u128;
        let found: Vec<DriverRow> = (1..=4).map(|n| driver(n, Some(fleet), true, true)).collect();
        let requested: Vec<Uuid> = (1..=4).map(Uuid::from_u128).collect();

        let s = screen_drivers(&requested, &found, Uuid::from_u128(fleet), &HashSet::new(), 2);
        assert_eq!(s.eligible.len(), 2);
        assert_eq!(s.skipped.len(), 2);
        assert!(s
            .skipped
            .iter()
            .all(|k| k.reason == SkipReason::NoAmbulancesRemaining));

        let alloc = allocate(2, s.eligible.len()).unwrap();
        assert_eq!(alloc.status, RequestStatus::Assigned);
    }

    #[test]
    fn commission_bounds_and_math() {
        assert!(validate_commission_percent(3.0).is_ok());
        assert!(validate_commission_percent(5.0).is_ok());
        assert!(validate_commission_percent(2.99).is_err());
        assert!(validate_commission_percent(f64::NAN).is_err());

        assert_eq!(commission_cents(250_000, 4.0).unwrap(), 10_000);
        assert_eq!(commission_cents(333, 3.0).unwrap(), 10);
        assert!(commission_cents(-1, 4.0).is_err());
    }

    #[test]
    fn ambulance_count_bounds() {
        assert!(validate_ambulance_count(0).is_err());
        assert_eq!(validate_ambulance_count(5).unwrap(), 5);
        assert!(validate_ambulance_count(6).is_err());
    }

    #[test]
    fn booking_id_shape() {
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 10, 0, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let id = generate_booking_id(now, &mut rng);
        assert!(id.starts_with("AMB-20260307-"), "{id}");
        let suffix = &id["AMB-20260307-".len()..];
        assert_eq!(suffix.len(), 6);
        assert!(suffix.bytes().all(|b| BOOKING_ALPHABET.contains(&b)));
    }

    #[test]
    fn offer_countdown_never_negative() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 30).unwrap();
        let exp = Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap();
        assert_eq!(offer_seconds_left(Some(exp), now), Some(30));
        assert_eq!(offer_seconds_left(Some(now), exp), Some(0));
        assert_eq!(offer_seconds_left(None, now), None);
    }

    #[test]
    fn driver_progress_is_forward_only() {
        use AssignmentStatus::*;
        assert!(Assigned.can_advance_to(EnRoute));
        assert!(EnRoute.can_advance_to(Arrived));
        assert!(Arrived.can_advance_to(Completed));
        assert!(!Assigned.can_advance_to(Completed));
        assert!(!Completed.can_advance_to(EnRoute));
        assert!(!Arrived.can_advance_to(Cancelled));
        assert_eq!("en_route".parse::<AssignmentStatus>().unwrap(), EnRoute);
    }
}
