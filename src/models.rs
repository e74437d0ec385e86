use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::dispatch::{AssignmentStatus, RequestStatus};
use crate::error::ApiError;
use crate::geo::GeoPoint;
use crate::notify::Notifier;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub session_ttl_hours: i64,
    pub dispatch: DispatchSettings,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub radius_km: f64,
    pub offer_ttl_secs: i64,
}

/* -------------------------
   Roles
--------------------------*/

pub const ROLE_PATIENT: i16 = 0;
pub const ROLE_ADMIN: i16 = 1;
pub const ROLE_PARTNER: i16 = 2;
pub const ROLE_DRIVER: i16 = 3;

/// 0 patient, 1 admin, 2 partner, 3 driver
pub fn role_to_string(role: i16) -> String {
    match role {
        ROLE_PATIENT => "patient",
        ROLE_ADMIN => "admin",
        ROLE_PARTNER => "partner",
        ROLE_DRIVER => "driver",
        _ => "unknown",
    }
    .to_string()
}

/// onboarding_status: 0 pending, 1 approved, 2 rejected
pub const ONBOARDING_PENDING: i16 = 0;
pub const ONBOARDING_APPROVED: i16 = 1;
pub const ONBOARDING_REJECTED: i16 = 2;

pub fn onboarding_to_string(status: i16) -> &'static str {
    match status {
        ONBOARDING_PENDING => "pending",
        ONBOARDING_APPROVED => "approved",
        ONBOARDING_REJECTED => "rejected",
        _ => "unknown",
    }
}

pub fn parse_onboarding(s: &str) -> Option<i16> {
    match s {
        "pending" => Some(ONBOARDING_PENDING),
        "approved" => Some(ONBOARDING_APPROVED),
        "rejected" => Some(ONBOARDING_REJECTED),
        _ => None,
    }
}

/* -------------------------
   API DTOs
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub device_name: Option<String>,
    pub remember_me: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub data: LoginResponseData,
}

#[derive(Debug, Serialize)]
pub struct LoginResponseData {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub data: MeResponseData,
}

#[derive(Debug, Serialize)]
pub struct MeResponseData {
    pub user: UserProfile,
    pub session: SessionInfo,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub data: OkData,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        OkResponse {
            data: OkData { ok: true },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/* -------------------------
   DB Row Models
--------------------------*/

#[derive(Debug, sqlx::FromRow)]
pub struct UserRow {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
    pub roles: i16,
    pub is_active: bool,
}

impl UserRow {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            user_id: self.user_id,
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            role: role_to_string(self.roles),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct SessionTokenRow {
    pub session_token_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PartnerRow {
    pub partner_id: Uuid,
    pub user_id: Uuid,
    pub hospital_name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub commission_percent: f64,
    pub onboarding_status: i16,
    pub is_accepting: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PartnerRow {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    pub fn is_approved(&self) -> bool {
        self.onboarding_status == ONBOARDING_APPROVED
    }
}

pub const PARTNER_COLUMNS: &str = r#"
    partner_id, user_id, hospital_name, address, latitude, longitude,
    commission_percent, onboarding_status, is_accepting, created_at, updated_at
"#;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DriverRow {
    pub driver_id: Uuid,
    pub user_id: Uuid,
    pub partner_id: Option<Uuid>,
    pub full_name: String,
    pub license_number: String,
    pub vehicle_number: String,
    pub ambulance_type: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_available: bool,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DriverRow {
    pub fn is_independent(&self) -> bool {
        self.partner_id.is_none()
    }

    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
            _ => None,
        }
    }
}

pub const DRIVER_COLUMNS: &str = r#"
    driver_id, user_id, partner_id, full_name, license_number, vehicle_number,
    ambulance_type, latitude, longitude, is_available, is_verified, created_at, updated_at
"#;

#[derive(Debug, Clone, FromRow)]
pub struct RequestRow {
    pub request_id: Uuid,
    pub booking_id: String,
    pub patient_user_id: Uuid,
    pub pickup_latitude: f64,
    pub pickup_longitude: f64,
    pub pickup_address: String,
    pub emergency_type: String,
    pub notes: Option<String>,
    pub ambulances_requested: i32,
    pub ambulances_remaining: i32,
    pub status: String,
    pub current_partner_id: Option<Uuid>,
    pub offered_at: Option<DateTime<Utc>>,
    pub offer_expires_at: Option<DateTime<Utc>>,
    pub open_to_independent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestRow {
    pub fn status(&self) -> Result<RequestStatus, ApiError> {
        self.status
            .parse::<RequestStatus>()
            .map_err(ApiError::Internal)
    }

    pub fn pickup(&self) -> GeoPoint {
        GeoPoint::new(self.pickup_latitude, self.pickup_longitude)
    }
}

pub const REQUEST_COLUMNS: &str = r#"
    request_id, booking_id, patient_user_id, pickup_latitude, pickup_longitude,
    pickup_address, emergency_type, notes, ambulances_requested, ambulances_remaining,
    status, current_partner_id, offered_at, offer_expires_at, open_to_independent,
    created_at, updated_at
"#;

#[derive(Debug, Clone, FromRow)]
pub struct AssignmentRow {
    pub assignment_id: Uuid,
    pub request_id: Uuid,
    pub driver_id: Uuid,
    pub partner_id: Option<Uuid>,
    pub status: String,
    pub fare_cents: Option<i64>,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AssignmentRow {
    pub fn status(&self) -> Result<AssignmentStatus, ApiError> {
        self.status
            .parse::<AssignmentStatus>()
            .map_err(ApiError::Internal)
    }
}

pub const ASSIGNMENT_COLUMNS: &str = r#"
    assignment_id, request_id, driver_id, partner_id, status, fare_cents,
    assigned_at, updated_at, completed_at
"#;

/* -------------------------
   Request view (polling payload)
--------------------------*/

#[derive(Debug, Serialize)]
pub struct PartnerBrief {
    pub partner_id: Uuid,
    pub hospital_name: String,
    pub distance_km: f64,
}

#[derive(Debug, Serialize)]
pub struct AssignmentView {
    pub assignment_id: Uuid,
    pub driver_id: Uuid,
    pub driver_name: String,
    pub vehicle_number: String,
    pub ambulance_type: String,
    pub driver_location: Option<GeoPoint>,
    pub independent: bool,
    pub status: AssignmentStatus,
    pub fare_cents: Option<i64>,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RequestView {
    pub request_id: Uuid,
    pub booking_id: String,
    pub status: RequestStatus,
    pub pickup: GeoPoint,
    pub pickup_address: String,
    pub emergency_type: String,
    pub notes: Option<String>,
    pub ambulances_requested: i32,
    pub ambulances_remaining: i32,
    pub current_partner: Option<PartnerBrief>,
    pub offer_expires_at: Option<DateTime<Utc>>,
    pub offer_seconds_left: Option<i64>,
    pub excluded_partners: i64,
    pub assignments: Vec<AssignmentView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names() {
        assert_eq!(role_to_string(ROLE_PATIENT), "patient");
        assert_eq!(role_to_string(ROLE_PARTNER), "partner");
        assert_eq!(role_to_string(42), "unknown");
    }

    #[test]
    fn onboarding_round_trip() {
        for s in ["pending", "approved", "rejected"] {
            let code = parse_onboarding(s).unwrap();
            assert_eq!(onboarding_to_string(code), s);
        }
        assert_eq!(parse_onboarding("maybe"), None);
    }
}
