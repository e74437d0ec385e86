// src/routes/auth_routes.rs

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    auth::{
        MIN_PASSWORD_LEN, generate_access_token, hash_access_token, hash_password,
        normalize_email, verify_password,
    },
    dispatch::DEFAULT_COMMISSION_PERCENT,
    error::{ApiError, db_error},
    geo::GeoPoint,
    middleware::auth_context::AuthContext,
    models::*,
};

const REMEMBER_ME_TTL_HOURS: i64 = 24 * 7;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register/patient", post(register_patient))
        .route("/register/partner", post(register_partner))
        .route("/register/driver", post(register_driver))
        .route("/login", post(login))
        .route("/me", get(me))
        .route("/logout", post(logout))
        .route("/logout_all_except_current", post(logout_all_except_current))
        // Rotate access token for the current session (old token dies immediately)
        .route("/refresh", post(refresh))
        .route("/sessions", get(list_sessions))
        .route("/change_password", post(change_password))
        .route("/reset_password", post(reset_password))
}

// =========================
// Validation
// =========================

fn validate_new_password(pw: &str) -> Result<(), ApiError> {
    if pw.trim().len() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, ApiError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(ApiError::validation(format!("{field} is required")));
    }
    if v.len() > 200 {
        return Err(ApiError::validation(format!("{field} is too long (max 200)")));
    }
    Ok(v)
}

fn validated_location(latitude: f64, longitude: f64) -> Result<GeoPoint, ApiError> {
    let p = GeoPoint::new(latitude, longitude);
    if !p.is_valid() {
        return Err(ApiError::validation("latitude/longitude out of range"));
    }
    Ok(p)
}

#[derive(Debug, Deserialize)]
pub struct AccountFields {
    pub email: String,
    pub password: String,
    pub display_name: String,
    pub phone: Option<String>,
}

pub struct ValidAccount<'a> {
    email: String,
    display_name: &'a str,
    phone: Option<&'a str>,
    password_hash: String,
}

pub fn validate_account(a: &AccountFields) -> Result<ValidAccount<'_>, ApiError> {
    let email = normalize_email(&a.email)
        .ok_or_else(|| ApiError::validation("a valid email is required"))?;
    let display_name = required(&a.display_name, "display_name")?;
    validate_new_password(&a.password)?;
    let password_hash = hash_password(&a.password).map_err(ApiError::Internal)?;

    Ok(ValidAccount {
        email,
        display_name,
        phone: a.phone.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        password_hash,
    })
}

// =========================
// Registration
// =========================

pub async fn insert_user(
    conn: &mut PgConnection,
    acct: &ValidAccount<'_>,
    role: i16,
) -> Result<UserRow, ApiError> {
    sqlx::query_as::<_, UserRow>(
        r#"
        INSERT INTO app_user (email, display_name, phone, password_hash, roles)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING user_id, email, display_name, password_hash, roles, is_active
        "#,
    )
    .bind(&acct.email)
    .bind(acct.display_name)
    .bind(acct.phone)
    .bind(&acct.password_hash)
    .bind(role)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        let unique = e
            .as_database_error()
            .is_some_and(|d| d.is_unique_violation());
        if unique {
            ApiError::Conflict("EMAIL_TAKEN", "an account with this email already exists".into())
        } else {
            db_error(e)
        }
    })
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub data: RegisterData,
}

#[derive(Debug, Serialize)]
pub struct RegisterData {
    pub user: UserProfile,
    pub partner_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
}

pub async fn register_patient(
    State(state): State<AppState>,
    Json(req): Json<AccountFields>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let acct = validate_account(&req)?;

    let mut conn = state.db.acquire().await.map_err(db_error)?;
    let user = insert_user(&mut conn, &acct, ROLE_PATIENT).await?;

    tracing::info!(user_id = %user.user_id, "patient registered");

    Ok(Json(RegisterResponse {
        data: RegisterData {
            user: user.profile(),
            partner_id: None,
            driver_id: None,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterPartnerRequest {
    #[serde(flatten)]
    pub account: AccountFields,
    pub hospital_name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Partners start in `pending` onboarding and are not routed requests until
/// an admin approves them.
pub async fn register_partner(
    State(state): State<AppState>,
    Json(req): Json<RegisterPartnerRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let hospital_name = required(&req.hospital_name, "hospital_name")?;
    let address = required(&req.address, "address")?;
    let loc = validated_location(req.latitude, req.longitude)?;
    let acct = validate_account(&req.account)?;

    let mut tx = state.db.begin().await.map_err(db_error)?;
    let user = insert_user(&mut tx, &acct, ROLE_PARTNER).await?;

    let partner_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO partner
          (user_id, hospital_name, address, latitude, longitude, commission_percent, onboarding_status)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING partner_id
        "#,
    )
    .bind(user.user_id)
    .bind(hospital_name)
    .bind(address)
    .bind(loc.latitude)
    .bind(loc.longitude)
    .bind(DEFAULT_COMMISSION_PERCENT)
    .bind(ONBOARDING_PENDING)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_error)?;

    tx.commit().await.map_err(db_error)?;

    tracing::info!(user_id = %user.user_id, partner_id = %partner_id, "partner registered");

    Ok(Json(RegisterResponse {
        data: RegisterData {
            user: user.profile(),
            partner_id: Some(partner_id),
            driver_id: None,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterDriverRequest {
    #[serde(flatten)]
    pub account: AccountFields,
    pub full_name: String,
    pub license_number: String,
    pub vehicle_number: String,
    pub ambulance_type: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

pub struct ValidDriverFields<'a> {
    pub full_name: &'a str,
    pub license_number: &'a str,
    pub vehicle_number: &'a str,
    pub ambulance_type: &'a str,
    pub location: Option<GeoPoint>,
}

pub fn validate_driver_fields<'a>(
    full_name: &'a str,
    license_number: &'a str,
    vehicle_number: &'a str,
    ambulance_type: Option<&'a str>,
    latitude: Option<f64>,
    longitude: Option<f64>,
) -> Result<ValidDriverFields<'a>, ApiError> {
    let location = match (latitude, longitude) {
        (Some(lat), Some(lng)) => Some(validated_location(lat, lng)?),
        (None, None) => None,
        _ => {
            return Err(ApiError::validation(
                "latitude and longitude must be given together",
            ));
        }
    };

    Ok(ValidDriverFields {
        full_name: required(full_name, "full_name")?,
        license_number: required(license_number, "license_number")?,
        vehicle_number: required(vehicle_number, "vehicle_number")?,
        ambulance_type: ambulance_type
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("basic"),
        location,
    })
}

/// Inserts the driver row for a fresh driver-role user.
pub async fn insert_driver(
    conn: &mut PgConnection,
    user_id: Uuid,
    partner_id: Option<Uuid>,
    fields: &ValidDriverFields<'_>,
    verified: bool,
) -> Result<Uuid, ApiError> {
    sqlx::query_scalar(
        r#"
        INSERT INTO driver
          (user_id, partner_id, full_name, license_number, vehicle_number,
           ambulance_type, latitude, longitude, is_verified)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING driver_id
        "#,
    )
    .bind(user_id)
    .bind(partner_id)
    .bind(fields.full_name)
    .bind(fields.license_number)
    .bind(fields.vehicle_number)
    .bind(fields.ambulance_type)
    .bind(fields.location.map(|p| p.latitude))
    .bind(fields.location.map(|p| p.longitude))
    .bind(verified)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error)
}

/// Self-registration creates an independent, unverified driver.
pub async fn register_driver(
    State(state): State<AppState>,
    Json(req): Json<RegisterDriverRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
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
    let driver_id = insert_driver(&mut tx, user.user_id, None, &fields, false).await?;
    tx.commit().await.map_err(db_error)?;

    tracing::info!(user_id = %user.user_id, driver_id = %driver_id, "independent driver registered");

    Ok(Json(RegisterResponse {
        data: RegisterData {
            user: user.profile(),
            partner_id: None,
            driver_id: Some(driver_id),
        },
    }))
}

// =========================
// Sessions
// =========================

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::validation("email and password are required"));
    }
    let email = normalize_email(&req.email).ok_or_else(ApiError::invalid_credentials)?;

    let user: UserRow = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT user_id, email, display_name, password_hash, roles, is_active
        FROM app_user
        WHERE email = $1
        "#,
    )
    .bind(&email)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(ApiError::invalid_credentials)?;

    if !user.is_active {
        return Err(ApiError::Forbidden("FORBIDDEN", "Account is disabled".into()));
    }

    if !verify_password(&req.password, &user.password_hash) {
        return Err(ApiError::invalid_credentials());
    }

    let access_token = generate_access_token();
    let token_hash = hash_access_token(&access_token);

    let ttl_hours = if req.remember_me.unwrap_or(false) {
        REMEMBER_ME_TTL_HOURS
    } else {
        state.session_ttl_hours
    };
    let expires_at = Utc::now() + Duration::hours(ttl_hours);

    let session: SessionTokenRow = sqlx::query_as::<_, SessionTokenRow>(
        r#"
        INSERT INTO session_token (user_id, session_token_hash, device_name, expires_at)
        VALUES ($1, $2, $3, $4)
        RETURNING session_token_id, expires_at
        "#,
    )
    .bind(user.user_id)
    .bind(&token_hash)
    .bind(req.device_name.as_deref())
    .bind(expires_at)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    tracing::info!(user_id = %user.user_id, role = %role_to_string(user.roles), "login");

    Ok(Json(LoginResponse {
        data: LoginResponseData {
            access_token,
            expires_at: session.expires_at,
            user: user.profile(),
        },
    }))
}

pub async fn me(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<MeResponse>, ApiError> {
    let user: UserRow = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT user_id, email, display_name, password_hash, roles, is_active
        FROM app_user
        WHERE user_id = $1
        "#,
    )
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(ApiError::session_expired)?;

    let session: SessionTokenRow = sqlx::query_as::<_, SessionTokenRow>(
        r#"
        SELECT session_token_id, expires_at
        FROM session_token
        WHERE session_token_id = $1
          AND user_id = $2
          AND revoked_at IS NULL
          AND expires_at > now()
        "#,
    )
    .bind(auth.session_token_id)
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(ApiError::session_expired)?;

    Ok(Json(MeResponse {
        data: MeResponseData {
            user: user.profile(),
            session: SessionInfo {
                session_token_id: session.session_token_id,
                expires_at: session.expires_at,
            },
        },
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<OkResponse>, ApiError> {
    let rows = sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE session_token_id = $1
          AND user_id = $2
          AND revoked_at IS NULL
        "#,
    )
    .bind(auth.session_token_id)
    .bind(auth.user_id)
    .execute(&state.db)
    .await
    .map_err(db_error)?;

    if rows.rows_affected() == 0 {
        return Err(ApiError::session_expired());
    }

    Ok(Json(OkResponse::ok()))
}

#[derive(Debug, Serialize)]
pub struct RevokeAllResponse {
    pub data: RevokeAllData,
}

#[derive(Debug, Serialize)]
pub struct RevokeAllData {
    pub ok: bool,
    pub revoked_count: i64,
}

async fn revoke_other_sessions(
    conn: &mut PgConnection,
    user_id: Uuid,
    keep: Uuid,
) -> Result<u64, ApiError> {
    let res = sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE user_id = $1
          AND revoked_at IS NULL
          AND expires_at > now()
          AND session_token_id <> $2
        "#,
    )
    .bind(user_id)
    .bind(keep)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(res.rows_affected())
}

pub async fn logout_all_except_current(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<RevokeAllResponse>, ApiError> {
    let mut conn = state.db.acquire().await.map_err(db_error)?;
    let revoked = revoke_other_sessions(&mut conn, auth.user_id, auth.session_token_id).await?;

    Ok(Json(RevokeAllResponse {
        data: RevokeAllData {
            ok: true,
            revoked_count: revoked as i64,
        },
    }))
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub data: RefreshData,
}

#[derive(Debug, Serialize)]
pub struct RefreshData {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub session_token_id: Uuid,
}

/// Keeps the session id, swaps the token.
pub async fn refresh(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<RefreshResponse>, ApiError> {
    let new_token = generate_access_token();
    let new_hash = hash_access_token(&new_token);

    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"
        UPDATE session_token
        SET session_token_hash = $1,
            last_seen_at = now()
        WHERE session_token_id = $2
          AND user_id = $3
          AND revoked_at IS NULL
          AND expires_at > now()
        RETURNING expires_at
        "#,
    )
    .bind(new_hash)
    .bind(auth.session_token_id)
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?;

    let expires_at = row.ok_or_else(ApiError::session_expired)?.0;

    Ok(Json(RefreshResponse {
        data: RefreshData {
            access_token: new_token,
            expires_at,
            session_token_id: auth.session_token_id,
        },
    }))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct SessionListItem {
    pub session_token_id: Uuid,
    pub device_name: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ListSessionsData {
    pub sessions: Vec<SessionListItem>,
    pub current_session_token_id: Uuid,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<ListSessionsData>>, ApiError> {
    let rows: Vec<SessionListItem> = sqlx::query_as::<_, SessionListItem>(
        r#"
        SELECT session_token_id, device_name, expires_at, last_seen_at, created_at
        FROM session_token
        WHERE user_id = $1
          AND revoked_at IS NULL
          AND expires_at > now()
        ORDER BY last_seen_at DESC NULLS LAST, created_at DESC
        "#,
    )
    .bind(auth.user_id)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk {
        data: ListSessionsData {
            sessions: rows,
            current_session_token_id: auth.session_token_id,
        },
    }))
}

// =========================
// Password management
// =========================

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if req.old_password.is_empty() || req.new_password.is_empty() {
        return Err(ApiError::validation("old_password and new_password are required"));
    }
    validate_new_password(&req.new_password)?;

    let row: (String,) = sqlx::query_as(
        r#"
        SELECT password_hash
        FROM app_user
        WHERE user_id = $1
          AND is_active = true
        "#,
    )
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(ApiError::session_expired)?;

    if !verify_password(&req.old_password, &row.0) {
        return Err(ApiError::invalid_credentials());
    }

    let new_hash = hash_password(&req.new_password).map_err(ApiError::Internal)?;

    let mut tx = state.db.begin().await.map_err(db_error)?;

    sqlx::query(
        r#"
        UPDATE app_user
        SET password_hash = $1, updated_at = now()
        WHERE user_id = $2
        "#,
    )
    .bind(new_hash)
    .bind(auth.user_id)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    // keep the current session, drop the rest
    revoke_other_sessions(&mut tx, auth.user_id, auth.session_token_id).await?;

    tx.commit().await.map_err(db_error)?;

    Ok(Json(OkResponse::ok()))
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub email: String,
    /// If omitted, a temporary password is generated and returned.
    pub new_password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetPasswordData {
    pub user_id: Uuid,
    pub email: String,
    pub temporary_password: Option<String>,
}

fn generate_temp_password() -> String {
    generate_access_token().chars().take(20).collect()
}

/// Admin-driven reset; revokes every session of the target account.
pub async fn reset_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Json<ApiOk<ResetPasswordData>>, ApiError> {
    auth.require_admin()?;

    let email = normalize_email(&req.email)
        .ok_or_else(|| ApiError::validation("a valid email is required"))?;

    let (new_pw, return_pw) = match req
        .new_password
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(pw) => {
            validate_new_password(pw)?;
            (pw.to_string(), None)
        }
        None => {
            let temp = generate_temp_password();
            (temp.clone(), Some(temp))
        }
    };

    let new_hash = hash_password(&new_pw).map_err(ApiError::Internal)?;

    let mut tx = state.db.begin().await.map_err(db_error)?;

    let target: Uuid = sqlx::query_scalar(
        r#"
        UPDATE app_user
        SET password_hash = $1, updated_at = now()
        WHERE email = $2
        RETURNING user_id
        "#,
    )
    .bind(new_hash)
    .bind(&email)
    .fetch_optional(&mut *tx)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("user"))?;

    sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE user_id = $1
          AND revoked_at IS NULL
        "#,
    )
    .bind(target)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    tx.commit().await.map_err(db_error)?;

    tracing::info!(admin = %auth.user_id, target = %target, "password reset");

    Ok(Json(ApiOk {
        data: ResetPasswordData {
            user_id: target,
            email,
            temporary_password: return_pw,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_passwords_rejected() {
        assert!(validate_new_password("1234567").is_err());
        assert!(validate_new_password("   1234567   ").is_err());
        assert!(validate_new_password("12345678").is_ok());
    }

    #[test]
    fn required_trims_and_bounds() {
        assert_eq!(required("  City Hospital ", "hospital_name").unwrap(), "City Hospital");
        assert!(required("   ", "hospital_name").is_err());
        assert!(required(&"x".repeat(201), "address").is_err());
    }

    #[test]
    fn driver_fields_need_both_coordinates() {
        assert!(validate_driver_fields("Ravi", "DL1", "KA01", None, Some(12.0), None).is_err());

        let f = validate_driver_fields("Ravi", "DL1", "KA01", Some("  "), None, None).unwrap();
        assert_eq!(f.ambulance_type, "basic");
        assert!(f.location.is_none());

        let f = validate_driver_fields("Ravi", "DL1", "KA01", Some("icu"), Some(12.0), Some(77.0))
            .unwrap();
        assert_eq!(f.ambulance_type, "icu");
        assert_eq!(f.location, Some(GeoPoint::new(12.0, 77.0)));

        assert!(validate_driver_fields("Ravi", "DL1", "KA01", None, Some(95.0), Some(0.0)).is_err());
    }

    #[test]
    fn temp_passwords_meet_policy() {
        let pw = generate_temp_password();
        assert_eq!(pw.len(), 20);
        assert!(validate_new_password(&pw).is_ok());
    }
}
