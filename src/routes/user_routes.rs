// src/routes/user_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    middleware::auth_context::AuthContext,
    models::{role_to_string, AppState, OkResponse},
};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct UserPublicRow {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub phone: Option<String>,
    pub roles: i16,
    pub is_active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct UserPublic {
    #[serde(flatten)]
    pub row: UserPublicRow,
    pub role: String,
}

impl From<UserPublicRow> for UserPublic {
    fn from(row: UserPublicRow) -> Self {
        let role = role_to_string(row.roles);
        UserPublic { row, role }
    }
}

#[derive(Debug, Serialize)]
pub struct UsersListResponse {
    pub data: UsersListData,
}

#[derive(Debug, Serialize)]
pub struct UsersListData {
    pub users: Vec<UserPublic>,
}

#[derive(Debug, Serialize)]
pub struct UserGetResponse {
    pub data: UserPublic,
}

#[derive(Debug, Deserialize)]
pub struct UsersQuery {
    pub role: Option<i16>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        // /api/v1/users
        .route("/", get(list_users))
        // /api/v1/users/{user_id}
        .route("/{user_id}", get(get_user))
        // /api/v1/users/{user_id}/disable
        .route("/{user_id}/disable", post(disable_user))
        // /api/v1/users/{user_id}/enable
        .route("/{user_id}/enable", post(enable_user))
}

fn validate_role(roles: i16) -> Result<(), ApiError> {
    if !(0..=3).contains(&roles) {
        return Err(ApiError::validation("role must be one of 0..3"));
    }
    Ok(())
}

pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<UsersQuery>,
) -> Result<Json<UsersListResponse>, ApiError> {
    auth.require_admin()?;
    if let Some(r) = q.role {
        validate_role(r)?;
    }

    let users: Vec<UserPublicRow> = sqlx::query_as::<_, UserPublicRow>(
        r#"
        SELECT user_id, email, display_name, phone, roles, is_active, created_at
        FROM app_user
        WHERE ($1::SMALLINT IS NULL OR roles = $1)
        ORDER BY created_at DESC
        LIMIT 200
        "#,
    )
    .bind(q.role)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(UsersListResponse {
        data: UsersListData {
            users: users.into_iter().map(UserPublic::from).collect(),
        },
    }))
}

pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserGetResponse>, ApiError> {
    auth.require_admin()?;

    let user: UserPublicRow = sqlx::query_as::<_, UserPublicRow>(
        r#"
        SELECT user_id, email, display_name, phone, roles, is_active, created_at
        FROM app_user
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("user"))?;

    Ok(Json(UserGetResponse { data: user.into() }))
}

/// Disabling also kills every live session of the account.
pub async fn disable_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    auth.require_admin()?;
    if user_id == auth.user_id {
        return Err(ApiError::BadRequest(
            "CANNOT_DISABLE_SELF",
            "admins cannot disable their own account".into(),
        ));
    }

    let mut tx = state.db.begin().await.map_err(db_error)?;

    let res = sqlx::query(
        r#"
        UPDATE app_user
        SET is_active = false, updated_at = now()
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("user"));
    }

    sqlx::query(
        r#"
        UPDATE session_token
        SET revoked_at = now()
        WHERE user_id = $1
          AND revoked_at IS NULL
        "#,
    )
    .bind(user_id)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    tx.commit().await.map_err(db_error)?;

    tracing::info!(admin = %auth.user_id, target = %user_id, "user disabled");
    Ok(Json(OkResponse::ok()))
}

pub async fn enable_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<OkResponse>, ApiError> {
    auth.require_admin()?;

    let res = sqlx::query(
        r#"
        UPDATE app_user
        SET is_active = true, updated_at = now()
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .execute(&state.db)
    .await
    .map_err(db_error)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("user"));
    }

    tracing::info!(admin = %auth.user_id, target = %user_id, "user enabled");
    Ok(Json(OkResponse::ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_role_bounds() {
        assert!(validate_role(0).is_ok());
        assert!(validate_role(3).is_ok());

        assert!(validate_role(-1).is_err());
        assert!(validate_role(4).is_err());
    }

    #[test]
    fn public_user_has_role_name() {
        let row = UserPublicRow {
            user_id: Uuid::from_u128(9),
            email: "ops@example.org".into(),
            display_name: "Ops".into(),
            phone: None,
            roles: 1,
            is_active: true,
            created_at: chrono::Utc::now(),
        };
        let json = serde_json::to_value(UserPublic::from(row)).unwrap();
        assert_eq!(json["role"], "admin");
        assert_eq!(json["email"], "ops@example.org");
        assert!(json.get("password_hash").is_none());
    }
}
