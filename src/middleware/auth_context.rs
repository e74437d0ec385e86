use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use uuid::Uuid;

use crate::auth::hash_access_token;
use crate::error::{ApiError, db_error};
use crate::models::{AppState, ROLE_ADMIN, ROLE_DRIVER, ROLE_PARTNER, ROLE_PATIENT};

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: i16,
    pub session_token_id: Uuid,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    pub fn require_role(&self, role: i16, what: &str) -> Result<(), ApiError> {
        if self.role == role {
            Ok(())
        } else {
            Err(ApiError::Forbidden("FORBIDDEN", format!("{what} only")))
        }
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        self.require_role(ROLE_ADMIN, "admin")
    }

    pub fn require_patient(&self) -> Result<(), ApiError> {
        self.require_role(ROLE_PATIENT, "patient")
    }

    pub fn require_partner(&self) -> Result<(), ApiError> {
        self.require_role(ROLE_PARTNER, "partner")
    }

    pub fn require_driver(&self) -> Result<(), ApiError> {
        self.require_role(ROLE_DRIVER, "driver")
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionLookupRow {
    session_token_id: Uuid,
    user_id: Uuid,
    roles: i16,
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::session_expired())?;

            let token_hash = hash_access_token(authz.token());

            let row: SessionLookupRow = sqlx::query_as::<_, SessionLookupRow>(
                r#"
                SELECT st.session_token_id, st.user_id, u.roles
                FROM session_token st
                JOIN app_user u ON u.user_id = st.user_id
                WHERE st.session_token_hash = $1
                  AND st.revoked_at IS NULL
                  AND st.expires_at > now()
                  AND u.is_active = true
                "#,
            )
            .bind(&token_hash)
            .fetch_optional(&state.db)
            .await
            .map_err(db_error)?
            .ok_or_else(ApiError::session_expired)?;

            // best-effort
            let _ = sqlx::query(
                r#"
                UPDATE session_token
                SET last_seen_at = now()
                WHERE session_token_id = $1
                "#,
            )
            .bind(row.session_token_id)
            .execute(&state.db)
            .await;

            Ok(AuthContext {
                user_id: row.user_id,
                role: row.roles,
                session_token_id: row.session_token_id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(role: i16) -> AuthContext {
        AuthContext {
            user_id: Uuid::from_u128(1),
            role,
            session_token_id: Uuid::from_u128(2),
        }
    }

    #[test]
    fn role_guards() {
        assert!(ctx(ROLE_ADMIN).require_admin().is_ok());
        assert!(ctx(ROLE_PATIENT).require_admin().is_err());
        assert!(ctx(ROLE_PARTNER).require_partner().is_ok());
        assert!(ctx(ROLE_DRIVER).require_partner().is_err());
        assert!(ctx(ROLE_DRIVER).require_driver().is_ok());
        assert!(ctx(ROLE_PATIENT).require_patient().is_ok());
        assert!(ctx(ROLE_ADMIN).is_admin());
    }
}
