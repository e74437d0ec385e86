use crate::models::AppState;
use axum::Router;

pub mod admin_routes;
pub mod auth_routes;
pub mod driver_routes;
pub mod home_routes;
pub mod partner_routes;
pub mod request_routes;
pub mod user_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/auth", auth_routes::router())
        .nest("/api/v1/users", user_routes::router())
        .nest("/api/v1/requests", request_routes::router())
        .nest("/api/v1/partner", partner_routes::router())
        .nest("/api/v1/driver", driver_routes::router())
        .nest("/api/v1/admin", admin_routes::router())
        .merge(home_routes::router())
        .with_state(state)
}
