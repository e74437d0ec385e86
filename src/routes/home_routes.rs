use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::error::{ApiError, db_error};
use crate::middleware::auth_context::AuthContext;
use crate::models::{AppState, ROLE_ADMIN, ROLE_DRIVER, ROLE_PARTNER, ROLE_PATIENT};

#[derive(Serialize)]
pub struct HomeResponse {
    pub data: HomeData,
}

#[derive(Serialize)]
pub struct HomeData {
    pub view: &'static str,
    /// Badge counters for the role's landing screen.
    pub counters: Vec<Counter>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Counter {
    pub name: &'static str,
    pub value: i64,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/home", get(home))
}

fn view_for(role: i16) -> &'static str {
    match role {
        ROLE_PATIENT => "patient",
        ROLE_ADMIN => "admin",
        ROLE_PARTNER => "partner",
        ROLE_DRIVER => "driver",
        _ => "unknown",
    }
}

/// Counter SQL returns one BIGINT. `PerUser` queries take the caller's id
/// as `$1`; `Global` ones take no parameters.
#[derive(Debug, Clone, Copy)]
enum CounterSql {
    PerUser(&'static str),
    Global(&'static str),
}

fn counter_queries(role: i16) -> &'static [(&'static str, CounterSql)] {
    use CounterSql::*;
    match role {
        ROLE_PATIENT => &[(
            "active_requests",
            PerUser(
                "SELECT count(*) FROM ambulance_request \
                 WHERE patient_user_id = $1 AND status NOT IN ('completed', 'cancelled')",
            ),
        )],
        ROLE_PARTNER => &[
            (
                "pending_offers",
                PerUser(
                    "SELECT count(*) FROM ambulance_request r JOIN partner p ON p.partner_id = r.current_partner_id \
                     WHERE p.user_id = $1 AND r.status IN ('requested', 'rejected & reassigned') \
                       AND r.offer_expires_at > now()",
                ),
            ),
            (
                "available_drivers",
                PerUser(
                    "SELECT count(*) FROM driver d JOIN partner p ON p.partner_id = d.partner_id \
                     WHERE p.user_id = $1 AND d.is_available AND d.is_verified",
                ),
            ),
        ],
        ROLE_DRIVER => &[(
            "active_trips",
            PerUser(
                "SELECT count(*) FROM request_assignment a JOIN driver d ON d.driver_id = a.driver_id \
                 WHERE d.user_id = $1 AND a.status IN ('assigned', 'en_route', 'arrived')",
            ),
        )],
        ROLE_ADMIN => &[
            (
                "partners_pending",
                Global("SELECT count(*) FROM partner WHERE onboarding_status = 0"),
            ),
            (
                "drivers_unverified",
                Global("SELECT count(*) FROM driver WHERE is_verified = false"),
            ),
            (
                "unrouted_requests",
                Global("SELECT count(*) FROM ambulance_request WHERE status = 'no_partner_available'"),
            ),
        ],
        _ => &[],
    }
}

pub async fn home(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<HomeResponse>, ApiError> {
    let mut counters = Vec::new();
    for &(name, sql) in counter_queries(auth.role) {
        let query = match sql {
            CounterSql::PerUser(sql) => sqlx::query_scalar::<_, i64>(sql).bind(auth.user_id),
            CounterSql::Global(sql) => sqlx::query_scalar::<_, i64>(sql),
        };
        let value: i64 = query.fetch_one(&state.db).await.map_err(db_error)?;
        counters.push(Counter { name, value });
    }

    Ok(Json(HomeResponse {
        data: HomeData {
            view: view_for(auth.role),
            counters,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_role_has_a_view_and_counters() {
        for role in [ROLE_PATIENT, ROLE_ADMIN, ROLE_PARTNER, ROLE_DRIVER] {
            assert_ne!(view_for(role), "unknown");
            let qs = counter_queries(role);
            assert!(!qs.is_empty());
            for (name, sql) in qs {
                match sql {
                    CounterSql::PerUser(sql) => assert!(sql.contains("$1"), "{name}"),
                    CounterSql::Global(sql) => assert!(!sql.contains('$'), "{name}"),
                }
            }
        }
        assert_eq!(view_for(9), "unknown");
        assert!(counter_queries(9).is_empty());
    }
}
