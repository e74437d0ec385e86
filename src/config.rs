use std::env;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub session_ttl_hours: i64,
    pub dispatch_radius_km: f64,
    pub partner_offer_ttl_secs: i64,
    pub reassign_sweep_secs: u64,
    pub run_migrations: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let dispatch_radius_km: f64 = env_or("DISPATCH_RADIUS_KM", 50.0);
        if !(dispatch_radius_km.is_finite() && dispatch_radius_km > 0.0) {
            anyhow::bail!("DISPATCH_RADIUS_KM must be a positive number");
        }

        let partner_offer_ttl_secs: i64 = env_or("PARTNER_OFFER_TTL_SECS", 60);
        if partner_offer_ttl_secs <= 0 {
            anyhow::bail!("PARTNER_OFFER_TTL_SECS must be > 0");
        }

        Ok(Self {
            database_url,
            bind_addr,
            session_ttl_hours: env_or("SESSION_TTL_HOURS", 24),
            dispatch_radius_km,
            partner_offer_ttl_secs,
            reassign_sweep_secs: env_or::<u64>("REASSIGN_SWEEP_SECS", 5).max(1),
            run_migrations: env_or("RUN_MIGRATIONS", true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_missing_and_garbage() {
        assert_eq!(env_or("ADS_TEST_SURELY_UNSET_KEY", 42i64), 42);

        // SAFETY: test-only key, not read by any other test.
        unsafe { env::set_var("ADS_TEST_GARBAGE_KEY", "not-a-number") };
        assert_eq!(env_or("ADS_TEST_GARBAGE_KEY", 7u64), 7);

        unsafe { env::set_var("ADS_TEST_PADDED_KEY", " 12.5 ") };
        assert_eq!(env_or("ADS_TEST_PADDED_KEY", 1.0f64), 12.5);
    }
}
