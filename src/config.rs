use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub db_max_connections: u32,
    pub public_url: String,
    pub storage_dir: PathBuf,
    pub courses_dir: PathBuf,
    pub admin_email: String,
    pub mail_from: String,
    pub mail_retries: u32,
    pub mail_backoff_secs: u64,
    pub session_days: i64,
    pub reminders_enabled: bool,
    pub reminder_day: u32,
    pub reminder_hour: u32,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, so tests can feed a map.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let reminder_day: u32 = try_load(&lookup, "REMINDER_DAY", "10")?;
        if !(1..=28).contains(&reminder_day) {
            return Err(anyhow!("REMINDER_DAY must be between 1 and 28"));
        }
        let reminder_hour: u32 = try_load(&lookup, "REMINDER_HOUR", "9")?;
        if reminder_hour > 23 {
            return Err(anyhow!("REMINDER_HOUR must be between 0 and 23"));
        }

        Ok(Self {
            bind_addr: try_load(&lookup, "BIND_ADDR", "127.0.0.1:8000")?,
            database_url: lookup("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            db_max_connections: try_load(&lookup, "DB_MAX_CONNECTIONS", "5")?,
            public_url: try_load::<String, _>(&lookup, "PUBLIC_URL", "http://localhost:8000")?
                .trim_end_matches('/')
                .to_string(),
            storage_dir: try_load(&lookup, "STORAGE_DIR", "storage")?,
            courses_dir: try_load(&lookup, "COURSES_DIR", "data/courses")?,
            admin_email: try_load(&lookup, "ADMIN_EMAIL", "admin@tellytech.local")?,
            mail_from: try_load(&lookup, "MAIL_FROM", "TellyTech Formation <no-reply@tellytech.local>")?,
            mail_retries: try_load(&lookup, "MAIL_RETRIES", "3")?,
            mail_backoff_secs: try_load(&lookup, "MAIL_BACKOFF_SECS", "3")?,
            session_days: try_load(&lookup, "SESSION_DAYS", "7")?,
            reminders_enabled: try_load(&lookup, "REMINDERS_ENABLED", "true")?,
            reminder_day,
            reminder_hour,
        })
    }
}

fn try_load<T, F>(lookup: &F, key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).unwrap_or_else(|| {
        log::info!("{} not set, using default: {}", key, default);
        default.to_string()
    });
    raw.parse()
        .map_err(|e| anyhow!("Invalid {} value `{}`: {}", key, raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap();
        assert_eq!(config.bind_addr.port(), 8000);
        assert_eq!(config.mail_retries, 3);
        assert_eq!(config.session_days, 7);
        assert_eq!(config.reminder_day, 10);
        assert!(config.reminders_enabled);
        assert_eq!(config.courses_dir, PathBuf::from("data/courses"));
    }

    #[test]
    fn database_url_is_required() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn bad_values_are_reported() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("MAIL_RETRIES", "many"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("MAIL_RETRIES"));

        assert!(Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("REMINDER_DAY", "31"),
        ]))
        .is_err());
    }

    #[test]
    fn public_url_loses_trailing_slash() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://x"),
            ("PUBLIC_URL", "https://api.example.org/"),
        ]))
        .unwrap();
        assert_eq!(config.public_url, "https://api.example.org");
    }
}
