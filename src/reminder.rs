//! Monthly payment reminders, run in the background.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use sqlx::PgPool;
use tokio::task::JoinHandle;

use crate::payment;
use crate::Context;

/// First `day` at `hour`:00 UTC strictly after `now`.
pub fn next_run(now: DateTime<Utc>, day: u32, hour: u32) -> Option<DateTime<Utc>> {
    let (mut year, mut month) = (now.year(), now.month());
    for _ in 0..2 {
        let at = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, 0, 0)?;
        let at = Utc.from_utc_datetime(&at);
        if at > now {
            return Some(at);
        }
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    None
}

pub fn spawn(pg: PgPool, ctx: Arc<Context>) -> Option<JoinHandle<()>> {
    if !ctx.config.reminders_enabled {
        log::info!("Payment reminders are disabled");
        return None;
    }
    let (day, hour) = (ctx.config.reminder_day, ctx.config.reminder_hour);
    Some(tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let at = match next_run(now, day, hour) {
                Some(at) => at,
                None => {
                    log::error!("No valid reminder date for day {} at {}:00", day, hour);
                    return;
                }
            };
            log::info!("Next payment reminder run at {}", at);
            if let Ok(wait) = (at - now).to_std() {
                tokio::time::sleep(wait).await;
            }
            match payment::send_reminders(&pg, &ctx.mailer, None).await {
                Ok(report) => log::info!(
                    "Scheduled reminders done: {} sent, {} failed",
                    report.sent.len(),
                    report.failed.len()
                ),
                Err(err) => log::error!("Scheduled reminders failed: {:?}", err),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, min, 0)
                .unwrap(),
        )
    }

    #[test]
    fn runs_later_this_month() {
        assert_eq!(next_run(at(2025, 3, 2, 12, 0), 10, 9), Some(at(2025, 3, 10, 9, 0)));
        assert_eq!(next_run(at(2025, 3, 10, 8, 59), 10, 9), Some(at(2025, 3, 10, 9, 0)));
    }

    #[test]
    fn rolls_to_next_month_once_passed() {
        assert_eq!(next_run(at(2025, 3, 10, 9, 0), 10, 9), Some(at(2025, 4, 10, 9, 0)));
        assert_eq!(next_run(at(2025, 3, 25, 0, 0), 10, 9), Some(at(2025, 4, 10, 9, 0)));
    }

    #[test]
    fn rolls_over_the_year() {
        assert_eq!(next_run(at(2025, 12, 11, 0, 0), 10, 9), Some(at(2026, 1, 10, 9, 0)));
    }

    #[test]
    fn rejects_impossible_hours() {
        assert_eq!(next_run(at(2025, 3, 1, 0, 0), 10, 24), None);
    }
}
