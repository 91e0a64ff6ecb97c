use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Which of the four counter families (spec §3) a reservation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, ToSchema)]
#[cfg_attr(feature = "postgres-store", derive(sqlx::Type))]
#[cfg_attr(feature = "postgres-store", sqlx(type_name = "rate_scope", rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum RateScope {
    WorkspaceDaily,
    WorkspaceHourly,
    UserDaily,
    UserHourly,
}

impl RateScope {
    pub fn window(self) -> RateWindow {
        match self {
            RateScope::WorkspaceDaily | RateScope::UserDaily => RateWindow::Day,
            RateScope::WorkspaceHourly | RateScope::UserHourly => RateWindow::Hour,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    Day,
    Hour,
}

impl RateWindow {
    /// The UTC-aligned bucket start containing `at` (spec §4.2: "All
    /// buckets are UTC-aligned").
    pub fn bucket_start(self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            RateWindow::Day => at.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc(),
            RateWindow::Hour => at
                .date_naive()
                .and_hms_opt(at.time().hour(), 0, 0)
                .unwrap()
                .and_utc(),
        }
    }

    pub fn bucket_end(self, bucket_start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            RateWindow::Day => bucket_start + chrono::Duration::days(1),
            RateWindow::Hour => bucket_start + chrono::Duration::hours(1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bucket_boundaries_are_utc_aligned() {
        let at = Utc.with_ymd_and_hms(2026, 7, 26, 14, 37, 9).unwrap();

        let day_start = RateWindow::Day.bucket_start(at);
        assert_eq!(day_start, Utc.with_ymd_and_hms(2026, 7, 26, 0, 0, 0).unwrap());
        assert_eq!(
            RateWindow::Day.bucket_end(day_start),
            Utc.with_ymd_and_hms(2026, 7, 27, 0, 0, 0).unwrap()
        );

        let hour_start = RateWindow::Hour.bucket_start(at);
        assert_eq!(hour_start, Utc.with_ymd_and_hms(2026, 7, 26, 14, 0, 0).unwrap());
        assert_eq!(
            RateWindow::Hour.bucket_end(hour_start),
            Utc.with_ymd_and_hms(2026, 7, 26, 15, 0, 0).unwrap()
        );
    }
}
