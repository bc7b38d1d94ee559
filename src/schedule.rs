//! Schedule Evaluator (spec §4.2, §6.3).
//!
//! Parses the frequency/time-parameter recurrence format into absolute
//! next-run timestamps and ticks on a fixed interval, enqueueing due
//! schedules. Grounded on `http_utils.rs::create_time_chunks`'s day-window
//! arithmetic style (date math via `chrono`, no manual calendar tables) and
//! on `postgres_service.rs`'s polling-loop shape, generalized from an ad
//! hoc OHLCV fetch interval to the full recurrence table in §4.2.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde_json::json;
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metadata_store::MetadataStoreGateway;
use crate::queue::JobRequestQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Fortnightly,
    Monthly,
    HalfYearly,
    Yearly,
    Immediate,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Fortnightly => "FORTNIGHTLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::HalfYearly => "HALF_YEARLY",
            Frequency::Yearly => "YEARLY",
            Frequency::Immediate => "IMMEDIATE",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "DAILY" => Ok(Frequency::Daily),
            "WEEKLY" => Ok(Frequency::Weekly),
            "FORTNIGHTLY" => Ok(Frequency::Fortnightly),
            "MONTHLY" => Ok(Frequency::Monthly),
            "HALF_YEARLY" => Ok(Frequency::HalfYearly),
            "YEARLY" => Ok(Frequency::Yearly),
            "IMMEDIATE" => Ok(Frequency::Immediate),
            other => Err(format!("unknown frequency '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Active,
    Paused,
    Ended,
}

impl ScheduleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleStatus::Active => "ACTIVE",
            ScheduleStatus::Paused => "PAUSED",
            ScheduleStatus::Ended => "ENDED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "ACTIVE" => Ok(ScheduleStatus::Active),
            "PAUSED" => Ok(ScheduleStatus::Paused),
            "ENDED" => Ok(ScheduleStatus::Ended),
            other => Err(format!("unknown schedule status '{other}'")),
        }
    }
}

/// A parsed time-parameter (spec §6.3): a time-of-day shared by all
/// frequencies, plus an optional weekday (WEEKLY/FORTNIGHTLY) or
/// day-of-month (MONTHLY/HALF_YEARLY/YEARLY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeParam {
    pub time_of_day: NaiveTime,
    pub weekday: Option<Weekday>,
    pub day_of_month: Option<u32>,
}

/// Parse the `HH:MM` / `DOW_HH:MM` / `D_HH:MM` formats of spec §6.3,
/// dispatched by the frequency that owns the parameter.
pub fn parse_time_param(frequency: Frequency, raw: &str) -> Result<TimeParam, String> {
    match frequency {
        Frequency::Daily | Frequency::Immediate => {
            let time_of_day = parse_hh_mm(raw)?;
            Ok(TimeParam {
                time_of_day,
                weekday: None,
                day_of_month: None,
            })
        }
        Frequency::Weekly | Frequency::Fortnightly => {
            let (dow_str, hhmm) = raw
                .split_once('_')
                .ok_or_else(|| format!("expected DOW_HH:MM, got '{raw}'"))?;
            let weekday = parse_dow(dow_str)?;
            let time_of_day = parse_hh_mm(hhmm)?;
            Ok(TimeParam {
                time_of_day,
                weekday: Some(weekday),
                day_of_month: None,
            })
        }
        Frequency::Monthly | Frequency::HalfYearly | Frequency::Yearly => {
            let (day_str, hhmm) = raw
                .split_once('_')
                .ok_or_else(|| format!("expected D_HH:MM, got '{raw}'"))?;
            let day: u32 = day_str
                .parse()
                .map_err(|_| format!("day-of-month must be an integer, got '{day_str}'"))?;
            if !(1..=31).contains(&day) {
                return Err(format!("day-of-month must be in 1..31, got {day}"));
            }
            let time_of_day = parse_hh_mm(hhmm)?;
            Ok(TimeParam {
                time_of_day,
                weekday: None,
                day_of_month: Some(day),
            })
        }
    }
}

fn parse_hh_mm(s: &str) -> Result<NaiveTime, String> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| format!("expected HH:MM, got '{s}'"))?;
    let hour: u32 = h.parse().map_err(|_| format!("invalid hour in '{s}'"))?;
    let minute: u32 = m.parse().map_err(|_| format!("invalid minute in '{s}'"))?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| format!("invalid time '{s}'"))
}

fn parse_dow(s: &str) -> Result<Weekday, String> {
    match s {
        "MON" => Ok(Weekday::Mon),
        "TUE" => Ok(Weekday::Tue),
        "WED" => Ok(Weekday::Wed),
        "THU" => Ok(Weekday::Thu),
        "FRI" => Ok(Weekday::Fri),
        "SAT" => Ok(Weekday::Sat),
        "SUN" => Ok(Weekday::Sun),
        other => Err(format!("unknown day-of-week '{other}'")),
    }
}

/// Deterministic next-run-at computation (spec §4.2 `advance`). All
/// arithmetic happens in the schedule's configured timezone so daylight
/// saving transitions land on the intended wall-clock time, then the result
/// is converted back to UTC for storage (spec §6.3: "time-parameters are
/// interpreted in the configured timezone").
pub fn advance(frequency: Frequency, time_param: TimeParam, current_next_run_at: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = current_next_run_at.with_timezone(&tz);
    let advanced_local = match frequency {
        Frequency::Daily | Frequency::Immediate => at_time(local.date_naive() + ChronoDuration::days(1), time_param.time_of_day, tz),
        Frequency::Weekly => next_weekday_after(local, time_param, tz, 0),
        Frequency::Fortnightly => next_weekday_after(local, time_param, tz, 7),
        Frequency::Monthly => add_months_clamped(local, 1, time_param, tz),
        Frequency::HalfYearly => add_months_clamped(local, 6, time_param, tz),
        Frequency::Yearly => add_months_clamped(local, 12, time_param, tz),
    };
    advanced_local.with_timezone(&Utc)
}

fn at_time(date: chrono::NaiveDate, time: NaiveTime, tz: Tz) -> DateTime<Tz> {
    tz.from_local_datetime(&date.and_time(time)).single().unwrap_or_else(|| {
        // A local time that's ambiguous/nonexistent across a DST boundary:
        // fall back to the earliest valid instant rather than panicking.
        tz.from_utc_datetime(&date.and_time(time))
    })
}

/// Next occurrence of `time_param.weekday` strictly after `local`, plus an
/// `extra_days` offset for FORTNIGHTLY (spec §4.2: "WEEKLY + 7 days").
fn next_weekday_after(local: DateTime<Tz>, time_param: TimeParam, tz: Tz, extra_days: i64) -> DateTime<Tz> {
    let target_dow = time_param.weekday.expect("WEEKLY/FORTNIGHTLY always carry a weekday");
    let mut date = local.date_naive() + ChronoDuration::days(1);
    while date.weekday() != target_dow {
        date += ChronoDuration::days(1);
    }
    at_time(date + ChronoDuration::days(extra_days), time_param.time_of_day, tz)
}

fn add_months_clamped(local: DateTime<Tz>, months: u32, time_param: TimeParam, tz: Tz) -> DateTime<Tz> {
    let day = time_param.day_of_month.unwrap_or(local.day());
    let mut year = local.year();
    let mut month0 = local.month0() + months;
    year += (month0 / 12) as i32;
    month0 %= 12;
    let month = month0 + 1;

    let last_day = last_day_of_month(year, month);
    let clamped_day = day.min(last_day);
    let date = chrono::NaiveDate::from_ymd_opt(year, month, clamped_day)
        .expect("clamped day is always valid for its month");
    at_time(date, time_param.time_of_day, tz)
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("month is always in 1..=12")
        .pred_opt()
        .expect("the day before the 1st always exists")
        .day()
}

pub struct ScheduleEvaluator<'a> {
    store: &'a MetadataStoreGateway,
    tz: Tz,
}

impl<'a> ScheduleEvaluator<'a> {
    pub fn new(store: &'a MetadataStoreGateway, tz: Tz) -> Self {
        Self { store, tz }
    }

    fn table(&self) -> String {
        format!(
            "{}.{}",
            self.store.dialect().quote_ident(self.store.schema()),
            self.store.dialect().quote_ident("schedule")
        )
    }

    /// One tick (spec §4.2): enqueue every ACTIVE schedule whose
    /// `next_run_at` has passed, advance it, and end it if advancing pushed
    /// it past `end_date`. Returns the number of requests enqueued.
    pub async fn tick(&self) -> OrchestratorResult<u64> {
        let table = self.table();
        let due = self
            .store
            .query(
                &format!(
                    "SELECT schedule_id, mapping_ref, frequency, time_param, next_run_at, end_date
                     FROM {table}
                     WHERE status = 'ACTIVE' AND next_run_at <= NOW()
                     FOR UPDATE SKIP LOCKED"
                ),
                &[],
            )
            .await?;

        let mut enqueued = 0u64;
        let queue = JobRequestQueue::new(self.store);

        for row in due {
            let schedule_id: Uuid = row.get("schedule_id");
            let mapping_ref: String = row.get("mapping_ref");
            let frequency = Frequency::parse(row.get::<_, &str>("frequency"))
                .map_err(OrchestratorError::other)?;
            let time_param_raw: String = row.get("time_param");
            let next_run_at: DateTime<Utc> = row.get("next_run_at");
            let end_date: Option<DateTime<Utc>> = row.get("end_date");

            let parameters = json!({"source": "SCHEDULE", "schedule_id": schedule_id.to_string()});
            queue.enqueue(&mapping_ref, parameters).await?;
            enqueued += 1;

            if frequency == Frequency::Immediate {
                self.store
                    .execute(
                        &format!("UPDATE {table} SET status = 'ENDED', last_run_at = $1 WHERE schedule_id = $2"),
                        &[&next_run_at, &schedule_id],
                    )
                    .await?;
                continue;
            }

            let time_param = parse_time_param(frequency, &time_param_raw).map_err(OrchestratorError::other)?;
            let new_next_run_at = advance(frequency, time_param, next_run_at, self.tz);

            let now_ended = end_date.map(|end| new_next_run_at > end).unwrap_or(false);
            let status = if now_ended { "ENDED" } else { "ACTIVE" };

            self.store
                .execute(
                    &format!(
                        "UPDATE {table} SET last_run_at = $1, next_run_at = $2, status = $3 WHERE schedule_id = $4"
                    ),
                    &[&next_run_at, &new_next_run_at, &status, &schedule_id],
                )
                .await?;
        }

        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_daily_time_param() {
        let tp = parse_time_param(Frequency::Daily, "09:30").unwrap();
        assert_eq!(tp.time_of_day, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert!(tp.weekday.is_none());
    }

    #[test]
    fn parses_weekly_time_param() {
        let tp = parse_time_param(Frequency::Weekly, "MON_06:00").unwrap();
        assert_eq!(tp.weekday, Some(Weekday::Mon));
        assert_eq!(tp.time_of_day, NaiveTime::from_hms_opt(6, 0, 0).unwrap());
    }

    #[test]
    fn parses_monthly_time_param() {
        let tp = parse_time_param(Frequency::Monthly, "31_23:00").unwrap();
        assert_eq!(tp.day_of_month, Some(31));
    }

    #[test]
    fn rejects_out_of_range_day_of_month() {
        assert!(parse_time_param(Frequency::Monthly, "32_00:00").is_err());
    }

    #[test]
    fn daily_advances_exactly_one_day_at_fixed_time() {
        let tp = parse_time_param(Frequency::Daily, "09:00").unwrap();
        let next = advance(Frequency::Daily, tp, utc(2026, 3, 1, 9, 0), Tz::UTC);
        assert_eq!(next, utc(2026, 3, 2, 9, 0));
    }

    #[test]
    fn weekly_lands_on_next_matching_weekday() {
        // 2026-03-02 is a Monday; next WEEKLY(MON) run is 2026-03-09.
        let tp = parse_time_param(Frequency::Weekly, "MON_08:00").unwrap();
        let next = advance(Frequency::Weekly, tp, utc(2026, 3, 2, 8, 0), Tz::UTC);
        assert_eq!(next, utc(2026, 3, 9, 8, 0));
    }

    #[test]
    fn fortnightly_adds_an_extra_week_over_weekly() {
        let tp = parse_time_param(Frequency::Fortnightly, "MON_08:00").unwrap();
        let next = advance(Frequency::Fortnightly, tp, utc(2026, 3, 2, 8, 0), Tz::UTC);
        assert_eq!(next, utc(2026, 3, 16, 8, 0));
    }

    #[test]
    fn monthly_clamps_to_last_day_when_target_day_does_not_exist() {
        // 31_.. scheduled from Jan 31 must clamp Feb to the 28th (2026, not a leap year).
        let tp = parse_time_param(Frequency::Monthly, "31_12:00").unwrap();
        let next = advance(Frequency::Monthly, tp, utc(2026, 1, 31, 12, 0), Tz::UTC);
        assert_eq!(next, utc(2026, 2, 28, 12, 0));
    }

    #[test]
    fn half_yearly_adds_six_months() {
        let tp = parse_time_param(Frequency::HalfYearly, "15_00:00").unwrap();
        let next = advance(Frequency::HalfYearly, tp, utc(2026, 1, 15, 0, 0), Tz::UTC);
        assert_eq!(next, utc(2026, 7, 15, 0, 0));
    }

    #[test]
    fn yearly_rolls_over_to_next_year() {
        let tp = parse_time_param(Frequency::Yearly, "1_00:00").unwrap();
        let next = advance(Frequency::Yearly, tp, utc(2026, 12, 1, 0, 0), Tz::UTC);
        assert_eq!(next, utc(2027, 12, 1, 0, 0));
    }

    #[test]
    fn schedule_monotonicity_property_7() {
        let tp = parse_time_param(Frequency::Daily, "00:00").unwrap();
        let mut t = utc(2026, 1, 1, 0, 0);
        for _ in 0..30 {
            let next = advance(Frequency::Daily, tp, t, Tz::UTC);
            assert!(next > t);
            t = next;
        }
    }
}
