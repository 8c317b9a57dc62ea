use chrono::{DateTime, TimeZone, Timelike};

/// Top-of-the-hour announcement state.
#[derive(Debug, Clone)]
pub struct HourlyReport {
    pub enabled: bool,
    pub target: String,
    /// `{time}` is replaced with `YYYY-MM-DD HH:MM:SS`.
    pub template: String,
    pub grace_secs: u32,
    last_reported_hour: Option<u32>,
}

impl HourlyReport {
    pub fn new(enabled: bool, target: String, template: String, grace_secs: u32) -> Self {
        Self {
            enabled,
            target,
            template,
            grace_secs,
            last_reported_hour: None,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, String::new(), String::new(), 0)
    }

    pub fn last_reported_hour(&self) -> Option<u32> {
        self.last_reported_hour
    }

    /// The announcement text if one should go out at `now`.
    pub fn due<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<String>
    where
        Tz::Offset: std::fmt::Display,
    {
        if !self.enabled || self.target.is_empty() {
            return None;
        }
        if now.minute() != 0 || now.second() >= self.grace_secs {
            return None;
        }
        if self.last_reported_hour == Some(now.hour()) {
            return None;
        }
        let stamp = now.format("%Y-%m-%d %H:%M:%S").to_string();
        Some(self.template.replace("{time}", &stamp))
    }

    /// Record a delivered announcement so the same hour is not announced twice.
    pub fn mark_reported<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) {
        self.last_reported_hour = Some(now.hour());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn report() -> HourlyReport {
        HourlyReport::new(
            true,
            "Alice".to_string(),
            "⏰ It is now {time}".to_string(),
            10,
        )
    }

    #[test]
    fn formats_template_at_top_of_hour() {
        let report = report();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 3).unwrap();
        assert_eq!(
            report.due(&now).as_deref(),
            Some("⏰ It is now 2026-03-01 14:00:03")
        );
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 10).unwrap();
        assert!(report.due(&late).is_none());
        let off_minute = Utc.with_ymd_and_hms(2026, 3, 1, 14, 1, 0).unwrap();
        assert!(report.due(&off_minute).is_none());
    }

    #[test]
    fn fires_once_per_hour_across_a_two_hour_sweep() {
        let mut report = report();
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 13, 59, 0).unwrap();
        let mut fired = Vec::new();

        // Half-second ticks, like a tight poll interval.
        let mut now = start;
        while now < start + Duration::hours(2) {
            if report.due(&now).is_some() {
                report.mark_reported(&now);
                fired.push(now.hour());
            }
            now += Duration::milliseconds(500);
        }

        assert_eq!(fired, vec![14, 15]);
        assert_eq!(report.last_reported_hour(), Some(15));
    }

    #[test]
    fn disabled_or_targetless_report_never_fires() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        assert!(HourlyReport::disabled().due(&now).is_none());

        let mut no_target = report();
        no_target.target.clear();
        assert!(no_target.due(&now).is_none());
    }
}
