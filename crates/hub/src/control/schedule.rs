//! Wall-clock watering triggers. Each entry resolves (runs or is skipped as
//! missed) at most once per calendar day.

use std::collections::HashMap;
use time::{Date, Duration, OffsetDateTime};

use crate::config::ClockTime;

/// How late a trigger may still run. Later than this it is reported missed.
pub const LATE_WINDOW: Duration = Duration::minutes(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Run(ClockTime),
    Missed { entry: ClockTime, late_by: Duration },
}

#[derive(Debug, Default)]
pub struct WaterTimer {
    resolved: HashMap<ClockTime, Date>,
}

impl WaterTimer {
    /// Resolve every entry whose target time today has passed.
    pub fn due(&mut self, entries: &[ClockTime], now: OffsetDateTime) -> Vec<Trigger> {
        let today = now.date();
        self.resolved.retain(|entry, _| entries.contains(entry));

        let mut triggers = Vec::new();
        for &entry in entries {
            let Some(at) = entry.to_time() else {
                continue;
            };
            let elapsed = now - now.replace_time(at);
            if elapsed.is_negative() || self.resolved.get(&entry) == Some(&today) {
                continue;
            }
            self.resolved.insert(entry, today);
            if elapsed <= LATE_WINDOW {
                triggers.push(Trigger::Run(entry));
            } else {
                triggers.push(Trigger::Missed {
                    entry,
                    late_by: elapsed,
                });
            }
        }
        triggers
    }

    pub fn last_resolved(&self, entry: ClockTime) -> Option<Date> {
        self.resolved.get(&entry).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn eight() -> ClockTime {
        ClockTime::new(8, 0).unwrap()
    }

    #[test]
    fn runs_once_per_day() {
        let mut timer = WaterTimer::default();
        let entries = [eight()];

        assert!(timer.due(&entries, datetime!(2024-06-01 07:59:50 UTC)).is_empty());
        assert_eq!(
            timer.due(&entries, datetime!(2024-06-01 08:00:05 UTC)),
            vec![Trigger::Run(eight())]
        );
        assert!(timer.due(&entries, datetime!(2024-06-01 08:00:15 UTC)).is_empty());
        assert!(timer.due(&entries, datetime!(2024-06-01 08:30:00 UTC)).is_empty());
        assert_eq!(
            timer.last_resolved(eight()),
            Some(time::macros::date!(2024 - 06 - 01))
        );
    }

    #[test]
    fn runs_again_next_day() {
        let mut timer = WaterTimer::default();
        let entries = [eight()];
        assert_eq!(timer.due(&entries, datetime!(2024-06-01 08:00:05 UTC)).len(), 1);
        assert_eq!(
            timer.due(&entries, datetime!(2024-06-02 08:01:00 UTC)),
            vec![Trigger::Run(eight())]
        );
    }

    #[test]
    fn late_window_edge_still_runs() {
        let mut timer = WaterTimer::default();
        assert_eq!(
            timer.due(&[eight()], datetime!(2024-06-01 08:10:00 UTC)),
            vec![Trigger::Run(eight())]
        );
    }

    #[test]
    fn too_late_is_missed_once() {
        let mut timer = WaterTimer::default();
        let entries = [eight()];
        assert_eq!(
            timer.due(&entries, datetime!(2024-06-01 08:10:01 UTC)),
            vec![Trigger::Missed {
                entry: eight(),
                late_by: Duration::seconds(601)
            }]
        );
        assert!(timer.due(&entries, datetime!(2024-06-01 09:00:00 UTC)).is_empty());
    }

    #[test]
    fn entries_resolve_independently() {
        let mut timer = WaterTimer::default();
        let evening = ClockTime::new(19, 30).unwrap();
        let entries = [eight(), evening];
        assert_eq!(timer.due(&entries, datetime!(2024-06-01 08:02:00 UTC)).len(), 1);
        assert_eq!(
            timer.due(&entries, datetime!(2024-06-01 19:31:00 UTC)),
            vec![Trigger::Run(evening)]
        );
    }

    #[test]
    fn removed_entries_are_forgotten() {
        let mut timer = WaterTimer::default();
        timer.due(&[eight()], datetime!(2024-06-01 08:00:00 UTC));
        timer.due(&[], datetime!(2024-06-01 08:01:00 UTC));
        assert_eq!(timer.last_resolved(eight()), None);
    }
}
