use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::RecurrenceRule;

/// Scheduled instants of `rule` inside the half-open window `[from, to)`.
///
/// Times of day are read as wall-clock times at `offset`. The sequence is
/// ascending, free of duplicates, and depends only on its inputs, so building
/// it again for the same window yields the same instants.
#[must_use]
pub fn occurrences(
    rule: &RecurrenceRule,
    offset: UtcOffset,
    from: OffsetDateTime,
    to: OffsetDateTime,
) -> Occurrences {
    let mut times = rule.times_of_day.iter().map(|time| time.time()).collect::<Vec<_>>();
    times.sort_unstable();
    times.dedup();

    let first_local = from.to_offset(offset).date().max(rule.start_date);
    let mut last_local = to.to_offset(offset).date();
    if let Some(end_date) = rule.end_date {
        last_local = last_local.min(end_date);
    }

    let date = (from < to && first_local <= last_local && !times.is_empty()).then_some(first_local);

    Occurrences { rule: rule.clone(), times, offset, from, to, date, last_date: last_local, index: 0 }
}

#[derive(Debug, Clone)]
pub struct Occurrences {
    rule: RecurrenceRule,
    times: Vec<Time>,
    offset: UtcOffset,
    from: OffsetDateTime,
    to: OffsetDateTime,
    date: Option<Date>,
    last_date: Date,
    index: usize,
}

impl Occurrences {
    fn advance_day(&mut self) {
        self.index = 0;
        self.date = self.date.and_then(Date::next_day).filter(|date| *date <= self.last_date);
    }
}

impl Iterator for Occurrences {
    type Item = OffsetDateTime;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let date = self.date?;
            if !self.rule.applies_on(date) {
                self.advance_day();
                continue;
            }
            let Some(time) = self.times.get(self.index).copied() else {
                self.advance_day();
                continue;
            };
            self.index += 1;

            let instant = PrimitiveDateTime::new(date, time).assume_offset(self.offset);
            if instant < self.from {
                continue;
            }
            if instant >= self.to {
                self.date = None;
                return None;
            }
            return Some(instant);
        }
    }
}
