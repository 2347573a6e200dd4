//! Weekly-schedule editing: add or remove exactly one entry in one day
//! bucket, leaving the other six days untouched (they are transmitted
//! zero-filled). Pure algorithm over the snapshot's cached schedule.

use crate::error::{Error, Result};
use crate::types::{DaySchedule, OnOffFlag, ScheduleEntry, WeeklyDayBlock};

pub const MAX_ENTRIES_PER_DAY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    Add,
    Delete,
}

/// The encoded day block to transmit plus the control value accompanying
/// it: the schedule feature's current enable flag, so an edit never flips
/// whether weekly control is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEdit {
    pub block: WeeklyDayBlock,
    pub control_value: u8,
}

pub fn apply(
    schedule: &[DaySchedule],
    weekly_enabled: bool,
    day_of_week: u8,
    entry: ScheduleEntry,
    action: ScheduleAction,
) -> Result<ScheduleEdit> {
    if !(1..=7).contains(&day_of_week) {
        return Err(Error::InvalidSchedule(format!(
            "day of week {day_of_week} not in 1..=7"
        )));
    }
    if entry.hour > 23 {
        return Err(Error::InvalidSchedule(format!("hour {} > 23", entry.hour)));
    }
    if entry.minute > 59 {
        return Err(Error::InvalidSchedule(format!(
            "minute {} > 59",
            entry.minute
        )));
    }

    let existing: Vec<ScheduleEntry> = schedule
        .iter()
        .find(|d| d.day_of_week == day_of_week)
        .map(|d| d.entries.clone())
        .unwrap_or_default();

    let entries = match action {
        ScheduleAction::Add => {
            if existing.iter().any(|e| *e == entry) {
                return Err(Error::InvalidSchedule(format!(
                    "entry {:02}:{:02} already scheduled",
                    entry.hour, entry.minute
                )));
            }
            if existing.len() >= MAX_ENTRIES_PER_DAY {
                return Err(Error::InvalidSchedule(format!(
                    "day {day_of_week} already holds {MAX_ENTRIES_PER_DAY} entries"
                )));
            }
            let mut entries = existing;
            entries.push(entry);
            entries
        }
        ScheduleAction::Delete => {
            if !existing.iter().any(|e| *e == entry) {
                return Err(Error::InvalidSchedule(format!(
                    "no entry {:02}:{:02} scheduled on day {day_of_week}",
                    entry.hour, entry.minute
                )));
            }
            // Remove exactly the first match; remaining entries pack down
            // into contiguous slots.
            let mut entries = existing;
            let position = entries.iter().position(|e| *e == entry).unwrap();
            entries.remove(position);
            entries
        }
    };

    let mut block = WeeklyDayBlock {
        day: day_of_week,
        count: entries.len() as u8,
        ..Default::default()
    };
    for (i, e) in entries.iter().enumerate() {
        block.slots[i] = (e.hour, e.minute, e.state.code());
    }
    Ok(ScheduleEdit {
        block,
        control_value: OnOffFlag::from(weekly_enabled).code(),
    })
}
