//! Cycle configuration
//!
//! A cycle is a named rotation policy (hour, day, week, month) that keeps a
//! bounded number of generations of hardlinked snapshots. This module holds
//! the immutable [`CycleDefinition`] and the ordered [`CycleTable`] the rotation
//! engine evaluates, together with the calendar arithmetic used to decide
//! whether a cycle is due.
//!
//! ## Configuration file
//!
//! The table can be loaded from JSON; every field maps one-to-one onto
//! [`CycleDefinition`]:
//!
//! ```json
//! [
//!   { "name": "hour", "max_generations": 12, "dir_template": "hour_%02d_%s",
//!     "preference": null, "forced_interval": 40, "interval_unit": "minutes",
//!     "calendar_field": "minute-of-hour" },
//!   { "name": "day", "max_generations": 30, "dir_template": "day_%02d_%s",
//!     "preference": 6, "forced_interval": 23, "interval_unit": "hours",
//!     "calendar_field": "hour-of-day", "gates_following": true }
//! ]
//! ```
//!
//! ## Trigger rule
//!
//! A cycle rolls when the configured calendar field of the current snapshot's
//! creation time equals its preference, or when its generation 1 is at least
//! `forced_interval` units old.

use crate::error::{HardsnapError, Result};
use crate::template::DirTemplate;
use crate::types::RollReason;
use chrono::{DateTime, Datelike, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Calendar field of a timestamp compared against a cycle's preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CalendarField {
    /// 0-59
    MinuteOfHour,
    /// 0-23
    HourOfDay,
    /// 1 (Monday) - 7 (Sunday)
    DayOfWeek,
    /// 1-31
    DayOfMonth,
}

impl CalendarField {
    /// Value of this field for `at`
    pub fn value_of<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> u32 {
        match self {
            CalendarField::MinuteOfHour => at.minute(),
            CalendarField::HourOfDay => at.hour(),
            CalendarField::DayOfWeek => at.weekday().number_from_monday(),
            CalendarField::DayOfMonth => at.day(),
        }
    }

    /// Values this field can take
    pub fn range(&self) -> RangeInclusive<u32> {
        match self {
            CalendarField::MinuteOfHour => 0..=59,
            CalendarField::HourOfDay => 0..=23,
            CalendarField::DayOfWeek => 1..=7,
            CalendarField::DayOfMonth => 1..=31,
        }
    }
}

/// Unit in which a cycle's age and forced interval are expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntervalUnit {
    /// 60 seconds
    Minutes,
    /// 3600 seconds
    Hours,
    /// 86400 seconds
    Days,
}

impl IntervalUnit {
    /// Seconds per unit
    pub fn divisor_seconds(&self) -> u64 {
        match self {
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 3_600,
            IntervalUnit::Days => 86_400,
        }
    }
}

/// One named rotation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleDefinition {
    /// Cycle name, e.g. `day`
    pub name: String,
    /// Number of generations kept
    pub max_generations: usize,
    /// Naming scheme of generation directories
    pub dir_template: DirTemplate,
    /// Calendar value at which the cycle prefers to roll
    #[serde(default)]
    pub preference: Option<u32>,
    /// Age (in `interval_unit`) at which a roll is forced
    pub forced_interval: f64,
    /// Unit of ages and `forced_interval`
    pub interval_unit: IntervalUnit,
    /// Calendar field compared with `preference`
    pub calendar_field: CalendarField,
    /// Whether cycles after this one are only evaluated when this one rolls
    #[serde(default)]
    pub gates_following: bool,
}

/// An existing generation directory of a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    /// Slot number, 1 = newest
    pub index: usize,
    /// Creation label carried in the directory name
    pub label: String,
    /// Full path
    pub path: PathBuf,
}

impl CycleDefinition {
    /// Seconds per unit of this cycle's ages
    pub fn interval_divisor_seconds(&self) -> u64 {
        self.interval_unit.divisor_seconds()
    }

    /// Age of a snapshot created at `then`, seen from `now`, in this cycle's unit
    pub fn age(&self, now: i64, then: i64) -> f64 {
        (now - then) as f64 / self.interval_divisor_seconds() as f64
    }

    /// Why this cycle should roll, if at all
    ///
    /// `age` is `f64::INFINITY` when there is no usable generation 1.
    pub fn trigger(&self, time_field: u32, age: f64) -> Option<RollReason> {
        if self.preference == Some(time_field) {
            Some(RollReason::Preference { value: time_field })
        } else if age >= self.forced_interval {
            Some(RollReason::Forced { age })
        } else {
            None
        }
    }

    /// Directory name of generation `index` created from a snapshot labelled `label`
    pub fn generation_name(&self, index: usize, label: &str) -> String {
        self.dir_template.render(index, label)
    }

    /// All generation directories of this cycle under `root`, ordered by index
    pub fn generations(&self, root: &Path) -> Result<Vec<Generation>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((index, label)) = self.dir_template.parse_name(name) {
                found.push(Generation {
                    index,
                    label: label.to_string(),
                    path: entry.path(),
                });
            }
        }
        found.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.path.cmp(&b.path)));
        Ok(found)
    }

    /// The generation in slot `index`, if present
    pub fn generation(&self, root: &Path, index: usize) -> Result<Option<Generation>> {
        let mut matching: Vec<Generation> = self
            .generations(root)?
            .into_iter()
            .filter(|g| g.index == index)
            .collect();
        if matching.len() > 1 {
            warn!(
                "Cycle '{}' has {} directories in slot {}; using {:?}",
                self.name,
                matching.len(),
                index,
                matching[0].path
            );
        }
        Ok(if matching.is_empty() { None } else { Some(matching.swap_remove(0)) })
    }

    /// Check the definition for internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HardsnapError::config("cycle name must not be empty"));
        }
        if self.max_generations == 0 {
            return Err(HardsnapError::config(format!(
                "cycle '{}' must keep at least one generation",
                self.name
            )));
        }
        if !(self.forced_interval.is_finite() && self.forced_interval > 0.0) {
            return Err(HardsnapError::config(format!(
                "cycle '{}' needs a positive forced interval",
                self.name
            )));
        }
        if let Some(pref) = self.preference {
            let range = self.calendar_field.range();
            if !range.contains(&pref) {
                return Err(HardsnapError::config(format!(
                    "cycle '{}' prefers {} but {:?} ranges over {}..={}",
                    self.name,
                    pref,
                    self.calendar_field,
                    range.start(),
                    range.end()
                )));
            }
        }
        Ok(())
    }
}

/// Ordered list of cycles, evaluated first to last
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CycleDefinition>", into = "Vec<CycleDefinition>")]
pub struct CycleTable {
    cycles: Vec<CycleDefinition>,
}

impl CycleTable {
    /// Build a validated table
    pub fn new(cycles: Vec<CycleDefinition>) -> Result<Self> {
        if cycles.is_empty() {
            return Err(HardsnapError::config("at least one cycle is required"));
        }

        let mut names = HashSet::new();
        for cycle in &cycles {
            cycle.validate()?;
            if !names.insert(cycle.name.as_str()) {
                return Err(HardsnapError::config(format!("duplicate cycle name '{}'", cycle.name)));
            }
        }

        // A generation directory must belong to exactly one cycle; indexes of
        // several widths catch templates that differ only in zero padding
        for a in &cycles {
            for b in cycles.iter().filter(|b| b.name != a.name) {
                let overlaps = [1, 10, 100, 1000]
                    .iter()
                    .any(|&index| b.dir_template.parse_name(&a.generation_name(index, "label")).is_some());
                if overlaps {
                    return Err(HardsnapError::config(format!(
                        "templates of cycles '{}' and '{}' overlap",
                        a.name, b.name
                    )));
                }
            }
        }

        Ok(Self { cycles })
    }

    /// Reference defaults: hour, day, week and month
    ///
    /// - hour: 12 generations, forced after 40 minutes, no preference
    /// - day: 30 generations, forced after 23 hours, prefers 6am, gates week and month
    /// - week: 9 generations, forced after 7 days, prefers Monday
    /// - month: 9 generations, forced after 31 days, prefers the 1st
    pub fn reference() -> Self {
        let cycle = |name: &str,
                     max_generations: usize,
                     template: &str,
                     preference: Option<u32>,
                     forced_interval: f64,
                     interval_unit: IntervalUnit,
                     calendar_field: CalendarField,
                     gates_following: bool| CycleDefinition {
            name: name.to_string(),
            max_generations,
            dir_template: DirTemplate::parse(template).unwrap_or_else(|e| panic!("built-in template: {}", e)),
            preference,
            forced_interval,
            interval_unit,
            calendar_field,
            gates_following,
        };

        Self {
            cycles: vec![
                cycle("hour", 12, "hour_%02d_%s", None, 40.0, IntervalUnit::Minutes, CalendarField::MinuteOfHour, false),
                cycle("day", 30, "day_%02d_%s", Some(6), 23.0, IntervalUnit::Hours, CalendarField::HourOfDay, true),
                cycle("week", 9, "week_%d_%s", Some(1), 7.0, IntervalUnit::Days, CalendarField::DayOfWeek, false),
                cycle("month", 9, "mnth_%d_%s", Some(1), 31.0, IntervalUnit::Days, CalendarField::DayOfMonth, false),
            ],
        }
    }

    /// Parse a table from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a table from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Cycles in evaluation order
    pub fn iter(&self) -> std::slice::Iter<'_, CycleDefinition> {
        self.cycles.iter()
    }

    /// Look a cycle up by name
    pub fn get(&self, name: &str) -> Option<&CycleDefinition> {
        self.cycles.iter().find(|c| c.name == name)
    }

    /// Number of cycles
    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    /// Whether the table is empty (never true for a validated table)
    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }
}

impl Default for CycleTable {
    fn default() -> Self {
        Self::reference()
    }
}

impl TryFrom<Vec<CycleDefinition>> for CycleTable {
    type Error = HardsnapError;

    fn try_from(value: Vec<CycleDefinition>) -> Result<Self> {
        CycleTable::new(value)
    }
}

impl From<CycleTable> for Vec<CycleDefinition> {
    fn from(value: CycleTable) -> Self {
        value.cycles
    }
}

impl<'a> IntoIterator for &'a CycleTable {
    type Item = &'a CycleDefinition;
    type IntoIter = std::slice::Iter<'a, CycleDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.cycles.iter()
    }
}
