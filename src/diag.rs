//! Diagnostic reporting.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// A bus primitive failed.
    Transport,
    /// A device slot failed its PEC check.
    Pec,
    /// A multiplexer did not acknowledge its channel selection.
    MuxAck,
    /// Another bridged peripheral did not acknowledge.
    PeripheralAck,
    /// A measured value lies outside its calibration range.
    Range,
    /// The configuration read back differs from what was written.
    ConfigReadBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Ok,
    NotOk,
}

impl From<bool> for Outcome {
    fn from(ok: bool) -> Self {
        if ok {
            Outcome::Ok
        } else {
            Outcome::NotOk
        }
    }
}

/// What the index of a report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Index is the string.
    String,
    /// Index is `string * devices_per_string + device`.
    Device,
}

/// Receives the outcome of every checked operation.
pub trait DiagnosticReporter {
    fn report(&mut self, category: Category, outcome: Outcome, scope: Scope, index: usize);
}

impl<T: DiagnosticReporter + ?Sized> DiagnosticReporter for Box<T> {
    fn report(&mut self, category: Category, outcome: Outcome, scope: Scope, index: usize) {
        (**self).report(category, outcome, scope, index)
    }
}

/// Logs failures as warnings and successes at trace level.
#[derive(Debug, Default)]
pub struct LogReporter;

impl DiagnosticReporter for LogReporter {
    fn report(&mut self, category: Category, outcome: Outcome, scope: Scope, index: usize) {
        match outcome {
            Outcome::Ok => log::trace!("{category:?} ok - {scope:?} #{index}"),
            Outcome::NotOk => log::warn!("{category:?} failed - {scope:?} #{index}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub category: Category,
    pub outcome: Outcome,
    pub scope: Scope,
    pub index: usize,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} ({:?} #{})",
            self.category, self.outcome, self.scope, self.index
        )
    }
}

/// Keeps every report in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    reports: Vec<Report>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> &[Report] {
        &self.reports
    }

    pub fn count(&self, category: Category, outcome: Outcome) -> usize {
        self.reports
            .iter()
            .filter(|r| r.category == category && r.outcome == outcome)
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &Report> {
        self.reports.iter().filter(|r| r.outcome == Outcome::NotOk)
    }

    pub fn clear(&mut self) {
        self.reports.clear();
    }
}

impl DiagnosticReporter for RecordingReporter {
    fn report(&mut self, category: Category, outcome: Outcome, scope: Scope, index: usize) {
        self.reports.push(Report {
            category,
            outcome,
            scope,
            index,
        });
    }
}
