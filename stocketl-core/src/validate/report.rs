//! Validation report types.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Error-level finding. Any violation fails the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    MissingField,
    TypeMismatch,
    OutOfRange,
    TemporalInconsistency,
    DuplicateKey,
    UnknownSymbol,
    MissingSymbol,
    /// A symbol lacks a window date that other symbols in the same file have.
    MissingDate,
    SchemaMismatch,
    EmptyDataset,
    Stale,
}

/// Warning-level finding. Logged and recorded, never fails the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    OldRecord,
    HighPrice,
    HighVolume,
    WideRange,
    SourceDiscrepancy,
    ExtraColumn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// 1-based data row (header excluded); `None` for file-level findings.
    pub row: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub row: Option<usize>,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(f, "row {row}: {:?}: {}", self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub record_count: usize,
    pub symbol_count: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub per_source: BTreeMap<String, usize>,
}

impl ValidationMetrics {
    pub(crate) fn observe_date(&mut self, date: NaiveDate) {
        self.first_date = Some(self.first_date.map_or(date, |d| d.min(date)));
        self.last_date = Some(self.last_date.map_or(date, |d| d.max(date)));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Name of the validated file, for messages.
    pub dataset: String,
    pub violations: Vec<Violation>,
    pub warnings: Vec<Warning>,
    pub metrics: ValidationMetrics,
}

impl ValidationReport {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Default::default()
        }
    }

    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violation(&mut self, kind: ViolationKind, row: Option<usize>, message: impl Into<String>) {
        self.violations.push(Violation {
            kind,
            row,
            message: message.into(),
        });
    }

    pub fn warn(&mut self, kind: WarningKind, row: Option<usize>, message: impl Into<String>) {
        self.warnings.push(Warning {
            kind,
            row,
            message: message.into(),
        });
    }

    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    /// The first `limit` violations, one per line.
    pub fn summary(&self, limit: usize) -> String {
        let mut lines: Vec<String> = self
            .violations
            .iter()
            .take(limit)
            .map(|v| format!("{}: {v}", self.dataset))
            .collect();
        if self.violations.len() > limit {
            lines.push(format!("... and {} more", self.violations.len() - limit));
        }
        lines.join("\n")
    }

    /// Emit warnings and the outcome through `tracing`.
    pub fn log(&self) {
        for w in &self.warnings {
            tracing::warn!(dataset = %self.dataset, kind = ?w.kind, row = ?w.row, "{}", w.message);
        }
        if self.passed() {
            tracing::info!(
                dataset = %self.dataset,
                records = self.metrics.record_count,
                symbols = self.metrics.symbol_count,
                warnings = self.warnings.len(),
                "validation passed"
            );
        } else {
            tracing::error!(
                dataset = %self.dataset,
                violations = self.violations.len(),
                "validation failed"
            );
        }
    }
}
