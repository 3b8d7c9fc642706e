//! Per-epoch summary rows, their display order and rendering.

use crate::error::{ExperimentError, Result};
use crate::format::{self, Reading};
use crate::meters::SharedMeter;
use std::fmt;
use tracing::debug;

pub const EPOCH: &str = "Epoch";
pub const TR_LOSS: &str = "TR Loss";
pub const TR_TIME: &str = "TR Time";
pub const VA_LOSS: &str = "VA Loss";
pub const VA_TIME: &str = "VA Time";
pub const MEMORY: &str = "Memory";

/// Default column order of the epoch summary.
pub const DEFAULT_SUMMARY_ORDER: [&str; 6] = [EPOCH, TR_LOSS, VA_LOSS, TR_TIME, VA_TIME, MEMORY];

/// Where a row takes its value from.
pub enum RowSource {
    /// Raw epoch number, written at log time.
    Epoch(Option<usize>),
    Meter(SharedMeter),
}

impl RowSource {
    fn reading(&self) -> Result<Reading> {
        match self {
            RowSource::Epoch(Some(epoch)) => Ok(Reading::from(*epoch)),
            RowSource::Epoch(None) => Err(ExperimentError::engine("epoch has not been set")),
            RowSource::Meter(meter) => meter
                .try_borrow()
                .map(|m| m.value())
                .map_err(|_| ExperimentError::engine("meter is being updated")),
        }
    }
}

impl fmt::Debug for RowSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowSource::Epoch(epoch) => f.debug_tuple("Epoch").field(epoch).finish(),
            RowSource::Meter(_) => f.write_str("Meter(..)"),
        }
    }
}

/// One `label = value` segment of the summary line.
#[derive(Debug)]
pub struct SummaryRow {
    label: String,
    format: String,
    source: RowSource,
}

impl SummaryRow {
    pub fn new(label: impl Into<String>, format: impl Into<String>, source: RowSource) -> Self {
        Self {
            label: label.into(),
            format: format.into(),
            source,
        }
    }

    pub fn meter(label: impl Into<String>, format: impl Into<String>, meter: SharedMeter) -> Self {
        Self::new(label, format, RowSource::Meter(meter))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn source(&self) -> &RowSource {
        &self.source
    }

    /// Render as `label = value`.
    pub fn render(&self) -> Result<String> {
        let wrap = |source: ExperimentError| ExperimentError::Render {
            label: self.label.clone(),
            source: Box::new(source),
        };
        let reading = self.source.reading().map_err(wrap)?;
        let value = format::render(&self.format, &reading).map_err(wrap)?;
        Ok(format!("{} = {}", self.label, value))
    }
}

/// Sort `rows` by the position of their labels in `order`.
///
/// All or nothing: when `order` is absent or misses any row label, the rows
/// come back in their original order and the reason is logged at debug level.
pub fn sort_rows<S: AsRef<str>>(rows: Vec<SummaryRow>, order: Option<&[S]>) -> Vec<SummaryRow> {
    let Some(order) = order else {
        debug!("Could not sort the summary. Reason: no summary order given");
        return rows;
    };

    let positions: Option<Vec<usize>> = rows
        .iter()
        .map(|row| order.iter().position(|label| label.as_ref() == row.label))
        .collect();

    let Some(positions) = positions else {
        let missing: Vec<&str> = rows
            .iter()
            .filter(|row| !order.iter().any(|label| label.as_ref() == row.label))
            .map(|row| row.label.as_str())
            .collect();
        debug!(
            "Could not sort the summary. Reason: labels {:?} not in summary order",
            missing
        );
        return rows;
    };

    let mut keyed: Vec<(usize, SummaryRow)> = positions.into_iter().zip(rows).collect();
    keyed.sort_by_key(|(position, _)| *position);
    keyed.into_iter().map(|(_, row)| row).collect()
}

/// The ordered rows rendered at every epoch end.
#[derive(Debug)]
pub struct Summary {
    rows: Vec<SummaryRow>,
    epoch_row: Option<usize>,
}

impl Summary {
    pub fn new(rows: Vec<SummaryRow>) -> Self {
        debug_assert!(
            rows.iter()
                .enumerate()
                .all(|(i, r)| rows[..i].iter().all(|o| o.label != r.label)),
            "summary labels must be unique"
        );
        let epoch_row = rows.iter().position(|r| r.label == EPOCH);
        Self { rows, epoch_row }
    }

    pub fn rows(&self) -> &[SummaryRow] {
        &self.rows
    }

    pub fn labels(&self) -> Vec<&str> {
        self.rows.iter().map(SummaryRow::label).collect()
    }

    /// Write `epoch` into the Epoch row, if the summary has one.
    pub fn set_epoch(&mut self, epoch: usize) {
        if let Some(index) = self.epoch_row {
            self.rows[index].source = RowSource::Epoch(Some(epoch));
        }
    }

    /// Render every row, joined by `", "`.
    pub fn render(&self) -> Result<String> {
        let parts = self
            .rows
            .iter()
            .map(SummaryRow::render)
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join(", "))
    }
}
