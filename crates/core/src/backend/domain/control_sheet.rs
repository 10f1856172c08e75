//! Typed parameter registry shared between a stage and its host/UI.
//!
//! Each cell is one of a fixed set of kinds with its own validated config.
//! Subscribers registered on a cell are called after every effective change.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SheetError {
    #[error("unknown cell: {0}")]
    UnknownCell(String),
    #[error("cell {name} is not a {expected} cell")]
    KindMismatch { name: String, expected: &'static str },
    #[error("value {value} for {name} is outside {min}..={max}")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{choice} is not a valid choice for {name}")]
    InvalidChoice { name: String, choice: String },
    #[error("cell {0} is disabled")]
    Disabled(String),
    #[error("cell {0} already exists")]
    Duplicate(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NumberConfig {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub decimals: u8,
}

impl NumberConfig {
    pub fn new(min: f64, max: f64, step: f64, decimals: u8) -> Self {
        Self {
            min,
            max,
            step,
            decimals,
        }
    }

    fn round(&self, value: f64) -> f64 {
        let scale = 10f64.powi(self.decimals as i32);
        (value * scale).round() / scale
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CellKind {
    Number { config: NumberConfig, value: f64 },
    Flag { value: bool },
    Choice { choices: Vec<String>, selected: Option<usize> },
    Progress { percent: u8, caption: Option<String> },
    Error { message: Option<String> },
    InfoLabel { text: Option<String> },
}

impl CellKind {
    fn label(&self) -> &'static str {
        match self {
            CellKind::Number { .. } => "number",
            CellKind::Flag { .. } => "flag",
            CellKind::Choice { .. } => "choice",
            CellKind::Progress { .. } => "progress",
            CellKind::Error { .. } => "error",
            CellKind::InfoLabel { .. } => "info label",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    pub enabled: bool,
    pub kind: CellKind,
}

/// A user-settable value. Choices are addressed by name so persisted values
/// survive reordering of the choice list.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Number(f64),
    Flag(bool),
    Choice(Option<String>),
}

impl CellValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Number(v) => serde_json::json!(v),
            CellValue::Flag(v) => serde_json::Value::Bool(*v),
            CellValue::Choice(Some(name)) => serde_json::Value::String(name.clone()),
            CellValue::Choice(None) => serde_json::Value::Null,
        }
    }

    /// Interprets a persisted JSON value according to the kind of the target cell.
    pub fn from_json(kind: &CellKind, value: &serde_json::Value) -> Option<Self> {
        match kind {
            CellKind::Number { .. } => value.as_f64().map(CellValue::Number),
            CellKind::Flag { .. } => value.as_bool().map(CellValue::Flag),
            CellKind::Choice { .. } => match value {
                serde_json::Value::Null => Some(CellValue::Choice(None)),
                serde_json::Value::String(s) => Some(CellValue::Choice(Some(s.clone()))),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Number(v) => write!(f, "{v}"),
            CellValue::Flag(v) => write!(f, "{v}"),
            CellValue::Choice(Some(name)) => f.write_str(name),
            CellValue::Choice(None) => f.write_str("<none>"),
        }
    }
}

pub type CellSubscriber = Box<dyn FnMut(&str, &Cell) + Send>;

/// Read-only copy of all cells, sent from a worker to its host.
pub type SheetSnapshot = BTreeMap<String, Cell>;

#[derive(Default)]
pub struct ControlSheet {
    cells: BTreeMap<String, Cell>,
    subscribers: HashMap<String, Vec<CellSubscriber>>,
    revision: u64,
}

impl ControlSheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incremented on every effective change; lets owners detect staleness cheaply.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn add_number(
        &mut self,
        name: &str,
        config: NumberConfig,
        value: f64,
    ) -> Result<(), SheetError> {
        let value = config.round(value.clamp(config.min, config.max));
        self.add(name, CellKind::Number { config, value })
    }

    pub fn add_flag(&mut self, name: &str, value: bool) -> Result<(), SheetError> {
        self.add(name, CellKind::Flag { value })
    }

    pub fn add_choice(
        &mut self,
        name: &str,
        choices: Vec<String>,
        selected: Option<usize>,
    ) -> Result<(), SheetError> {
        let selected = selected.filter(|&i| i < choices.len());
        self.add(name, CellKind::Choice { choices, selected })
    }

    pub fn add_progress(&mut self, name: &str) -> Result<(), SheetError> {
        self.add(
            name,
            CellKind::Progress {
                percent: 0,
                caption: None,
            },
        )
    }

    pub fn add_error(&mut self, name: &str) -> Result<(), SheetError> {
        self.add(name, CellKind::Error { message: None })
    }

    pub fn add_info_label(&mut self, name: &str) -> Result<(), SheetError> {
        self.add(name, CellKind::InfoLabel { text: None })
    }

    fn add(&mut self, name: &str, kind: CellKind) -> Result<(), SheetError> {
        if self.cells.contains_key(name) {
            return Err(SheetError::Duplicate(name.to_string()));
        }
        self.cells.insert(
            name.to_string(),
            Cell {
                enabled: true,
                kind,
            },
        );
        self.revision += 1;
        Ok(())
    }

    pub fn subscribe(&mut self, name: &str, subscriber: CellSubscriber) -> Result<(), SheetError> {
        if !self.cells.contains_key(name) {
            return Err(SheetError::UnknownCell(name.to_string()));
        }
        self.subscribers
            .entry(name.to_string())
            .or_default()
            .push(subscriber);
        Ok(())
    }

    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells.get(name)
    }

    pub fn snapshot(&self) -> SheetSnapshot {
        self.cells.clone()
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.cells.get(name)?.kind {
            CellKind::Number { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.cells.get(name)?.kind {
            CellKind::Flag { value } => Some(value),
            _ => None,
        }
    }

    pub fn selected(&self, name: &str) -> Option<&str> {
        match &self.cells.get(name)?.kind {
            CellKind::Choice { choices, selected } => selected.map(|i| choices[i].as_str()),
            _ => None,
        }
    }

    pub fn error(&self, name: &str) -> Option<&str> {
        match &self.cells.get(name)?.kind {
            CellKind::Error { message } => message.as_deref(),
            _ => None,
        }
    }

    pub fn info(&self, name: &str) -> Option<&str> {
        match &self.cells.get(name)?.kind {
            CellKind::InfoLabel { text } => text.as_deref(),
            _ => None,
        }
    }

    /// The user-settable value of a cell, if it has one.
    pub fn value(&self, name: &str) -> Option<CellValue> {
        match &self.cells.get(name)?.kind {
            CellKind::Number { value, .. } => Some(CellValue::Number(*value)),
            CellKind::Flag { value } => Some(CellValue::Flag(*value)),
            CellKind::Choice { choices, selected } => {
                Some(CellValue::Choice(selected.map(|i| choices[i].clone())))
            }
            _ => None,
        }
    }

    /// Applies a user-settable value. Returns whether the value changed.
    ///
    /// Disabled cells reject values; out-of-range numbers and unknown choices
    /// are rejected rather than clamped.
    pub fn apply(&mut self, name: &str, value: &CellValue) -> Result<bool, SheetError> {
        let cell = self.cell_mut(name)?;
        if !cell.enabled {
            return Err(SheetError::Disabled(name.to_string()));
        }
        let changed = match (&mut cell.kind, value) {
            (CellKind::Number { config, value: current }, CellValue::Number(v)) => {
                if !(config.min..=config.max).contains(v) {
                    return Err(SheetError::OutOfRange {
                        name: name.to_string(),
                        value: *v,
                        min: config.min,
                        max: config.max,
                    });
                }
                let v = config.round(*v);
                replace(current, v)
            }
            (CellKind::Flag { value: current }, CellValue::Flag(v)) => replace(current, *v),
            (CellKind::Choice { choices, selected }, CellValue::Choice(choice)) => {
                let index = match choice {
                    None => None,
                    Some(c) => match choices.iter().position(|x| x == c) {
                        Some(i) => Some(i),
                        None => {
                            return Err(SheetError::InvalidChoice {
                                name: name.to_string(),
                                choice: c.clone(),
                            })
                        }
                    },
                };
                replace(selected, index)
            }
            (kind, _) => {
                return Err(SheetError::KindMismatch {
                    name: name.to_string(),
                    expected: kind.label(),
                })
            }
        };
        if changed {
            self.changed(name);
        }
        Ok(changed)
    }

    /// Replaces the choice list, keeping the selection if its name survives.
    pub fn set_choices(&mut self, name: &str, new_choices: Vec<String>) -> Result<(), SheetError> {
        let cell = self.cell_mut(name)?;
        let changed = match &mut cell.kind {
            CellKind::Choice { choices, selected } => {
                let keep = selected
                    .map(|i| choices[i].clone())
                    .and_then(|n| new_choices.iter().position(|c| *c == n));
                let changed = *choices != new_choices || *selected != keep;
                *choices = new_choices;
                *selected = keep;
                changed
            }
            _ => return Err(mismatch(name, "choice")),
        };
        if changed {
            self.changed(name);
        }
        Ok(())
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), SheetError> {
        let cell = self.cell_mut(name)?;
        if replace(&mut cell.enabled, enabled) {
            self.changed(name);
        }
        Ok(())
    }

    pub fn set_progress(
        &mut self,
        name: &str,
        percent: u8,
        caption: Option<String>,
    ) -> Result<(), SheetError> {
        let cell = self.cell_mut(name)?;
        let changed = match &mut cell.kind {
            CellKind::Progress {
                percent: p,
                caption: c,
            } => {
                let a = replace(p, percent.min(100));
                let b = replace(c, caption);
                a || b
            }
            _ => return Err(mismatch(name, "progress")),
        };
        if changed {
            self.changed(name);
        }
        Ok(())
    }

    pub fn set_error(&mut self, name: &str, message: Option<String>) -> Result<(), SheetError> {
        let cell = self.cell_mut(name)?;
        let changed = match &mut cell.kind {
            CellKind::Error { message: m } => replace(m, message),
            _ => return Err(mismatch(name, "error")),
        };
        if changed {
            self.changed(name);
        }
        Ok(())
    }

    pub fn set_info(&mut self, name: &str, text: Option<String>) -> Result<(), SheetError> {
        let cell = self.cell_mut(name)?;
        let changed = match &mut cell.kind {
            CellKind::InfoLabel { text: t } => replace(t, text),
            _ => return Err(mismatch(name, "info label")),
        };
        if changed {
            self.changed(name);
        }
        Ok(())
    }

    fn cell_mut(&mut self, name: &str) -> Result<&mut Cell, SheetError> {
        self.cells
            .get_mut(name)
            .ok_or_else(|| SheetError::UnknownCell(name.to_string()))
    }

    fn changed(&mut self, name: &str) {
        self.revision += 1;
        let Some(cell) = self.cells.get(name) else {
            return;
        };
        if let Some(subs) = self.subscribers.get_mut(name) {
            for sub in subs.iter_mut() {
                sub(name, cell);
            }
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

fn mismatch(name: &str, expected: &'static str) -> SheetError {
    SheetError::KindMismatch {
        name: name.to_string(),
        expected,
    }
}
