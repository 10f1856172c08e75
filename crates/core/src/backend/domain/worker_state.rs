use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::domain::control_sheet::{CellValue, ControlSheet};

/// Persisted per-stage configuration: cell name -> value.
///
/// Keys are kept sorted so re-application on restart happens in a stable order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerState {
    values: BTreeMap<String, serde_json::Value>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: &str, value: &CellValue) {
        self.values.insert(name.to_string(), value.to_json());
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.values.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Applies every stored value to `sheet` in key order.
    ///
    /// Returns the names of cells that changed. Values that no longer fit the
    /// sheet (unknown cell, wrong kind, out of range) are skipped and logged.
    pub fn apply_to(&self, sheet: &mut ControlSheet) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, json) in &self.values {
            let Some(cell) = sheet.cell(name) else {
                log::debug!("Skipping persisted value for unknown cell {name}");
                continue;
            };
            let Some(value) = CellValue::from_json(&cell.kind, json) else {
                log::warn!("Persisted value {json} does not fit cell {name}");
                continue;
            };
            match sheet.apply(name, &value) {
                Ok(true) => changed.push(name.clone()),
                Ok(false) => {}
                Err(e) => log::warn!("Could not restore {name}: {e}"),
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::domain::control_sheet::NumberConfig;
    use approx::assert_relative_eq;

    fn sheet() -> ControlSheet {
        let mut sheet = ControlSheet::new();
        sheet
            .add_number("gain", NumberConfig::new(0.0, 10.0, 0.1, 1), 1.0)
            .unwrap();
        sheet.add_flag("mirror", false).unwrap();
        sheet
            .add_choice("model", vec!["x".into(), "y".into()], Some(0))
            .unwrap();
        sheet
    }

    #[test]
    fn test_apply_restores_values_in_order() {
        let mut state = WorkerState::new();
        state.set("mirror", &CellValue::Flag(true));
        state.set("gain", &CellValue::Number(2.5));
        state.set("model", &CellValue::Choice(Some("y".into())));
        let mut sheet = sheet();

        let changed = state.apply_to(&mut sheet);

        assert_eq!(changed, vec!["gain", "mirror", "model"]);
        assert_relative_eq!(sheet.number("gain").unwrap(), 2.5);
        assert_eq!(sheet.flag("mirror"), Some(true));
        assert_eq!(sheet.selected("model"), Some("y"));
    }

    #[test]
    fn test_apply_skips_values_that_no_longer_fit() {
        let mut state = WorkerState::new();
        state.set("gain", &CellValue::Number(99.0));
        state.set("gone", &CellValue::Flag(true));
        state.set("model", &CellValue::Choice(Some("deleted".into())));
        let mut sheet = sheet();

        let changed = state.apply_to(&mut sheet);

        assert!(changed.is_empty());
        assert_relative_eq!(sheet.number("gain").unwrap(), 1.0);
        assert_eq!(sheet.selected("model"), Some("x"));
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut state = WorkerState::new();
        state.set("gain", &CellValue::Number(1.5));
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"gain":1.5}"#);
        let back: WorkerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_remove_and_len() {
        let mut state = WorkerState::new();
        assert!(state.is_empty());
        state.set("a", &CellValue::Flag(true));
        assert_eq!(state.len(), 1);
        assert!(state.remove("a"));
        assert!(!state.remove("a"));
    }
}
