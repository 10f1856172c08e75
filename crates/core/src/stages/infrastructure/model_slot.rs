use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::domain::control_sheet::ControlSheet;
use crate::backend::infrastructure::model_loader::{BuildError, ModelEvent, ModelLoader};
use crate::shared::model_resolver::ModelSource;

pub const MODEL_CELL: &str = "model";
pub const MODEL_PROGRESS_CELL: &str = "model_progress";
pub const MODEL_ERROR_CELL: &str = "model_error";

pub type ModelBuilder<M> = Arc<dyn Fn(Option<PathBuf>) -> Result<M, BuildError> + Send + Sync>;

/// One selectable model. `source = None` for models that need no file.
pub struct ModelEntry<M> {
    pub name: String,
    pub source: Option<ModelSource>,
    pub build: ModelBuilder<M>,
}

impl<M> Clone for ModelEntry<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            source: self.source.clone(),
            build: self.build.clone(),
        }
    }
}

impl<M: 'static> ModelEntry<M> {
    pub fn builtin(name: &str, build: impl Fn() -> M + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            source: None,
            build: Arc::new(move |_: Option<PathBuf>| -> Result<M, BuildError> { Ok(build()) }),
        }
    }
}

/// A stage's selectable model and its load lifecycle.
///
/// Owns the `model` choice cell plus progress and error cells. Selecting a
/// model starts a background [`ModelLoader`]; the stage drains it every tick
/// through [`poll`](Self::poll). A load failure stays on the error cell until
/// another model is selected.
pub struct ModelSlot<M> {
    catalog: Vec<ModelEntry<M>>,
    cache_dir: PathBuf,
    loader: Option<ModelLoader<M>>,
    model: Option<M>,
    loaded_name: Option<String>,
}

impl<M: Send + 'static> ModelSlot<M> {
    pub fn new(catalog: Vec<ModelEntry<M>>, cache_dir: &Path) -> Self {
        Self {
            catalog,
            cache_dir: cache_dir.to_path_buf(),
            loader: None,
            model: None,
            loaded_name: None,
        }
    }

    /// Registers the cells and starts loading the first catalog entry.
    pub fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
        let names: Vec<String> = self.catalog.iter().map(|e| e.name.clone()).collect();
        let selected = (!names.is_empty()).then_some(0);
        for result in [
            sheet.add_choice(MODEL_CELL, names, selected),
            sheet.add_progress(MODEL_PROGRESS_CELL),
            sheet.add_error(MODEL_ERROR_CELL),
        ] {
            if let Err(e) = result {
                log::warn!("{e}");
            }
        }
        self.load_selected(sheet);
    }

    /// Returns `true` when `cell` was the model choice.
    pub fn on_cell_changed(&mut self, cell: &str, sheet: &mut ControlSheet) -> bool {
        if cell != MODEL_CELL {
            return false;
        }
        self.load_selected(sheet);
        true
    }

    fn load_selected(&mut self, sheet: &mut ControlSheet) {
        self.model = None;
        self.loaded_name = None;
        self.loader = None;
        let _ = sheet.set_error(MODEL_ERROR_CELL, None);

        let Some(name) = sheet.selected(MODEL_CELL).map(str::to_string) else {
            let _ = sheet.set_progress(MODEL_PROGRESS_CELL, 0, None);
            return;
        };
        let Some(entry) = self.catalog.iter().find(|e| e.name == name).cloned() else {
            let _ = sheet.set_error(MODEL_ERROR_CELL, Some(format!("unknown model {name}")));
            return;
        };

        let _ = sheet.set_progress(MODEL_PROGRESS_CELL, 0, Some(format!("loading {name}")));
        let build = entry.build.clone();
        self.loader = Some(ModelLoader::spawn(
            &entry.name,
            entry.source.clone(),
            self.cache_dir.clone(),
            move |path| build(path),
        ));
    }

    /// Drains loader events. Returns `true` when a model became ready.
    pub fn poll(&mut self, sheet: &mut ControlSheet) -> bool {
        let Some(loader) = &self.loader else {
            return false;
        };
        let name = loader.name().to_string();
        let mut ready = false;
        for event in loader.poll() {
            match event {
                ModelEvent::Downloading { downloaded, total } => {
                    let percent = if total > 0 {
                        (downloaded * 100 / total).min(100) as u8
                    } else {
                        0
                    };
                    let caption = format!("downloading {name}: {} KiB", downloaded / 1024);
                    let _ = sheet.set_progress(MODEL_PROGRESS_CELL, percent, Some(caption));
                }
                ModelEvent::Initialized(model) => {
                    self.model = Some(model);
                    self.loaded_name = Some(name.clone());
                    let _ = sheet.set_progress(MODEL_PROGRESS_CELL, 100, Some(format!("{name} ready")));
                    ready = true;
                }
                ModelEvent::Failed(message) => {
                    let _ = sheet.set_progress(MODEL_PROGRESS_CELL, 0, Some(format!("{name} failed")));
                    let _ = sheet.set_error(MODEL_ERROR_CELL, Some(message));
                }
            }
        }
        if ready || sheet.error(MODEL_ERROR_CELL).is_some() {
            self.loader = None;
        }
        ready
    }

    pub fn model_mut(&mut self) -> Option<&mut M> {
        self.model.as_mut()
    }

    /// Name of the loaded model, for cache fingerprints.
    pub fn loaded_name(&self) -> Option<&str> {
        self.loaded_name.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        self.loader.is_some()
    }
}
