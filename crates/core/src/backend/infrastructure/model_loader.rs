use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;

use crate::shared::model_resolver::{self, ModelSource};

pub type BuildError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle events of a background model load.
pub enum ModelEvent<M> {
    Downloading { downloaded: u64, total: u64 },
    Initialized(M),
    Failed(String),
}

/// Resolves (and if needed downloads) a model file, then builds the model,
/// on a background thread. The owning worker drains events every tick.
///
/// Dropping the loader abandons the load: a download in flight still
/// finishes, but its result is discarded.
pub struct ModelLoader<M> {
    name: String,
    events: Receiver<ModelEvent<M>>,
    cancelled: Arc<AtomicBool>,
}

impl<M: Send + 'static> ModelLoader<M> {
    /// `source = None` means the model needs no file (built-in); `build`
    /// then receives `None`.
    pub fn spawn<F>(name: &str, source: Option<ModelSource>, cache_dir: PathBuf, build: F) -> Self
    where
        F: FnOnce(Option<PathBuf>) -> Result<M, BuildError> + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let model_name = name.to_string();

        thread::spawn(move || {
            let path = match source {
                Some(source) => {
                    let tx_progress = tx.clone();
                    let progress: model_resolver::ProgressFn = Box::new(move |downloaded, total| {
                        let _ = tx_progress.send(ModelEvent::Downloading { downloaded, total });
                    });
                    match model_resolver::resolve(&source, &cache_dir, Some(progress)) {
                        Ok(path) => Some(path),
                        Err(e) => {
                            log::error!("Model {model_name} could not be resolved: {e}");
                            let _ = tx.send(ModelEvent::Failed(e.to_string()));
                            return;
                        }
                    }
                }
                None => None,
            };
            if flag.load(Ordering::Relaxed) {
                return;
            }
            let event = match build(path) {
                Ok(model) => {
                    log::info!("Model {model_name} initialized");
                    ModelEvent::Initialized(model)
                }
                Err(e) => {
                    log::error!("Model {model_name} failed to initialize: {e}");
                    ModelEvent::Failed(e.to_string())
                }
            };
            let _ = tx.send(event);
        });

        Self {
            name: name.to_string(),
            events: rx,
            cancelled,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking drain of all events produced since the last poll.
    pub fn poll(&self) -> Vec<ModelEvent<M>> {
        self.events.try_iter().collect()
    }
}

impl<M> Drop for ModelLoader<M> {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}
