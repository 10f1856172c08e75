use std::fmt;

/// Lifecycle of a stage: `Initial -> Starting -> {Idle <-> Busy} -> Stopping -> Stopped`.
///
/// `Idle` and `Busy` are the two sub-states of "started".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageState {
    Initial,
    Starting,
    Idle,
    Busy,
    Stopping,
    Stopped,
}

impl StageState {
    pub fn is_started(self) -> bool {
        matches!(self, StageState::Idle | StageState::Busy)
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            StageState::Starting | StageState::Idle | StageState::Busy
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageState::Initial => "initial",
            StageState::Starting => "starting",
            StageState::Idle => "idle",
            StageState::Busy => "busy",
            StageState::Stopping => "stopping",
            StageState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}
