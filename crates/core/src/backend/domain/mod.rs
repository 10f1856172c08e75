pub mod compute_data;
pub mod control_sheet;
pub mod stage_state;
pub mod stage_transform;
pub mod worker_state;
