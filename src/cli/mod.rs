pub mod doctor_cmd;
pub mod output;
pub mod renderer;
pub mod snapshot_cmd;
pub mod watch_cmd;
