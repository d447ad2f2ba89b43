pub mod client;
pub mod patch;
pub mod resources;
pub mod snapshot;
pub mod workload;
