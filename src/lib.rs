pub mod application;
pub mod config;
pub mod process_monitor;
pub mod supervisor;
pub mod utils;

pub use application::{ApplicationSource, ApplicationSpec, DesiredStatus, JsonApplicationStore};
pub use process_monitor::{Pid, Prober, SystemProber};
pub use supervisor::{Supervisor, SupervisorEvent, SupervisorSettings};
