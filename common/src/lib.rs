pub mod config;
pub mod control;
pub mod form;
pub mod page;
pub mod ringlog;
pub mod schedule;
pub mod signal;
pub mod store;
pub mod types;

pub use config::{ControlConfig, NetworkConfig, RuntimeConfig};
pub use control::{CellController, CellIo, ElectrodeDrive, ElectrodeLevels, IoError};
pub use form::{
    apply_config, execute_config_actions, read_form_body, BodyError, ConfigAction, ConfigOutcome, ConfigRequest, Notice,
    RecvError, MAX_FORM_BODY,
};
pub use page::{render_page, PageView};
pub use ringlog::{RingLog, SharedLog};
pub use schedule::{Schedule, ScheduleError, TimeOfDay};
pub use signal::{FlowSignal, UpgradeFlag};
pub use store::{KeyValueStore, MemoryStore, ScheduleStore, StoreError};
pub use types::{CellState, ControlState, Override, ProbeSample, StatusLine};
