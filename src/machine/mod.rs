pub mod events;
pub mod manager;
pub mod snapshot;

pub use events::{ChangeSignal, EventBus, Notice, SettleTimer};
pub use manager::{abbreviated_machine_name, MachineManager};
pub use snapshot::{ExtruderConfiguration, MaterialSummary, PrinterConfiguration};
