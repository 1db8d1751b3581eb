pub mod container;
pub mod sentinels;
pub mod stack;
pub mod value;

pub use container::{Container, ContainerType, SharedContainer};
pub use stack::{ExtruderStack, GlobalStack, Position, StackLayers};
pub use value::{SettingValue, SettingsView};
