//! Machine configuration management for a slicer: layered settings stacks,
//! profile catalog lookup, and the resolver that keeps quality, material,
//! variant and extruder selections mutually consistent.
//!
//! The entry point is [`MachineManager`]: it owns the machine registry, the
//! active machine slot and the change-notification stream, and mediates
//! every profile selection write.

pub mod builder;
pub mod catalog;
mod error;
pub mod machine;
pub mod preferences;
pub mod registry;
pub mod settings;

pub use builder::{DefinitionStackBuilder, StackBuilder};
pub use catalog::{
    MaterialNode, ProfileCatalog, QualityChangesGroup, QualityGroup, VariantNode,
};
pub use error::StackError;
pub use machine::{ChangeSignal, MachineManager, Notice, PrinterConfiguration};
pub use preferences::Preferences;
pub use registry::MachineRegistry;
pub use settings::{
    Container, ContainerType, ExtruderStack, GlobalStack, Position, SettingValue, SettingsView,
    SharedContainer, StackLayers,
};

/// Initialize tracing output for binaries and examples; honors `RUST_LOG`.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
