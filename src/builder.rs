//! Stack construction: turning a registered machine definition into a fresh
//! global stack with its extruder stacks, sentinel layers and empty change
//! containers.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::error::StackError;
use crate::settings::{
    Container, ContainerType, ExtruderStack, GlobalStack, Position, SharedContainer, StackLayers,
};

/// External collaborator contract for machine construction.
pub trait StackBuilder {
    /// Build a new machine stack. The id is derived from `name`; the caller
    /// is responsible for name uniqueness.
    fn create_machine(&self, name: &str, definition_id: &str) -> Result<GlobalStack>;

    /// Human name of a definition, used when `add_machine` is called without
    /// an explicit name.
    fn definition_name(&self, definition_id: &str) -> Option<String>;

    /// Reverse lookup by human name, used when a printer reports its type by
    /// name rather than id.
    fn definition_id_by_name(&self, name: &str) -> Option<String>;
}

/// Builder over an in-memory set of machine and extruder definitions.
#[derive(Default)]
pub struct DefinitionStackBuilder {
    definitions: BTreeMap<String, SharedContainer>,
    extruder_definitions: BTreeMap<String, SharedContainer>,
}

impl DefinitionStackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a machine definition. Recognized metadata:
    /// `machine_extruder_trains` (position → extruder definition id),
    /// `has_materials`, `preferred_quality_type`, `preferred_material`.
    pub fn add_definition(&mut self, definition: SharedContainer) {
        let id = definition.borrow().id().to_string();
        self.definitions.insert(id, definition);
    }

    pub fn add_extruder_definition(&mut self, definition: SharedContainer) {
        let id = definition.borrow().id().to_string();
        self.extruder_definitions.insert(id, definition);
    }

    fn machine_id_from_name(name: &str) -> String {
        let mut id: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        if id.is_empty() {
            id.push_str("machine");
        }
        id
    }

    fn extruder_train(&self, definition: &SharedContainer, position: Position) -> SharedContainer {
        let train_id = definition
            .borrow()
            .metadata_entry("machine_extruder_trains")
            .and_then(|v| v.as_object())
            .and_then(|trains| trains.get(&position.to_string()))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(train_id) = train_id {
            if let Some(train) = self.extruder_definitions.get(&train_id) {
                return train.clone();
            }
            debug!(%train_id, "extruder train definition not registered, using generic");
        }
        // Generic fallback train so single-extruder definitions without
        // explicit trains still produce a usable stack.
        Container::new(format!("generic_extruder_{position}"), ContainerType::Definition)
            .with_name(format!("Extruder {}", position.index() + 1))
            .shared()
    }

    fn declared_extruder_count(definition: &SharedContainer) -> usize {
        use crate::settings::SettingValue;
        match definition.borrow().setting("machine_extruder_count") {
            Some(SettingValue::Literal(v)) => v.as_u64().unwrap_or(1) as usize,
            _ => 1,
        }
    }
}

impl StackBuilder for DefinitionStackBuilder {
    fn create_machine(&self, name: &str, definition_id: &str) -> Result<GlobalStack> {
        let definition = self
            .definitions
            .get(definition_id)
            .ok_or_else(|| StackError::UnknownDefinition(definition_id.to_string()))
            .context("cannot create machine")?;

        let machine_id = Self::machine_id_from_name(name);
        let definition_changes = Container::new(
            format!("{machine_id}_settings"),
            ContainerType::DefinitionChanges,
        )
        .shared();
        let user_changes =
            Container::new(format!("{machine_id}_user"), ContainerType::User).shared();

        let layers =
            StackLayers::around_definition(definition.clone(), definition_changes, user_changes);
        let mut global = GlobalStack::new(machine_id.clone(), layers);
        global.set_name(name);

        // Carry the definition's selection hints onto the machine metadata
        // so they survive definition swaps.
        {
            let def = definition.borrow();
            for key in ["has_materials", "preferred_quality_type", "preferred_material"] {
                if let Some(value) = def.metadata_entry(key) {
                    global.set_metadata_entry(key, value.clone());
                }
            }
        }

        let extruder_count = Self::declared_extruder_count(definition);
        for index in 0..extruder_count {
            let position = Position(u8::try_from(index).map_err(|_| {
                StackError::Build(format!("extruder count {extruder_count} out of range"))
            })?);
            let train = self.extruder_train(definition, position);
            let extruder_definition_changes = Container::new(
                format!("{machine_id}_e{position}_settings"),
                ContainerType::DefinitionChanges,
            )
            .shared();
            let extruder_user = Container::new(
                format!("{machine_id}_e{position}_user"),
                ContainerType::User,
            )
            .shared();
            let extruder_layers =
                StackLayers::around_definition(train, extruder_definition_changes, extruder_user);
            global.add_extruder(ExtruderStack::new(
                format!("{machine_id}_e{position}"),
                position,
                extruder_layers,
            ));
        }

        if !global.is_valid() {
            return Err(StackError::InvalidStack(machine_id).into());
        }
        info!(machine = %global.id(), definition = definition_id, "created machine stack");
        Ok(global)
    }

    fn definition_name(&self, definition_id: &str) -> Option<String> {
        self.definitions
            .get(definition_id)
            .map(|d| d.borrow().name().to_string())
    }

    fn definition_id_by_name(&self, name: &str) -> Option<String> {
        self.definitions
            .values()
            .find(|d| d.borrow().name() == name)
            .map(|d| d.borrow().id().to_string())
    }
}
