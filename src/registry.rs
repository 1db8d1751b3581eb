//! Machine stack registry: id and metadata lookup over all known machines.
//!
//! Stands in for the application's container database; the resolver owns one
//! and reaches every stack through it.

use std::collections::BTreeMap;

use tracing::debug;

use crate::settings::GlobalStack;

#[derive(Default)]
pub struct MachineRegistry {
    machines: BTreeMap<String, GlobalStack>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, machine: GlobalStack) {
        debug!(machine = %machine.id(), "registering machine stack");
        self.machines.insert(machine.id().to_string(), machine);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.machines.contains_key(id)
    }

    pub fn machine(&self, id: &str) -> Option<&GlobalStack> {
        self.machines.get(id)
    }

    pub fn machine_mut(&mut self, id: &str) -> Option<&mut GlobalStack> {
        self.machines.get_mut(id)
    }

    /// Removing a machine drops its extruder stacks and every user-override
    /// container they own.
    pub fn remove(&mut self, id: &str) -> Option<GlobalStack> {
        debug!(machine = %id, "removing machine stack");
        self.machines.remove(id)
    }

    pub fn machine_ids(&self) -> Vec<String> {
        self.machines.keys().cloned().collect()
    }

    pub fn machines(&self) -> impl Iterator<Item = &GlobalStack> {
        self.machines.values()
    }

    /// All machines whose metadata carries every given key/value pair.
    pub fn find_by_metadata<'a>(
        &'a self,
        filter: &'a [(&'a str, &'a str)],
    ) -> impl Iterator<Item = &'a GlobalStack> {
        self.machines.values().filter(move |machine| {
            filter
                .iter()
                .all(|(key, value)| machine.metadata_str(key) == Some(value))
        })
    }

    /// Produce a machine name not yet taken: trims the proposal, falls back
    /// when it is empty, then appends ` #2`, ` #3`, ... until unique.
    pub fn create_unique_name(&self, proposed: &str, fallback: &str) -> String {
        let base = proposed.trim();
        let base = if base.is_empty() { fallback.trim() } else { base };
        let taken: Vec<&str> = self.machines.values().map(|m| m.name()).collect();
        if !taken.contains(&base) {
            return base.to_string();
        }
        let mut counter = 2;
        loop {
            let candidate = format!("{base} #{counter}");
            if !taken.contains(&candidate.as_str()) {
                return candidate;
            }
            counter += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Container, ContainerType, StackLayers};
    use crate::settings::sentinels;

    fn machine(id: &str, name: &str) -> GlobalStack {
        let layers = StackLayers::around_definition(
            Container::new("printer", ContainerType::Definition).shared(),
            sentinels::empty_definition_changes(),
            Container::new(format!("{id}_user"), ContainerType::User).shared(),
        );
        let mut global = GlobalStack::new(id, layers);
        global.set_name(name);
        global
    }

    #[test]
    fn test_unique_name_numbering() {
        let mut registry = MachineRegistry::new();
        registry.insert(machine("m1", "My Printer"));
        registry.insert(machine("m2", "My Printer #2"));

        assert_eq!(
            registry.create_unique_name("My Printer", "Printer"),
            "My Printer #3"
        );
        assert_eq!(registry.create_unique_name("  ", "Printer"), "Printer");
        assert_eq!(registry.create_unique_name("Fresh", "Printer"), "Fresh");
    }

    #[test]
    fn test_metadata_filter() {
        let mut registry = MachineRegistry::new();
        let mut grouped = machine("m1", "A");
        grouped.set_metadata_entry("group_id", "g-7");
        registry.insert(grouped);
        registry.insert(machine("m2", "B"));

        let found: Vec<_> = registry
            .find_by_metadata(&[("group_id", "g-7")])
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(found, vec!["m1"]);
    }
}
