//! The configuration resolver: owns the active machine slot, mediates every
//! write to quality/material/variant/extruder enablement, and re-derives the
//! dependent selections so the machine never settles in an inconsistent
//! state.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::builder::StackBuilder;
use crate::catalog::{MaterialNode, ProfileCatalog, QualityChangesGroup, QualityGroup, VariantNode};
use crate::preferences::{Preferences, ACTIVE_MACHINE_KEY};
use crate::registry::MachineRegistry;
use crate::settings::sentinels::{self, NOT_SUPPORTED_QUALITY_TYPE};
use crate::settings::{
    Container, ContainerType, ExtruderStack, GlobalStack, Position, SettingValue, SettingsView,
    SharedContainer, StackLayers,
};

use super::events::{ChangeSignal, EventBus, Notice, SettleTimer, SETTLED_SIGNALS};
use super::snapshot::{ExtruderConfiguration, MaterialSummary, PrinterConfiguration};

pub struct MachineManager {
    registry: MachineRegistry,
    catalog: Box<dyn ProfileCatalog>,
    builder: Box<dyn StackBuilder>,
    preferences: Preferences,
    events: EventBus,
    settle: SettleTimer,

    active_machine_id: Option<String>,
    active_extruder: Position,
    default_extruder: Position,

    current_quality_group: Option<QualityGroup>,
    current_quality_changes_group: Option<QualityChangesGroup>,
    current_root_material_ids: BTreeMap<Position, Option<String>>,
    current_configuration: PrinterConfiguration,

    /// Build-plate objects assigned to an extruder, so assignments can be
    /// corrected when extruders disappear. The embedder maintains entries.
    placed_objects: BTreeMap<String, Position>,

    notices: Vec<Notice>,
    faulty_machines: BTreeSet<String>,
    printer_connected: bool,
}

impl MachineManager {
    pub fn new(
        registry: MachineRegistry,
        catalog: Box<dyn ProfileCatalog>,
        builder: Box<dyn StackBuilder>,
        preferences: Preferences,
    ) -> Self {
        Self {
            registry,
            catalog,
            builder,
            preferences,
            events: EventBus::new(),
            settle: SettleTimer::default(),
            active_machine_id: None,
            active_extruder: Position::ZERO,
            default_extruder: Position::ZERO,
            current_quality_group: None,
            current_quality_changes_group: None,
            current_root_material_ids: BTreeMap::new(),
            current_configuration: PrinterConfiguration::default(),
            placed_objects: BTreeMap::new(),
            notices: Vec::new(),
            faulty_machines: BTreeSet::new(),
            printer_connected: false,
        }
    }

    pub fn subscribe(&mut self, subscriber: impl Fn(ChangeSignal) + 'static) {
        self.events.subscribe(subscriber);
    }

    /// Restore the machine saved in preferences, if that id still resolves.
    pub fn restore_active_machine(&mut self) {
        let saved = self
            .preferences
            .get(ACTIVE_MACHINE_KEY)
            .map(str::to_string);
        if let Some(id) = saved {
            if !id.is_empty() && self.registry.contains(&id) {
                self.set_active_machine(&id);
            }
        }
    }

    // --- accessors ---

    pub fn active_machine_id(&self) -> Option<&str> {
        self.active_machine_id.as_deref()
    }

    pub fn active_machine(&self) -> Option<&GlobalStack> {
        self.registry.machine(self.active_machine_id.as_deref()?)
    }

    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut MachineRegistry {
        &mut self.registry
    }

    pub fn is_faulty(&self, machine_id: &str) -> bool {
        self.faulty_machines.contains(machine_id)
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn push_notice(&mut self, title: &str, message: String) {
        self.notices.push(Notice {
            title: title.to_string(),
            message,
        });
    }

    // --- machine activation ---

    /// Activate the machine with the given id. Silent no-op when the id does
    /// not resolve; aborts (previous machine stays active) when the stack
    /// fails structural validation.
    pub fn set_active_machine(&mut self, machine_id: &str) {
        if !self.registry.contains(machine_id) {
            info!(machine = %machine_id, "cannot activate unknown machine");
            return;
        }

        if let Some(machine) = self.registry.machine_mut(machine_id) {
            Self::normalize_single_extruder(machine);
        }

        let valid = self
            .registry
            .machine(machine_id)
            .is_some_and(GlobalStack::is_valid);
        if !valid {
            warn!(machine = %machine_id, "machine stack failed validation, not activating");
            self.faulty_machines.insert(machine_id.to_string());
            return;
        }

        self.events.begin_batch();
        self.active_machine_id = Some(machine_id.to_string());
        self.preferences.set(ACTIVE_MACHINE_KEY, machine_id);

        // The global stack may only carry a build-plate variant, and never a
        // material: materials live on the extruder stacks.
        if let Some(machine) = self.registry.machine_mut(machine_id) {
            let variant_ok = {
                let variant = machine.layers.variant.borrow();
                variant.is_empty_sentinel()
                    || variant.metadata_str("hardware_type") == Some("buildplate")
            };
            if !variant_ok {
                machine.layers.variant = sentinels::empty_variant();
            }
            if !machine.layers.material.borrow().is_empty_sentinel() {
                machine.layers.material = sentinels::empty_material();
            }
        }

        self.init_machine_state();
        self.update_default_extruder();
        self.update_number_extruders_enabled();
        self.active_extruder = self.default_extruder;
        self.recompute_current_configuration();

        info!(machine = %machine_id, "machine activated");
        for signal in [
            ChangeSignal::GlobalStack,
            ChangeSignal::ActiveStack,
            ChangeSignal::ExtruderCountEnabled,
            ChangeSignal::QualityGroup,
            ChangeSignal::QualityChangesGroup,
            ChangeSignal::Variant,
            ChangeSignal::Material,
            ChangeSignal::RootMaterial,
            ChangeSignal::PrinterConnectedStatus,
        ] {
            self.events.emit(signal);
        }
        self.events.end_batch();
    }

    /// Single-extruder definitions sometimes arrive without an extruder
    /// train; give them one so position 0 always exists.
    fn normalize_single_extruder(machine: &mut GlobalStack) {
        if machine.extruder(Position::ZERO).is_some() {
            return;
        }
        if machine.extruder_positions().is_empty() {
            debug!(machine = %machine.id(), "synthesizing extruder 0 for single-extruder machine");
            let definition = Container::new(
                format!("{}_extruder_0_def", machine.id()),
                ContainerType::Definition,
            )
            .with_name("Extruder 1")
            .shared();
            let layers = StackLayers::around_definition(
                definition,
                sentinels::empty_definition_changes(),
                Container::new(format!("{}_e0_user", machine.id()), ContainerType::User).shared(),
            );
            machine.add_extruder(ExtruderStack::new(
                format!("{}_e0", machine.id()),
                Position::ZERO,
                layers,
            ));
        }
    }

    /// Re-derive a consistent state for a freshly activated machine:
    /// reconcile materials, then adopt the stored quality-changes by name,
    /// else the stored quality type, else preferred, else the first
    /// available group, else no quality.
    fn init_machine_state(&mut self) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };

        // Seed the root-material cache from the stacks before reconciling.
        let (positions, material_map) = {
            let Some(machine) = self.registry.machine(&machine_id) else {
                return;
            };
            let positions = machine.extruder_positions();
            let map: BTreeMap<Position, Option<String>> = machine
                .extruders()
                .map(|(p, e)| (p, e.material_base_file()))
                .collect();
            (positions, map)
        };
        self.current_root_material_ids = material_map;

        for position in positions {
            self.update_material_with_variant(Some(position));
        }

        let (stored_quality_type, stored_changes_name, changes_selected, machine_name) = {
            let Some(machine) = self.registry.machine(&machine_id) else {
                return;
            };
            let quality_type = machine.quality_type();
            let changes = machine.layers.quality_changes.borrow();
            (
                quality_type,
                changes.name().to_string(),
                !changes.is_empty_sentinel(),
                machine.name().to_string(),
            )
        };

        let quality_groups = {
            let Some(machine) = self.registry.machine(&machine_id) else {
                return;
            };
            self.catalog.quality_groups(machine)
        };

        let mut same_quality_found = false;
        if changes_selected {
            let changes_group = self
                .registry
                .machine(&machine_id)
                .and_then(|m| {
                    self.catalog
                        .quality_changes_groups(m)
                        .remove(&stored_changes_name)
                });
            if let Some(group) = changes_group {
                info!(machine = %machine_name, group = %group.name, "restoring quality changes");
                self.apply_quality_changes_group(group);
                same_quality_found = true;
            }
        } else if let Some(quality_type) = &stored_quality_type {
            if let Some(group) = quality_groups.get(quality_type) {
                info!(machine = %machine_name, quality_type = %quality_type, "restoring quality");
                self.apply_quality_group(Some(group.clone()), true);
                same_quality_found = true;
            }
        }

        if !same_quality_found {
            info!(
                machine = %machine_name,
                stored_quality_type = ?stored_quality_type,
                available = ?quality_groups.keys().collect::<Vec<_>>(),
                "stored quality not available, falling back"
            );
            let preferred = self
                .registry
                .machine(&machine_id)
                .and_then(GlobalStack::preferred_quality_type);
            let fallback = preferred
                .and_then(|p| quality_groups.get(&p).cloned())
                .or_else(|| quality_groups.values().next().cloned());
            self.apply_quality_group(fallback, true);
        }
    }

    /// Create a machine from a definition and activate it. Fails without
    /// touching state when the definition is unknown or the build fails.
    pub fn add_machine(&mut self, definition_id: &str, name: Option<&str>) -> Result<()> {
        info!(definition = %definition_id, "adding machine");
        let proposed = name
            .map(str::to_string)
            .or_else(|| self.builder.definition_name(definition_id))
            .unwrap_or_else(|| definition_id.to_string());
        let unique_name = self.registry.create_unique_name(&proposed, definition_id);

        let machine = self.builder.create_machine(&unique_name, definition_id)?;
        let machine_id = machine.id().to_string();
        self.registry.insert(machine);
        self.set_active_machine(&machine_id);
        Ok(())
    }

    /// Remove a machine and every hidden machine sharing its network group
    /// id. Removing the active machine first activates another one so there
    /// is never a window without an active machine (when one exists).
    pub fn remove_machine(&mut self, machine_id: &str) {
        info!(machine = %machine_id, "removing machine");
        let mut worklist = vec![machine_id.to_string()];
        let mut scheduled: BTreeSet<String> = worklist.iter().cloned().collect();

        while let Some(current) = worklist.pop() {
            if !self.registry.contains(&current) {
                continue;
            }

            if self.active_machine_id.as_deref() == Some(current.as_str()) {
                let replacement = self
                    .registry
                    .machine_ids()
                    .into_iter()
                    .find(|id| *id != current && !scheduled.contains(id));
                match replacement {
                    Some(other) => self.set_active_machine(&other),
                    None => {
                        self.active_machine_id = None;
                        self.current_quality_group = None;
                        self.current_quality_changes_group = None;
                        self.events.emit(ChangeSignal::GlobalStack);
                    }
                }
            }

            let group_id = self
                .registry
                .machine(&current)
                .and_then(|m| m.metadata_str("group_id").map(str::to_string));
            self.registry.remove(&current);

            // Hidden duplicates of a network printer share a group id; clean
            // them up iteratively rather than recursing.
            if let Some(group_id) = group_id {
                let members: Vec<String> = self
                    .registry
                    .find_by_metadata(&[("group_id", &group_id)])
                    .map(|m| m.id().to_string())
                    .collect();
                for member in members {
                    if scheduled.insert(member.clone()) {
                        worklist.push(member);
                    }
                }
            }
        }
    }

    pub fn rename_machine(&mut self, machine_id: &str, new_name: &str) {
        let fallback = match self.registry.machine(machine_id) {
            Some(machine) => machine.definition_name(),
            None => return,
        };
        let unique = self.registry.create_unique_name(new_name, &fallback);
        if let Some(machine) = self.registry.machine_mut(machine_id) {
            machine.set_name(unique);
        }
        self.events.emit(ChangeSignal::GlobalStack);
    }

    pub fn machines_in_group(&self, group_id: &str) -> Vec<String> {
        self.registry
            .find_by_metadata(&[("group_id", group_id)])
            .map(|m| m.id().to_string())
            .collect()
    }

    // --- quality state machine ---

    /// Set quality and quality-changes to the empty sentinels on every stack
    /// of the active machine: the explicit "not supported" state.
    fn apply_empty_quality(&mut self) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        self.current_quality_group = None;
        self.current_quality_changes_group = None;
        if let Some(machine) = self.registry.machine_mut(&machine_id) {
            machine.layers.quality = sentinels::empty_quality();
            machine.layers.quality_changes = sentinels::empty_quality_changes();
            for (_, extruder) in machine.extruders_mut() {
                extruder.layers.quality = sentinels::empty_quality();
                extruder.layers.quality_changes = sentinels::empty_quality_changes();
            }
        }
        self.events.emit(ChangeSignal::QualityGroup);
        self.events.emit(ChangeSignal::QualityChangesGroup);
    }

    /// Apply a quality group to the global stack and every referenced
    /// position. `empty_quality_changes` additionally resets the
    /// quality-changes slots; pass `false` when re-validating after a
    /// material swap to preserve the user's customization.
    fn apply_quality_group(&mut self, group: Option<QualityGroup>, empty_quality_changes: bool) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        let Some(group) = group else {
            self.apply_empty_quality();
            return;
        };
        let Some(global_container) = group.global.clone() else {
            warn!(group = %group.name, "quality group has no global container, ignoring");
            return;
        };

        self.current_quality_group = Some(group.clone());
        if empty_quality_changes {
            self.current_quality_changes_group = None;
        }

        if let Some(machine) = self.registry.machine_mut(&machine_id) {
            machine.layers.quality = global_container;
            if empty_quality_changes {
                machine.layers.quality_changes = sentinels::empty_quality_changes();
            }
            for (position, container) in &group.extruders {
                if let Some(extruder) = machine.extruder_mut(*position) {
                    extruder.layers.quality = container.clone();
                    if empty_quality_changes {
                        extruder.layers.quality_changes = sentinels::empty_quality_changes();
                    }
                }
            }
        }

        self.events.emit(ChangeSignal::QualityGroup);
        self.events.emit(ChangeSignal::QualityChangesGroup);
    }

    fn apply_quality_changes_group(&mut self, mut group: QualityChangesGroup) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };

        // A custom profile may be based on "not supported"; in that case no
        // quality group is applied alongside it.
        let mut quality_group = None;
        if group.quality_type != NOT_SUPPORTED_QUALITY_TYPE {
            let found = self.registry.machine(&machine_id).and_then(|m| {
                self.catalog
                    .quality_groups(m)
                    .remove(&group.quality_type)
            });
            match found {
                Some(g) => quality_group = Some(g),
                None => {
                    // The base quality type no longer exists: downgrade the
                    // group's containers permanently so later lookups agree.
                    warn!(
                        group = %group.name,
                        quality_type = %group.quality_type,
                        "quality type gone, marking quality changes as not supported"
                    );
                    for container in group.global.iter().chain(group.extruders.values()) {
                        container
                            .borrow_mut()
                            .set_metadata_entry("quality_type", NOT_SUPPORTED_QUALITY_TYPE);
                    }
                    group.quality_type = NOT_SUPPORTED_QUALITY_TYPE.to_string();
                }
            }
        }

        if let Some(machine) = self.registry.machine_mut(&machine_id) {
            machine.layers.quality_changes = group
                .global
                .clone()
                .unwrap_or_else(sentinels::empty_quality_changes);
            machine.layers.quality = quality_group
                .as_ref()
                .and_then(|g| g.global.clone())
                .unwrap_or_else(sentinels::empty_quality);

            let positions = machine.extruder_positions();
            for position in positions {
                let changes_container = group
                    .extruders
                    .get(&position)
                    .cloned()
                    .unwrap_or_else(sentinels::empty_quality_changes);
                let quality_container = quality_group
                    .as_ref()
                    .and_then(|g| g.extruders.get(&position).cloned())
                    .unwrap_or_else(sentinels::empty_quality);
                if let Some(extruder) = machine.extruder_mut(position) {
                    extruder.layers.quality_changes = changes_container;
                    extruder.layers.quality = quality_container;
                }
            }
        }

        self.current_quality_group = quality_group;
        self.current_quality_changes_group = Some(group);
        self.events.emit(ChangeSignal::QualityGroup);
        self.events.emit(ChangeSignal::QualityChangesGroup);
    }

    pub fn set_quality_group(&mut self, group: Option<QualityGroup>) {
        self.events.begin_batch();
        self.apply_quality_group(group, true);
        self.events.end_batch();
    }

    pub fn set_quality_group_by_type(&mut self, quality_type: &str) {
        let group = {
            let Some(machine) = self.active_machine() else {
                return;
            };
            self.catalog.quality_groups(machine).remove(quality_type)
        };
        match group {
            Some(group) => self.set_quality_group(Some(group)),
            None => warn!(quality_type, "no quality group with this type"),
        }
    }

    pub fn set_quality_changes_group(&mut self, group: QualityChangesGroup) {
        self.events.begin_batch();
        self.apply_quality_changes_group(group);
        self.events.end_batch();
    }

    /// Re-apply the current quality group and discard every user override.
    pub fn reset_to_default_quality(&mut self) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        self.events.begin_batch();
        let current = self.current_quality_group.clone();
        self.apply_quality_group(current, true);
        if let Some(machine) = self.registry.machine(&machine_id) {
            machine.layers.user_changes.borrow_mut().clear_settings();
            for (_, extruder) in machine.extruders() {
                extruder.layers.user_changes.borrow_mut().clear_settings();
            }
        }
        self.events.end_batch();
    }

    /// Whether every enabled extruder's material is flagged compatible with
    /// its nozzle. Machines without swappable materials are always
    /// compatible.
    pub fn active_materials_compatible(&self) -> bool {
        let Some(machine) = self.active_machine() else {
            return true;
        };
        if !machine.has_materials() {
            return true;
        }
        for (_, extruder) in machine.active_extruders() {
            if !extruder
                .layers
                .material
                .borrow()
                .metadata_bool("compatible", false)
            {
                return false;
            }
        }
        true
    }

    /// Re-validate the quality selection after a material, variant or
    /// enablement change.
    fn update_quality_with_material(&mut self) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        debug!("re-validating quality after material/variant change");

        let current_quality_type = self
            .current_quality_group
            .as_ref()
            .map(|g| g.quality_type.clone());

        let (candidates, preferred) = {
            let Some(machine) = self.registry.machine(&machine_id) else {
                return;
            };
            (
                self.catalog.quality_groups(machine),
                machine.preferred_quality_type(),
            )
        };
        let available: BTreeSet<String> = candidates
            .iter()
            .filter(|(_, g)| g.is_available)
            .map(|(t, _)| t.clone())
            .collect();

        if !self.active_materials_compatible() {
            if current_quality_type.is_some() {
                info!("active materials incompatible, dropping to no quality");
                self.apply_empty_quality();
            }
            return;
        }

        if available.is_empty() {
            // Keep an active quality-changes selection: a custom profile may
            // legitimately be based on "not supported".
            if self.current_quality_changes_group.is_none() {
                info!("no quality types available, dropping to no quality");
                self.apply_empty_quality();
            }
            return;
        }

        if let Some(current) = &current_quality_type {
            if available.contains(current) {
                let group = candidates.get(current).cloned();
                self.apply_quality_group(group, false);
                return;
            }
        }

        let Some(chosen) = preferred
            .filter(|p| available.contains(p))
            .or_else(|| available.iter().next().cloned())
        else {
            return;
        };
        info!(
            from = ?current_quality_type,
            to = %chosen,
            "current quality type unavailable, switching"
        );
        let group = candidates.get(&chosen).cloned();
        self.apply_quality_group(group, true);
    }

    // --- material / variant reconciliation ---

    /// Assign a material container to one extruder, keeping the
    /// root-material cache coherent. Emits root-material-changed only when
    /// the cached family id actually changes.
    fn set_material_node(&mut self, position: Position, node: Option<&MaterialNode>) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        let root_id = node.and_then(MaterialNode::base_file);
        if let Some(machine) = self.registry.machine_mut(&machine_id) {
            let Some(extruder) = machine.extruder_mut(position) else {
                warn!(%position, "no extruder at position");
                return;
            };
            extruder.layers.material = node
                .map(|n| n.container.clone())
                .unwrap_or_else(sentinels::empty_material);
        }
        if self.current_root_material_ids.get(&position) != Some(&root_id) {
            self.current_root_material_ids.insert(position, root_id);
            self.events.emit(ChangeSignal::RootMaterial);
        }
        self.events.emit(ChangeSignal::Material);
        self.recompute_current_configuration();
    }

    fn set_variant_node(&mut self, position: Position, node: &VariantNode) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        if let Some(machine) = self.registry.machine_mut(&machine_id) {
            if let Some(extruder) = machine.extruder_mut(position) {
                extruder.layers.variant = node.container.clone();
            }
        }
        self.events.emit(ChangeSignal::Variant);
        self.recompute_current_configuration();
    }

    fn set_global_variant_node(&mut self, node: Option<&VariantNode>) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        if let Some(machine) = self.registry.machine_mut(&machine_id) {
            machine.layers.variant = node
                .map(|n| n.container.clone())
                .unwrap_or_else(sentinels::empty_variant);
        }
        self.events.emit(ChangeSignal::Variant);
        self.recompute_current_configuration();
    }

    /// Reconcile material selection with the mounted nozzle and build plate
    /// for one position, or for every position when `None`.
    ///
    /// Policy per position: no candidates → empty; current family still a
    /// candidate → switch to the candidate (the nozzle/diameter-specific
    /// variant of the same family); otherwise the machine's default
    /// material, or empty when there is none.
    pub fn update_material_with_variant(&mut self, position: Option<Position>) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };

        let plan: Vec<(Position, Option<MaterialNode>)> = {
            let Some(machine) = self.registry.machine(&machine_id) else {
                return;
            };
            let buildplate = machine.buildplate_name();
            let positions = match position {
                Some(p) => vec![p],
                None => machine.extruder_positions(),
            };

            positions
                .into_iter()
                .filter_map(|p| {
                    let extruder = machine.extruder(p)?;
                    let nozzle = extruder.variant_name();
                    let current_family = extruder.material_base_file();
                    let diameter = machine.material_diameter(p);

                    let mut candidates = self.catalog.available_materials(
                        machine,
                        nozzle.as_deref(),
                        buildplate.as_deref(),
                        diameter,
                    );
                    if candidates.is_empty() {
                        return Some((p, None));
                    }
                    if let Some(family) = &current_family {
                        if let Some(node) = candidates.remove(family) {
                            return Some((p, Some(node)));
                        }
                    }
                    let default = self.catalog.default_material(machine, p, nozzle.as_deref());
                    Some((p, default))
                })
                .collect()
        };

        for (p, node) in plan {
            self.set_material_node(p, node.as_ref());
        }
    }

    pub fn set_material(&mut self, position: Position, node: Option<MaterialNode>) {
        self.events.begin_batch();
        self.set_material_node(position, node.as_ref());
        self.update_quality_with_material();
        self.events.end_batch();
    }

    pub fn set_material_by_id(&mut self, position: Position, root_material_id: &str) {
        let node = {
            let Some(machine) = self.active_machine() else {
                return;
            };
            let nozzle = machine
                .extruder(position)
                .and_then(ExtruderStack::variant_name);
            self.catalog.material_node(
                &machine.definition_id(),
                nozzle.as_deref(),
                machine.buildplate_name().as_deref(),
                machine.material_diameter(position),
                root_material_id,
            )
        };
        self.set_material(position, node);
    }

    pub fn set_variant(&mut self, position: Position, node: &VariantNode) {
        self.events.begin_batch();
        self.set_variant_node(position, node);
        self.update_material_with_variant(Some(position));
        self.update_quality_with_material();
        self.events.end_batch();
    }

    pub fn set_variant_by_name(&mut self, position: Position, variant_name: &str) {
        let node = {
            let Some(machine) = self.active_machine() else {
                return;
            };
            self.catalog
                .variant_node(&machine.definition_id(), variant_name)
        };
        match node {
            Some(node) => self.set_variant(position, &node),
            None => warn!(variant_name, "no nozzle variant with this name"),
        }
    }

    pub fn set_global_variant(&mut self, node: Option<&VariantNode>) {
        self.events.begin_batch();
        self.set_global_variant_node(node);
        self.update_material_with_variant(None);
        self.update_quality_with_material();
        self.events.end_batch();
    }

    /// Reconcile the machine to an externally reported printer
    /// configuration. One batch scope; at most one notice.
    pub fn apply_remote_configuration(&mut self, configuration: &PrinterConfiguration) {
        if self.active_machine_id.is_none() {
            return;
        }
        self.events.begin_batch();

        let needs_type_switch = self
            .active_machine()
            .map(|m| m.definition_name() != configuration.printer_type)
            .unwrap_or(false);
        if needs_type_switch {
            self.switch_printer_type(&configuration.printer_type);
        }

        let Some(machine_id) = self.active_machine_id.clone() else {
            self.events.end_batch();
            return;
        };
        let extruder_stack_count = self
            .active_machine()
            .map(|m| m.extruder_positions().len())
            .unwrap_or(0);

        let mut to_disable: BTreeSet<Position> = configuration
            .extruders
            .iter()
            .filter(|e| !e.has_nozzle() || !e.has_material())
            .map(|e| Position(e.position))
            .collect();

        // Never disable everything: the lowest-numbered extruder stays.
        if to_disable.len() == extruder_stack_count {
            if let Some(keep) = to_disable.iter().next().copied() {
                to_disable.remove(&keep);
            }
        }

        let buildplate = if configuration.buildplate.is_empty() {
            None
        } else {
            Some(configuration.buildplate.clone())
        };

        let mut disabled_positions = BTreeSet::new();
        for extruder_configuration in &configuration.extruders {
            let position = Position(extruder_configuration.position);
            if to_disable.contains(&position) {
                if let Some(machine) = self.registry.machine_mut(&machine_id) {
                    if let Some(extruder) = machine.extruder_mut(position) {
                        extruder.set_enabled(false);
                        disabled_positions.insert(position);
                    }
                }
                continue;
            }

            let (variant_node, material_node) = {
                let Some(machine) = self.registry.machine(&machine_id) else {
                    continue;
                };
                let nozzle = extruder_configuration.nozzle.as_deref();
                let variant_node = nozzle
                    .and_then(|n| self.catalog.variant_node(&machine.definition_id(), n));
                let material_node = extruder_configuration
                    .material
                    .guid
                    .as_deref()
                    .filter(|g| !g.is_empty())
                    .and_then(|guid| {
                        self.catalog.material_node_by_guid(
                            machine,
                            position,
                            nozzle,
                            buildplate.as_deref(),
                            guid,
                        )
                    });
                (variant_node, material_node)
            };

            match variant_node {
                Some(node) => self.set_variant_node(position, &node),
                None => {
                    if let Some(machine) = self.registry.machine_mut(&machine_id) {
                        if let Some(extruder) = machine.extruder_mut(position) {
                            extruder.layers.variant = sentinels::empty_variant();
                        }
                    }
                }
            }
            self.set_material_node(position, material_node.as_ref());

            if let Some(machine) = self.registry.machine_mut(&machine_id) {
                if let Some(extruder) = machine.extruder_mut(position) {
                    extruder.set_enabled(true);
                }
            }
            self.update_material_with_variant(Some(position));
        }

        self.update_default_extruder();
        self.update_number_extruders_enabled();

        let buildplate_node = self.registry.machine(&machine_id).and_then(|machine| {
            buildplate
                .as_deref()
                .and_then(|name| self.catalog.buildplate_variant_node(&machine.definition_id(), name))
        });
        self.set_global_variant_node(buildplate_node.as_ref());

        self.update_quality_with_material();

        if !disabled_positions.is_empty() {
            let names: Vec<String> = self
                .registry
                .machine(&machine_id)
                .map(|machine| {
                    disabled_positions
                        .iter()
                        .filter_map(|p| machine.extruder(*p))
                        .map(ExtruderStack::definition_name)
                        .collect()
                })
                .unwrap_or_default();
            let message = format!(
                "{} is disabled because there is no material loaded. \
                 Please load a material or use custom configurations.",
                names.join(", ")
            );
            self.push_notice("Extruder(s) Disabled", message);
        }

        self.recompute_current_configuration();
        self.events.end_batch();
    }

    /// Switch to a machine instance of a different printer type, reusing a
    /// hidden instance with the same network group id when one exists.
    pub fn switch_printer_type(&mut self, printer_type_name: &str) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        let same_type = self
            .registry
            .machine(&machine_id)
            .map(|m| m.definition_name() == printer_type_name)
            .unwrap_or(true);
        if same_type {
            return;
        }

        info!(printer_type = %printer_type_name, "switching printer type");
        let Some(definition_id) = self.builder.definition_id_by_name(printer_type_name) else {
            warn!(printer_type = %printer_type_name, "no definition with this name");
            return;
        };
        let group_id = self
            .registry
            .machine(&machine_id)
            .and_then(|m| m.metadata_str("group_id").map(str::to_string));

        let existing = group_id.as_deref().and_then(|gid| {
            self.registry
                .find_by_metadata(&[("group_id", gid)])
                .find(|m| m.definition_id() == definition_id)
                .map(|m| m.id().to_string())
        });

        let new_id = match existing {
            Some(id) => {
                info!(machine = %id, "reusing machine in the same group");
                id
            }
            None => {
                let name = format!("{definition_id}_sync");
                let machine = match self.builder.create_machine(&name, &definition_id) {
                    Ok(mut machine) => {
                        if let Some(gid) = &group_id {
                            machine.set_metadata_entry("group_id", gid.clone());
                        }
                        machine
                    }
                    Err(e) => {
                        warn!("failed creating machine for printer type switch: {e:#}");
                        return;
                    }
                };
                let id = machine.id().to_string();
                self.registry.insert(machine);
                id
            }
        };

        if let Some(machine) = self.registry.machine_mut(&new_id) {
            machine.set_metadata_entry("hidden", false);
        }
        if let Some(machine) = self.registry.machine_mut(&machine_id) {
            machine.set_metadata_entry("hidden", true);
        }
        self.set_active_machine(&new_id);
    }

    // --- extruder count & enablement bookkeeping ---

    /// Settings in `container` whose value is an extruder index that no
    /// longer exists or is disabled.
    fn incompatible_settings_on_enabled_extruders(&self, container: &SharedContainer) -> Vec<String> {
        let Some(machine) = self.active_machine() else {
            return Vec::new();
        };
        let extruder_count = machine.extruder_count();
        let mut result = Vec::new();
        for key in container.borrow().setting_keys() {
            if !machine.is_extruder_index_setting(&key) {
                continue;
            }
            let old_value = match container.borrow().setting(&key).cloned() {
                Some(SettingValue::Literal(v)) => v,
                Some(SettingValue::Formula(f)) => f.evaluate(machine),
                None => continue,
            };
            let Some(index) = crate::settings::value::as_extruder_index(&old_value) else {
                continue;
            };
            if index < 0 {
                continue;
            }
            let position = Position(index.min(u8::MAX as i64) as u8);
            let usable = position.index() < extruder_count
                && machine
                    .extruder(position)
                    .is_some_and(ExtruderStack::is_enabled);
            if !usable {
                debug!(
                    setting = %key,
                    old_value = %index,
                    "extruder reference no longer valid, resetting"
                );
                result.push(key);
            }
        }
        result
    }

    /// Scrub settings referencing extruders that no longer exist or are
    /// disabled: user overrides are deleted; quality-changes overrides are
    /// shadowed by a corrective user override (quality-changes content is
    /// never mutated), surfaced in one notice.
    fn correct_extruder_settings(&mut self) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };

        let (user_changes, quality_changes) = {
            let Some(machine) = self.registry.machine(&machine_id) else {
                return;
            };
            (
                machine.layers.user_changes.clone(),
                machine.layers.quality_changes.clone(),
            )
        };

        for key in self.incompatible_settings_on_enabled_extruders(&user_changes) {
            user_changes.borrow_mut().remove_setting(&key);
        }

        let shadowed = self.incompatible_settings_on_enabled_extruders(&quality_changes);
        for key in &shadowed {
            user_changes.borrow_mut().set_setting(
                key.clone(),
                SettingValue::literal(self.default_extruder.index() as i64),
            );
        }
        if !shadowed.is_empty() {
            let message = format!(
                "Settings have been changed to match the current availability of extruders: [{}]",
                shadowed.join(", ")
            );
            self.push_notice("Settings updated", message);
        }
    }

    /// First enabled extruder position; emitted when it changes.
    fn update_default_extruder(&mut self) {
        let Some(machine) = self.active_machine() else {
            return;
        };
        let new_default = machine
            .extruders()
            .find(|(_, e)| e.is_enabled())
            .map(|(p, _)| p)
            .unwrap_or(Position::ZERO);
        if new_default != self.default_extruder {
            self.default_extruder = new_default;
            self.events.emit(ChangeSignal::DefaultExtruder);
        }
    }

    /// Recount enabled extruders within the machine extruder count, store
    /// the result in definition-changes, and notify on change.
    fn update_number_extruders_enabled(&mut self) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        let (enabled_count, definition_changes, previous) = {
            let Some(machine) = self.registry.machine(&machine_id) else {
                return;
            };
            let enabled = machine.active_extruders().count() as i64;
            let container = machine.layers.definition_changes.clone();
            let previous = match container.borrow().setting("extruders_enabled_count") {
                Some(SettingValue::Literal(v)) => v.as_i64(),
                _ => None,
            };
            (enabled, container, previous)
        };
        if previous != Some(enabled_count) {
            definition_changes
                .borrow_mut()
                .set_setting("extruders_enabled_count", SettingValue::literal(enabled_count));
            self.events.emit(ChangeSignal::ExtruderCountEnabled);
        }
    }

    pub fn number_extruders_enabled(&self) -> usize {
        let Some(machine) = self.active_machine() else {
            return 1;
        };
        machine
            .resolve("extruders_enabled_count")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or_else(|| machine.active_extruders().count())
    }

    pub fn default_extruder_position(&self) -> Position {
        self.default_extruder
    }

    pub fn active_extruder_position(&self) -> Position {
        self.active_extruder
    }

    pub fn set_active_extruder(&mut self, position: Position) {
        if self.active_extruder != position {
            self.active_extruder = position;
            self.events.emit(ChangeSignal::ActiveStack);
        }
    }

    /// Change the machine's extruder count. No-op (zero notifications) when
    /// the count is unchanged.
    pub fn set_active_machine_extruder_count(&mut self, extruder_count: usize) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        let previous = self
            .registry
            .machine(&machine_id)
            .map(GlobalStack::extruder_count)
            .unwrap_or(1);
        if extruder_count == previous {
            return;
        }

        self.events.begin_batch();
        if let Some(machine) = self.registry.machine(&machine_id) {
            machine.layers.definition_changes.borrow_mut().set_setting(
                "machine_extruder_count",
                SettingValue::literal(extruder_count as i64),
            );
        }

        self.update_default_extruder();
        self.update_number_extruders_enabled();
        self.correct_extruder_settings();
        self.reassign_placed_objects(extruder_count);
        self.set_active_extruder(Position::ZERO);
        self.migrate_global_per_extruder_overrides();
        self.recompute_current_configuration();

        self.events.emit(ChangeSignal::GlobalStack);
        self.events.end_batch();
    }

    /// Objects assigned to a removed extruder move to the highest remaining
    /// valid index.
    fn reassign_placed_objects(&mut self, extruder_count: usize) {
        let highest_valid = {
            let Some(machine) = self.active_machine() else {
                return;
            };
            machine
                .extruders_in_range()
                .map(|(p, _)| p)
                .max()
                .unwrap_or(Position::ZERO)
        };
        for (object, position) in self.placed_objects.iter_mut() {
            if position.index() >= extruder_count {
                debug!(object = %object, from = %position, to = %highest_valid, "reassigning object");
                *position = highest_valid;
            }
        }
    }

    /// Legacy project files carry per-extruder settings in the global user
    /// container; move them to the extruder they belong to.
    fn migrate_global_per_extruder_overrides(&mut self) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        let moves: Vec<(String, SettingValue, Position)> = {
            let Some(machine) = self.registry.machine(&machine_id) else {
                return;
            };
            let global_user = machine.layers.user_changes.borrow();
            global_user
                .setting_keys()
                .into_iter()
                .filter(|key| machine.is_settable_per_extruder(key))
                .filter_map(|key| {
                    let value = global_user.setting(&key)?.clone();
                    let target = machine.limit_to_extruder(&key).unwrap_or(Position::ZERO);
                    Some((key, value, target))
                })
                .collect()
        };

        let Some(machine) = self.registry.machine(&machine_id) else {
            return;
        };
        for (key, value, target) in moves {
            match machine.extruder(target) {
                Some(extruder) => {
                    extruder
                        .layers
                        .user_changes
                        .borrow_mut()
                        .set_setting(key.clone(), value);
                    machine.layers.user_changes.borrow_mut().remove_setting(&key);
                }
                None => warn!(%target, setting = %key, "no extruder for migrated setting"),
            }
        }
    }

    pub fn set_extruder_enabled(&mut self, position: Position, enabled: bool) {
        let Some(machine_id) = self.active_machine_id.clone() else {
            return;
        };
        let exists = self
            .registry
            .machine(&machine_id)
            .and_then(|m| m.extruder(position))
            .is_some();
        if !exists {
            warn!(%position, "cannot toggle unknown extruder");
            return;
        }

        self.events.begin_batch();
        if let Some(machine) = self.registry.machine_mut(&machine_id) {
            if let Some(extruder) = machine.extruder_mut(position) {
                extruder.set_enabled(enabled);
            }
        }

        self.update_default_extruder();
        self.update_number_extruders_enabled();
        self.correct_extruder_settings();

        if !enabled && self.active_extruder == position {
            self.set_active_extruder(self.default_extruder);
        }

        self.update_quality_with_material();
        self.recompute_current_configuration();

        self.events.emit(ChangeSignal::ExtruderCountEnabled);
        self.events.emit(ChangeSignal::QualityGroup);
        self.events.emit(ChangeSignal::Material);
        self.events.end_batch();
    }

    // --- placed object bookkeeping ---

    pub fn assign_object_to_extruder(&mut self, object_id: impl Into<String>, position: Position) {
        self.placed_objects.insert(object_id.into(), position);
    }

    pub fn object_assignment(&self, object_id: &str) -> Option<Position> {
        self.placed_objects.get(object_id).copied()
    }

    // --- user settings surface ---

    pub fn has_user_settings(&self) -> bool {
        self.num_user_settings() > 0
    }

    pub fn num_user_settings(&self) -> usize {
        let Some(machine) = self.active_machine() else {
            return 0;
        };
        let mut count = machine.layers.user_changes.borrow().num_settings();
        for (_, extruder) in machine.extruders_in_range() {
            count += extruder.layers.user_changes.borrow().num_settings();
        }
        count
    }

    /// Delete a user override everywhere it applies. A setting that is not
    /// per-extruder settable (or is pinned to one extruder) is linked across
    /// stacks and cleared from all of them; otherwise only the active
    /// extruder's override is cleared.
    pub fn clear_user_setting_all_stacks(&mut self, key: &str) {
        let Some(machine) = self.active_machine() else {
            return;
        };
        info!(setting = %key, "clearing user override");
        machine.layers.user_changes.borrow_mut().remove_setting(key);

        let linked =
            !machine.is_settable_per_extruder(key) || machine.limit_to_extruder(key).is_some();
        if linked {
            for (_, extruder) in machine.extruders_in_range() {
                extruder.layers.user_changes.borrow_mut().remove_setting(key);
            }
        } else if let Some(extruder) = machine.extruder(self.active_extruder) {
            extruder.layers.user_changes.borrow_mut().remove_setting(key);
        }
    }

    /// Copy the active extruder's value of `key` onto every other extruder
    /// as a user override.
    pub fn copy_value_to_extruders(&mut self, key: &str) {
        let Some(machine) = self.active_machine() else {
            return;
        };
        let Some(value) = machine.extruder_property(self.active_extruder, key) else {
            return;
        };
        for (position, extruder) in machine.extruders_in_range() {
            if position == self.active_extruder {
                continue;
            }
            if machine.extruder_property(position, key).as_ref() != Some(&value) {
                extruder
                    .layers
                    .user_changes
                    .borrow_mut()
                    .set_setting(key, SettingValue::literal(value.clone()));
            }
        }
    }

    pub fn copy_all_values_to_extruders(&mut self) {
        let keys = {
            let Some(machine) = self.active_machine() else {
                return;
            };
            match machine.extruder(self.active_extruder) {
                Some(extruder) => extruder.layers.user_changes.borrow().setting_keys(),
                None => return,
            }
        };
        for key in keys {
            self.copy_value_to_extruders(&key);
        }
    }

    pub fn set_setting_for_all_extruders(&mut self, key: &str, value: Value) {
        let Some(machine) = self.active_machine() else {
            return;
        };
        for (_, extruder) in machine.extruders_in_range() {
            extruder
                .layers
                .user_changes
                .borrow_mut()
                .set_setting(key, SettingValue::literal(value.clone()));
        }
    }

    pub fn reset_setting_for_all_extruders(&mut self, key: &str) {
        let Some(machine) = self.active_machine() else {
            return;
        };
        for (_, extruder) in machine.extruders_in_range() {
            extruder.layers.user_changes.borrow_mut().remove_setting(key);
        }
    }

    // --- quality queries ---

    pub fn active_quality_group(&self) -> Option<&QualityGroup> {
        self.current_quality_group.as_ref()
    }

    pub fn active_quality_changes_group(&self) -> Option<&QualityChangesGroup> {
        self.current_quality_changes_group.as_ref()
    }

    pub fn active_quality_type(&self) -> Option<&str> {
        self.current_quality_group
            .as_ref()
            .map(|g| g.quality_type.as_str())
    }

    pub fn is_active_quality_supported(&self) -> bool {
        self.current_quality_group
            .as_ref()
            .map(|g| g.is_available)
            .unwrap_or(false)
    }

    pub fn is_active_quality_experimental(&self) -> bool {
        self.current_quality_group
            .as_ref()
            .map(|g| g.is_experimental)
            .unwrap_or(false)
    }

    pub fn has_custom_quality(&self) -> bool {
        self.current_quality_changes_group.is_some()
    }

    pub fn active_quality_or_changes_name(&self) -> String {
        if let Some(changes) = &self.current_quality_changes_group {
            changes.name.clone()
        } else if let Some(group) = &self.current_quality_group {
            group.name.clone()
        } else {
            "Not Supported".to_string()
        }
    }

    /// Exactly one of quality / quality-changes / not-supported holds.
    pub fn has_not_supported_quality(&self) -> bool {
        self.current_quality_group.is_none() && self.current_quality_changes_group.is_none()
    }

    /// Whether every container in every stack of the machine is marked
    /// supported.
    pub fn is_current_setup_supported(&self) -> bool {
        let Some(machine) = self.active_machine() else {
            return false;
        };
        if !machine.layers.all_supported() {
            return false;
        }
        machine
            .extruders()
            .all(|(_, e)| e.layers.all_supported())
    }

    // --- material / variant queries ---

    pub fn current_root_material_ids(&self) -> &BTreeMap<Position, Option<String>> {
        &self.current_root_material_ids
    }

    pub fn all_active_material_ids(&self) -> BTreeMap<String, String> {
        let Some(machine) = self.active_machine() else {
            return BTreeMap::new();
        };
        machine
            .extruders_in_range()
            .map(|(_, e)| {
                (
                    e.id().to_string(),
                    e.layers.material.borrow().id().to_string(),
                )
            })
            .collect()
    }

    pub fn active_variant_names(&self) -> BTreeMap<Position, String> {
        let Some(machine) = self.active_machine() else {
            return BTreeMap::new();
        };
        machine
            .extruders_in_range()
            .filter_map(|(p, e)| Some((p, e.variant_name()?)))
            .collect()
    }

    /// The active build plate is compatible when every enabled extruder's
    /// material declares it compatible.
    pub fn variant_buildplate_compatible(&self) -> bool {
        let Some(machine) = self.active_machine() else {
            return true;
        };
        let Some(buildplate) = machine.buildplate_name() else {
            return true;
        };
        for (_, extruder) in machine.active_extruders() {
            let material = extruder.layers.material.borrow();
            if material.is_empty_sentinel() {
                continue;
            }
            if let Some(map) = material
                .metadata_entry("buildplate_compatible")
                .and_then(|v| v.as_object())
            {
                if !map.get(&buildplate).and_then(Value::as_bool).unwrap_or(false) {
                    return false;
                }
            }
        }
        true
    }

    /// The build plate is usable when it is not outright compatible with
    /// everything, yet every enabled material is either compatible with it
    /// or at least recommended on it.
    pub fn variant_buildplate_usable(&self) -> bool {
        let Some(machine) = self.active_machine() else {
            return true;
        };
        let Some(buildplate) = machine.buildplate_name() else {
            return true;
        };
        let mut result = !self.variant_buildplate_compatible();
        for (_, extruder) in machine.active_extruders() {
            let material = extruder.layers.material.borrow();
            if material.is_empty_sentinel() {
                continue;
            }
            let flag = |key: &str| {
                material
                    .metadata_entry(key)
                    .and_then(|v| v.as_object())
                    .map(|map| map.get(&buildplate).and_then(Value::as_bool).unwrap_or(false))
                    .unwrap_or(true)
            };
            result = result && (flag("buildplate_compatible") || flag("buildplate_recommended"));
        }
        result
    }

    // --- printer configuration snapshot ---

    pub fn current_configuration(&self) -> &PrinterConfiguration {
        &self.current_configuration
    }

    pub fn matches_configuration(&self, configuration: &PrinterConfiguration) -> bool {
        self.current_configuration == *configuration
    }

    pub fn printer_connected(&self) -> bool {
        self.printer_connected
    }

    pub fn set_printer_connected(&mut self, connected: bool) {
        if self.printer_connected != connected {
            self.printer_connected = connected;
            self.events.emit(ChangeSignal::PrinterConnectedStatus);
        }
    }

    /// Rebuild the read-only projection of the machine's hardware
    /// configuration from the current stacks.
    fn recompute_current_configuration(&mut self) {
        let configuration = {
            let Some(machine) = self.active_machine() else {
                return;
            };

            let extruders = machine
                .extruders()
                .map(|(position, extruder)| {
                    let material = extruder.layers.material.borrow();
                    let summary = if material.is_empty_sentinel() {
                        MaterialSummary::default()
                    } else {
                        MaterialSummary {
                            guid: material.metadata_str("GUID").map(str::to_string),
                            material_type: material.metadata_str("material").map(str::to_string),
                            color: material.metadata_str("color_name").map(str::to_string),
                            brand: material.metadata_str("brand").map(str::to_string),
                            name: Some(material.name().to_string()),
                        }
                    };
                    ExtruderConfiguration {
                        position: position.0,
                        material: summary,
                        nozzle: extruder.variant_name(),
                    }
                })
                .collect();

            let buildplate = if machine.layers.variant.borrow().is_empty_sentinel() {
                String::new()
            } else {
                machine
                    .resolve("machine_buildplate_type")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .or_else(|| machine.buildplate_name())
                    .unwrap_or_default()
            };

            PrinterConfiguration {
                printer_type: machine.definition_name(),
                extruders,
                buildplate,
            }
        };
        self.current_configuration = configuration;
        self.events.emit(ChangeSignal::CurrentConfiguration);
    }

    // --- settle timer over raw container mutations ---

    /// Record one raw container mutation; the settled-notification window
    /// restarts.
    pub fn note_container_mutation(&mut self, now: Instant) {
        self.settle.touch(now);
    }

    /// Drive the quiescence window. When a mutation burst has settled, the
    /// settled signal set fires once, in fixed order.
    pub fn poll_settled(&mut self, now: Instant) -> bool {
        if !self.settle.poll(now) {
            return false;
        }
        for signal in SETTLED_SIGNALS {
            self.events.emit(signal);
        }
        true
    }
}

/// Abbreviate a printer type name for display and id purposes: digits are
/// kept, long words contribute their first letter, short words are kept
/// whole, everything uppercased ASCII.
pub fn abbreviated_machine_name(machine_type_name: &str) -> String {
    let mut abbreviated = String::new();
    for word in machine_type_name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if word.chars().all(|c| c.is_ascii_digit()) {
            abbreviated.push_str(word);
            continue;
        }
        let stripped: String = word
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if stripped.len() > 3 {
            if let Some(first) = stripped.chars().next() {
                abbreviated.push(first);
            }
        } else {
            abbreviated.push_str(&stripped);
        }
    }
    abbreviated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DefinitionStackBuilder;
    use crate::catalog::memory::StaticCatalog;

    fn empty_manager(registry: MachineRegistry) -> MachineManager {
        MachineManager::new(
            registry,
            Box::new(StaticCatalog::new()),
            Box::new(DefinitionStackBuilder::new()),
            Preferences::in_memory(),
        )
    }

    #[test]
    fn test_abbreviated_machine_name() {
        assert_eq!(abbreviated_machine_name("Dual Tool 2"), "DT2");
        assert_eq!(abbreviated_machine_name("XL5"), "XL5");
        assert_eq!(abbreviated_machine_name("Mega-Printer One"), "MPONE");
    }

    #[test]
    fn test_unknown_machine_activation_is_a_no_op() {
        let mut manager = empty_manager(MachineRegistry::new());
        manager.set_active_machine("ghost");
        assert_eq!(manager.active_machine_id(), None);
        assert!(!manager.is_faulty("ghost"));
    }

    #[test]
    fn test_invalid_machine_is_marked_faulty_and_not_activated() {
        let mut registry = MachineRegistry::new();
        let layers = StackLayers::around_definition(
            Container::new("empty_definition", ContainerType::Definition).shared(),
            sentinels::empty_definition_changes(),
            Container::new("broken_user", ContainerType::User).shared(),
        );
        registry.insert(GlobalStack::new("broken", layers));

        let mut manager = empty_manager(registry);
        manager.set_active_machine("broken");
        assert_eq!(manager.active_machine_id(), None);
        assert!(manager.is_faulty("broken"));
    }
}
