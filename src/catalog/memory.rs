//! In-memory [`ProfileCatalog`] backed by registered containers.
//!
//! Embedders without a container database (and the test suite) register
//! material, variant and quality containers directly; compatibility is
//! derived from container metadata at lookup time.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::settings::{GlobalStack, Position, SharedContainer};

use super::{MaterialNode, ProfileCatalog, QualityChangesGroup, QualityGroup, VariantNode};

/// Definition id under which printer-agnostic profiles are registered.
pub const GENERIC_DEFINITION_ID: &str = "fdmprinter";

/// Tolerance when matching material diameters (1.75 vs 1.74 spools).
const DIAMETER_TOLERANCE: f64 = 0.4;

/// One registered quality profile, instantiated into a [`QualityGroup`] per
/// machine at lookup time.
#[derive(Clone, Debug)]
pub struct QualityEntry {
    pub definition_id: String,
    pub quality_type: String,
    pub name: String,
    pub is_experimental: bool,
    /// Material types (e.g. "PLA") this quality supports; `None` means all.
    pub material_types: Option<BTreeSet<String>>,
    pub global_container: SharedContainer,
    pub extruder_container: SharedContainer,
}

/// One registered quality-changes profile, owned by a specific machine.
#[derive(Clone, Debug)]
pub struct QualityChangesEntry {
    pub machine_id: String,
    pub name: String,
    pub global_container: SharedContainer,
    pub extruder_containers: BTreeMap<Position, SharedContainer>,
}

#[derive(Default)]
pub struct StaticCatalog {
    materials: Vec<SharedContainer>,
    variants: Vec<SharedContainer>,
    qualities: Vec<QualityEntry>,
    quality_changes: Vec<QualityChangesEntry>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a material container. Expected metadata: `base_file`, `GUID`,
    /// `material` (type), `diameter`, optional `variant_name` /
    /// `buildplate` for variant-specific containers, optional `definition`
    /// (defaults to the generic printer).
    pub fn add_material(&mut self, container: SharedContainer) {
        self.materials.push(container);
    }

    /// Register a nozzle or build-plate variant container. Expected
    /// metadata: `definition`, `hardware_type` (`nozzle` or `buildplate`).
    pub fn add_variant(&mut self, container: SharedContainer) {
        self.variants.push(container);
    }

    pub fn add_quality(&mut self, entry: QualityEntry) {
        self.qualities.push(entry);
    }

    pub fn add_quality_changes(&mut self, entry: QualityChangesEntry) {
        self.quality_changes.push(entry);
    }

    fn definition_matches(container_definition: Option<&str>, definition_id: &str) -> bool {
        match container_definition {
            None => true,
            Some(d) => d == definition_id || d == GENERIC_DEFINITION_ID,
        }
    }

    /// Specificity rank of a material container for candidate selection:
    /// nozzle-specific beats buildplate-specific beats machine-specific
    /// beats generic.
    fn material_specificity(container: &SharedContainer, definition_id: &str) -> u32 {
        let c = container.borrow();
        let mut rank = 0;
        if c.metadata_str("variant_name").is_some() {
            rank += 4;
        }
        if c.metadata_str("buildplate").is_some() {
            rank += 2;
        }
        if c.metadata_str("definition") == Some(definition_id) {
            rank += 1;
        }
        rank
    }

    fn material_matches(
        container: &SharedContainer,
        definition_id: &str,
        nozzle: Option<&str>,
        buildplate: Option<&str>,
        diameter: f64,
    ) -> bool {
        let c = container.borrow();
        if !Self::definition_matches(c.metadata_str("definition"), definition_id) {
            return false;
        }
        let material_diameter = c
            .metadata_entry("diameter")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.75);
        if (material_diameter - diameter).abs() > DIAMETER_TOLERANCE {
            return false;
        }
        // A variant-specific container only applies when that nozzle is
        // mounted; same for buildplate-specific containers.
        if let Some(required_nozzle) = c.metadata_str("variant_name") {
            if nozzle != Some(required_nozzle) {
                return false;
            }
        }
        if let Some(required_buildplate) = c.metadata_str("buildplate") {
            if buildplate != Some(required_buildplate) {
                return false;
            }
        }
        true
    }

    fn candidate_materials(
        &self,
        definition_id: &str,
        nozzle: Option<&str>,
        buildplate: Option<&str>,
        diameter: f64,
    ) -> BTreeMap<String, MaterialNode> {
        let mut result: BTreeMap<String, (u32, MaterialNode)> = BTreeMap::new();
        for container in &self.materials {
            if !Self::material_matches(container, definition_id, nozzle, buildplate, diameter) {
                continue;
            }
            let node = MaterialNode::new(container.clone());
            let Some(base_file) = node.base_file() else {
                continue;
            };
            let rank = Self::material_specificity(container, definition_id);
            match result.get(&base_file) {
                Some((existing_rank, _)) if *existing_rank >= rank => {}
                _ => {
                    result.insert(base_file, (rank, node));
                }
            }
        }
        result.into_iter().map(|(k, (_, node))| (k, node)).collect()
    }

    fn find_variant(&self, definition_id: &str, name: &str, hardware_type: &str) -> Option<VariantNode> {
        self.variants
            .iter()
            .find(|container| {
                let c = container.borrow();
                c.metadata_str("definition") == Some(definition_id)
                    && c.metadata_str("hardware_type") == Some(hardware_type)
                    && c.name() == name
            })
            .map(|container| VariantNode::new(container.clone()))
    }

    /// Availability of one quality entry against the machine's current
    /// active extruders: every enabled extruder must have a material whose
    /// type the quality supports.
    fn entry_available(entry: &QualityEntry, global: &GlobalStack) -> bool {
        if !global.has_materials() {
            return true;
        }
        for (_, extruder) in global.active_extruders() {
            let material = extruder.layers.material.borrow();
            if material.is_empty_sentinel() {
                return false;
            }
            if let Some(allowed) = &entry.material_types {
                let material_type = material.metadata_str("material").unwrap_or("");
                if !allowed.contains(material_type) {
                    return false;
                }
            }
        }
        true
    }
}

impl ProfileCatalog for StaticCatalog {
    fn quality_groups(&self, global: &GlobalStack) -> BTreeMap<String, QualityGroup> {
        let definition_id = global.definition_id();
        let mut groups = BTreeMap::new();
        for entry in &self.qualities {
            if entry.definition_id != definition_id
                && entry.definition_id != GENERIC_DEFINITION_ID
            {
                continue;
            }
            let mut extruders = BTreeMap::new();
            for (position, _) in global.extruders_in_range() {
                extruders.insert(position, entry.extruder_container.clone());
            }
            groups.insert(
                entry.quality_type.clone(),
                QualityGroup {
                    name: entry.name.clone(),
                    quality_type: entry.quality_type.clone(),
                    global: Some(entry.global_container.clone()),
                    extruders,
                    is_available: Self::entry_available(entry, global),
                    is_experimental: entry.is_experimental,
                },
            );
        }
        debug!(
            machine = %global.id(),
            groups = groups.len(),
            "computed quality groups"
        );
        groups
    }

    fn quality_changes_groups(
        &self,
        global: &GlobalStack,
    ) -> BTreeMap<String, QualityChangesGroup> {
        let mut groups = BTreeMap::new();
        for entry in &self.quality_changes {
            if entry.machine_id != global.id() {
                continue;
            }
            // The quality type is read from the container on every lookup so
            // a not_supported downgrade stays visible.
            let quality_type = entry
                .global_container
                .borrow()
                .metadata_str("quality_type")
                .unwrap_or("not_supported")
                .to_string();
            groups.insert(
                entry.name.clone(),
                QualityChangesGroup {
                    name: entry.name.clone(),
                    quality_type,
                    global: Some(entry.global_container.clone()),
                    extruders: entry.extruder_containers.clone(),
                },
            );
        }
        groups
    }

    fn available_materials(
        &self,
        global: &GlobalStack,
        nozzle: Option<&str>,
        buildplate: Option<&str>,
        diameter: f64,
    ) -> BTreeMap<String, MaterialNode> {
        self.candidate_materials(&global.definition_id(), nozzle, buildplate, diameter)
    }

    fn default_material(
        &self,
        global: &GlobalStack,
        position: Position,
        nozzle: Option<&str>,
    ) -> Option<MaterialNode> {
        let preferred = global
            .metadata_str("preferred_material")
            .map(str::to_string)
            .or_else(|| {
                global
                    .layers
                    .definition
                    .borrow()
                    .metadata_str("preferred_material")
                    .map(str::to_string)
            })?;
        self.material_node(
            &global.definition_id(),
            nozzle,
            global.buildplate_name().as_deref(),
            global.material_diameter(position),
            &preferred,
        )
    }

    fn material_node(
        &self,
        definition_id: &str,
        nozzle: Option<&str>,
        buildplate: Option<&str>,
        diameter: f64,
        root_material_id: &str,
    ) -> Option<MaterialNode> {
        self.candidate_materials(definition_id, nozzle, buildplate, diameter)
            .remove(root_material_id)
    }

    fn material_node_by_guid(
        &self,
        global: &GlobalStack,
        position: Position,
        nozzle: Option<&str>,
        buildplate: Option<&str>,
        guid: &str,
    ) -> Option<MaterialNode> {
        let candidates = self.candidate_materials(
            &global.definition_id(),
            nozzle,
            buildplate,
            global.material_diameter(position),
        );
        candidates
            .into_values()
            .find(|node| node.guid().as_deref() == Some(guid))
    }

    fn variant_node(&self, definition_id: &str, name: &str) -> Option<VariantNode> {
        self.find_variant(definition_id, name, "nozzle")
    }

    fn buildplate_variant_node(&self, definition_id: &str, name: &str) -> Option<VariantNode> {
        self.find_variant(definition_id, name, "buildplate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{
        Container, ContainerType, ExtruderStack, GlobalStack, SettingValue, StackLayers,
    };

    fn material(id: &str, base: &str, material_type: &str, variant: Option<&str>) -> SharedContainer {
        let mut container = Container::new(id, ContainerType::Material)
            .with_metadata("base_file", base)
            .with_metadata("material", material_type)
            .with_metadata("GUID", format!("guid-{base}"))
            .with_metadata("diameter", 1.75)
            .with_metadata("compatible", true);
        if let Some(v) = variant {
            container = container.with_metadata("variant_name", v);
        }
        container.shared()
    }

    #[test]
    fn test_variant_specific_material_shadows_generic() {
        let mut catalog = StaticCatalog::new();
        catalog.add_material(material("pla_generic", "pla", "PLA", None));
        catalog.add_material(material("pla_04", "pla", "PLA", Some("0.4mm Nozzle")));

        let with_nozzle =
            catalog.candidate_materials("fdmprinter", Some("0.4mm Nozzle"), None, 1.75);
        assert_eq!(with_nozzle["pla"].container.borrow().id(), "pla_04");

        let without_nozzle = catalog.candidate_materials("fdmprinter", None, None, 1.75);
        assert_eq!(without_nozzle["pla"].container.borrow().id(), "pla_generic");
    }

    fn mixed_diameter_machine() -> GlobalStack {
        let definition = Container::new("fdmprinter", ContainerType::Definition)
            .with_setting("machine_extruder_count", SettingValue::literal(2))
            .with_setting("material_diameter", SettingValue::literal(1.75))
            .shared();
        let mut global = GlobalStack::new(
            "mixed_rig",
            StackLayers::around_definition(
                definition,
                Container::new("mixed_rig_settings", ContainerType::DefinitionChanges).shared(),
                Container::new("mixed_rig_user", ContainerType::User).shared(),
            ),
        );
        for position in [Position(0), Position(1)] {
            let mut extruder_definition =
                Container::new(format!("fdmextruder_{position}"), ContainerType::Definition);
            if position == Position(1) {
                extruder_definition
                    .set_setting("material_diameter", SettingValue::literal(2.85));
            }
            global.add_extruder(ExtruderStack::new(
                format!("mixed_rig_e{position}"),
                position,
                StackLayers::around_definition(
                    extruder_definition.shared(),
                    Container::new(format!("mixed_rig_e{position}_settings"), ContainerType::DefinitionChanges)
                        .shared(),
                    Container::new(format!("mixed_rig_e{position}_user"), ContainerType::User)
                        .shared(),
                ),
            ));
        }
        global
    }

    #[test]
    fn test_guid_lookup_uses_the_queried_extruders_diameter() {
        let mut catalog = StaticCatalog::new();
        let fat = material("pla_285", "pla_285", "PLA", None);
        fat.borrow_mut().set_metadata_entry("diameter", 2.85);
        catalog.add_material(fat);
        catalog.add_material(material("pla_175", "pla_175", "PLA", None));

        let global = mixed_diameter_machine();

        let at_one = catalog.material_node_by_guid(&global, Position(1), None, None, "guid-pla_285");
        assert_eq!(at_one.unwrap().container.borrow().id(), "pla_285");
        assert!(catalog
            .material_node_by_guid(&global, Position::ZERO, None, None, "guid-pla_285")
            .is_none());
        let at_zero =
            catalog.material_node_by_guid(&global, Position::ZERO, None, None, "guid-pla_175");
        assert_eq!(at_zero.unwrap().container.borrow().id(), "pla_175");
    }

    #[test]
    fn test_diameter_filter_excludes_wrong_spools() {
        let mut catalog = StaticCatalog::new();
        let fat = material("abs_285", "abs", "ABS", None);
        fat.borrow_mut().set_metadata_entry("diameter", 2.85);
        catalog.add_material(fat);

        assert!(catalog
            .candidate_materials("fdmprinter", None, None, 1.75)
            .is_empty());
        assert_eq!(
            catalog
                .candidate_materials("fdmprinter", None, None, 2.85)
                .len(),
            1
        );
    }
}
