//! Profile catalog contract: which quality, quality-changes, material and
//! variant options exist and are compatible with the current machine setup.
//!
//! The resolver consumes this through the [`ProfileCatalog`] trait; an
//! in-memory implementation lives in [`memory`].

pub mod memory;

use std::collections::BTreeMap;

use crate::settings::{GlobalStack, Position, SharedContainer};

/// A coherent quality selection across all extruders: one container for the
/// global stack plus one per position. Usable only if every referenced
/// container actually resolves.
#[derive(Clone, Debug)]
pub struct QualityGroup {
    pub name: String,
    pub quality_type: String,
    pub global: Option<SharedContainer>,
    pub extruders: BTreeMap<Position, SharedContainer>,
    pub is_available: bool,
    pub is_experimental: bool,
}

impl QualityGroup {
    /// A group with a dangling global reference cannot be applied.
    pub fn resolves(&self) -> bool {
        self.global.is_some()
    }
}

/// User-customized quality overrides, tagged with the quality type they were
/// derived from. `quality_type` may be `not_supported` when the base quality
/// no longer exists.
#[derive(Clone, Debug)]
pub struct QualityChangesGroup {
    pub name: String,
    pub quality_type: String,
    pub global: Option<SharedContainer>,
    pub extruders: BTreeMap<Position, SharedContainer>,
}

/// Catalog handle to one material container, with the metadata the resolver
/// reads during reconciliation.
#[derive(Clone, Debug)]
pub struct MaterialNode {
    pub container: SharedContainer,
}

impl MaterialNode {
    pub fn new(container: SharedContainer) -> Self {
        Self { container }
    }

    /// Base material family id ("base_file"), used to group variant-specific
    /// containers of one family.
    pub fn base_file(&self) -> Option<String> {
        let container = self.container.borrow();
        container
            .metadata_str("base_file")
            .map(str::to_string)
            .or_else(|| Some(container.id().to_string()))
    }

    pub fn guid(&self) -> Option<String> {
        self.container.borrow().metadata_str("GUID").map(str::to_string)
    }
}

/// Catalog handle to one variant (nozzle or build plate) container.
#[derive(Clone, Debug)]
pub struct VariantNode {
    pub container: SharedContainer,
}

impl VariantNode {
    pub fn new(container: SharedContainer) -> Self {
        Self { container }
    }

    pub fn name(&self) -> String {
        self.container.borrow().name().to_string()
    }
}

/// Lookup service answering which profile options exist and are compatible
/// with a machine definition, nozzle, material and build plate.
pub trait ProfileCatalog {
    /// Quality groups for this machine, keyed by quality type.
    fn quality_groups(&self, global: &GlobalStack) -> BTreeMap<String, QualityGroup>;

    /// Quality-changes groups for this machine, keyed by group name.
    fn quality_changes_groups(&self, global: &GlobalStack)
        -> BTreeMap<String, QualityChangesGroup>;

    /// Material candidates for one extruder, keyed by base material family
    /// id. Variant-specific containers shadow generic ones of the same
    /// family.
    fn available_materials(
        &self,
        global: &GlobalStack,
        nozzle: Option<&str>,
        buildplate: Option<&str>,
        diameter: f64,
    ) -> BTreeMap<String, MaterialNode>;

    /// The declared default material for a machine/position/nozzle, if any.
    fn default_material(
        &self,
        global: &GlobalStack,
        position: Position,
        nozzle: Option<&str>,
    ) -> Option<MaterialNode>;

    /// Material lookup by base family id under the given constraints.
    fn material_node(
        &self,
        definition_id: &str,
        nozzle: Option<&str>,
        buildplate: Option<&str>,
        diameter: f64,
        root_material_id: &str,
    ) -> Option<MaterialNode>;

    /// Material lookup by GUID, as reported by a connected printer.
    /// Diameter constraints are those of the extruder at `position`.
    fn material_node_by_guid(
        &self,
        global: &GlobalStack,
        position: Position,
        nozzle: Option<&str>,
        buildplate: Option<&str>,
        guid: &str,
    ) -> Option<MaterialNode>;

    /// Nozzle variant by exact name.
    fn variant_node(&self, definition_id: &str, name: &str) -> Option<VariantNode>;

    /// Build-plate variant by exact name.
    fn buildplate_variant_node(&self, definition_id: &str, name: &str) -> Option<VariantNode>;
}
