use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use tracing::warn;

use super::container::{ContainerType, SharedContainer};
use super::sentinels;
use super::value::{SettingValue, SettingsView};

/// Index of one extruder within a machine. Bounded, ordered numerically;
/// `Display`/`FromStr` keep compatibility with the stringified keys used by
/// project files and network printers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(pub u8);

impl Position {
    pub const ZERO: Position = Position(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Position {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Position)
    }
}

impl From<u8> for Position {
    fn from(value: u8) -> Self {
        Position(value)
    }
}

/// The seven named layers of a stack, top to bottom.
#[derive(Clone, Debug)]
pub struct StackLayers {
    pub user_changes: SharedContainer,
    pub quality_changes: SharedContainer,
    pub quality: SharedContainer,
    pub material: SharedContainer,
    pub variant: SharedContainer,
    pub definition_changes: SharedContainer,
    pub definition: SharedContainer,
}

impl StackLayers {
    /// Fresh layers around a definition: sentinels everywhere except the
    /// caller-supplied definition-changes and user-changes containers.
    pub fn around_definition(
        definition: SharedContainer,
        definition_changes: SharedContainer,
        user_changes: SharedContainer,
    ) -> Self {
        Self {
            user_changes,
            quality_changes: sentinels::empty_quality_changes(),
            quality: sentinels::empty_quality(),
            material: sentinels::empty_material(),
            variant: sentinels::empty_variant(),
            definition_changes,
            definition,
        }
    }

    fn ordered(&self) -> [&SharedContainer; 7] {
        [
            &self.user_changes,
            &self.quality_changes,
            &self.quality,
            &self.material,
            &self.variant,
            &self.definition_changes,
            &self.definition,
        ]
    }

    fn raw_setting(&self, key: &str) -> Option<SettingValue> {
        for layer in self.ordered() {
            if let Some(value) = layer.borrow().setting(key) {
                return Some(value.clone());
            }
        }
        None
    }

    /// True when every container in the stack is marked supported.
    pub fn all_supported(&self) -> bool {
        self.ordered()
            .iter()
            .all(|layer| layer.borrow().metadata_bool("supported", true))
    }
}

/// Per-extruder layered stack, subordinate to one global stack.
///
/// A disabled extruder, or one whose position is at or beyond
/// `machine_extruder_count`, is excluded from "active extruder" iteration but
/// never deleted.
#[derive(Clone, Debug)]
pub struct ExtruderStack {
    id: String,
    name: String,
    position: Position,
    enabled: bool,
    pub layers: StackLayers,
}

impl ExtruderStack {
    pub fn new(id: impl Into<String>, position: Position, layers: StackLayers) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            position,
            enabled: true,
            layers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Display name of the extruder hardware, from its definition container.
    pub fn definition_name(&self) -> String {
        self.layers.definition.borrow().name().to_string()
    }

    pub fn variant_name(&self) -> Option<String> {
        let variant = self.layers.variant.borrow();
        if variant.is_empty_sentinel() {
            return None;
        }
        Some(variant.name().to_string())
    }

    /// Base material family id of the active material, if one is selected.
    pub fn material_base_file(&self) -> Option<String> {
        let material = self.layers.material.borrow();
        if material.is_empty_sentinel() {
            return None;
        }
        material
            .metadata_str("base_file")
            .map(str::to_string)
            .or_else(|| Some(material.id().to_string()))
    }
}

/// One machine: global layers plus the position → extruder stack map.
#[derive(Clone, Debug)]
pub struct GlobalStack {
    id: String,
    name: String,
    metadata: Map<String, Value>,
    pub layers: StackLayers,
    extruders: BTreeMap<Position, ExtruderStack>,
}

impl GlobalStack {
    pub fn new(id: impl Into<String>, layers: StackLayers) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            metadata: Map::new(),
            layers,
            extruders: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn definition_id(&self) -> String {
        self.layers.definition.borrow().id().to_string()
    }

    pub fn definition_name(&self) -> String {
        self.layers.definition.borrow().name().to_string()
    }

    // --- machine metadata ---

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key)?.as_str()
    }

    pub fn metadata_bool(&self, key: &str, default: bool) -> bool {
        match self.metadata.get(key) {
            None => default,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
            Some(_) => default,
        }
    }

    pub fn set_metadata_entry(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Whether this machine selects materials at all. Machines without
    /// swappable materials skip material/quality compatibility checks.
    pub fn has_materials(&self) -> bool {
        self.metadata_bool("has_materials", false)
    }

    /// Preferred quality type, from machine metadata with a definition
    /// container fallback.
    pub fn preferred_quality_type(&self) -> Option<String> {
        if let Some(preferred) = self.metadata_str("preferred_quality_type") {
            return Some(preferred.to_string());
        }
        self.layers
            .definition
            .borrow()
            .metadata_str("preferred_quality_type")
            .map(str::to_string)
    }

    // --- extruders ---

    pub fn extruders(&self) -> impl Iterator<Item = (Position, &ExtruderStack)> {
        self.extruders.iter().map(|(p, e)| (*p, e))
    }

    pub fn extruders_mut(&mut self) -> impl Iterator<Item = (Position, &mut ExtruderStack)> {
        self.extruders.iter_mut().map(|(p, e)| (*p, e))
    }

    pub fn extruder(&self, position: Position) -> Option<&ExtruderStack> {
        self.extruders.get(&position)
    }

    pub fn extruder_mut(&mut self, position: Position) -> Option<&mut ExtruderStack> {
        self.extruders.get_mut(&position)
    }

    pub fn add_extruder(&mut self, extruder: ExtruderStack) {
        self.extruders.insert(extruder.position(), extruder);
    }

    pub fn extruder_positions(&self) -> Vec<Position> {
        self.extruders.keys().copied().collect()
    }

    /// Number of extruders the machine hardware exposes, from the resolved
    /// `machine_extruder_count` setting.
    pub fn extruder_count(&self) -> usize {
        self.resolve("machine_extruder_count")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(1)
    }

    /// Extruders that participate in printing: position within the machine
    /// extruder count and not disabled.
    pub fn active_extruders(&self) -> impl Iterator<Item = (Position, &ExtruderStack)> {
        let count = self.extruder_count();
        self.extruders
            .iter()
            .filter(move |(p, e)| p.index() < count && e.is_enabled())
            .map(|(p, e)| (*p, e))
    }

    /// Extruders within the machine extruder count, enabled or not.
    pub fn extruders_in_range(&self) -> impl Iterator<Item = (Position, &ExtruderStack)> {
        let count = self.extruder_count();
        self.extruders
            .iter()
            .filter(move |(p, _)| p.index() < count)
            .map(|(p, e)| (*p, e))
    }

    /// Resolve a key against an extruder's stack, falling back to the global
    /// layers for keys the extruder does not override.
    pub fn extruder_property(&self, position: Position, key: &str) -> Option<Value> {
        let extruder = self.extruders.get(&position)?;
        ExtruderView {
            extruder,
            global: self,
        }
        .resolve(key)
    }

    /// Material diameter the given extruder expects, used to filter material
    /// candidates. Falls back to 1.75 mm when the definition is silent.
    pub fn material_diameter(&self, position: Position) -> f64 {
        self.extruder_property(position, "material_diameter")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.75)
    }

    // --- setting traits (stored on the definition container) ---

    fn definition_key_list_contains(&self, list_key: &str, setting_key: &str) -> bool {
        let definition = self.layers.definition.borrow();
        definition
            .metadata_entry(list_key)
            .and_then(|v| v.as_array())
            .map(|keys| keys.iter().any(|k| k.as_str() == Some(setting_key)))
            .unwrap_or(false)
    }

    /// Whether a setting's value is an extruder index (`type = extruder` in
    /// the source definitions).
    pub fn is_extruder_index_setting(&self, key: &str) -> bool {
        self.definition_key_list_contains("extruder_index_settings", key)
    }

    pub fn is_settable_per_extruder(&self, key: &str) -> bool {
        self.definition_key_list_contains("settable_per_extruder", key)
    }

    /// The extruder a setting is pinned to, if the definition pins one.
    pub fn limit_to_extruder(&self, key: &str) -> Option<Position> {
        let definition = self.layers.definition.borrow();
        let pin = definition
            .metadata_entry("limit_to_extruder")?
            .as_object()?
            .get(key)?
            .as_i64()?;
        if pin < 0 {
            return None;
        }
        u8::try_from(pin).ok().map(Position)
    }

    // --- structural validation ---

    /// Structural validation run before a stack may become active: the
    /// definition must be real, extruder position 0 must exist, and every
    /// slot must hold a container of the expected type.
    pub fn is_valid(&self) -> bool {
        if self.layers.definition.borrow().is_empty_sentinel() {
            warn!(machine = %self.id, "stack has no definition container");
            return false;
        }
        if self.layers.definition.borrow().container_type() != ContainerType::Definition {
            warn!(machine = %self.id, "definition slot holds a non-definition container");
            return false;
        }
        if !self.extruders.contains_key(&Position::ZERO) {
            warn!(machine = %self.id, "stack has no extruder at position 0");
            return false;
        }
        true
    }

    /// Quality type currently applied on the global quality slot.
    pub fn quality_type(&self) -> Option<String> {
        let quality = self.layers.quality.borrow();
        quality.metadata_str("quality_type").map(str::to_string)
    }

    /// Name of the global build-plate variant, if one is selected.
    pub fn buildplate_name(&self) -> Option<String> {
        let variant = self.layers.variant.borrow();
        if variant.is_empty_sentinel() {
            return None;
        }
        Some(variant.name().to_string())
    }
}

impl SettingsView for GlobalStack {
    fn raw_setting(&self, key: &str) -> Option<SettingValue> {
        self.layers.raw_setting(key)
    }
}

/// Resolution view for one extruder: the extruder's own layers shadow the
/// global layers.
struct ExtruderView<'a> {
    extruder: &'a ExtruderStack,
    global: &'a GlobalStack,
}

impl SettingsView for ExtruderView<'_> {
    fn raw_setting(&self, key: &str) -> Option<SettingValue> {
        self.extruder
            .layers
            .raw_setting(key)
            .or_else(|| self.global.layers.raw_setting(key))
    }
}
