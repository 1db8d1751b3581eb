use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Map, Value};

use super::value::SettingValue;

/// The layer a container occupies within a stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerType {
    Definition,
    DefinitionChanges,
    Variant,
    Material,
    Quality,
    QualityChanges,
    User,
}

/// One named override layer: an immutable-id, mutable-content key/value map
/// with a metadata side table.
///
/// Wraps raw `serde_json` values so arbitrary profile fields survive without
/// a typed struct per field; typed accessors cover the metadata the resolver
/// actively reads.
#[derive(Clone, Debug)]
pub struct Container {
    id: String,
    name: String,
    container_type: ContainerType,
    metadata: Map<String, Value>,
    settings: BTreeMap<String, SettingValue>,
}

/// Containers are shared between stacks, catalog nodes and the registry;
/// everything runs on one control thread, so `Rc<RefCell<..>>` is the
/// ownership model.
pub type SharedContainer = Rc<RefCell<Container>>;

impl Container {
    pub fn new(id: impl Into<String>, container_type: ContainerType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            container_type,
            metadata: Map::new(),
            settings: BTreeMap::new(),
        }
    }

    pub fn shared(self) -> SharedContainer {
        Rc::new(RefCell::new(self))
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

    pub fn container_type(&self) -> ContainerType {
        self.container_type
    }

    /// Sentinel containers carry the canonical `empty_` id prefix; they mean
    /// "no selection", which is distinct from a slot being absent.
    pub fn is_empty_sentinel(&self) -> bool {
        self.id.starts_with("empty_") || self.id == "empty"
    }

    // --- metadata ---

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn metadata_entry(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key)?.as_str()
    }

    /// Boolean metadata, treating missing as `default`. Accepts real bools
    /// and the "True"/"False" strings older profiles carry.
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

    // --- settings ---

    pub fn setting(&self, key: &str) -> Option<&SettingValue> {
        self.settings.get(key)
    }

    pub fn set_setting(&mut self, key: impl Into<String>, value: impl Into<SettingValue>) {
        self.settings.insert(key.into(), value.into());
    }

    pub fn remove_setting(&mut self, key: &str) -> bool {
        self.settings.remove(key).is_some()
    }

    pub fn clear_settings(&mut self) {
        self.settings.clear();
    }

    pub fn setting_keys(&self) -> Vec<String> {
        self.settings.keys().cloned().collect()
    }

    pub fn num_settings(&self) -> usize {
        self.settings.len()
    }

    pub fn has_setting(&self, key: &str) -> bool {
        self.settings.contains_key(key)
    }
}

/// Builder-style helpers used when assembling containers for definitions,
/// materials and variants.
impl Container {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

/// Identity comparison for shared containers: two slots hold "the same"
/// container when the ids match.
pub fn same_container(a: &SharedContainer, b: &SharedContainer) -> bool {
    Rc::ptr_eq(a, b) || a.borrow().id() == b.borrow().id()
}
