//! Canonical "no selection" containers.
//!
//! Every slot of a stack always holds a container; when nothing is selected
//! the slot holds one of these sentinels. Callers compare against the ids
//! below rather than the container contents.

use super::container::{Container, ContainerType, SharedContainer};

pub const EMPTY_VARIANT_ID: &str = "empty_variant";
pub const EMPTY_MATERIAL_ID: &str = "empty_material";
pub const EMPTY_QUALITY_ID: &str = "empty_quality";
pub const EMPTY_QUALITY_CHANGES_ID: &str = "empty_quality_changes";
pub const EMPTY_DEFINITION_CHANGES_ID: &str = "empty_definition_changes";

/// Quality type carried by orphaned quality-changes groups and reported for
/// the no-quality state.
pub const NOT_SUPPORTED_QUALITY_TYPE: &str = "not_supported";

fn sentinel(id: &str, name: &str, container_type: ContainerType) -> SharedContainer {
    Container::new(id, container_type).with_name(name).shared()
}

pub fn empty_variant() -> SharedContainer {
    sentinel(EMPTY_VARIANT_ID, "Not Supported", ContainerType::Variant)
}

pub fn empty_material() -> SharedContainer {
    sentinel(EMPTY_MATERIAL_ID, "Not Supported", ContainerType::Material)
}

pub fn empty_quality() -> SharedContainer {
    let container = sentinel(EMPTY_QUALITY_ID, "Not Supported", ContainerType::Quality);
    container
        .borrow_mut()
        .set_metadata_entry("quality_type", NOT_SUPPORTED_QUALITY_TYPE);
    container
}

pub fn empty_quality_changes() -> SharedContainer {
    sentinel(
        EMPTY_QUALITY_CHANGES_ID,
        "Not Supported",
        ContainerType::QualityChanges,
    )
}

pub fn empty_definition_changes() -> SharedContainer {
    sentinel(
        EMPTY_DEFINITION_CHANGES_ID,
        "Not Supported",
        ContainerType::DefinitionChanges,
    )
}

pub fn is_empty_id(id: &str) -> bool {
    id.starts_with("empty_")
}
