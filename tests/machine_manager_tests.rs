use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde_json::json;

use printstack::catalog::memory::{QualityEntry, StaticCatalog};
use printstack::{
    ChangeSignal, Container, ContainerType, DefinitionStackBuilder, MachineManager,
    MachineRegistry, Position, Preferences, QualityChangesGroup, SettingValue, SettingsView,
    SharedContainer, StackBuilder,
};

fn extruder_definition(id: &str, name: &str) -> SharedContainer {
    Container::new(id, ContainerType::Definition)
        .with_name(name)
        .with_setting("material_diameter", SettingValue::literal(1.75))
        .shared()
}

fn dualtool_definition(extruder_count: usize) -> SharedContainer {
    let mut trains = serde_json::Map::new();
    for position in 0..extruder_count {
        trains.insert(
            position.to_string(),
            json!(format!("dualtool_extruder_{position}")),
        );
    }
    Container::new("dualtool", ContainerType::Definition)
        .with_name("Dual Tool")
        .with_setting(
            "machine_extruder_count",
            SettingValue::literal(extruder_count as i64),
        )
        .with_setting("layer_height", SettingValue::literal(0.2))
        .with_metadata("has_materials", true)
        .with_metadata("preferred_quality_type", "normal")
        .with_metadata("preferred_material", "pla")
        .with_metadata("machine_extruder_trains", serde_json::Value::Object(trains))
        .with_metadata("extruder_index_settings", json!(["support_extruder_nr"]))
        .with_metadata("settable_per_extruder", json!(["infill_density"]))
        .shared()
}

fn fixture_builder(extruder_count: usize) -> DefinitionStackBuilder {
    let mut builder = DefinitionStackBuilder::new();
    for position in 0..extruder_count {
        builder.add_extruder_definition(extruder_definition(
            &format!("dualtool_extruder_{position}"),
            &format!("Extruder {}", position + 1),
        ));
    }
    builder.add_definition(dualtool_definition(extruder_count));
    builder.add_definition(
        Container::new("monotool", ContainerType::Definition)
            .with_name("Mono Tool")
            .with_setting("machine_extruder_count", SettingValue::literal(1))
            .shared(),
    );
    builder
}

fn material(id: &str, base: &str, material_type: &str) -> SharedContainer {
    Container::new(id, ContainerType::Material)
        .with_name(id.to_uppercase())
        .with_metadata("base_file", base)
        .with_metadata("material", material_type)
        .with_metadata("GUID", format!("guid-{base}"))
        .with_metadata("diameter", 1.75)
        .with_metadata("compatible", true)
        .shared()
}

fn quality_entry(quality_type: &str, material_types: Option<&[&str]>) -> QualityEntry {
    QualityEntry {
        definition_id: "dualtool".into(),
        quality_type: quality_type.into(),
        name: format!("{quality_type} profile"),
        is_experimental: false,
        material_types: material_types
            .map(|types| types.iter().map(|t| t.to_string()).collect()),
        global_container: Container::new(
            format!("{quality_type}_global"),
            ContainerType::Quality,
        )
        .with_metadata("quality_type", quality_type)
        .shared(),
        extruder_container: Container::new(
            format!("{quality_type}_extruder"),
            ContainerType::Quality,
        )
        .with_metadata("quality_type", quality_type)
        .shared(),
    }
}

fn fixture_catalog() -> StaticCatalog {
    let mut catalog = StaticCatalog::new();
    catalog.add_material(material("pla_generic", "pla", "PLA"));
    catalog.add_material(material("abs_generic", "abs", "ABS"));
    catalog.add_quality(quality_entry("normal", None));
    catalog.add_quality(quality_entry("draft", Some(&["PLA"])));
    catalog
}

fn fixture(extruder_count: usize) -> MachineManager {
    let mut manager = MachineManager::new(
        MachineRegistry::new(),
        Box::new(fixture_catalog()),
        Box::new(fixture_builder(extruder_count)),
        Preferences::in_memory(),
    );
    manager.add_machine("dualtool", Some("Rig")).unwrap();
    manager
}

fn record_signals(manager: &mut MachineManager) -> Rc<RefCell<Vec<ChangeSignal>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    manager.subscribe(move |signal| sink.borrow_mut().push(signal));
    log
}

#[test]
fn test_activation_selects_preferred_quality_and_default_material() {
    let manager = fixture(2);
    assert_eq!(manager.active_machine_id(), Some("rig"));
    assert_eq!(manager.active_quality_type(), Some("normal"));
    assert!(!manager.has_custom_quality());

    let roots = manager.current_root_material_ids();
    assert_eq!(roots[&Position(0)], Some("pla".to_string()));
    assert_eq!(roots[&Position(1)], Some("pla".to_string()));
}

#[test]
fn test_quality_group_selection_is_idempotent() {
    let mut manager = fixture(2);
    manager.set_quality_group_by_type("draft");
    let first = manager.active_quality_or_changes_name();

    manager.set_quality_group_by_type("draft");
    assert_eq!(manager.active_quality_type(), Some("draft"));
    assert_eq!(manager.active_quality_or_changes_name(), first);
    assert!(!manager.has_custom_quality());
}

#[test]
fn test_exactly_one_quality_state_holds() {
    let mut manager = fixture(2);

    manager.set_quality_group_by_type("draft");
    assert!(manager.active_quality_type().is_some());
    assert!(!manager.has_custom_quality());
    assert!(!manager.has_not_supported_quality());

    let changes_container = Container::new("my_changes", ContainerType::QualityChanges)
        .with_metadata("quality_type", "normal")
        .shared();
    manager.set_quality_changes_group(QualityChangesGroup {
        name: "My Profile".into(),
        quality_type: "normal".into(),
        global: Some(changes_container),
        extruders: BTreeMap::new(),
    });
    assert!(manager.has_custom_quality());
    assert!(!manager.has_not_supported_quality());
    // The base quality rides along with the custom profile.
    assert_eq!(manager.active_quality_type(), Some("normal"));
    assert_eq!(manager.active_quality_or_changes_name(), "My Profile");

    manager.set_quality_group(None);
    assert!(manager.has_not_supported_quality());
    assert!(manager.active_quality_type().is_none());
    assert!(!manager.has_custom_quality());
}

#[test]
fn test_orphaned_quality_changes_downgrade_permanently() {
    let mut manager = fixture(2);
    let changes_container = Container::new("orphan_changes", ContainerType::QualityChanges)
        .with_metadata("quality_type", "fine")
        .shared();

    manager.set_quality_changes_group(QualityChangesGroup {
        name: "Orphan".into(),
        quality_type: "fine".into(),
        global: Some(changes_container.clone()),
        extruders: BTreeMap::new(),
    });

    let active = manager.active_quality_changes_group().unwrap();
    assert_eq!(active.quality_type, "not_supported");
    // The downgrade is written into the container so later lookups agree.
    assert_eq!(
        changes_container.borrow().metadata_str("quality_type"),
        Some("not_supported")
    );
    assert!(manager.active_quality_type().is_none());
    assert!(manager.has_custom_quality());
}

#[test]
fn test_incompatible_material_switches_to_available_quality() {
    let mut manager = fixture(2);
    manager.set_quality_group_by_type("draft");
    assert_eq!(manager.active_quality_type(), Some("draft"));

    // ABS is not supported by the draft profile; the preferred type wins.
    manager.set_material_by_id(Position(1), "abs");
    assert_eq!(manager.active_quality_type(), Some("normal"));
    assert_eq!(
        manager.current_root_material_ids()[&Position(1)],
        Some("abs".to_string())
    );
}

#[test]
fn test_unavailable_preferred_type_falls_back_to_smallest_remaining() {
    // Preferred "normal" only takes PLA here; "draft" takes both.
    let mut catalog = StaticCatalog::new();
    catalog.add_material(material("pla_generic", "pla", "PLA"));
    catalog.add_material(material("abs_generic", "abs", "ABS"));
    catalog.add_quality(quality_entry("normal", Some(&["PLA"])));
    catalog.add_quality(quality_entry("draft", Some(&["PLA", "ABS"])));

    let mut manager = MachineManager::new(
        MachineRegistry::new(),
        Box::new(catalog),
        Box::new(fixture_builder(2)),
        Preferences::in_memory(),
    );
    manager.add_machine("dualtool", Some("Rig")).unwrap();
    assert_eq!(manager.active_quality_type(), Some("normal"));

    manager.set_material_by_id(Position(0), "abs");

    assert_eq!(manager.active_quality_type(), Some("draft"));
    assert!(!manager.has_not_supported_quality());
}

#[test]
fn test_material_reconciliation_is_idempotent() {
    let mut manager = fixture(2);
    let before = manager.current_root_material_ids().clone();

    let log = record_signals(&mut manager);
    manager.update_material_with_variant(None);

    assert_eq!(manager.current_root_material_ids(), &before);
    assert!(!log.borrow().contains(&ChangeSignal::RootMaterial));
}

#[test]
fn test_unchanged_extruder_count_emits_nothing() {
    let mut manager = fixture(2);
    let log = record_signals(&mut manager);

    manager.set_active_machine_extruder_count(2);
    assert!(log.borrow().is_empty());
}

#[test]
fn test_shrinking_extruder_count_scrubs_stale_user_overrides() {
    let mut manager = fixture(4);
    manager
        .active_machine()
        .unwrap()
        .layers
        .user_changes
        .borrow_mut()
        .set_setting("support_extruder_nr", SettingValue::literal(3));

    manager.set_active_machine_extruder_count(2);

    let machine = manager.active_machine().unwrap();
    assert!(!machine
        .layers
        .user_changes
        .borrow()
        .has_setting("support_extruder_nr"));
    assert_eq!(machine.extruder_count(), 2);
    // Stacks beyond the new count survive, they are just out of range.
    assert_eq!(machine.extruder_positions().len(), 4);
}

#[test]
fn test_quality_changes_overrides_are_shadowed_not_mutated() {
    let mut manager = fixture(4);
    manager
        .active_machine()
        .unwrap()
        .layers
        .quality_changes
        .borrow_mut()
        .set_setting("support_extruder_nr", SettingValue::literal(3));

    manager.set_active_machine_extruder_count(2);

    let machine = manager.active_machine().unwrap();
    // The profile content is untouched; a corrective user override wins.
    assert!(machine
        .layers
        .quality_changes
        .borrow()
        .has_setting("support_extruder_nr"));
    let corrected = machine
        .resolve("support_extruder_nr")
        .and_then(|v| v.as_i64());
    assert_eq!(corrected, Some(0));

    let notices = manager.take_notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].message.contains("support_extruder_nr"));
    assert!(manager.take_notices().is_empty());
}

#[test]
fn test_shrinking_extruder_count_reassigns_placed_objects() {
    let mut manager = fixture(4);
    manager.assign_object_to_extruder("benchy", Position(3));
    manager.assign_object_to_extruder("cube", Position(0));

    manager.set_active_machine_extruder_count(2);

    assert_eq!(manager.object_assignment("benchy"), Some(Position(1)));
    assert_eq!(manager.object_assignment("cube"), Some(Position(0)));
}

#[test]
fn test_per_extruder_overrides_migrate_off_the_global_stack() {
    let mut manager = fixture(4);
    manager
        .active_machine()
        .unwrap()
        .layers
        .user_changes
        .borrow_mut()
        .set_setting("infill_density", SettingValue::literal(40));

    manager.set_active_machine_extruder_count(2);

    let machine = manager.active_machine().unwrap();
    assert!(!machine
        .layers
        .user_changes
        .borrow()
        .has_setting("infill_density"));
    let migrated = machine
        .extruder(Position(0))
        .unwrap()
        .layers
        .user_changes
        .borrow()
        .setting("infill_density")
        .is_some();
    assert!(migrated);
}

#[test]
fn test_disabling_an_extruder_updates_counts_and_default() {
    let mut manager = fixture(2);
    assert_eq!(manager.number_extruders_enabled(), 2);

    manager.set_extruder_enabled(Position(0), false);
    assert_eq!(manager.number_extruders_enabled(), 1);
    assert_eq!(manager.default_extruder_position(), Position(1));
    assert_eq!(manager.active_extruder_position(), Position(1));

    manager.set_extruder_enabled(Position(0), true);
    assert_eq!(manager.number_extruders_enabled(), 2);
    assert_eq!(manager.default_extruder_position(), Position(0));
}

#[test]
fn test_remote_configuration_never_disables_every_extruder() {
    let mut manager = fixture(2);
    let mut configuration = printstack::PrinterConfiguration {
        printer_type: "Dual Tool".into(),
        extruders: vec![],
        buildplate: String::new(),
    };
    for position in 0..2u8 {
        configuration
            .extruders
            .push(printstack::machine::ExtruderConfiguration {
                position,
                material: Default::default(),
                nozzle: None,
            });
    }

    manager.apply_remote_configuration(&configuration);

    let machine = manager.active_machine().unwrap();
    assert!(machine.extruder(Position(0)).unwrap().is_enabled());
    assert!(!machine.extruder(Position(1)).unwrap().is_enabled());
    assert_eq!(manager.number_extruders_enabled(), 1);

    let notices = manager.take_notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].message.contains("no material loaded"));
}

#[test]
fn test_removing_active_machine_activates_another_first() {
    let mut manager = MachineManager::new(
        MachineRegistry::new(),
        Box::new(fixture_catalog()),
        Box::new(fixture_builder(2)),
        Preferences::in_memory(),
    );
    manager.add_machine("dualtool", Some("A")).unwrap();
    manager.add_machine("dualtool", Some("B")).unwrap();
    assert_eq!(manager.active_machine_id(), Some("b"));

    manager.remove_machine("b");
    assert_eq!(manager.active_machine_id(), Some("a"));
    assert!(!manager.registry().contains("b"));

    manager.remove_machine("a");
    assert_eq!(manager.active_machine_id(), None);
}

#[test]
fn test_rename_keeps_names_unique() {
    let mut manager = MachineManager::new(
        MachineRegistry::new(),
        Box::new(fixture_catalog()),
        Box::new(fixture_builder(2)),
        Preferences::in_memory(),
    );
    manager.add_machine("dualtool", Some("Left")).unwrap();
    manager.add_machine("dualtool", Some("Right")).unwrap();

    manager.rename_machine("right", "Left");
    assert_eq!(
        manager.registry().machine("right").unwrap().name(),
        "Left #2"
    );
}

#[test]
fn test_switching_printer_type_hides_the_old_machine() {
    let mut manager = fixture(2);
    manager.switch_printer_type("Mono Tool");

    let active = manager.active_machine().unwrap();
    assert_eq!(active.definition_name(), "Mono Tool");
    assert_eq!(
        manager
            .registry()
            .machine("rig")
            .unwrap()
            .metadata_bool("hidden", false),
        true
    );
}

#[test]
fn test_active_machine_is_restored_from_preferences() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prefs.json");

    {
        let mut manager = MachineManager::new(
            MachineRegistry::new(),
            Box::new(fixture_catalog()),
            Box::new(fixture_builder(2)),
            Preferences::load_from(&path),
        );
        manager.add_machine("dualtool", Some("Rig")).unwrap();
    }

    let mut registry = MachineRegistry::new();
    registry.insert(
        fixture_builder(2)
            .create_machine("Rig", "dualtool")
            .unwrap(),
    );
    let mut manager = MachineManager::new(
        registry,
        Box::new(fixture_catalog()),
        Box::new(fixture_builder(2)),
        Preferences::load_from(&path),
    );
    assert_eq!(manager.active_machine_id(), None);

    manager.restore_active_machine();
    assert_eq!(manager.active_machine_id(), Some("rig"));
    assert_eq!(manager.active_quality_type(), Some("normal"));
}

#[test]
fn test_linked_user_settings_clear_across_all_stacks() {
    let mut manager = fixture(2);
    manager.set_setting_for_all_extruders("infill_density", json!(30));
    manager
        .active_machine()
        .unwrap()
        .layers
        .user_changes
        .borrow_mut()
        .set_setting("support_extruder_nr", SettingValue::literal(1));
    assert!(manager.has_user_settings());

    // Not settable per extruder, so the override clears everywhere.
    manager.clear_user_setting_all_stacks("support_extruder_nr");
    assert!(!manager
        .active_machine()
        .unwrap()
        .layers
        .user_changes
        .borrow()
        .has_setting("support_extruder_nr"));

    // Settable per extruder: only the active extruder's override clears.
    manager.clear_user_setting_all_stacks("infill_density");
    let machine = manager.active_machine().unwrap();
    assert!(!machine
        .extruder(Position(0))
        .unwrap()
        .layers
        .user_changes
        .borrow()
        .has_setting("infill_density"));
    assert!(machine
        .extruder(Position(1))
        .unwrap()
        .layers
        .user_changes
        .borrow()
        .has_setting("infill_density"));
}

#[test]
fn test_reset_to_default_quality_discards_overrides() {
    let mut manager = fixture(2);
    manager.set_setting_for_all_extruders("infill_density", json!(30));
    manager
        .active_machine()
        .unwrap()
        .layers
        .user_changes
        .borrow_mut()
        .set_setting("layer_height", SettingValue::literal(0.3));
    assert!(manager.has_user_settings());

    manager.reset_to_default_quality();
    assert!(!manager.has_user_settings());
    assert_eq!(manager.active_quality_type(), Some("normal"));
}

#[test]
fn test_settled_burst_fires_once_after_quiescence() {
    let mut manager = fixture(2);
    let log = record_signals(&mut manager);

    let t0 = Instant::now();
    manager.note_container_mutation(t0);
    manager.note_container_mutation(t0 + Duration::from_millis(100));

    assert!(!manager.poll_settled(t0 + Duration::from_millis(200)));
    assert!(log.borrow().is_empty());

    assert!(manager.poll_settled(t0 + Duration::from_millis(400)));
    assert_eq!(
        *log.borrow(),
        vec![
            ChangeSignal::ExtruderCountEnabled,
            ChangeSignal::QualityGroup,
            ChangeSignal::Variant,
            ChangeSignal::Material,
            ChangeSignal::RootMaterial,
        ]
    );

    assert!(!manager.poll_settled(t0 + Duration::from_millis(500)));
}

#[test]
fn test_copy_value_to_extruders_overrides_the_others() {
    let mut manager = fixture(2);
    manager
        .active_machine()
        .unwrap()
        .extruder(Position(0))
        .unwrap()
        .layers
        .user_changes
        .borrow_mut()
        .set_setting("infill_density", SettingValue::literal(55));

    manager.copy_value_to_extruders("infill_density");

    let value = manager
        .active_machine()
        .unwrap()
        .extruder_property(Position(1), "infill_density")
        .and_then(|v| v.as_i64());
    assert_eq!(value, Some(55));
}
