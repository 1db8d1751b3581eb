//! Read-only projection of the machine's current hardware configuration,
//! compared against the configuration a connected printer reports.

use serde::{Deserialize, Serialize};

/// Material identity as exchanged with a printer. GUID is what matters for
/// comparison; the rest is display data.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialSummary {
    pub guid: Option<String>,
    pub material_type: Option<String>,
    pub color: Option<String>,
    pub brand: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtruderConfiguration {
    pub position: u8,
    pub material: MaterialSummary,
    /// Nozzle id; `None` when the printer reports no hotend mounted.
    pub nozzle: Option<String>,
}

/// Pure projection: recomputed on material/variant change, never mutated
/// directly. An empty build plate is represented as an empty string, which
/// is how network printers report it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterConfiguration {
    pub printer_type: String,
    pub extruders: Vec<ExtruderConfiguration>,
    pub buildplate: String,
}

impl ExtruderConfiguration {
    pub fn has_nozzle(&self) -> bool {
        self.nozzle.as_deref().is_some_and(|n| !n.is_empty())
    }

    pub fn has_material(&self) -> bool {
        self.material
            .guid
            .as_deref()
            .is_some_and(|g| !g.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_strings_count_as_absent() {
        let config = ExtruderConfiguration {
            position: 0,
            material: MaterialSummary {
                guid: Some(String::new()),
                ..Default::default()
            },
            nozzle: Some(String::new()),
        };
        assert!(!config.has_nozzle());
        assert!(!config.has_material());
    }

    #[test]
    fn test_configuration_equality_is_structural() {
        let a = PrinterConfiguration {
            printer_type: "Dual Tool".into(),
            extruders: vec![],
            buildplate: String::new(),
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
