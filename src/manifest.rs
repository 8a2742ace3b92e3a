//! Component identity set
//!
//! The fixed universe of UI-facing components that take part in the
//! init/test/shutdown handshakes. It never changes while a simulation runs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::CategoryIds;

/// Side length of the fuel rod grid
pub const GRID_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Buttons,
    Indicators,
    Displays,
    Controls,
    ConditionLights,
    FuelRods,
    Auxiliary,
}

#[derive(Debug, Clone)]
pub struct ComponentManifest {
    categories: Vec<(Category, Vec<String>)>,
    all: Vec<String>,
    index: HashMap<String, Category>,
}

impl Default for ComponentManifest {
    fn default() -> Self {
        let grid = |prefix: &str| -> Vec<String> {
            (0..GRID_SIZE)
                .flat_map(|y| (0..GRID_SIZE).map(move |x| (x, y)))
                .map(|(x, y)| fuel_rod_id(prefix, x, y))
                .collect()
        };
        let strings = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let mut indicators = strings(&[
            "core_temp_gauge",
            "turbine_rpm_gauge",
            "pump_temp_meter",
            "pump_pres_meter",
            "target_temp_meter",
            "core_reactivity_meter",
        ]);
        indicators.extend(grid("control_rod_light"));

        Self::new(vec![
            (Category::Buttons, strings(&["master", "scram"])),
            (Category::Indicators, indicators),
            (
                Category::Displays,
                (1..=6).map(|n| format!("power_demand_{n}")).collect(),
            ),
            (Category::Controls, strings(&["pump_speed", "target_power"])),
            (
                Category::ConditionLights,
                strings(&[
                    "cond_power",
                    "cond_trans",
                    "cond_fault",
                    "cond_scram",
                    "cond_aux",
                    "sys_core",
                    "sys_cooling",
                    "sys_gen",
                    "sys_ctrl",
                    "sys_aux",
                ]),
            ),
            (Category::FuelRods, grid("fuel_rod_button")),
            (Category::Auxiliary, strings(&["alarm"])),
        ])
    }
}

impl ComponentManifest {
    /// Build a manifest. Ids repeated across categories keep their first category.
    pub fn new(categories: Vec<(Category, Vec<String>)>) -> Self {
        let mut all = Vec::new();
        let mut index = HashMap::new();
        for (category, ids) in &categories {
            for id in ids {
                if !index.contains_key(id) {
                    index.insert(id.clone(), *category);
                    all.push(id.clone());
                }
            }
        }
        Self {
            categories,
            all,
            index,
        }
    }

    pub fn from_config(entries: &[CategoryIds]) -> Self {
        Self::new(
            entries
                .iter()
                .map(|entry| (entry.category, entry.ids.clone()))
                .collect(),
        )
    }

    pub fn all_ids(&self) -> &[String] {
        &self.all
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn category_of(&self, id: &str) -> Option<Category> {
        self.index.get(id).copied()
    }

    pub fn ids_in(&self, category: Category) -> Vec<&str> {
        self.categories
            .iter()
            .filter(|(c, _)| *c == category)
            .flat_map(|(_, ids)| ids.iter().map(String::as_str))
            .collect()
    }
}

/// Component id of a grid-addressed element, e.g. `fuel_rod_button_2_3`.
pub fn fuel_rod_id(prefix: &str, x: usize, y: usize) -> String {
    format!("{prefix}_{x}_{y}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = ComponentManifest::default();
        assert_eq!(manifest.ids_in(Category::FuelRods).len(), GRID_SIZE * GRID_SIZE);
        assert_eq!(manifest.category_of("master"), Some(Category::Buttons));
        assert_eq!(
            manifest.category_of("fuel_rod_button_5_5"),
            Some(Category::FuelRods)
        );
        assert!(!manifest.contains("fuel_rod_button_6_6"));
        assert_eq!(manifest.len(), manifest.all_ids().len());
    }

    #[test]
    fn test_duplicate_ids_counted_once() {
        let manifest = ComponentManifest::new(vec![
            (Category::Buttons, vec!["a".into(), "b".into()]),
            (Category::Auxiliary, vec!["b".into(), "c".into()]),
        ]);
        assert_eq!(manifest.all_ids(), ["a", "b", "c"]);
        assert_eq!(manifest.category_of("b"), Some(Category::Buttons));
        assert_eq!(manifest.ids_in(Category::Auxiliary), ["b", "c"]);
    }
}
