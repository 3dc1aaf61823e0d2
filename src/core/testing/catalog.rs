//! Case catalog and selection
//!
//! The catalog is rebuilt from a [`TestRegistry`] on every load. The first
//! load selects every case; later loads keep whatever selection still
//! names an existing case.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::case::CaseMeta;
use super::suite::TestRegistry;

/// Full catalog plus the selected subset
#[derive(Debug, Clone)]
pub struct CaseCatalog {
    sets: Vec<(String, Vec<CaseMeta>)>,
    selected: BTreeMap<String, BTreeSet<String>>,
    first_load: bool,
}

impl Default for CaseCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl CaseCatalog {
    /// Empty catalog awaiting its first load
    pub fn new() -> Self {
        Self {
            sets: Vec::new(),
            selected: BTreeMap::new(),
            first_load: true,
        }
    }

    /// Rescan `registry`
    pub fn load(&mut self, registry: &TestRegistry) {
        self.sets = registry
            .iter()
            .map(|def| (def.name().to_string(), def.cases()))
            .collect();

        if self.first_load {
            self.selected = self
                .sets
                .iter()
                .map(|(set, cases)| (set.clone(), cases.iter().map(|c| c.no.clone()).collect()))
                .collect();
            self.first_load = false;
        } else {
            let sets = &self.sets;
            self.selected.retain(|set, nos| {
                match sets.iter().find(|(name, _)| name == set) {
                    Some((_, cases)) => nos.retain(|no| cases.iter().any(|c| &c.no == no)),
                    None => nos.clear(),
                }
                !nos.is_empty()
            });
        }
        tracing::debug!(
            sets = self.sets.len(),
            selected = self.selected_count(),
            "Case catalog loaded"
        );
    }

    /// Whether the next load selects everything
    pub fn is_first_load(&self) -> bool {
        self.first_load
    }

    /// Every set with its cases, in registration order
    pub fn sets(&self) -> &[(String, Vec<CaseMeta>)] {
        &self.sets
    }

    /// Cases of one set
    pub fn cases(&self, set: &str) -> Option<&[CaseMeta]> {
        self.sets
            .iter()
            .find(|(name, _)| name == set)
            .map(|(_, cases)| cases.as_slice())
    }

    fn exists(&self, set: &str, no: &str) -> bool {
        self.cases(set).is_some_and(|cases| cases.iter().any(|c| c.no == no))
    }

    /// Select a case; returns whether it exists
    pub fn select(&mut self, set: &str, no: &str) -> bool {
        if !self.exists(set, no) {
            return false;
        }
        self.selected
            .entry(set.to_string())
            .or_default()
            .insert(no.to_string());
        true
    }

    /// Select every case of a set; returns whether the set exists
    pub fn select_set(&mut self, set: &str) -> bool {
        let Some(cases) = self.cases(set) else {
            return false;
        };
        let nos: BTreeSet<String> = cases.iter().map(|c| c.no.clone()).collect();
        self.selected.insert(set.to_string(), nos);
        true
    }

    /// Deselect a case
    pub fn deselect(&mut self, set: &str, no: &str) {
        if let Some(nos) = self.selected.get_mut(set) {
            nos.remove(no);
            if nos.is_empty() {
                self.selected.remove(set);
            }
        }
    }

    /// Drop the whole selection
    pub fn clear_selection(&mut self) {
        self.selected.clear();
    }

    /// Replace the selection; unknown entries are ignored
    pub fn set_selection<I, S>(&mut self, selection: I)
    where
        I: IntoIterator<Item = (S, S)>,
        S: AsRef<str>,
    {
        self.selected.clear();
        for (set, no) in selection {
            self.select(set.as_ref(), no.as_ref());
        }
    }

    /// Whether a case is selected
    pub fn is_selected(&self, set: &str, no: &str) -> bool {
        self.selected.get(set).is_some_and(|nos| nos.contains(no))
    }

    /// Number of selected cases
    pub fn selected_count(&self) -> usize {
        self.selected.values().map(BTreeSet::len).sum()
    }

    /// Selected cases grouped by set, in registration and declaration order
    pub fn selection(&self) -> Vec<(String, Vec<CaseMeta>)> {
        self.sets
            .iter()
            .filter_map(|(set, cases)| {
                let nos = self.selected.get(set)?;
                let chosen: Vec<CaseMeta> = cases.iter().filter(|c| nos.contains(&c.no)).cloned().collect();
                (!chosen.is_empty()).then(|| (set.clone(), chosen))
            })
            .collect()
    }

    /// Store the duration of the last run of a case
    pub fn update_cost_time(&mut self, set: &str, no: &str, cost: Duration) {
        if let Some(meta) = self
            .sets
            .iter_mut()
            .filter(|(name, _)| name == set)
            .flat_map(|(_, cases)| cases.iter_mut())
            .find(|c| c.no == no)
        {
            meta.cost_time = Some(cost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::case::CaseSpec;
    use crate::core::testing::suite::{CaseContext, TestSet, TestSetDef};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl TestSet for Noop {
        async fn run(&mut self, _case_no: &str, _ctx: &mut CaseContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry(cases: &[(&str, &[&str])]) -> TestRegistry {
        let mut registry = TestRegistry::new();
        for (set, nos) in cases {
            let mut def = TestSetDef::new(set, |_| Box::new(Noop));
            for no in *nos {
                def = def.case(CaseSpec::new(no));
            }
            registry.add(def).unwrap();
        }
        registry
    }

    #[test]
    fn test_first_load_selects_all() {
        let mut catalog = CaseCatalog::new();
        catalog.load(&registry(&[("Adv", &["TC1", "TC2"]), ("Scan", &["TC3"])]));
        assert!(!catalog.is_first_load());
        assert_eq!(catalog.selected_count(), 3);
    }

    #[test]
    fn test_reload_preserves_selection() {
        let mut catalog = CaseCatalog::new();
        catalog.load(&registry(&[("Adv", &["TC1", "TC2", "TC3"])]));
        catalog.set_selection([("Adv", "TC1"), ("Adv", "TC3")]);

        catalog.load(&registry(&[("Adv", &["TC0", "TC1", "TC2", "TC3"])]));
        assert!(catalog.is_selected("Adv", "TC1"));
        assert!(catalog.is_selected("Adv", "TC3"));
        assert!(!catalog.is_selected("Adv", "TC0"));
        assert!(!catalog.is_selected("Adv", "TC2"));
    }

    #[test]
    fn test_reload_drops_vanished_cases() {
        let mut catalog = CaseCatalog::new();
        catalog.load(&registry(&[("Adv", &["TC1", "TC2"]), ("Scan", &["TC3"])]));
        catalog.load(&registry(&[("Adv", &["TC2"])]));
        let selection = catalog.selection();
        assert_eq!(selection.len(), 1);
        assert_eq!(selection[0].1.len(), 1);
        assert_eq!(selection[0].1[0].no, "TC2");
    }

    #[test]
    fn test_selection_follows_declaration_order() {
        let mut catalog = CaseCatalog::new();
        catalog.load(&registry(&[("B", &["z", "a"]), ("A", &["m"])]));
        catalog.clear_selection();
        assert!(catalog.select("A", "m"));
        assert!(catalog.select("B", "a"));
        assert!(catalog.select("B", "z"));
        assert!(!catalog.select("B", "missing"));

        let order: Vec<(String, Vec<String>)> = catalog
            .selection()
            .into_iter()
            .map(|(set, cases)| (set, cases.into_iter().map(|c| c.no).collect()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("B".to_string(), vec!["z".to_string(), "a".to_string()]),
                ("A".to_string(), vec!["m".to_string()]),
            ]
        );

        catalog.deselect("A", "m");
        assert_eq!(catalog.selection().len(), 1);
    }

    #[test]
    fn test_cost_time_update() {
        let mut catalog = CaseCatalog::new();
        catalog.load(&registry(&[("Adv", &["TC1"])]));
        catalog.update_cost_time("Adv", "TC1", Duration::from_millis(1500));
        assert_eq!(catalog.cases("Adv").unwrap()[0].cost_time, Some(Duration::from_millis(1500)));
    }
}
