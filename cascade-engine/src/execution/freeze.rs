// Freeze Registry
// Tracks groups and modules exempt from recomputation and reset

use std::collections::BTreeSet;

/// Set of frozen group/module ids
///
/// Frozen units are treated as satisfied by the scheduler, never started,
/// and left untouched by reset and by new iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreezeRegistry {
    frozen: BTreeSet<String>,
}

impl FreezeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the frozen flag, returning the new value
    pub fn toggle_frozen(&mut self, id: &str) -> bool {
        if self.frozen.remove(id) {
            false
        } else {
            self.frozen.insert(id.to_string());
            true
        }
    }

    pub fn set_frozen(&mut self, id: &str, frozen: bool) {
        if frozen {
            self.frozen.insert(id.to_string());
        } else {
            self.frozen.remove(id);
        }
    }

    pub fn is_frozen(&self, id: &str) -> bool {
        self.frozen.contains(id)
    }

    /// Frozen ids in sorted order
    pub fn frozen_ids(&self) -> Vec<String> {
        self.frozen.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frozen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frozen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_round_trip() {
        let mut registry = FreezeRegistry::new();

        assert!(registry.toggle_frozen("Econ"));
        assert!(registry.is_frozen("Econ"));
        assert!(!registry.toggle_frozen("Econ"));
        assert!(!registry.is_frozen("Econ"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_frozen_ids_sorted() {
        let mut registry = FreezeRegistry::new();
        registry.set_frozen("Risk", true);
        registry.set_frozen("Econ", true);
        registry.set_frozen("Fin", true);
        registry.set_frozen("Risk", false);

        assert_eq!(registry.frozen_ids(), vec!["Econ", "Fin"]);
        assert_eq!(registry.len(), 2);
    }
}
