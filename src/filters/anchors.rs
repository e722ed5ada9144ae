use serde::{Deserialize, Serialize};

use crate::config::{default_anchor_survey, AnchorConfig};
use crate::error::{NavError, NavResult};
use crate::types::Position3;

/// Maximum number of anchors a deployment can address
pub const MAX_ANCHORS: usize = 8;

/// Fixed 3D anchor positions indexed by anchor id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorRegistry {
    positions: [Option<[f64; 3]>; MAX_ANCHORS],
}

impl AnchorRegistry {
    /// Registry with no anchors set
    pub fn empty() -> Self {
        Self {
            positions: [None; MAX_ANCHORS],
        }
    }

    pub fn from_survey(survey: &[AnchorConfig]) -> NavResult<Self> {
        let mut registry = Self::empty();
        for anchor in survey {
            let [x, y, z] = anchor.position;
            registry.set(anchor.id, Position3::new(x, y, z))?;
        }
        Ok(registry)
    }

    pub fn set(&mut self, id: usize, position: Position3) -> NavResult<()> {
        Self::check_index(id)?;
        if position.iter().any(|v| !v.is_finite()) {
            return Err(NavError::Configuration(format!(
                "anchor {id} position must be finite"
            )));
        }
        self.positions[id] = Some([position.x, position.y, position.z]);
        Ok(())
    }

    pub fn get(&self, id: usize) -> NavResult<Position3> {
        Self::check_index(id)?;
        self.positions[id]
            .map(|[x, y, z]| Position3::new(x, y, z))
            .ok_or(NavError::AnchorNotFound(id))
    }

    pub fn is_set(&self, id: usize) -> bool {
        id < MAX_ANCHORS && self.positions[id].is_some()
    }

    /// Ids of all anchors with a known position, ascending
    pub fn ids(&self) -> Vec<usize> {
        (0..MAX_ANCHORS).filter(|&id| self.is_set(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.positions.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_index(id: usize) -> NavResult<()> {
        if id >= MAX_ANCHORS {
            return Err(NavError::Configuration(format!(
                "anchor index {id} outside [0, {MAX_ANCHORS})"
            )));
        }
        Ok(())
    }
}

impl Default for AnchorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for anchor in default_anchor_survey() {
            let [x, y, z] = anchor.position;
            registry.positions[anchor.id] = Some([x, y, z]);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_survey() {
        let registry = AnchorRegistry::default();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.ids(), vec![0, 1, 2, 3]);
        assert_eq!(registry.get(3).unwrap(), Position3::new(0.123, 1.673, 1.903));
    }

    #[test]
    fn test_out_of_range_set_is_rejected() {
        let mut registry = AnchorRegistry::default();
        let before = registry.clone();
        let err = registry.set(MAX_ANCHORS, Position3::new(1.0, 1.0, 1.0)).unwrap_err();
        assert!(matches!(err, NavError::Configuration(_)));
        assert_eq!(registry, before);
    }

    #[test]
    fn test_unset_anchor_not_found() {
        let registry = AnchorRegistry::default();
        assert!(matches!(registry.get(5), Err(NavError::AnchorNotFound(5))));
        assert!(matches!(registry.get(42), Err(NavError::Configuration(_))));
    }

    #[test]
    fn test_overwrite_anchor() {
        let mut registry = AnchorRegistry::empty();
        registry.set(6, Position3::new(1.0, 2.0, 3.0)).unwrap();
        registry.set(6, Position3::new(4.0, 5.0, 6.0)).unwrap();
        assert_eq!(registry.get(6).unwrap(), Position3::new(4.0, 5.0, 6.0));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_non_finite_position_rejected() {
        let mut registry = AnchorRegistry::empty();
        assert!(registry.set(0, Position3::new(f64::NAN, 0.0, 0.0)).is_err());
        assert!(registry.is_empty());
    }
}
