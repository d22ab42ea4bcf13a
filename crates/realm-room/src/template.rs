//! Room blueprints: what to build when someone asks for a room.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use realm_scene::LoadStrategy;
use serde::{Deserialize, Serialize};

use crate::RoomError;

// ---------------------------------------------------------------------------
// RoomSpec
// ---------------------------------------------------------------------------

/// Everything needed to register a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSpec {
    pub name: String,
    /// World segment to load. Required unless `strategy` is `None`.
    pub segment: Option<String>,
    pub strategy: LoadStrategy,
    pub max_players: usize,
    /// Hidden from matchmaking and default listings.
    pub private: bool,
    /// Token joiners must present. Private rooms normally set one.
    pub access_token: Option<String>,
    pub custom_data: BTreeMap<String, String>,
    /// Tear the room down when its last connection leaves.
    pub destroy_when_empty: bool,
    /// Template category the room was built from, if any.
    pub category: Option<String>,
}

impl RoomSpec {
    /// A room backed by an additive world segment.
    pub fn new(name: impl Into<String>, segment: impl Into<String>, max_players: usize) -> Self {
        Self {
            name: name.into(),
            segment: Some(segment.into()),
            strategy: LoadStrategy::Additive,
            max_players,
            private: false,
            access_token: None,
            custom_data: BTreeMap::new(),
            destroy_when_empty: true,
            category: None,
        }
    }

    /// A room with no world segment (chat, lobby, text rooms).
    pub fn headless(name: impl Into<String>, max_players: usize) -> Self {
        Self {
            segment: None,
            strategy: LoadStrategy::None,
            ..Self::new(name, String::new(), max_players)
        }
    }

    pub fn with_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_data.insert(key.into(), value.into());
        self
    }

    /// Makes the room private and requires `token` to join.
    pub fn private_with_token(mut self, token: impl Into<String>) -> Self {
        self.private = true;
        self.access_token = Some(token.into());
        self
    }

    /// Keeps the room alive after its last connection leaves.
    pub fn persistent(mut self) -> Self {
        self.destroy_when_empty = false;
        self
    }

    /// Structural checks every spec must pass before validators run.
    pub fn check(&self) -> Result<(), RoomError> {
        if self.name.trim().is_empty() {
            return Err(RoomError::InvalidSpec("room name is empty".into()));
        }
        if self.max_players == 0 {
            return Err(RoomError::InvalidSpec("max_players must be at least 1".into()));
        }
        let has_segment = self.segment.as_deref().is_some_and(|s| !s.is_empty());
        if self.strategy.needs_segment() && !has_segment {
            return Err(RoomError::InvalidSpec(format!(
                "strategy {} needs a world segment",
                self.strategy
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RoomTemplate
// ---------------------------------------------------------------------------

/// Immutable blueprint: world segment, capacity bounds, category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomTemplate {
    pub category: String,
    pub segment: Option<String>,
    #[serde(default)]
    pub strategy: LoadStrategy,
    /// Smallest capacity a room built from this template may have.
    pub min_players: usize,
    /// Largest capacity, and the default when none is requested.
    pub max_players: usize,
    #[serde(default = "default_true")]
    pub destroy_when_empty: bool,
}

fn default_true() -> bool {
    true
}

impl RoomTemplate {
    pub fn new(
        category: impl Into<String>,
        segment: impl Into<String>,
        min_players: usize,
        max_players: usize,
    ) -> Self {
        Self {
            category: category.into(),
            segment: Some(segment.into()),
            strategy: LoadStrategy::Additive,
            min_players,
            max_players,
            destroy_when_empty: true,
        }
    }

    /// Builds a spec for a room called `name`.
    ///
    /// # Errors
    /// [`RoomError::AccessDenied`] if `capacity` is outside the template's
    /// bounds.
    pub fn instantiate(
        &self,
        name: impl Into<String>,
        capacity: Option<usize>,
    ) -> Result<RoomSpec, RoomError> {
        let max_players = capacity.unwrap_or(self.max_players);
        if !(self.min_players..=self.max_players).contains(&max_players) {
            return Err(RoomError::AccessDenied(format!(
                "capacity {max_players} outside {}..={} for template {:?}",
                self.min_players, self.max_players, self.category
            )));
        }
        Ok(RoomSpec {
            name: name.into(),
            segment: self.segment.clone(),
            strategy: self.strategy,
            max_players,
            private: false,
            access_token: None,
            custom_data: BTreeMap::new(),
            destroy_when_empty: self.destroy_when_empty,
            category: Some(self.category.clone()),
        })
    }
}

impl Default for RoomTemplate {
    fn default() -> Self {
        Self::new("match", "Arena", 1, 4)
    }
}

/// Published templates by category. Publishing is write-once.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, Arc<RoomTemplate>>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `template`. Returns `None` if the category is taken, in
    /// which case the existing template stays in place.
    pub fn publish(&mut self, template: RoomTemplate) -> Option<Arc<RoomTemplate>> {
        if self.templates.contains_key(&template.category) {
            tracing::warn!(category = %template.category, "template already published");
            return None;
        }
        let template = Arc::new(template);
        self.templates
            .insert(template.category.clone(), Arc::clone(&template));
        Some(template)
    }

    pub fn get(&self, category: &str) -> Result<Arc<RoomTemplate>, RoomError> {
        self.templates
            .get(category)
            .cloned()
            .ok_or_else(|| RoomError::UnknownTemplate(category.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_check_rejects_segment_strategy_without_segment() {
        let spec = RoomSpec::headless("Lobby", 8).with_strategy(LoadStrategy::Single);
        assert!(matches!(spec.check(), Err(RoomError::InvalidSpec(_))));
    }

    #[test]
    fn test_spec_check_accepts_headless() {
        assert_eq!(RoomSpec::headless("Lobby", 8).check(), Ok(()));
    }

    #[test]
    fn test_spec_check_rejects_zero_capacity_and_blank_name() {
        assert!(RoomSpec::new("Arena", "Map1", 0).check().is_err());
        assert!(RoomSpec::new("  ", "Map1", 4).check().is_err());
    }

    #[test]
    fn test_template_instantiate_defaults_to_max_capacity() {
        let template = RoomTemplate::new("duel", "Pit", 2, 2);
        let spec = template.instantiate("Duel 1", None).unwrap();
        assert_eq!(spec.max_players, 2);
        assert_eq!(spec.segment.as_deref(), Some("Pit"));
        assert_eq!(spec.category.as_deref(), Some("duel"));
    }

    #[test]
    fn test_template_instantiate_out_of_bounds_is_denied() {
        let template = RoomTemplate::new("squad", "Field", 2, 4);
        let err = template.instantiate("Squad", Some(6)).unwrap_err();
        assert!(matches!(err, RoomError::AccessDenied(reason) if reason.contains("2..=4")));
    }

    #[test]
    fn test_catalog_publish_is_write_once() {
        let mut catalog = TemplateCatalog::new();
        assert!(catalog.publish(RoomTemplate::new("duel", "Pit", 2, 2)).is_some());
        assert!(catalog.publish(RoomTemplate::new("duel", "Other", 1, 9)).is_none());
        assert_eq!(catalog.get("duel").unwrap().segment.as_deref(), Some("Pit"));
        assert_eq!(
            catalog.get("race").unwrap_err(),
            RoomError::UnknownTemplate("race".into())
        );
    }
}
