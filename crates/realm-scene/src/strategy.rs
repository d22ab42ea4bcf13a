//! Loading strategies and the handles they produce.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a room's world segment relates to everything else loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// No segment at all. Loads and unloads complete synchronously.
    None,
    /// One world for the whole process; loading unloads the previous one.
    Single,
    /// Each room loads its own instance next to the others.
    #[default]
    Additive,
}

impl LoadStrategy {
    /// Returns `true` if this strategy needs a segment name to load.
    pub fn needs_segment(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Single => write!(f, "single"),
            Self::Additive => write!(f, "additive"),
        }
    }
}

/// One loaded copy of a world segment, as handed out by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentInstance {
    pub id: u64,
    pub segment: String,
}

impl fmt::Display for SegmentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.segment, self.id)
    }
}

/// A room's reference to its loaded world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldBinding {
    /// Headless room, loaded under [`LoadStrategy::None`].
    Headless,
    Segment {
        instance: SegmentInstance,
        strategy: LoadStrategy,
    },
}

impl WorldBinding {
    pub fn segment_name(&self) -> Option<&str> {
        match self {
            Self::Headless => None,
            Self::Segment { instance, .. } => Some(&instance.segment),
        }
    }
}
