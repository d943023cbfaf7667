//! Public types of the cache service.

use std::fmt;
use std::str::FromStr;

use crate::cache::GeneralResource;
use crate::error::CacheError;
use crate::keys::MAINLINE_ENTITY;

/// Service lifecycle state.
///
/// Use [`super::CacheService::state()`] to check the current state or
/// [`super::CacheService::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, reads work, nothing is being watched
    Created,
    /// Spawning reflectors
    Starting,
    /// Every reflector is running
    Running,
    /// Cancelling reflectors and background refreshes
    ShuttingDown,
    /// All background work has exited
    Stopped,
}

impl ServiceState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Entity type named in a read request.
///
/// Parsing maps `biz`, `set`, `module` and the general resources to their
/// caches; any other valid object id is taken as a custom mainline level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Biz,
    Set,
    Module,
    /// A custom mainline level by object id, e.g. `region`.
    Custom(String),
    General(GeneralResource),
}

impl EntityKind {
    /// Mainline object id, `None` for general resources other than hosts.
    #[must_use]
    pub fn object(&self) -> Option<&str> {
        match self {
            EntityKind::Biz => Some("biz"),
            EntityKind::Set => Some("set"),
            EntityKind::Module => Some("module"),
            EntityKind::Custom(object) => Some(object),
            EntityKind::General(GeneralResource::Host) => Some("host"),
            EntityKind::General(_) => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Biz => f.write_str("biz"),
            EntityKind::Set => f.write_str("set"),
            EntityKind::Module => f.write_str("module"),
            EntityKind::Custom(object) => f.write_str(object),
            EntityKind::General(resource) => write!(f, "{}", resource),
        }
    }
}

impl FromStr for EntityKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "biz" => Ok(EntityKind::Biz),
            "set" => Ok(EntityKind::Set),
            "module" => Ok(EntityKind::Module),
            _ => {
                if let Ok(resource) = s.parse::<GeneralResource>() {
                    return Ok(EntityKind::General(resource));
                }
                let valid = !s.is_empty()
                    && s != MAINLINE_ENTITY
                    && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
                if valid {
                    Ok(EntityKind::Custom(s.to_string()))
                } else {
                    Err(CacheError::InvalidInput(format!("invalid entity type '{}'", s)))
                }
            }
        }
    }
}
