use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display name used when the other participant cannot be resolved, e.g. a
/// deleted account. A missing profile never fails a conversation listing.
pub const UNKNOWN_USER: &str = "Unknown user";

/// A user as seen by the messaging core: an opaque, stable id plus a display
/// name. Profiles are fed in by the surrounding identity service and are
/// immutable from this core's perspective apart from wholesale replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub display_name: String,
}

impl Profile {
    pub fn new(id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }

    /// Sentinel profile for an unresolvable user.
    pub fn unknown(id: Uuid) -> Self {
        Self::new(id, UNKNOWN_USER)
    }
}
