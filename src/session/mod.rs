//! Pipeline state machine, status publication and the session store.

pub mod stage;
pub mod state;
pub mod store;

use serde::{Deserialize, Serialize};

pub use stage::Stage;
pub use state::{channel, StateError, StatusHandle, StatusSnapshot, StatusWriter};
pub use store::{spawn_reaper, SessionEntry, SessionError, SessionStore, SharedResults};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a finished session stays readable.
    pub retention_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3_600,
            reap_interval_secs: 60,
        }
    }
}
