//! User and application identity arithmetic

use serde::{Deserialize, Serialize};

pub type UserId = u32;
pub type AppId = u32;

/// Number of uids reserved for each user
pub const PER_USER_RANGE: u32 = 100_000;

/// Kernel uid of `app_id` running as `user_id`, or `None` past the uid space
pub fn multiuser_uid(user_id: UserId, app_id: AppId) -> Option<u32> {
    user_id
        .checked_mul(PER_USER_RANGE)?
        .checked_add(app_id % PER_USER_RANGE)
}

/// Whether every app uid of `user_id` fits in a kernel uid
pub fn is_valid_user_id(user_id: UserId) -> bool {
    multiuser_uid(user_id, PER_USER_RANGE - 1).is_some()
}

pub fn user_id_of(uid: u32) -> UserId {
    uid / PER_USER_RANGE
}

pub fn app_id_of(uid: u32) -> AppId {
    uid % PER_USER_RANGE
}

/// Storage visibility requested for the processes of one uid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemountMode {
    /// No external storage visible
    None,
    /// Resolve from the stored per-package permission state
    Default,
    Read,
    Write,
    Full,
}

impl RemountMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Default),
            2 => Some(Self::Read),
            3 => Some(Self::Write),
            4 => Some(Self::Full),
            _ => None,
        }
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::Write | Self::Full)
    }

    /// Name of the runtime view directory for the legacy layout
    pub fn runtime_view(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Default => Some("default"),
            Self::Read => Some("read"),
            Self::Write => Some("write"),
            Self::Full => Some("full"),
        }
    }
}
