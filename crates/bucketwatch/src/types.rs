//! Core identifiers, lifecycle states and prefix semantics.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a notification row.
    NotificationId
);
string_id!(
    /// Identifier of a listener row.
    ListenerId
);
string_id!(
    /// Identifier of a handler row.
    HandlerId
);

/// Lifecycle of a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationState {
    /// Backs a live entry in the bucket configuration.
    Active,
    /// Superseded by a broader notification.
    Consolidated,
    /// No longer needed; replaced by zero or more narrower notifications.
    Deactivated,
}

impl fmt::Display for NotificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationState::Active => "ACTIVE",
            NotificationState::Consolidated => "CONSOLIDATED",
            NotificationState::Deactivated => "DEACTIVATED",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a listener. The only transition is Active -> Deactivated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListenerState {
    /// Receiving events.
    Active,
    /// Removed by the client.
    Deactivated,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ListenerState::Active => "ACTIVE",
            ListenerState::Deactivated => "DEACTIVATED",
        };
        f.write_str(s)
    }
}

/// Returns true if `scope` covers `path`.
///
/// A `None` scope is the whole bucket and covers everything. A string scope
/// covers every path it is a string-prefix of, and never the whole bucket.
/// "`path` is nested at or under `scope`" is the same relation read the other way.
pub fn covers(scope: Option<&str>, path: Option<&str>) -> bool {
    match (scope, path) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(s), Some(p)) => p.starts_with(s),
    }
}

/// Renders a bucket path for log lines.
pub fn display_path(bucket: &str, prefix: Option<&str>) -> String {
    format!("s3://{}/{}", bucket, prefix.unwrap_or(""))
}
