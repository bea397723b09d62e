//! Identity and ordering types for oplog-sync.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty (or whitespace only).
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Opaque token identifying one physical device.
    ///
    /// Supplied by the client on every request; unique per device.
    DeviceToken
);

string_id!(
    /// Stable user identifier yielded by the authentication provider.
    UserId
);

string_id!(
    /// Identifier of a sync group.
    ///
    /// Groups are not declared anywhere: two devices carrying the same
    /// `GroupId` are in the same group by definition. Ordering is
    /// lexicographic, which gives multi-group locking a canonical order.
    GroupId
);

impl GroupId {
    /// The "own group" of a user: the group a device belongs to until it
    /// joins another one.
    pub fn own(user: &UserId) -> Self {
        Self(user.as_str().to_string())
    }

    /// Whether this is the own group of `user`.
    pub fn is_own_group_of(&self, user: &UserId) -> bool {
        self.0 == user.as_str()
    }
}

/// A logical timestamp drawn from the store's monotonic clock.
///
/// Operations record the tick at which they were written and devices
/// record the tick of their last completed sync, so "created after the
/// last sync" is an exact comparison that wall clocks cannot provide.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Tick(u64);

impl Tick {
    /// Create a new Tick with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this Tick.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The tick before anything was written ("never synced").
    pub fn zero() -> Self {
        Self(0)
    }

    /// The following tick.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tick({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_group_matches_user() {
        let user = UserId::new("user-1");
        let group = GroupId::own(&user);
        assert_eq!(group.as_str(), "user-1");
        assert!(group.is_own_group_of(&user));
        assert!(!GroupId::new("shared").is_own_group_of(&user));
    }

    #[test]
    fn group_ids_order_lexicographically() {
        let mut groups = vec![GroupId::new("b"), GroupId::new("a"), GroupId::new("c")];
        groups.sort();
        assert_eq!(
            groups,
            vec![GroupId::new("a"), GroupId::new("b"), GroupId::new("c")]
        );
    }

    #[test]
    fn blank_detection() {
        assert!(DeviceToken::new("").is_blank());
        assert!(DeviceToken::new("   ").is_blank());
        assert!(!DeviceToken::new("device-1").is_blank());
    }

    #[test]
    fn debug_names_the_kind() {
        assert_eq!(format!("{:?}", UserId::new("u")), "UserId(u)");
        assert_eq!(GroupId::new("g").to_string(), "g");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&DeviceToken::new("dev")).unwrap();
        assert_eq!(json, "\"dev\"");
    }

    #[test]
    fn tick_ordering_and_next() {
        assert!(Tick::new(1) < Tick::new(2));
        assert_eq!(Tick::zero().next(), Tick::new(1));
        assert_eq!(Tick::new(u64::MAX).next().value(), u64::MAX);
    }
}
