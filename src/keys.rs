//! Identifier and value types shared across the crate.
//!
//! All identifiers are opaque interned strings. The replication protocol
//! never inspects their structure; it only compares and forwards them.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
    sync::Arc,
    time::SystemTime,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sentinel for "never expires" in [`Timestamps::expires`].
pub const NEVER_EXPIRES: i64 = -1;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

macro_rules! identifier {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Returns the identifier in its external string form.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub(crate) fn shared(&self) -> &Arc<str> {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(Arc::from(s))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(Arc::from(s.as_str()))
            }
        }

        impl From<Arc<str>> for $name {
            fn from(s: Arc<str>) -> Self {
                Self(s)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self::from(s))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

identifier!(
    /// Network identifier of a mesh base, unique across the cooperating set.
    MeshBaseIdentifier
);

identifier!(
    /// Globally stable identifier of a mesh object.
    ///
    /// Unique within the namespace of the mesh base that is the object's
    /// home. Replicas in other mesh bases are correlated only by sharing
    /// this identifier.
    MeshObjectIdentifier
);

identifier!(
    /// Opaque identifier of an entity type, property type or role type.
    ///
    /// The type system itself lives outside this crate; change records
    /// carry these as-is.
    MeshTypeIdentifier
);

/// A property value attached to a mesh object.
///
/// Closed set of variants so values can participate in change records and
/// round-trip through the codec without consulting a type model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Text(String),
    Int(i64),
    Float(f64),
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    TimeStamp(i64),
    Blob(Bytes),
}

impl Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Text(s) => write!(f, "{s}"),
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Boolean(v) => write!(f, "{v}"),
            PropertyValue::TimeStamp(v) => write!(f, "ts:{v}"),
            PropertyValue::Blob(b) => write!(f, "blob:{}", hex::encode(b)),
        }
    }
}

/// The four lifecycle timestamps every mesh object and proxy carries.
///
/// All in milliseconds since the Unix epoch; `expires == -1` means the
/// entry never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created: i64,
    pub updated: i64,
    pub read: i64,
    pub expires: i64,
}

impl Timestamps {
    /// All fields set to the current time, except `expires` which is never.
    pub fn now() -> Self {
        let now = now_millis();
        Timestamps {
            created: now,
            updated: now,
            read: now,
            expires: NEVER_EXPIRES,
        }
    }

    /// Whether this entry has expired relative to `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires != NEVER_EXPIRES && self.expires <= now
    }
}

impl Default for Timestamps {
    fn default() -> Self {
        Self::now()
    }
}

/// Re-interns identifiers during decoding.
///
/// Decoding externalized objects goes through a resolution context so that
/// identifiers already known to the local mesh base share one allocation,
/// and related objects are looked up by identifier instead of deep-copied.
pub trait ResolutionContext {
    fn object_identifier(&self, raw: &str) -> MeshObjectIdentifier;
    fn type_identifier(&self, raw: &str) -> MeshTypeIdentifier;
    fn base_identifier(&self, raw: &str) -> MeshBaseIdentifier;
}

/// A plain string interner, the default [`ResolutionContext`].
#[derive(Debug, Default)]
pub struct Interner {
    known: parking_lot::RwLock<std::collections::HashSet<Arc<str>>>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared allocation for `s`, creating it on first use.
    pub fn intern(&self, s: &str) -> Arc<str> {
        if let Some(found) = self.known.read().get(s) {
            return found.clone();
        }
        let mut known = self.known.write();
        match known.get(s) {
            Some(found) => found.clone(),
            None => {
                let arc: Arc<str> = Arc::from(s);
                known.insert(arc.clone());
                arc
            }
        }
    }
}

impl ResolutionContext for Interner {
    fn object_identifier(&self, raw: &str) -> MeshObjectIdentifier {
        MeshObjectIdentifier::from(self.intern(raw))
    }

    fn type_identifier(&self, raw: &str) -> MeshTypeIdentifier {
        MeshTypeIdentifier::from(self.intern(raw))
    }

    fn base_identifier(&self, raw: &str) -> MeshBaseIdentifier {
        MeshBaseIdentifier::from(self.intern(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_display_roundtrip() {
        let id: MeshObjectIdentifier = "example.org/#abc".parse().unwrap();
        assert_eq!(id.to_string(), "example.org/#abc");
        assert_eq!(id, MeshObjectIdentifier::from("example.org/#abc"));
    }

    #[test]
    fn interner_shares_allocations() {
        let interner = Interner::new();
        let a = interner.object_identifier("obj-1");
        let b = interner.object_identifier("obj-1");
        assert!(Arc::ptr_eq(a.shared(), b.shared()));
    }

    #[test]
    fn expiry_sentinel() {
        let ts = Timestamps::now();
        assert!(!ts.is_expired(i64::MAX));
        let ts = Timestamps {
            expires: 10,
            ..Timestamps::now()
        };
        assert!(ts.is_expired(10));
        assert!(!ts.is_expired(9));
    }
}
