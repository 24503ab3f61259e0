//! # Identifiers
//!
//! - `Sindex`: local index of a store (a shared folder scope)
//! - `Did`: identifier of a peer device
//! - `Oid`: identifier of a content-bearing object
//! - `Soid`: an object qualified by the store it lives in

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length in bytes of device and object identifiers.
pub const UNIQUE_ID_LEN: usize = 16;

/// Local index of a store.
///
/// Opaque to the collector; every filter structure is scoped to exactly one
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sindex(pub u32);

impl Sindex {
    /// Big-endian encoding, used as a key component so stores sort numerically.
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Sindex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

macro_rules! unique_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; UNIQUE_ID_LEN]);

        impl $name {
            /// Generate a random identifier.
            #[cfg(any(test, feature = "test-util"))]
            pub fn generate() -> Self {
                Self(*uuid::Uuid::new_v4().as_bytes())
            }

            /// Raw identifier bytes.
            pub fn as_bytes(&self) -> &[u8; UNIQUE_ID_LEN] {
                &self.0
            }

            /// Parse from a byte slice of exactly `UNIQUE_ID_LEN` bytes.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; UNIQUE_ID_LEN]>::try_from(bytes).ok().map(Self)
            }
        }

        impl From<[u8; UNIQUE_ID_LEN]> for $name {
            fn from(bytes: [u8; UNIQUE_ID_LEN]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Short form is enough to tell peers and objects apart in logs
                write!(f, "{}", &hex::encode(self.0)[..8])
            }
        }
    };
}

unique_id!(
    /// Identifier of a peer device in the sync mesh.
    Did
);

unique_id!(
    /// Identifier of a content-bearing object.
    Oid
);

/// An object qualified by its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Soid {
    pub sidx: Sindex,
    pub oid: Oid,
}

impl Soid {
    pub fn new(sidx: Sindex, oid: Oid) -> Self {
        Self { sidx, oid }
    }
}

impl fmt::Display for Soid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.sidx, self.oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = Did::generate();
        let b = Did::generate();
        assert_ne!(a, b, "Random device ids should not collide");
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(Oid::from_slice(&[0u8; 15]).is_none());
        assert!(Oid::from_slice(&[0u8; 17]).is_none());
        assert_eq!(Oid::from_slice(&[7u8; 16]), Some(Oid([7u8; 16])));
    }

    #[test]
    fn test_display_is_short_hex() {
        let did = Did([0xAB; UNIQUE_ID_LEN]);
        assert_eq!(did.to_string(), "abababab");

        let soid = Soid::new(Sindex(3), Oid([0x01; UNIQUE_ID_LEN]));
        assert_eq!(soid.to_string(), "s301010101");
    }

    #[test]
    fn test_sindex_key_bytes_sort_numerically() {
        assert!(Sindex(2).to_be_bytes() < Sindex(256).to_be_bytes());
    }

    #[test]
    fn test_serde_roundtrip_preserves_soid() {
        let soid = Soid::new(Sindex(9), Oid::generate());
        let json = serde_json::to_string(&soid).unwrap();
        let back: Soid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, soid);
    }
}
