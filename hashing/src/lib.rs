// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::fmt;
use std::str::FromStr;

use digest::consts::U32;
use generic_array::GenericArray;
use serde::de::Visitor;
use serde::ser::{Serialize, Serializer};
use serde::{Deserialize, Deserializer};
use sha2::{Digest as Sha256Digest, Sha256};

pub const OBJECT_ID_SIZE: usize = 32;

/// The id of the zero-length payload: every store treats it as always present.
pub const EMPTY_OBJECT_ID: ObjectId = ObjectId([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

///
/// The content address of a blob: the SHA-256 of its bytes, rendered as lowercase hex on the wire
/// and in object-store keys. The same bytes always hash to the same id, and an id uniquely
/// determines its bytes.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct ObjectId(pub [u8; OBJECT_ID_SIZE]);

impl ObjectId {
    pub fn of_bytes(bytes: &[u8]) -> ObjectId {
        let mut hasher = Sha256::default();
        hasher.update(bytes);
        ObjectId::from_digest(hasher.finalize())
    }

    pub fn from_digest(bytes: GenericArray<u8, U32>) -> ObjectId {
        ObjectId(bytes.into())
    }

    pub fn from_hex_string(hex_string: &str) -> Result<ObjectId, String> {
        <[u8; OBJECT_ID_SIZE] as hex::FromHex>::from_hex(hex_string)
            .map(ObjectId)
            .map_err(|e| format!("Invalid object id {hex_string:?}: {e:?}"))
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_SIZE] {
        &self.0
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(OBJECT_ID_SIZE * 2);
        for &byte in &self.0 {
            fmt::Write::write_fmt(&mut s, format_args!("{byte:02x}")).unwrap();
        }
        s
    }

    ///
    /// The first two hex characters of the id, used as a sharding directory by the disk cache so
    /// that no single directory grows too wide.
    ///
    pub fn prefix(&self) -> String {
        format!("{:02x}", self.0[0])
    }

    ///
    /// The remainder of the hex rendering after `prefix`.
    ///
    pub fn rest(&self) -> String {
        self.to_hex().split_off(2)
    }

    ///
    /// Whether `bytes` is in fact the payload this id addresses.
    ///
    pub fn matches(&self, bytes: &[u8]) -> bool {
        ObjectId::of_bytes(bytes) == *self
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ObjectIdVisitor;

        impl<'de> Visitor<'de> for ObjectIdVisitor {
            type Value = ObjectId;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> Result<(), fmt::Error> {
                formatter.write_str("a hex representation of a 32 byte value")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                ObjectId::from_hex_string(v).map_err(|err| {
                    serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(&format!("{v:?}: {err}")),
                        &format!("A hex representation of a {OBJECT_ID_SIZE} byte value").as_str(),
                    )
                })
            }
        }

        deserializer.deserialize_string(ObjectIdVisitor)
    }
}

impl FromStr for ObjectId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectId::from_hex_string(s)
    }
}

impl TryFrom<&str> for ObjectId {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        ObjectId::from_hex_string(s)
    }
}
