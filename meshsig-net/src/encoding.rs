// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Serde adapters for binary fields.
//!
//! Wire messages carry bytes as lowercase hex. Persisted cache records carry
//! them as `{"type":"Buffer","data":[..]}` so that records written by other
//! implementations of the cache format load unchanged.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub(crate) mod hex_bytes_64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

pub(crate) mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

const BUFFER_TAG: &str = "Buffer";

#[derive(Serialize, Deserialize)]
struct BufferRepr {
    #[serde(rename = "type")]
    kind: String,
    data: Vec<u8>,
}

pub(crate) mod buffer_64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{BufferRepr, BUFFER_TAG};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BufferRepr {
            kind: BUFFER_TAG.to_string(),
            data: bytes.to_vec(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = BufferRepr::deserialize(deserializer)?;
        if repr.kind != BUFFER_TAG {
            return Err(serde::de::Error::custom(format!(
                "expected type \"{BUFFER_TAG}\", got \"{}\"",
                repr.kind
            )));
        }
        repr.data
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}
