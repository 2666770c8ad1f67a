// Copyright 2023 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Serializable types for the small closed set of wire shapes the E2EE core
//! consumes and produces.
//!
//! The generic event registry, the sync loop and the HTTP transport are
//! external collaborators; the types here are the contract between them and
//! the [`OlmMachine`](crate::OlmMachine).

mod events;
mod requests;

pub use events::{
    AnyToDeviceEvent, DecryptedOlmEvent, DeviceKeys, EncryptedRoomEvent,
    EncryptedToDeviceContent, OlmV1Keys, RawToDeviceEvent, RoomEncryptedContent, RoomKeyContent,
    SignedOneTimeKey, ToDeviceEvent, UnsignedDeviceInfo,
};
pub use requests::{
    DeviceLists, EncryptionSyncChanges, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
    KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, OneTimeKeyCounts, ToDeviceRequest,
    SIGNED_CURVE25519,
};

/// The event encryption algorithms the core understands.
pub mod algorithms {
    /// Olm, the device to device encryption algorithm.
    pub const OLM_V1_CURVE25519_AES_SHA2: &str = "m.olm.v1.curve25519-aes-sha2";
    /// Megolm, the group encryption algorithm.
    pub const MEGOLM_V1_AES_SHA2: &str = "m.megolm.v1.aes-sha2";
}

// Vodozemac serializes curve keys directly as a byteslice, while Matrix likes
// to base64 encode all byte slices.
//
// This ensures that we serialize/deserialize in a Matrix compatible way.
pub(crate) fn deserialize_curve_key<'de, D>(
    de: D,
) -> Result<vodozemac::Curve25519PublicKey, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    let key: String = Deserialize::deserialize(de)?;
    vodozemac::Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_curve_key<S>(
    key: &vodozemac::Curve25519PublicKey,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&key.to_base64())
}

pub(crate) fn deserialize_ed25519_key<'de, D>(
    de: D,
) -> Result<vodozemac::Ed25519PublicKey, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    let key: String = Deserialize::deserialize(de)?;
    vodozemac::Ed25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_ed25519_key<S>(
    key: &vodozemac::Ed25519PublicKey,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&key.to_base64())
}
