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

use std::collections::BTreeMap;

use ruma::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId,
    UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    error::SignatureError,
    olm::utility::VerifyJson,
    types::{algorithms, DeviceKeys, SignedOneTimeKey},
};

/// A device belonging to some user, together with the keys it advertised in
/// a key query response.
///
/// Records are replaced, never mutated in place: when a key query returns a
/// different ed25519 key for a known device the record is swapped for a new
/// one. Trust lives in the store, keyed by the ed25519 identity, so a
/// replaced device never inherits the verification of the old identity; see
/// [`OlmMachine::is_device_verified`](crate::OlmMachine::is_device_verified).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Device {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    algorithms: Vec<String>,
    keys: BTreeMap<OwnedDeviceKeyId, String>,
    signatures: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>,
    display_name: Option<String>,
}

impl Device {
    /// The user that owns the device.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique id of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The encryption algorithms the device supports.
    pub fn algorithms(&self) -> &[String] {
        &self.algorithms
    }

    /// Can the device receive Olm encrypted to-device messages.
    pub fn supports_olm(&self) -> bool {
        self.algorithms.iter().any(|a| a == algorithms::OLM_V1_CURVE25519_AES_SHA2)
    }

    /// The display name the owner gave the device, if any.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// All the public identity keys of the device.
    pub fn keys(&self) -> &BTreeMap<OwnedDeviceKeyId, String> {
        &self.keys
    }

    /// Get one of the identity keys of the device as a string.
    pub fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&str> {
        self.keys
            .get(&DeviceKeyId::from_parts(algorithm, &self.device_id))
            .map(|k| k.as_str())
    }

    /// The curve25519 key of the device, used to establish Olm sessions.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.get_key(DeviceKeyAlgorithm::Curve25519)
            .and_then(|k| Curve25519PublicKey::from_base64(k).ok())
    }

    /// The ed25519 key of the device, its long-lived identity.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.get_key(DeviceKeyAlgorithm::Ed25519)
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }

    /// Verify a one-time key that was claimed for this device.
    pub(crate) fn verify_one_time_key(
        &self,
        one_time_key: &SignedOneTimeKey,
    ) -> Result<(), SignatureError> {
        let signing_key = self.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;

        signing_key.verify_json(
            &self.user_id,
            &DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
            &json!(one_time_key),
        )
    }

    /// Check that the device keys are validly self-signed by the device's
    /// own ed25519 key.
    fn verify_device_keys(device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        let key_id =
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &device_keys.device_id);
        let signing_key = device_keys
            .keys
            .get(&key_id)
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
            .ok_or(SignatureError::MissingSigningKey)?;

        signing_key.verify_json(&device_keys.user_id, &key_id, &json!(device_keys))
    }

    /// The wire-format device keys of this device, used when the record is
    /// stored or compared against a key query response.
    pub(crate) fn as_device_keys(&self) -> DeviceKeys {
        DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: self.algorithms.clone(),
            keys: self.keys.clone(),
            signatures: self.signatures.clone(),
            unsigned: None,
        }
    }
}

impl TryFrom<&DeviceKeys> for Device {
    type Error = SignatureError;

    fn try_from(device_keys: &DeviceKeys) -> Result<Self, Self::Error> {
        Self::verify_device_keys(device_keys)?;

        Ok(Self {
            user_id: device_keys.user_id.clone(),
            device_id: device_keys.device_id.clone(),
            algorithms: device_keys.algorithms.clone(),
            keys: device_keys.keys.clone(),
            signatures: device_keys.signatures.clone(),
            display_name: device_keys
                .unsigned
                .as_ref()
                .and_then(|u| u.device_display_name.clone()),
        })
    }
}
