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

use ruma::{CanonicalJsonValue, OwnedDeviceKeyId, UserId};
use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::error::SignatureError;

/// Convert a JSON object into the canonical string form that Matrix
/// signatures cover.
///
/// The `signatures` and `unsigned` fields are not part of the signed
/// material and are stripped before canonicalization.
pub(crate) fn to_signable_json(mut value: Value) -> Result<String, SignatureError> {
    let json_object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    json_object.remove("signatures");
    json_object.remove("unsigned");

    let canonical_json: CanonicalJsonValue =
        value.try_into().map_err(|_| SignatureError::NotAnObject)?;

    Ok(canonical_json.to_string())
}

pub(crate) trait VerifyJson {
    /// Verify a signed JSON object.
    ///
    /// The object must have a signatures key associated with an object of
    /// the form `user_id: {key_id: signature}`.
    ///
    /// Returns Ok if the signature was successfully verified, otherwise an
    /// SignatureError.
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &OwnedDeviceKeyId,
        json: &Value,
    ) -> Result<(), SignatureError>;
}

impl VerifyJson for Ed25519PublicKey {
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &OwnedDeviceKeyId,
        json: &Value,
    ) -> Result<(), SignatureError> {
        let signature = json
            .get("signatures")
            .and_then(|s| s.get(user_id.as_str()))
            .and_then(|s| s.get(key_id.to_string()))
            .and_then(|s| s.as_str())
            .ok_or(SignatureError::NoSignatureFound)?;

        let signature = Ed25519Signature::from_base64(signature)?;
        let canonical_json = to_signable_json(json.clone())?;

        self.verify(canonical_json.as_bytes(), &signature)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ruma::{user_id, DeviceKeyAlgorithm, DeviceKeyId};
    use serde_json::json;
    use vodozemac::olm::Account;

    use super::{to_signable_json, VerifyJson};

    #[test]
    fn verify_own_signature() {
        let account = Account::new();
        let device_id = ruma::device_id!("DEVICEID");
        let user_id = user_id!("@alice:example.org");
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id);

        let mut device_keys = json!({
            "user_id": user_id,
            "device_id": device_id,
            "algorithms": ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"],
            "keys": {
                (format!("curve25519:{device_id}")): account.curve25519_key().to_base64(),
                (format!("ed25519:{device_id}")): account.ed25519_key().to_base64(),
            },
        });

        let canonical = to_signable_json(device_keys.clone()).unwrap();
        let signature = account.sign(canonical.as_bytes());

        device_keys["signatures"] =
            json!({ (user_id.as_str()): { (key_id.to_string()): signature.to_base64() } });

        account
            .ed25519_key()
            .verify_json(user_id, &key_id, &device_keys)
            .expect("our own signature should verify");

        device_keys["user_id"] = json!("@mallory:example.org");

        account
            .ed25519_key()
            .verify_json(user_id, &key_id, &device_keys)
            .expect_err("a tampered object should not verify");
    }
}
