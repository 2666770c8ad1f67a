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
    MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedDeviceKeyId, OwnedEventId, OwnedRoomId,
    OwnedUserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{
    megolm::{MegolmMessage, SessionKey},
    olm::OlmMessage,
    Curve25519PublicKey, Ed25519PublicKey,
};

use super::{
    algorithms, deserialize_curve_key, deserialize_ed25519_key, serialize_curve_key,
    serialize_ed25519_key,
};

/// A to-device event as it arrives from a sync response, before the core has
/// looked at it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RawToDeviceEvent {
    /// The user that sent us the event.
    pub sender: OwnedUserId,
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the event.
    pub content: Value,
}

/// A to-device event with a concrete, deserialized content type.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToDeviceEvent<C> {
    /// The user that sent us the event.
    pub sender: OwnedUserId,
    /// The content of the event.
    pub content: C,
}

/// The closed set of to-device events the E2EE core handles.
///
/// Everything else the sync response carries belongs to other subsystems and
/// shows up here only as `Other`.
#[derive(Clone, Debug)]
pub enum AnyToDeviceEvent {
    /// An `m.room.encrypted` event, an Olm encrypted to-device message.
    Encrypted(ToDeviceEvent<EncryptedToDeviceContent>),
    /// An `m.room_key` event carrying a Megolm session key.
    RoomKey(ToDeviceEvent<RoomKeyContent>),
    /// One of the `m.key.verification.*` events.
    Verification(RawToDeviceEvent),
    /// An event the E2EE core doesn't handle.
    Other(RawToDeviceEvent),
}

impl AnyToDeviceEvent {
    /// Classify a raw to-device event into the set of events the core
    /// handles.
    ///
    /// Malformed content of a known event type is reported as an error so the
    /// caller can log and drop the single event.
    pub fn from_raw(raw: &RawToDeviceEvent) -> Result<Self, serde_json::Error> {
        match raw.event_type.as_str() {
            "m.room.encrypted" => {
                let content = serde_json::from_value(raw.content.clone())?;
                Ok(Self::Encrypted(ToDeviceEvent { sender: raw.sender.clone(), content }))
            }
            "m.room_key" => {
                let content = serde_json::from_value(raw.content.clone())?;
                Ok(Self::RoomKey(ToDeviceEvent { sender: raw.sender.clone(), content }))
            }
            t if t.starts_with("m.key.verification.") => Ok(Self::Verification(raw.clone())),
            _ => Ok(Self::Other(raw.clone())),
        }
    }
}

/// The content of an `m.room.encrypted` to-device event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EncryptedToDeviceContent {
    /// The encryption algorithm that was used to encrypt the message.
    pub algorithm: String,
    /// The curve25519 key of the account that encrypted the message.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// A map from the recipient curve25519 key to the Olm ciphertext meant
    /// for that recipient.
    pub ciphertext: BTreeMap<String, OlmMessage>,
}

impl EncryptedToDeviceContent {
    /// Is the content using an algorithm the core can decrypt.
    pub fn is_supported(&self) -> bool {
        self.algorithm == algorithms::OLM_V1_CURVE25519_AES_SHA2
    }
}

/// The ed25519 key claims inside the plaintext of an Olm message.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OlmV1Keys {
    /// The ed25519 key of the account the claim is about.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub ed25519: Ed25519PublicKey,
}

/// The plaintext envelope an Olm message decrypts into.
///
/// The envelope binds the inner event to the sending and receiving accounts;
/// the pipeline validates the bindings before dispatching the inner event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DecryptedOlmEvent {
    /// The user that encrypted the message.
    pub sender: OwnedUserId,
    /// The user the message was meant for.
    pub recipient: OwnedUserId,
    /// The key claims of the sending account.
    pub keys: OlmV1Keys,
    /// The key claims about the receiving account.
    pub recipient_keys: OlmV1Keys,
    /// The type of the inner event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the inner event.
    pub content: Value,
}

/// The content of an `m.room_key` event, carried inside an Olm encrypted
/// to-device message.
#[derive(Deserialize, Serialize)]
pub struct RoomKeyContent {
    /// The algorithm of the session the key belongs to.
    pub algorithm: String,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The unique id of the session.
    pub session_id: String,
    /// The exported Megolm session key.
    pub session_key: SessionKey,
}

impl Clone for RoomKeyContent {
    fn clone(&self) -> Self {
        Self {
            algorithm: self.algorithm.clone(),
            room_id: self.room_id.clone(),
            session_id: self.session_id.clone(),
            #[allow(clippy::expect_used)]
            session_key: SessionKey::from_bytes(&self.session_key.to_bytes())
                .expect("A SessionKey should always round-trip through its own byte encoding"),
        }
    }
}

impl std::fmt::Debug for RoomKeyContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("session_key", &"SessionKey { .. }")
            .finish()
    }
}

/// An `m.room.encrypted` room event carrying Megolm encrypted content.
///
/// Only the fields the E2EE core needs are represented; the surrounding
/// timeline event belongs to the room storage layer.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EncryptedRoomEvent {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The unique id of the event.
    pub event_id: OwnedEventId,
    /// The server side timestamp of the event.
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    /// The encrypted content.
    pub content: RoomEncryptedContent,
}

/// The Megolm encrypted content of an `m.room.encrypted` room event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomEncryptedContent {
    /// The encryption algorithm that was used to encrypt the message.
    pub algorithm: String,
    /// The curve25519 key of the device that encrypted the message.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The Megolm ciphertext.
    pub ciphertext: MegolmMessage,
    /// The id of the group session that encrypted the message.
    pub session_id: String,
    /// The id of the device that encrypted the message.
    pub device_id: OwnedDeviceId,
}

/// Additional data for a device that isn't covered by its signatures.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct UnsignedDeviceInfo {
    /// The display name the owner gave the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

/// The signed identity keys of a device, as exchanged through `/keys/query`
/// and `/keys/upload`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeviceKeys {
    /// The user that owns the device.
    pub user_id: OwnedUserId,
    /// The unique id of the device.
    pub device_id: OwnedDeviceId,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<String>,
    /// Public identity keys, keyed by algorithm and device id.
    pub keys: BTreeMap<OwnedDeviceKeyId, String>,
    /// Signatures over the canonical form of this object.
    pub signatures: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>,
    /// Data that isn't covered by the signatures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<UnsignedDeviceInfo>,
}

/// A one-time key signed by the ed25519 key of the device that published it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SignedOneTimeKey {
    /// The public part of the one-time key.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub key: Curve25519PublicKey,
    /// Signatures over the canonical form of this object.
    pub signatures: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn classify_to_device_events() {
        let raw = RawToDeviceEvent {
            sender: ruma::user_id!("@alice:example.org").to_owned(),
            event_type: "m.key.verification.start".to_owned(),
            content: json!({}),
        };
        assert!(matches!(AnyToDeviceEvent::from_raw(&raw).unwrap(), AnyToDeviceEvent::Verification(_)));

        let raw = RawToDeviceEvent {
            sender: ruma::user_id!("@alice:example.org").to_owned(),
            event_type: "m.dummy".to_owned(),
            content: json!({}),
        };
        assert!(matches!(AnyToDeviceEvent::from_raw(&raw).unwrap(), AnyToDeviceEvent::Other(_)));
    }

    #[test]
    fn encrypted_content_round_trip() {
        use vodozemac::olm::{Account, SessionConfig};

        let alice = Account::new();
        let mut bob = Account::new();
        bob.generate_one_time_keys(1);
        let one_time_key = *bob.one_time_keys().values().next().unwrap();

        let mut session = alice.create_outbound_session(
            SessionConfig::version_1(),
            bob.curve25519_key(),
            one_time_key,
        );
        let message = session.encrypt("it's a secret to everybody");

        let content = json!({
            "algorithm": "m.olm.v1.curve25519-aes-sha2",
            "sender_key": alice.curve25519_key().to_base64(),
            "ciphertext": {
                (bob.curve25519_key().to_base64()): message,
            }
        });

        let content: EncryptedToDeviceContent = serde_json::from_value(content).unwrap();
        assert!(content.is_supported());
        assert_eq!(content.sender_key, alice.curve25519_key());
        assert!(content.ciphertext.contains_key(&bob.curve25519_key().to_base64()));
    }
}
