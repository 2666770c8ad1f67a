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

use ruma::{OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::{DeviceKeys, RawToDeviceEvent, SignedOneTimeKey};

/// The key algorithm one-time keys are published and claimed under.
pub const SIGNED_CURVE25519: &str = "signed_curve25519";

/// Counts of the one-time keys the server still holds for us, keyed by
/// algorithm.
pub type OneTimeKeyCounts = BTreeMap<String, u64>;

/// The encryption relevant part of a sync response.
///
/// The sync loop is an external collaborator; it hands the E2EE core this
/// digest of every successful sync.
#[derive(Clone, Debug, Default)]
pub struct EncryptionSyncChanges {
    /// The to-device events the sync response carried, in received order.
    pub to_device_events: Vec<RawToDeviceEvent>,
    /// The device list deltas of the sync response.
    pub changed_devices: DeviceLists,
    /// The number of unused one-time keys the server reported.
    pub one_time_key_counts: OneTimeKeyCounts,
}

/// Device list deltas embedded in a sync response.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeviceLists {
    /// Users whose device list changed since the last sync.
    #[serde(default)]
    pub changed: Vec<OwnedUserId>,
    /// Users we no longer share an encrypted room with.
    #[serde(default)]
    pub left: Vec<OwnedUserId>,
}

/// The body of a `/keys/upload` request.
#[derive(Clone, Debug, Serialize)]
pub struct KeysUploadRequest {
    /// The signed identity keys of our own device, uploaded once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// Freshly generated signed one-time keys, keyed by algorithm and key
    /// id.
    pub one_time_keys: BTreeMap<String, SignedOneTimeKey>,
}

/// The body of a successful `/keys/upload` response.
#[derive(Clone, Debug, Deserialize)]
pub struct KeysUploadResponse {
    /// The number of unused one-time keys the server holds after the upload.
    pub one_time_key_counts: OneTimeKeyCounts,
}

/// The body of a `/keys/query` request.
#[derive(Clone, Debug, Serialize)]
pub struct KeysQueryRequest {
    /// The users whose device keys should be returned. An empty device list
    /// requests all devices of the user.
    pub device_keys: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
}

impl KeysQueryRequest {
    pub(crate) fn new(users: impl Iterator<Item = OwnedUserId>) -> Self {
        let device_keys = users.map(|u| (u, Vec::new())).collect();
        Self { device_keys }
    }
}

/// The body of a successful `/keys/query` response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct KeysQueryResponse {
    /// The returned device keys, grouped by user and device.
    #[serde(default)]
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>,
    /// Homeservers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// The body of a `/keys/claim` request.
#[derive(Clone, Debug, Serialize)]
pub struct KeysClaimRequest {
    /// The one-time keys to claim, keyed by user, device and algorithm.
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,
}

/// The body of a successful `/keys/claim` response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct KeysClaimResponse {
    /// The claimed one-time keys.
    #[serde(default)]
    pub one_time_keys:
        BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<String, SignedOneTimeKey>>>,
    /// Homeservers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// A to-device message that should be sent out as a single transaction.
#[derive(Clone, Debug)]
pub struct ToDeviceRequest {
    /// The type of the event that is going to be sent.
    pub event_type: String,
    /// The unique id of this request, used to couple the confirmation of the
    /// send back to the state the request was built from.
    pub txn_id: OwnedTransactionId,
    /// Per recipient message contents, keyed by user and device.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
}

impl ToDeviceRequest {
    /// Create a new to-device request with a fresh transaction id.
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_owned(),
            txn_id: TransactionId::new(),
            messages: BTreeMap::new(),
        }
    }

    /// The number of unique messages the request carries.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|m| m.len()).sum()
    }
}
