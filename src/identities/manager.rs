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

use std::{
    collections::HashSet,
    sync::Arc,
};

use ruma::{
    DeviceId, OwnedTransactionId, OwnedUserId, TransactionId, UserId,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vodozemac::Curve25519PublicKey;

use crate::{
    error::OlmResult,
    identities::Device,
    olm::Account,
    store::CryptoStore,
    types::{KeysQueryRequest, KeysQueryResponse},
};

/// The result of merging a key query response into the device registry.
///
/// `replaced` carries devices whose ed25519 key changed; they are treated as
/// new identities. Verification is keyed by the ed25519 key in the store, so
/// the replacement never inherits it, and the caller should invalidate any
/// outbound group session those devices could still read.
#[derive(Clone, Debug, Default)]
pub struct DeviceChanges {
    /// Devices we saw for the first time.
    pub new: Vec<Device>,
    /// Known devices whose mutable fields changed.
    pub changed: Vec<Device>,
    /// Known devices that came back with a different ed25519 identity.
    pub replaced: Vec<Device>,
    /// Devices that disappeared from the user's device list.
    pub deleted: Vec<Device>,
}

impl DeviceChanges {
    /// Was nothing changed by the merge.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty()
            && self.changed.is_empty()
            && self.replaced.is_empty()
            && self.deleted.is_empty()
    }

    fn extend(&mut self, other: DeviceChanges) {
        self.new.extend(other.new);
        self.changed.extend(other.changed);
        self.replaced.extend(other.replaced);
        self.deleted.extend(other.deleted);
    }
}

/// Details of the in-flight `/keys/query` request, if any.
#[derive(Debug, Clone)]
struct KeysQueryRequestDetails {
    request_id: OwnedTransactionId,
    users: HashSet<OwnedUserId>,
}

/// Tracks the devices of the users we share encrypted rooms with and keeps
/// the local view current with a single outstanding key query at a time.
#[derive(Clone)]
pub(crate) struct IdentityManager {
    account: Account,
    store: Arc<dyn CryptoStore>,
    keys_query_request_details: Arc<Mutex<Option<KeysQueryRequestDetails>>>,
}

impl IdentityManager {
    pub fn new(account: Account, store: Arc<dyn CryptoStore>) -> Self {
        Self {
            account,
            store,
            keys_query_request_details: Arc::new(Mutex::new(None)),
        }
    }

    /// Look up the curve25519 key a device advertised.
    pub async fn curve_key_for(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> OlmResult<Option<Curve25519PublicKey>> {
        Ok(self.store.get_device(user_id, device_id).await?.and_then(|d| d.curve25519_key()))
    }

    /// Does any device of the given user currently advertise the given
    /// curve25519 key.
    pub async fn is_known_curve_key(
        &self,
        user_id: &UserId,
        curve_key: Curve25519PublicKey,
    ) -> OlmResult<bool> {
        let devices = self.store.get_user_devices(user_id).await?;
        let result = devices.devices().any(|d| d.curve25519_key() == Some(curve_key));
        Ok(result)
    }

    /// Start tracking the given users, marking them as outdated so the next
    /// key query picks them up.
    ///
    /// Users that are already tracked are left as they are.
    pub async fn update_tracked_users(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> OlmResult<()> {
        for user in users {
            if !self.store.is_user_tracked(user) {
                self.store.update_tracked_user(user, true).await?;
            }
        }

        Ok(())
    }

    /// Mark the given users as outdated if we track them.
    pub async fn receive_device_changes(
        &self,
        changed: impl IntoIterator<Item = &UserId>,
    ) -> OlmResult<()> {
        for user in changed {
            if self.store.is_user_tracked(user) {
                self.store.update_tracked_user(user, true).await?;
            }
        }

        Ok(())
    }

    /// Stop tracking the given users.
    pub async fn receive_left_users(
        &self,
        left: impl IntoIterator<Item = &UserId>,
    ) -> OlmResult<()> {
        for user in left {
            self.store.untrack_user(user).await?;
        }

        Ok(())
    }

    /// Get a key query request for all the users whose device list is
    /// outdated, if any.
    ///
    /// At most one query is outstanding at a time; while one is in flight
    /// this returns `None`. Users marked as outdated in the meantime are
    /// picked up by the follow-up query after the response was received.
    pub async fn users_for_key_query(
        &self,
    ) -> Option<(OwnedTransactionId, KeysQueryRequest)> {
        let mut details = self.keys_query_request_details.lock().await;

        if details.is_some() {
            return None;
        }

        let users = self.store.users_for_key_query();

        if users.is_empty() {
            return None;
        }

        let request_id = TransactionId::new();
        let request = KeysQueryRequest::new(users.iter().cloned());

        debug!(?request_id, ?users, "Building a `/keys/query` request");

        *details = Some(KeysQueryRequestDetails { request_id: request_id.clone(), users });

        Some((request_id, request))
    }

    /// Forget the in-flight query after a transient failure so the next
    /// tick can retry it.
    pub async fn query_failed(&self, request_id: &TransactionId) {
        let mut details = self.keys_query_request_details.lock().await;

        if details.as_ref().is_some_and(|d| d.request_id == request_id) {
            *details = None;
        }
    }

    /// Receive a successful key query response and merge it into the device
    /// registry.
    pub async fn receive_keys_query_response(
        &self,
        request_id: &TransactionId,
        response: &KeysQueryResponse,
    ) -> OlmResult<DeviceChanges> {
        let query_users = {
            let mut details = self.keys_query_request_details.lock().await;

            match details.take() {
                Some(d) if d.request_id == request_id => Some(d.users),
                Some(d) => {
                    warn!(
                        ?request_id,
                        expected_request_id = ?d.request_id,
                        "Received a `/keys/query` response for the wrong request"
                    );
                    *details = Some(d);
                    None
                }
                None => None,
            }
        };

        if !response.failures.is_empty() {
            warn!(failures = ?response.failures.keys(), "Some homeservers couldn't be reached");
        }

        let mut changes = DeviceChanges::default();

        for (user_id, device_map) in &response.device_keys {
            let user_changes = self.update_user_devices(user_id, device_map).await?;
            changes.extend(user_changes);

            // Only clear the outdated flag when the response belongs to the
            // request we issued; the user could have been marked outdated
            // again while an unrelated query ran.
            if query_users.as_ref().is_some_and(|u| u.contains(user_id)) {
                self.store.update_tracked_user(user_id, false).await?;
            }
        }

        self.store.save_devices(&changes.new).await?;
        self.store.save_devices(&changes.changed).await?;
        self.store.save_devices(&changes.replaced).await?;
        for device in &changes.deleted {
            self.store.delete_device(device.clone()).await?;
        }

        info!(
            new = changes.new.len(),
            changed = changes.changed.len(),
            replaced = changes.replaced.len(),
            deleted = changes.deleted.len(),
            "Finished handling of a `/keys/query` response"
        );

        Ok(changes)
    }

    async fn update_user_devices(
        &self,
        user_id: &UserId,
        device_map: &std::collections::BTreeMap<ruma::OwnedDeviceId, crate::types::DeviceKeys>,
    ) -> OlmResult<DeviceChanges> {
        let mut changes = DeviceChanges::default();

        for (device_id, device_keys) in device_map {
            if user_id != device_keys.user_id || device_id != &device_keys.device_id {
                warn!(
                    %user_id,
                    %device_id,
                    "Mismatch in the device keys payload of a key query response",
                );
                continue;
            }

            if user_id == self.account.user_id() && device_id == self.account.device_id() {
                // The server is telling us about our own device, check that
                // it isn't lying about our keys.
                let own_keys = self.account.identity_keys();
                let advertised = crate::identities::Device::try_from(device_keys).ok();

                if advertised.as_ref().and_then(|d| d.ed25519_key()) != Some(own_keys.ed25519) {
                    warn!("The server returned a different set of keys for our own device");
                }

                continue;
            }

            let new_device = match Device::try_from(device_keys) {
                Ok(d) => d,
                Err(e) => {
                    warn!(
                        %user_id,
                        %device_id,
                        error = ?e,
                        "Failed to verify the signatures of a device in a key query response",
                    );
                    continue;
                }
            };

            match self.store.get_device(user_id, device_id).await? {
                None => changes.new.push(new_device),
                Some(old_device) => {
                    if old_device.ed25519_key() != new_device.ed25519_key() {
                        // The device identity changed, treat it as a brand
                        // new device. Verification is keyed by the ed25519
                        // identity in the store, so the old identity's trust
                        // stays behind with the old key.
                        warn!(
                            %user_id,
                            %device_id,
                            "A device rekeyed its ed25519 identity, treating it as a new device",
                        );
                        changes.replaced.push(new_device);
                    } else if old_device.as_device_keys() != new_device.as_device_keys()
                        || old_device.display_name() != new_device.display_name()
                    {
                        changes.changed.push(new_device);
                    }
                }
            }
        }

        // Devices missing from the response were deleted on the server.
        let stored = self.store.get_user_devices(user_id).await?;
        for device in stored.devices() {
            if !device_map.contains_key(device.device_id()) {
                changes.deleted.push(device.clone());
            }
        }

        Ok(changes)
    }
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("user_id", &self.account.user_id())
            .finish()
    }
}
