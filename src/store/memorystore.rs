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
    collections::{BTreeSet, HashSet},
    sync::{Arc, Mutex as SyncMutex},
};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use ruma::{
    DeviceId, EventId, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedUserId,
    RoomId, UserId,
};
use tokio::sync::Mutex;

use super::{
    caches::{DeviceStore, GroupSessionStore, SessionStore},
    CryptoStore, DeviceSet, Result, SharedDevice, UserDevices,
};
use crate::{
    identities::Device,
    olm::{Account, InboundGroupSession, OutboundGroupSession, Session},
};

/// An in-memory only store that loses all data on shutdown.
///
/// Mostly useful for tests and for the mock setup mode of the coordinator.
#[derive(Debug, Default)]
pub struct MemoryStore {
    account: SyncMutex<Option<Account>>,
    sessions: SessionStore,
    inbound_group_sessions: GroupSessionStore,
    outbound_group_sessions: DashMap<OwnedRoomId, OutboundGroupSession>,
    devices: DeviceStore,
    tracked_users: DashSet<OwnedUserId>,
    users_for_key_query: DashSet<OwnedUserId>,
    message_indices:
        DashMap<(OwnedRoomId, String, u32), (OwnedEventId, MilliSecondsSinceUnixEpoch)>,
    sent_room_keys: DashMap<(OwnedRoomId, String), DeviceSet>,
    verified_devices: DashSet<String>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        Ok(self.account.lock().unwrap().clone())
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        *self.account.lock().unwrap() = Some(account);
        Ok(())
    }

    async fn save_sessions(&self, sessions: &[Session]) -> Result<()> {
        for session in sessions {
            self.sessions.add(session.clone()).await;
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        Ok(self.sessions.get(sender_key))
    }

    async fn save_inbound_group_session(&self, session: InboundGroupSession) -> Result<bool> {
        Ok(self.inbound_group_sessions.add(session))
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.get(room_id, session_id))
    }

    async fn record_message_index(
        &self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
        event_id: &EventId,
        timestamp: MilliSecondsSinceUnixEpoch,
    ) -> Result<Option<(OwnedEventId, MilliSecondsSinceUnixEpoch)>> {
        let key = (room_id.to_owned(), session_id.to_owned(), index);

        match self.message_indices.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(Some(e.get().clone())),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert((event_id.to_owned(), timestamp));
                Ok(None)
            }
        }
    }

    async fn get_message_index_record(
        &self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
    ) -> Result<Option<(OwnedEventId, MilliSecondsSinceUnixEpoch)>> {
        let key = (room_id.to_owned(), session_id.to_owned(), index);
        Ok(self.message_indices.get(&key).map(|r| r.clone()))
    }

    async fn save_outbound_group_session(&self, session: OutboundGroupSession) -> Result<()> {
        self.outbound_group_sessions.insert(session.room_id().to_owned(), session);
        Ok(())
    }

    async fn load_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>> {
        Ok(self.outbound_group_sessions.get(room_id).map(|s| s.clone()))
    }

    async fn devices_missing_session_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
        devices: &DeviceSet,
    ) -> Result<DeviceSet> {
        let key = (room_id.to_owned(), session_id.to_owned());
        let sent = self.sent_room_keys.get(&key);

        let mut missing = DeviceSet::new();

        for (user_id, device_ids) in devices {
            let sent_devices = sent.as_ref().and_then(|s| s.get(user_id));

            let user_missing: BTreeSet<_> = match sent_devices {
                Some(sent) => device_ids.difference(sent).cloned().collect(),
                None => device_ids.clone(),
            };

            if !user_missing.is_empty() {
                missing.insert(user_id.clone(), user_missing);
            }
        }

        Ok(missing)
    }

    async fn mark_devices_as_received_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
        _index: u32,
        devices: &[SharedDevice],
    ) -> Result<()> {
        let key = (room_id.to_owned(), session_id.to_owned());
        let mut sent = self.sent_room_keys.entry(key).or_default();

        for (user_id, device_id, _curve_key) in devices {
            sent.entry(user_id.clone()).or_default().insert(device_id.clone());
        }

        Ok(())
    }

    async fn update_tracked_user(&self, user: &UserId, dirty: bool) -> Result<bool> {
        let newly_tracked = self.tracked_users.insert(user.to_owned());

        if dirty {
            self.users_for_key_query.insert(user.to_owned());
        } else {
            self.users_for_key_query.remove(user);
        }

        Ok(newly_tracked)
    }

    async fn untrack_user(&self, user: &UserId) -> Result<bool> {
        self.users_for_key_query.remove(user);
        Ok(self.tracked_users.remove(user).is_some())
    }

    fn is_user_tracked(&self, user_id: &UserId) -> bool {
        self.tracked_users.contains(user_id)
    }

    fn has_users_for_key_query(&self) -> bool {
        !self.users_for_key_query.is_empty()
    }

    fn users_for_key_query(&self) -> HashSet<OwnedUserId> {
        self.users_for_key_query.iter().map(|u| u.clone()).collect()
    }

    async fn save_devices(&self, devices: &[Device]) -> Result<()> {
        for device in devices {
            self.devices.add(device.clone());
        }

        Ok(())
    }

    async fn delete_device(&self, device: Device) -> Result<()> {
        self.devices.remove(device.user_id(), device.device_id());
        Ok(())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<Device>> {
        Ok(self.devices.get(user_id, device_id))
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices> {
        Ok(self.devices.user_devices(user_id))
    }

    async fn is_device_verified(&self, ed25519_key: &str) -> Result<bool> {
        Ok(self.verified_devices.contains(ed25519_key))
    }

    async fn mark_device_verified(&self, ed25519_key: &str) -> Result<()> {
        self.verified_devices.insert(ed25519_key.to_owned());
        Ok(())
    }

    async fn clear_room_data(&self, room_id: &RoomId) -> Result<()> {
        self.inbound_group_sessions.clear_room(room_id);
        self.outbound_group_sessions.remove(room_id);
        self.message_indices.retain(|(r, _, _), _| r != room_id);
        self.sent_room_keys.retain(|(r, _), _| r != room_id);

        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.account.lock().unwrap() = None;
        self.sessions.clear();
        self.inbound_group_sessions.clear();
        self.outbound_group_sessions.clear();
        self.devices.clear();
        self.tracked_users.clear();
        self.users_for_key_query.clear();
        self.message_indices.clear();
        self.sent_room_keys.clear();
        self.verified_devices.clear();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ruma::{event_id, room_id, user_id, MilliSecondsSinceUnixEpoch};

    use super::MemoryStore;
    use crate::store::{CryptoStore, DeviceSet};

    #[tokio::test]
    async fn message_index_records_are_write_once() {
        let store = MemoryStore::new();
        let room_id = room_id!("!test:localhost");
        let now = MilliSecondsSinceUnixEpoch::now();

        let existing = store
            .record_message_index(room_id, "SESSIONID", 5, event_id!("$a"), now)
            .await
            .unwrap();
        assert!(existing.is_none());

        let existing = store
            .record_message_index(room_id, "SESSIONID", 5, event_id!("$b"), now)
            .await
            .unwrap();
        assert_eq!(existing.unwrap().0, event_id!("$a"));

        let record = store.get_message_index_record(room_id, "SESSIONID", 5).await.unwrap();
        assert_eq!(record.unwrap().0, event_id!("$a"));
    }

    #[tokio::test]
    async fn missing_devices_shrink_as_keys_are_marked_received() {
        let store = MemoryStore::new();
        let room_id = room_id!("!test:localhost");
        let alice = user_id!("@alice:example.org");
        let bob = user_id!("@bob:example.org");

        let mut candidates = DeviceSet::new();
        candidates.entry(alice.to_owned()).or_default().insert("A1".into());
        candidates.entry(bob.to_owned()).or_default().insert("B1".into());
        candidates.entry(bob.to_owned()).or_default().insert("B2".into());

        let missing = store
            .devices_missing_session_key(room_id, "SESSIONID", &candidates)
            .await
            .unwrap();
        assert_eq!(missing, candidates);

        let curve = vodozemac::olm::Account::new().curve25519_key();
        store
            .mark_devices_as_received_key(
                room_id,
                "SESSIONID",
                0,
                &[(bob.to_owned(), "B1".into(), curve)],
            )
            .await
            .unwrap();

        let missing = store
            .devices_missing_session_key(room_id, "SESSIONID", &candidates)
            .await
            .unwrap();

        assert_eq!(missing.get(alice).unwrap().len(), 1);
        assert_eq!(missing.get(bob).unwrap().len(), 1);
        assert!(missing.get(bob).unwrap().contains(&ruma::OwnedDeviceId::from("B2")));
    }
}
