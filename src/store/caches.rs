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

//! In-memory caches the store implementations share.

use std::{collections::HashMap, sync::Arc};

use dashmap::{DashMap, ReadOnlyView};
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::Mutex;

use crate::{
    identities::Device,
    olm::{InboundGroupSession, Session},
};

/// In-memory store for Olm sessions, keyed by the sender key of the peer.
///
/// Every per-sender list keeps the session that most recently produced valid
/// plaintext at the head.
#[derive(Clone, Debug, Default)]
pub(crate) struct SessionStore {
    entries: Arc<DashMap<String, Arc<Mutex<Vec<Session>>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the head of the sender key's list.
    ///
    /// Returns true if the session was added, false if it was already in the
    /// store.
    pub async fn add(&self, session: Session) -> bool {
        let sessions =
            self.entries.entry(session.sender_key.to_base64()).or_default().clone();
        let mut sessions = sessions.lock().await;

        if sessions.contains(&session) {
            false
        } else {
            sessions.insert(0, session);
            true
        }
    }

    /// Get all the sessions that belong to the given sender key.
    pub fn get(&self, sender_key: &str) -> Option<Arc<Mutex<Vec<Session>>>> {
        self.entries.get(sender_key).map(|s| s.clone())
    }

    /// Replace the list of sessions belonging to the sender key.
    pub fn set_for_sender(&self, sender_key: &str, sessions: Vec<Session>) {
        self.entries.insert(sender_key.to_owned(), Arc::new(Mutex::new(sessions)));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// In-memory store for inbound group sessions, keyed by room id and session
/// id.
#[derive(Clone, Debug, Default)]
pub(crate) struct GroupSessionStore {
    entries: Arc<DashMap<OwnedRoomId, HashMap<String, InboundGroupSession>>>,
}

impl GroupSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inbound group session to the store.
    ///
    /// Returns true if the session replaced nothing, false if a session with
    /// the same id was already present.
    pub fn add(&self, session: InboundGroupSession) -> bool {
        self.entries
            .entry(session.room_id.clone())
            .or_default()
            .insert(session.session_id().to_owned(), session)
            .is_none()
    }

    /// Get the inbound group session with the given id in the given room.
    pub fn get(&self, room_id: &RoomId, session_id: &str) -> Option<InboundGroupSession> {
        self.entries.get(room_id).and_then(|m| m.get(session_id).cloned())
    }

    /// Drop all the sessions of the given room.
    pub fn clear_room(&self, room_id: &RoomId) {
        self.entries.remove(room_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// In-memory store holding the known devices of other users.
#[derive(Clone, Debug, Default)]
pub(crate) struct DeviceStore {
    entries: Arc<DashMap<OwnedUserId, DashMap<OwnedDeviceId, Device>>>,
}

/// A read only view over all devices belonging to a user.
#[derive(Debug)]
pub struct UserDevices {
    entries: ReadOnlyView<OwnedDeviceId, Device>,
}

impl UserDevices {
    /// Get the specific device with the given device id.
    pub fn get(&self, device_id: &DeviceId) -> Option<Device> {
        self.entries.get(device_id).cloned()
    }

    /// Iterator over all the device ids of the user.
    pub fn keys(&self) -> impl Iterator<Item = &OwnedDeviceId> {
        self.entries.keys()
    }

    /// Iterator over all the devices of the user.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.entries.values()
    }

    /// The number of devices the user has.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Does the user have no known devices.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device to the store.
    ///
    /// Returns true if the device was added, false if a record for it
    /// already existed and was replaced.
    pub fn add(&self, device: Device) -> bool {
        self.entries
            .entry(device.user_id().to_owned())
            .or_default()
            .insert(device.device_id().to_owned(), device)
            .is_none()
    }

    /// Get the device with the given id belonging to the given user.
    pub fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Device> {
        self.entries.get(user_id).and_then(|m| m.get(device_id).map(|d| d.value().clone()))
    }

    /// Remove the device with the given id belonging to the given user.
    pub fn remove(&self, user_id: &UserId, device_id: &DeviceId) -> Option<Device> {
        self.entries.get(user_id).and_then(|m| m.remove(device_id)).map(|(_, d)| d)
    }

    /// Get a read-only view over all devices of the given user.
    pub fn user_devices(&self, user_id: &UserId) -> UserDevices {
        UserDevices {
            entries: self
                .entries
                .entry(user_id.to_owned())
                .or_default()
                .clone()
                .into_read_only(),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use ruma::room_id;

    use super::{GroupSessionStore, SessionStore};
    use crate::olm::{
        session::tests::session_pair, EncryptionSettings, InboundGroupSession,
        OutboundGroupSession,
    };

    #[tokio::test]
    async fn session_store_prefers_the_newest_session() {
        let (_alice, _bob, session) = session_pair().await;
        let (_, _, second_session) = session_pair().await;

        let store = SessionStore::new();

        assert!(store.add(session.clone()).await);
        assert!(!store.add(session.clone()).await);

        // The second session arrives later, it should end up at the head.
        let mut second = second_session.clone();
        second.sender_key = session.sender_key;
        store.add(second.clone()).await;

        let sessions = store.get(&session.sender_key.to_base64()).unwrap();
        let sessions = sessions.lock().await;

        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id(), second.session_id());
    }

    #[tokio::test]
    async fn group_session_store_is_keyed_by_room_and_session_id() {
        let account = vodozemac::olm::Account::new();
        let room_id = room_id!("!test:localhost");

        let outbound = OutboundGroupSession::new(room_id, EncryptionSettings::default());
        let inbound = InboundGroupSession::new(
            account.curve25519_key(),
            account.ed25519_key(),
            room_id,
            &outbound.session_key().await,
        );

        let store = GroupSessionStore::new();
        assert!(store.add(inbound.clone()));
        assert!(!store.add(inbound.clone()));

        let loaded = store.get(room_id, outbound.session_id()).unwrap();
        assert_eq!(inbound, loaded);

        assert!(store.get(room_id!("!other:localhost"), outbound.session_id()).is_none());

        store.clear_room(room_id);
        assert!(store.get(room_id, outbound.session_id()).is_none());
    }
}
