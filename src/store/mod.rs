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

//! The persistent store for all pickled key material and device tracking
//! state.
//!
//! The store is the single writer; the rest of the crate reads snapshots and
//! hands mutations back through the trait operations.

use core::fmt::Debug;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    io::Error as IoError,
    sync::Arc,
};

use async_trait::async_trait;
use ruma::{
    DeviceId, EventId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedUserId,
    RoomId, UserId,
};
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::sync::Mutex;
use vodozemac::{Curve25519PublicKey, PickleError};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    identities::Device,
    olm::{Account, InboundGroupSession, OutboundGroupSession, Session},
};

pub(crate) mod caches;
pub mod memorystore;

#[cfg(feature = "sqlite-cryptostore")]
pub mod sqlite;

pub use caches::UserDevices;
pub use memorystore::MemoryStore;
#[cfg(feature = "sqlite-cryptostore")]
pub use sqlite::SqliteStore;

/// The secret that encrypts every pickle blob the store writes.
///
/// The key is moved into the store when it is opened, never copied, and the
/// bytes are wiped when the key is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PicklingKey {
    inner: [u8; 32],
}

impl PicklingKey {
    /// The raw bytes of the key.
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.inner
    }
}

impl From<[u8; 32]> for PicklingKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self { inner: bytes }
    }
}

impl Debug for PicklingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PicklingKey { .. }")
    }
}

/// The crypto store's error type.
#[derive(Error, Debug)]
pub enum CryptoStoreError {
    /// The account that owns the sessions, group sessions, and devices wasn't
    /// found.
    #[error("can't save/load sessions or group sessions in the store before an account is stored")]
    AccountUnset,

    /// A pickle blob couldn't be decrypted, either the pickling key the
    /// store was opened with doesn't match the one the data was written
    /// under, or the data is corrupted.
    #[error("a stored pickle couldn't be decrypted with the provided pickling key: {0}")]
    MismatchedPicklingKey(#[from] PickleError),

    /// The schema of the opened database is newer than what this version
    /// supports.
    #[error("the database schema version {0} is newer than the supported version {1}")]
    UnsupportedSchemaVersion(u32, u32),

    /// SQL error occurred.
    #[cfg(feature = "sqlite-cryptostore")]
    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    /// An IO error occurred.
    #[error(transparent)]
    Io(#[from] IoError),

    /// The store failed to (de)serialize a data type.
    #[error(transparent)]
    Serialization(#[from] SerdeError),

    /// A stored identifier couldn't be parsed back.
    #[error(transparent)]
    Identifier(#[from] ruma::IdParseError),

    /// A stored public key couldn't be decoded.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),
}

pub type Result<T> = std::result::Result<T, CryptoStoreError>;

/// A recipient device of a room key, with the curve25519 key the key was
/// encrypted for and the ratchet index it was shared at.
pub type SharedDevice = (OwnedUserId, OwnedDeviceId, Curve25519PublicKey);

/// A map from users to the set of their devices.
pub type DeviceSet = BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>;

/// Trait abstracting the store that the `OlmMachine` uses to persist
/// cryptographic keys and device tracking state.
#[async_trait]
pub trait CryptoStore: Debug + Send + Sync {
    /// Load the account that was previously stored, together with the
    /// sessions, devices and tracking state belonging to it.
    async fn load_account(&self) -> Result<Option<Account>>;

    /// Save the given account in the store.
    async fn save_account(&self, account: Account) -> Result<()>;

    /// Save the given Olm sessions in the store, inserting new ones and
    /// updating the ratchet state and use times of known ones.
    async fn save_sessions(&self, sessions: &[Session]) -> Result<()>;

    /// Get all the Olm sessions that were established with the device owning
    /// the given curve25519 sender key.
    ///
    /// The sessions are ordered by their last use time, most recently used
    /// first, ties broken by session id.
    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>>;

    /// Save the given inbound group session in the store.
    ///
    /// Returns true if the session wasn't already in the store.
    async fn save_inbound_group_session(&self, session: InboundGroupSession) -> Result<bool>;

    /// Get the inbound group session with the given id for the given room.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Record that the message at `index` of the given group session
    /// decrypted to the event with the given id.
    ///
    /// If an event was already recorded at that index the existing record is
    /// returned untouched, letting the caller tell a replay of the same
    /// event apart from a forged one.
    async fn record_message_index(
        &self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
        event_id: &EventId,
        timestamp: MilliSecondsSinceUnixEpoch,
    ) -> Result<Option<(OwnedEventId, MilliSecondsSinceUnixEpoch)>>;

    /// Look up which event was recorded at the given message index.
    async fn get_message_index_record(
        &self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
    ) -> Result<Option<(OwnedEventId, MilliSecondsSinceUnixEpoch)>>;

    /// Save the current outbound group session of a room.
    async fn save_outbound_group_session(&self, session: OutboundGroupSession) -> Result<()>;

    /// Load the current outbound group session of a room.
    async fn load_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>>;

    /// Out of the given candidate devices, return the ones that haven't
    /// received the key of the given group session yet.
    async fn devices_missing_session_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
        devices: &DeviceSet,
    ) -> Result<DeviceSet>;

    /// Remember that the given devices received the key of the given group
    /// session at the given ratchet index.
    async fn mark_devices_as_received_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
        devices: &[SharedDevice],
    ) -> Result<()>;

    /// Add a user to the set of tracked users.
    ///
    /// Returns true if the user wasn't already tracked.
    ///
    /// # Arguments
    ///
    /// * `user` - The user that should be marked as tracked.
    ///
    /// * `dirty` - Should the user also be marked as outdated, so the next
    /// key query refreshes our view of their devices.
    async fn update_tracked_user(&self, user: &UserId, dirty: bool) -> Result<bool>;

    /// Stop tracking a user, dropping them from the outdated set as well.
    ///
    /// Returns true if the user was tracked before.
    async fn untrack_user(&self, user: &UserId) -> Result<bool>;

    /// Is the given user tracked.
    fn is_user_tracked(&self, user_id: &UserId) -> bool;

    /// Are there users whose device list is outdated.
    fn has_users_for_key_query(&self) -> bool;

    /// The set of tracked users whose device list is outdated.
    fn users_for_key_query(&self) -> HashSet<OwnedUserId>;

    /// Save the given devices in the store.
    async fn save_devices(&self, devices: &[Device]) -> Result<()>;

    /// Delete the given device from the store.
    async fn delete_device(&self, device: Device) -> Result<()>;

    /// Get the device for the given user with the given device id.
    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId)
        -> Result<Option<Device>>;

    /// Get all the devices of the given user.
    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices>;

    /// Was the device owning the given ed25519 identity key marked as
    /// verified.
    async fn is_device_verified(&self, ed25519_key: &str) -> Result<bool>;

    /// Mark the device owning the given ed25519 identity key as verified.
    ///
    /// Verification state is monotone, there is no operation to take it
    /// back.
    async fn mark_device_verified(&self, ed25519_key: &str) -> Result<()>;

    /// Remove all the encryption state of the given room: its inbound and
    /// outbound group sessions, message index records and room key
    /// bookkeeping.
    async fn clear_room_data(&self, room_id: &RoomId) -> Result<()>;

    /// Wipe the whole store.
    async fn clear(&self) -> Result<()>;
}
