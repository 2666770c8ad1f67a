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
    cmp::max,
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock as StdRwLock,
    },
    time::Duration,
};

use ruma::{
    DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::{
    megolm::{
        DecryptionError, GroupSession, GroupSessionPickle, InboundGroupSession as InnerSession,
        InboundGroupSessionPickle, MegolmMessage, SessionConfig, SessionKey,
    },
    Curve25519PublicKey, Ed25519PublicKey, PickleError,
};

use crate::{store::PicklingKey, types::algorithms};

const ROTATION_PERIOD: Duration = Duration::from_millis(604_800_000);
const ROTATION_MESSAGES: u64 = 100;

/// Settings for the group sessions of an encrypted room.
///
/// This determines the algorithm and the rotation policy of the room's
/// outbound group sessions.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: String,
    /// How long a session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
    /// Should the session be rotated when a device that received it leaves
    /// the recipient set.
    pub rotate_on_membership_change: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: algorithms::MEGOLM_V1_AES_SHA2.to_owned(),
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            rotate_on_membership_change: true,
        }
    }
}

/// Outbound group session, the encrypting half of a Megolm session.
///
/// One session is active per room at a time; it is rotated according to the
/// room's `EncryptionSettings`, when the recipient set shrinks, or when the
/// owner explicitly invalidates it.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<Mutex<GroupSession>>,
    session_id: Arc<str>,
    room_id: OwnedRoomId,
    pub(crate) creation_time: MilliSecondsSinceUnixEpoch,
    message_count: Arc<AtomicU64>,
    shared: Arc<AtomicBool>,
    invalidated: Arc<AtomicBool>,
    settings: Arc<EncryptionSettings>,
    shared_with_set: Arc<StdRwLock<BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>>>,
}

impl OutboundGroupSession {
    /// Create a new outbound group session for the given room.
    pub fn new(room_id: &RoomId, settings: EncryptionSettings) -> Self {
        let session = GroupSession::new(SessionConfig::version_1());
        let session_id = session.session_id();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            room_id: room_id.to_owned(),
            creation_time: MilliSecondsSinceUnixEpoch::now(),
            message_count: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(AtomicBool::new(false)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
            shared_with_set: Arc::new(StdRwLock::new(BTreeMap::new())),
        }
    }

    /// The unique identifier of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The encryption settings the session was created with.
    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    /// Encrypt the given plaintext using this session.
    ///
    /// Returns the ciphertext and the message index it was encrypted at.
    pub async fn encrypt(&self, plaintext: &str) -> (MegolmMessage, u32) {
        let mut session = self.inner.lock().await;
        let index = session.message_index();
        let message = session.encrypt(plaintext);
        self.message_count.fetch_add(1, Ordering::SeqCst);

        (message, index)
    }

    /// The message index the next encrypted message will use.
    pub async fn message_index(&self) -> u32 {
        self.inner.lock().await.message_index()
    }

    /// The exportable session key of this session.
    ///
    /// The key can be used to create an `InboundGroupSession` that decrypts
    /// from the current message index onwards.
    pub async fn session_key(&self) -> SessionKey {
        self.inner.lock().await.session_key()
    }

    fn elapsed(&self) -> bool {
        let creation_time = Duration::from_millis(self.creation_time.get().into());
        let now = Duration::from_millis(MilliSecondsSinceUnixEpoch::now().get().into());

        // The rotation period comes from user supplied settings, clamp it so
        // a session is usable for at least an hour.
        now.checked_sub(creation_time)
            .map(|elapsed| elapsed >= max(self.settings.rotation_period, Duration::from_secs(3600)))
            .unwrap_or(true)
    }

    /// Check if the session has expired and should be rotated.
    ///
    /// A session expires after a number of messages or after some time,
    /// whichever comes first.
    pub fn expired(&self) -> bool {
        let rotation_period_msgs = self.settings.rotation_period_msgs.clamp(1, 10_000);

        self.message_count.load(Ordering::SeqCst) >= rotation_period_msgs || self.elapsed()
    }

    /// Request that the session is rotated before the next use.
    pub fn invalidate_session(&self) {
        self.invalidated.store(true, Ordering::SeqCst)
    }

    /// Has the session been invalidated.
    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Mark the session as shared with the current recipient set.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::SeqCst);
    }

    /// Has the session been shared at least once.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// Remember that the given device received the session key.
    pub fn mark_shared_with(&self, user_id: &UserId, device_id: &DeviceId) {
        self.shared_with_set
            .write()
            .unwrap()
            .entry(user_id.to_owned())
            .or_default()
            .insert(device_id.to_owned());
    }

    /// Did any device of the given user receive the session key.
    pub fn is_shared_with_user(&self, user_id: &UserId) -> bool {
        self.shared_with_set.read().unwrap().get(user_id).is_some_and(|d| !d.is_empty())
    }

    /// Did the given device already receive the session key.
    pub fn is_shared_with(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.shared_with_set
            .read()
            .unwrap()
            .get(user_id)
            .is_some_and(|d| d.contains(device_id))
    }

    /// Check if a device that previously received the session key is missing
    /// from the given recipient set.
    ///
    /// Such a device can still decrypt messages at the current ratchet state,
    /// so the session has to be rotated to stop it from reading further
    /// messages.
    pub fn has_stale_recipients(
        &self,
        recipients: &BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>,
    ) -> bool {
        self.shared_with_set.read().unwrap().iter().any(|(user_id, devices)| {
            match recipients.get(user_id) {
                Some(current) => devices.difference(current).next().is_some(),
                None => !devices.is_empty(),
            }
        })
    }

    /// Store the session as an encrypted pickle.
    pub async fn pickle(&self, pickling_key: &PicklingKey) -> PickledOutboundGroupSession {
        let pickle = self.inner.lock().await.pickle().encrypt(pickling_key.as_bytes());

        PickledOutboundGroupSession {
            pickle,
            room_id: self.room_id.clone(),
            settings: (*self.settings).clone(),
            creation_time: self.creation_time,
            message_count: self.message_count.load(Ordering::SeqCst),
            shared: self.shared(),
            invalidated: self.invalidated(),
            shared_with_set: self.shared_with_set.read().unwrap().clone(),
        }
    }

    /// Restore a session from a previously stored pickle.
    pub fn from_pickle(
        pickle: PickledOutboundGroupSession,
        pickling_key: &PicklingKey,
    ) -> Result<Self, PickleError> {
        let session: GroupSession =
            GroupSessionPickle::from_encrypted(&pickle.pickle, pickling_key.as_bytes())?.into();
        let session_id = session.session_id();

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            room_id: pickle.room_id,
            creation_time: pickle.creation_time,
            message_count: Arc::new(AtomicU64::new(pickle.message_count)),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            invalidated: Arc::new(AtomicBool::new(pickle.invalidated)),
            settings: Arc::new(pickle.settings),
            shared_with_set: Arc::new(StdRwLock::new(pickle.shared_with_set)),
        })
    }
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

/// A pickled version of an `OutboundGroupSession`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PickledOutboundGroupSession {
    /// The encrypted pickle of the session.
    pub pickle: String,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The settings the session was created with.
    pub settings: EncryptionSettings,
    /// When the session was created.
    pub creation_time: MilliSecondsSinceUnixEpoch,
    /// How many messages the session encrypted so far.
    pub message_count: u64,
    /// Was the session shared with its recipients.
    pub shared: bool,
    /// Was the session invalidated.
    pub invalidated: bool,
    /// The devices the session key was sent to.
    pub shared_with_set: BTreeMap<OwnedUserId, BTreeSet<OwnedDeviceId>>,
}

/// Inbound group session, the decrypting half of a Megolm session.
///
/// Keyed by (room id, session id); the ratchet only moves forward, replay
/// protection on top of it is handled by the store's message index records.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,
    first_known_index: u32,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The curve25519 key of the account that sent us the session.
    pub sender_key: Curve25519PublicKey,
    /// The ed25519 key of the account that sent us the session.
    pub signing_key: Ed25519PublicKey,
}

impl InboundGroupSession {
    /// Create a new inbound group session from an exported session key.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
    ) -> Self {
        let session = InnerSession::new(session_key, SessionConfig::version_1());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            room_id: room_id.to_owned(),
            sender_key,
            signing_key,
        }
    }

    /// The unique identifier of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The first message index this session can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Decrypt the given ciphertext.
    ///
    /// Returns the plaintext and the message index the message was encrypted
    /// at.
    pub async fn decrypt(&self, message: &MegolmMessage) -> Result<(String, u32), DecryptionError> {
        let decrypted = self.inner.lock().await.decrypt(message)?;

        Ok((
            String::from_utf8_lossy(&decrypted.plaintext).to_string(),
            decrypted.message_index,
        ))
    }

    /// Store the session as an encrypted pickle.
    pub async fn pickle(&self, pickling_key: &PicklingKey) -> PickledInboundGroupSession {
        let pickle = self.inner.lock().await.pickle().encrypt(pickling_key.as_bytes());

        PickledInboundGroupSession {
            pickle,
            sender_key: self.sender_key,
            signing_key: self.signing_key,
            room_id: self.room_id.clone(),
        }
    }

    /// Restore a session from a previously stored pickle.
    pub fn from_pickle(
        pickle: PickledInboundGroupSession,
        pickling_key: &PicklingKey,
    ) -> Result<Self, PickleError> {
        let session = InnerSession::from_pickle(InboundGroupSessionPickle::from_encrypted(
            &pickle.pickle,
            pickling_key.as_bytes(),
        )?);
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            room_id: pickle.room_id,
            sender_key: pickle.sender_key,
            signing_key: pickle.signing_key,
        })
    }
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession").field("session_id", &self.session_id()).finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of an `InboundGroupSession`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PickledInboundGroupSession {
    /// The encrypted pickle of the session.
    pub pickle: String,
    /// The curve25519 key of the account that sent us the session.
    pub sender_key: Curve25519PublicKey,
    /// The ed25519 key of the account that sent us the session.
    pub signing_key: Ed25519PublicKey,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
}

#[cfg(test)]
mod tests {
    use ruma::room_id;

    use super::{EncryptionSettings, InboundGroupSession, OutboundGroupSession};
    use crate::store::PicklingKey;

    async fn sessions() -> (OutboundGroupSession, InboundGroupSession) {
        sessions_with_settings(EncryptionSettings::default()).await
    }

    async fn sessions_with_settings(
        settings: EncryptionSettings,
    ) -> (OutboundGroupSession, InboundGroupSession) {
        let account = vodozemac::olm::Account::new();
        let room_id = room_id!("!test:localhost");

        let outbound = OutboundGroupSession::new(room_id, settings);
        let inbound = InboundGroupSession::new(
            account.curve25519_key(),
            account.ed25519_key(),
            room_id,
            &outbound.session_key().await,
        );

        (outbound, inbound)
    }

    #[tokio::test]
    async fn group_message_round_trip() {
        let (outbound, inbound) = sessions().await;

        assert_eq!(outbound.session_id(), inbound.session_id());
        assert_eq!(outbound.message_index().await, 0);

        let (message, index) = outbound.encrypt("the fish flies at night").await;
        assert_eq!(index, 0);

        let (plaintext, decrypted_index) = inbound.decrypt(&message).await.unwrap();
        assert_eq!(plaintext, "the fish flies at night");
        assert_eq!(decrypted_index, 0);
    }

    #[tokio::test]
    async fn session_expires_after_the_configured_message_count() {
        let settings = EncryptionSettings { rotation_period_msgs: 1, ..Default::default() };
        let (outbound, _) = sessions_with_settings(settings).await;

        assert!(!outbound.expired());
        outbound.encrypt("one").await;
        assert!(outbound.expired());
    }

    #[tokio::test]
    async fn stale_recipient_detection() {
        use std::collections::{BTreeMap, BTreeSet};

        let (outbound, _) = sessions().await;

        let alice = ruma::user_id!("@alice:example.org");
        let bob = ruma::user_id!("@bob:example.org");
        outbound.mark_shared_with(alice, ruma::device_id!("ALICEDEVICE"));
        outbound.mark_shared_with(bob, ruma::device_id!("BOBDEVICE"));

        let mut recipients: BTreeMap<_, BTreeSet<_>> = BTreeMap::new();
        recipients
            .entry(alice.to_owned())
            .or_default()
            .insert(ruma::device_id!("ALICEDEVICE").to_owned());
        recipients
            .entry(bob.to_owned())
            .or_default()
            .insert(ruma::device_id!("BOBDEVICE").to_owned());

        assert!(!outbound.has_stale_recipients(&recipients));

        recipients.remove(bob);
        assert!(outbound.has_stale_recipients(&recipients));
    }

    #[tokio::test]
    async fn inbound_pickle_cycle() {
        let key = PicklingKey::from(*b"itsaseekreeto32byteslongitsaseek");
        let (_, inbound) = sessions().await;

        let pickle = inbound.pickle(&key).await;
        let restored = InboundGroupSession::from_pickle(pickle, &key).unwrap();

        assert_eq!(inbound, restored);
        assert_eq!(inbound.first_known_index(), restored.first_known_index());
    }
}
