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

use std::sync::Arc;

use dashmap::DashMap;
use ruma::{EventId, MilliSecondsSinceUnixEpoch, OwnedRoomId, RoomId};
use tracing::{debug, info, warn};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    error::{MegolmError, MegolmResult},
    olm::{Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession},
    store::{CryptoStore, DeviceSet},
    types::{algorithms, EncryptedRoomEvent, RoomEncryptedContent, RoomKeyContent},
};

/// Manages the Megolm sessions of every encrypted room.
///
/// The outbound side owns one active session per room and rotates it
/// according to the room settings; the inbound side registers the sessions
/// other devices send us and guards decryption against replays.
#[derive(Clone)]
pub(crate) struct GroupSessionManager {
    account: Account,
    store: Arc<dyn CryptoStore>,
    outbound_sessions: Arc<DashMap<OwnedRoomId, OutboundGroupSession>>,
}

impl GroupSessionManager {
    pub fn new(account: Account, store: Arc<dyn CryptoStore>) -> Self {
        Self { account, store, outbound_sessions: Arc::new(DashMap::new()) }
    }

    /// Get the active outbound session of the room, creating or rotating it
    /// if necessary.
    ///
    /// Returns the session and whether it is freshly created and still needs
    /// to be distributed.
    ///
    /// A session is rotated when the configured message count or age is
    /// exceeded, when it was explicitly invalidated, or when a device that
    /// already received the key is gone from the recipient set.
    pub async fn get_or_create_outbound_session(
        &self,
        room_id: &RoomId,
        recipients: &DeviceSet,
        settings: EncryptionSettings,
    ) -> MegolmResult<(OutboundGroupSession, bool)> {
        let existing = match self.outbound_sessions.get(room_id) {
            Some(s) => Some(s.clone()),
            None => {
                let loaded = self.store.load_outbound_group_session(room_id).await?;

                if let Some(s) = &loaded {
                    self.outbound_sessions.insert(room_id.to_owned(), s.clone());
                }

                loaded
            }
        };

        if let Some(session) = existing {
            let stale_recipients = session.settings().rotate_on_membership_change
                && session.has_stale_recipients(recipients);

            if !session.expired() && !session.invalidated() && !stale_recipients {
                return Ok((session, false));
            }

            info!(
                %room_id,
                session_id = session.session_id(),
                expired = session.expired(),
                invalidated = session.invalidated(),
                stale_recipients,
                "Rotating an outbound group session"
            );
        }

        let session = self.create_outbound_session(room_id, settings).await?;

        Ok((session, true))
    }

    /// Create a fresh outbound session for the room and register its inbound
    /// twin so we can decrypt our own messages.
    async fn create_outbound_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> MegolmResult<OutboundGroupSession> {
        let session = OutboundGroupSession::new(room_id, settings);

        let inbound = InboundGroupSession::new(
            self.account.identity_keys().curve25519,
            self.account.identity_keys().ed25519,
            room_id,
            &session.session_key().await,
        );

        self.store.save_inbound_group_session(inbound).await?;
        self.store.save_outbound_group_session(session.clone()).await?;
        self.outbound_sessions.insert(room_id.to_owned(), session.clone());

        debug!(%room_id, session_id = session.session_id(), "Created a new outbound group session");

        Ok(session)
    }

    /// The active outbound session of the room, from the cache or the
    /// store.
    pub async fn get_outbound_session(
        &self,
        room_id: &RoomId,
    ) -> MegolmResult<Option<OutboundGroupSession>> {
        match self.outbound_sessions.get(room_id) {
            Some(s) => Ok(Some(s.clone())),
            None => {
                let loaded = self.store.load_outbound_group_session(room_id).await?;

                if let Some(s) = &loaded {
                    self.outbound_sessions.insert(room_id.to_owned(), s.clone());
                }

                Ok(loaded)
            }
        }
    }

    /// Invalidate the active outbound session of the given room, if any.
    pub async fn invalidate_group_session(&self, room_id: &RoomId) -> MegolmResult<bool> {
        let session = match self.outbound_sessions.get(room_id) {
            Some(s) => Some(s.clone()),
            None => self.store.load_outbound_group_session(room_id).await?,
        };

        if let Some(session) = session {
            session.invalidate_session();
            self.store.save_outbound_group_session(session.clone()).await?;
            self.outbound_sessions.insert(room_id.to_owned(), session);

            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Invalidate the sessions of every room whose recipient set contains
    /// one of the given users.
    pub async fn invalidate_sessions_with_users(
        &self,
        users: &[&ruma::UserId],
    ) -> MegolmResult<()> {
        for entry in self.outbound_sessions.iter() {
            let session = entry.value();

            if users.iter().any(|u| session.is_shared_with_user(u)) {
                debug!(
                    room_id = %session.room_id(),
                    session_id = session.session_id(),
                    "Invalidating an outbound group session after a membership change"
                );
                session.invalidate_session();
                self.store.save_outbound_group_session(session.clone()).await?;
            }
        }

        Ok(())
    }

    /// Encrypt a room event with the active outbound session of the room.
    ///
    /// The session has to exist and must have been shared with the room's
    /// devices beforehand.
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        plaintext: &str,
    ) -> MegolmResult<RoomEncryptedContent> {
        let session = match self.outbound_sessions.get(room_id) {
            Some(s) => s.clone(),
            None => self
                .store
                .load_outbound_group_session(room_id)
                .await?
                .ok_or(MegolmError::MissingSession)?,
        };

        let (ciphertext, _index) = session.encrypt(plaintext).await;
        self.store.save_outbound_group_session(session.clone()).await?;

        Ok(RoomEncryptedContent {
            algorithm: algorithms::MEGOLM_V1_AES_SHA2.to_owned(),
            sender_key: self.account.identity_keys().curve25519,
            ciphertext,
            session_id: session.session_id().to_owned(),
            device_id: self.account.device_id().clone(),
        })
    }

    /// The content of the `m.room_key` event that distributes the active
    /// session of the room.
    pub async fn room_key_content(
        &self,
        session: &OutboundGroupSession,
    ) -> (RoomKeyContent, u32) {
        let content = RoomKeyContent {
            algorithm: algorithms::MEGOLM_V1_AES_SHA2.to_owned(),
            room_id: session.room_id().to_owned(),
            session_id: session.session_id().to_owned(),
            session_key: session.session_key().await,
        };
        let index = session.message_index().await;

        (content, index)
    }

    /// Register an inbound group session another device sent us in an
    /// `m.room_key` event.
    ///
    /// The session is imported if it is new or if its ratchet starts earlier
    /// than what we already have; otherwise the event is dropped.
    pub async fn receive_room_key(
        &self,
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        content: &RoomKeyContent,
    ) -> MegolmResult<bool> {
        if content.algorithm != algorithms::MEGOLM_V1_AES_SHA2 {
            warn!(
                algorithm = %content.algorithm,
                "Received a room key for an unsupported algorithm"
            );
            return Ok(false);
        }

        let session = InboundGroupSession::new(
            sender_key,
            signing_key,
            &content.room_id,
            &content.session_key,
        );

        if session.session_id() != content.session_id {
            warn!(
                session_id = %content.session_id,
                derived_session_id = session.session_id(),
                "The session id of a room key doesn't match its session key"
            );
            return Ok(false);
        }

        if let Some(existing) =
            self.store.get_inbound_group_session(&content.room_id, session.session_id()).await?
        {
            if existing.first_known_index() <= session.first_known_index() {
                debug!(
                    room_id = %content.room_id,
                    session_id = session.session_id(),
                    "Ignoring a room key we already know about"
                );
                return Ok(false);
            }
        }

        info!(
            room_id = %content.room_id,
            session_id = session.session_id(),
            "Received a new Megolm room key"
        );

        self.store.save_inbound_group_session(session).await?;

        Ok(true)
    }

    /// Decrypt a Megolm encrypted room event.
    ///
    /// Decryption fails with `ReplayDetected` when the message index was
    /// already recorded for a different event id; decrypting the same event
    /// again succeeds.
    pub async fn decrypt_room_event(
        &self,
        room_id: &RoomId,
        event: &EncryptedRoomEvent,
    ) -> MegolmResult<(String, u32)> {
        let session = self
            .store
            .get_inbound_group_session(room_id, &event.content.session_id)
            .await?
            .ok_or(MegolmError::MissingSession)?;

        let (plaintext, index) = session.decrypt(&event.content.ciphertext).await?;

        self.check_for_replay(room_id, &event.content.session_id, index, &event.event_id, event.origin_server_ts)
            .await?;

        Ok((plaintext, index))
    }

    async fn check_for_replay(
        &self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
        event_id: &EventId,
        timestamp: MilliSecondsSinceUnixEpoch,
    ) -> MegolmResult<()> {
        let existing = self
            .store
            .record_message_index(room_id, session_id, index, event_id, timestamp)
            .await?;

        if let Some((existing_event, _)) = existing {
            if existing_event != event_id {
                warn!(
                    %room_id,
                    session_id,
                    index,
                    %event_id,
                    %existing_event,
                    "The message index of an event collided with a different event, \
                     this is either a replay attack or a protocol error"
                );

                return Err(MegolmError::ReplayDetected {
                    session_id: session_id.to_owned(),
                    index,
                });
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for GroupSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSessionManager")
            .field("user_id", &self.account.user_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ruma::{event_id, room_id, user_id, MilliSecondsSinceUnixEpoch};

    use super::GroupSessionManager;
    use crate::{
        error::MegolmError,
        olm::{Account, EncryptionSettings},
        store::{CryptoStore, DeviceSet, MemoryStore},
        types::EncryptedRoomEvent,
    };

    async fn manager() -> GroupSessionManager {
        let store: Arc<dyn CryptoStore> = Arc::new(MemoryStore::new());
        let account = Account::new(user_id!("@alice:example.org"), "ALICEDEVICE");
        store.save_account(account.clone()).await.unwrap();

        GroupSessionManager::new(account, store)
    }

    fn recipients(pairs: &[(&ruma::UserId, &str)]) -> DeviceSet {
        let mut set = DeviceSet::new();

        for (user, device) in pairs {
            set.entry((*user).to_owned()).or_default().insert((*device).into());
        }

        set
    }

    #[tokio::test]
    async fn the_active_session_is_reused_until_it_rotates() {
        let manager = manager().await;
        let room_id = room_id!("!test:localhost");
        let recipients = recipients(&[(user_id!("@bob:example.org"), "B1")]);

        let (first, created) = manager
            .get_or_create_outbound_session(room_id, &recipients, EncryptionSettings::default())
            .await
            .unwrap();
        assert!(created);

        let (second, created) = manager
            .get_or_create_outbound_session(room_id, &recipients, EncryptionSettings::default())
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.session_id(), second.session_id());

        first.invalidate_session();

        let (third, created) = manager
            .get_or_create_outbound_session(room_id, &recipients, EncryptionSettings::default())
            .await
            .unwrap();
        assert!(created);
        assert_ne!(first.session_id(), third.session_id());
    }

    #[tokio::test]
    async fn a_leaving_device_rotates_the_session() {
        let manager = manager().await;
        let room_id = room_id!("!test:localhost");
        let bob = user_id!("@bob:example.org");
        let carol = user_id!("@carol:example.org");

        let both = recipients(&[(bob, "B1"), (carol, "C1")]);

        let (session, _) = manager
            .get_or_create_outbound_session(room_id, &both, EncryptionSettings::default())
            .await
            .unwrap();
        session.mark_shared_with(bob, ruma::device_id!("B1"));
        session.mark_shared_with(carol, ruma::device_id!("C1"));

        // Carol leaves the room.
        let only_bob = recipients(&[(bob, "B1")]);

        let (new_session, created) = manager
            .get_or_create_outbound_session(room_id, &only_bob, EncryptionSettings::default())
            .await
            .unwrap();

        assert!(created);
        assert_ne!(session.session_id(), new_session.session_id());
    }

    #[tokio::test]
    async fn we_can_decrypt_our_own_messages() {
        let manager = manager().await;
        let room_id = room_id!("!test:localhost");
        let recipients = recipients(&[(user_id!("@bob:example.org"), "B1")]);

        let (_session, _) = manager
            .get_or_create_outbound_session(room_id, &recipients, EncryptionSettings::default())
            .await
            .unwrap();

        let content = manager.encrypt(room_id, "it's a secret to everybody").await.unwrap();

        let event = EncryptedRoomEvent {
            sender: user_id!("@alice:example.org").to_owned(),
            event_id: event_id!("$a").to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            content,
        };

        let (plaintext, index) = manager.decrypt_room_event(room_id, &event).await.unwrap();
        assert_eq!(plaintext, "it's a secret to everybody");
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn replayed_indices_are_rejected_for_different_events() {
        let manager = manager().await;
        let room_id = room_id!("!test:localhost");
        let recipients = recipients(&[(user_id!("@bob:example.org"), "B1")]);

        manager
            .get_or_create_outbound_session(room_id, &recipients, EncryptionSettings::default())
            .await
            .unwrap();

        let content = manager.encrypt(room_id, "it's a secret to everybody").await.unwrap();

        let mut event = EncryptedRoomEvent {
            sender: user_id!("@alice:example.org").to_owned(),
            event_id: event_id!("$a").to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            content,
        };

        manager.decrypt_room_event(room_id, &event).await.unwrap();

        // The same event decrypts again.
        let (plaintext, _) = manager.decrypt_room_event(room_id, &event).await.unwrap();
        assert_eq!(plaintext, "it's a secret to everybody");

        // The same ciphertext under a different event id doesn't.
        event.event_id = event_id!("$b").to_owned();
        let result = manager.decrypt_room_event(room_id, &event).await;

        assert!(matches!(result, Err(MegolmError::ReplayDetected { .. })));
    }

    #[tokio::test]
    async fn received_room_keys_decrypt_the_senders_messages() {
        let alice_manager = manager().await;
        let room_id = room_id!("!test:localhost");
        let recipients = recipients(&[(user_id!("@bob:example.org"), "B1")]);

        let (session, _) = alice_manager
            .get_or_create_outbound_session(room_id, &recipients, EncryptionSettings::default())
            .await
            .unwrap();
        let (room_key, _index) = alice_manager.room_key_content(&session).await;

        // Bob receives the room key.
        let bob_store: Arc<dyn CryptoStore> = Arc::new(MemoryStore::new());
        let bob_account = Account::new(user_id!("@bob:example.org"), "B1");
        bob_store.save_account(bob_account.clone()).await.unwrap();
        let bob_manager = GroupSessionManager::new(bob_account, bob_store);

        let alice_keys = alice_manager.account.identity_keys();
        assert!(bob_manager
            .receive_room_key(alice_keys.curve25519, alice_keys.ed25519, &room_key)
            .await
            .unwrap());

        // Importing the same key again is a no-op.
        assert!(!bob_manager
            .receive_room_key(alice_keys.curve25519, alice_keys.ed25519, &room_key)
            .await
            .unwrap());

        let content = alice_manager.encrypt(room_id, "hi bob").await.unwrap();
        let event = EncryptedRoomEvent {
            sender: user_id!("@alice:example.org").to_owned(),
            event_id: event_id!("$a").to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            content,
        };

        let (plaintext, _) = bob_manager.decrypt_room_event(room_id, &event).await.unwrap();
        assert_eq!(plaintext, "hi bob");
    }
}
