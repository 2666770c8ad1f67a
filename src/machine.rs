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
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock as StdRwLock,
    },
};

use dashmap::DashMap;
use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId,
    UserId,
};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use vodozemac::{olm::IdentityKeys, Curve25519PublicKey};

use crate::{
    error::{EventError, MegolmResult, OlmError, OlmResult},
    identities::{manager::IdentityManager, Device, DeviceChanges},
    olm::{Account, EncryptionSettings},
    session_manager::{GroupSessionManager, SessionManager},
    store::{CryptoStore, DeviceSet, MemoryStore, SharedDevice},
    types::{
        AnyToDeviceEvent, DecryptedOlmEvent, EncryptedRoomEvent, EncryptedToDeviceContent,
        EncryptionSyncChanges, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
        KeysQueryResponse, KeysUploadRequest, KeysUploadResponse, RawToDeviceEvent,
        RoomEncryptedContent, RoomKeyContent, ToDeviceEvent, ToDeviceRequest, SIGNED_CURVE25519,
    },
    verification::{VerificationRegistry, VerificationSession},
};

/// Events that arrived before the Olm session of their sender key; the
/// oldest are dropped once the buffer is full.
const MAX_PENDING_ENCRYPTED_EVENTS: usize = 100;

/// The lifecycle state of an [`OlmMachine`].
///
/// A failed setup never produces a machine, so the uninitialized phase has
/// no representation here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineState {
    /// The account and the stored state are being loaded.
    Loading,
    /// The machine is idle and ready to process sync responses.
    Ready,
    /// A sync response is being processed.
    Syncing,
    /// The machine was cleared; all state is gone and the machine can't be
    /// used anymore.
    Cleared,
}

/// A room key that was received and accepted during a sync.
#[derive(Clone, Debug)]
pub struct RoomKeyInfo {
    /// The room the key belongs to.
    pub room_id: OwnedRoomId,
    /// The unique id of the group session.
    pub session_id: String,
    /// The curve25519 key of the device that sent us the key.
    pub sender_key: Curve25519PublicKey,
}

/// What processing the encryption parts of a sync response produced.
#[derive(Debug, Default)]
pub struct SyncProcessingResult {
    /// The room keys that were received and accepted.
    pub room_keys: Vec<RoomKeyInfo>,
    /// Verification flows that were started by this sync.
    pub new_verification_flows: Vec<String>,
}

/// A room key distribution that was handed out as a to-device request and
/// is waiting for its send confirmation.
#[derive(Debug)]
struct PendingKeyShare {
    room_id: OwnedRoomId,
    session_id: String,
    message_index: u32,
    devices: Vec<SharedDevice>,
}

/// State machine that handles the end-to-end encryption of a single device:
/// the account identity keys, the Olm channels to every peer device, the
/// Megolm sessions of every encrypted room and the view of other users'
/// devices.
///
/// The machine performs no I/O of its own; it consumes sync responses and
/// produces requests, and the owning client shuttles them over the wire.
#[derive(Clone)]
pub struct OlmMachine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    account: Account,
    store: Arc<dyn CryptoStore>,
    session_manager: SessionManager,
    group_session_manager: GroupSessionManager,
    identity_manager: IdentityManager,
    verification: VerificationRegistry,
    pending_encrypted_events: Arc<Mutex<VecDeque<ToDeviceEvent<EncryptedToDeviceContent>>>>,
    discarded_pending_events: Arc<AtomicU64>,
    outgoing_key_shares: Arc<DashMap<OwnedTransactionId, PendingKeyShare>>,
    is_uploading_keys: Arc<AtomicBool>,
    first_sync: Arc<AtomicBool>,
    state: Arc<StdRwLock<MachineState>>,
}

impl OlmMachine {
    /// Create a new machine that keeps all its state in memory.
    ///
    /// Everything is lost when the machine is dropped; mostly useful for
    /// tests and ephemeral clients.
    pub async fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self::with_store(user_id, device_id, Arc::new(MemoryStore::new()))
            .await
            .expect("the memory store can't fail to load")
    }

    /// Create a machine backed by the given store.
    ///
    /// The account is loaded from the store, or created and persisted on
    /// first run. A store that was written under a different pickling key
    /// fails the setup with `CryptoStoreError::MismatchedPicklingKey`.
    pub async fn with_store(
        user_id: &UserId,
        device_id: &DeviceId,
        store: Arc<dyn CryptoStore>,
    ) -> OlmResult<Self> {
        let state = Arc::new(StdRwLock::new(MachineState::Loading));

        let account = match store.load_account().await? {
            Some(account) => {
                debug!("Restored the account from the store");
                account
            }
            None => {
                let account = Account::new(user_id, device_id.as_str());
                info!("Created a new account");
                store.save_account(account.clone()).await?;
                account
            }
        };

        let session_manager = SessionManager::new(account.clone(), store.clone());
        let group_session_manager = GroupSessionManager::new(account.clone(), store.clone());
        let identity_manager = IdentityManager::new(account.clone(), store.clone());

        *state.write().unwrap() = MachineState::Ready;

        Ok(Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            account,
            store,
            session_manager,
            group_session_manager,
            identity_manager,
            verification: VerificationRegistry::new(),
            pending_encrypted_events: Arc::new(Mutex::new(VecDeque::new())),
            discarded_pending_events: Arc::new(AtomicU64::new(0)),
            outgoing_key_shares: Arc::new(DashMap::new()),
            is_uploading_keys: Arc::new(AtomicBool::new(false)),
            first_sync: Arc::new(AtomicBool::new(true)),
            state,
        })
    }

    /// Create a machine backed by a SQLite store in the given directory.
    #[cfg(feature = "sqlite-cryptostore")]
    pub async fn with_sqlite_store<P: AsRef<std::path::Path>>(
        user_id: &UserId,
        device_id: &DeviceId,
        path: P,
        pickling_key: crate::store::PicklingKey,
    ) -> OlmResult<Self> {
        let store =
            crate::store::SqliteStore::open(user_id, device_id, path, pickling_key).await?;

        Self::with_store(user_id, device_id, Arc::new(store)).await
    }

    /// The user this machine belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device this machine belongs to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public identity keys of our own device.
    pub fn identity_keys(&self) -> &IdentityKeys {
        self.account.identity_keys()
    }

    /// The current lifecycle state of the machine.
    pub fn state(&self) -> MachineState {
        *self.state.read().unwrap()
    }

    /// Has the first sync after the setup not completed yet.
    pub fn first_sync(&self) -> bool {
        self.first_sync.load(Ordering::SeqCst)
    }

    /// How many buffered events were dropped because the pending buffer
    /// overflowed.
    pub fn discarded_pending_events(&self) -> u64 {
        self.discarded_pending_events.load(Ordering::SeqCst)
    }

    /// Should the client upload new keys to the server.
    pub async fn should_upload_keys(&self) -> bool {
        if self.is_uploading_keys.load(Ordering::SeqCst) {
            return false;
        }

        self.account.should_upload_keys().await
    }

    /// Get the key upload request for the keys that need to be uploaded, if
    /// any.
    ///
    /// At most one upload is outstanding at a time. The response has to be
    /// passed back with [`receive_keys_upload_response`], a failed upload
    /// reported with [`keys_upload_failed`].
    ///
    /// [`receive_keys_upload_response`]: #method.receive_keys_upload_response
    /// [`keys_upload_failed`]: #method.keys_upload_failed
    pub async fn keys_for_upload(&self) -> Option<KeysUploadRequest> {
        if !self.account.should_upload_keys().await {
            return None;
        }

        if self.is_uploading_keys.swap(true, Ordering::SeqCst) {
            return None;
        }

        let device_keys =
            if self.account.shared() { None } else { Some(self.account.device_keys().await) };
        let one_time_keys = self.account.signed_one_time_keys().await;

        if device_keys.is_none() && one_time_keys.is_empty() {
            self.is_uploading_keys.store(false, Ordering::SeqCst);
            return None;
        }

        Some(KeysUploadRequest { device_keys, one_time_keys })
    }

    /// Receive a successful keys upload response.
    #[instrument(skip_all)]
    pub async fn receive_keys_upload_response(
        &self,
        response: &KeysUploadResponse,
    ) -> OlmResult<()> {
        if !self.account.shared() {
            debug!("Marking the account as shared");
        }
        self.account.mark_as_shared();

        let count =
            response.one_time_key_counts.get(SIGNED_CURVE25519).copied().unwrap_or_default();

        debug!(
            count,
            "Updated the one-time key count after a key upload, marking keys as published"
        );

        self.account.update_uploaded_key_count(count);
        self.account.mark_keys_as_published().await;
        self.store.save_account(self.account.clone()).await?;

        self.is_uploading_keys.store(false, Ordering::SeqCst);

        Ok(())
    }

    /// Report a failed key upload so a later tick can retry it.
    pub fn keys_upload_failed(&self) {
        self.is_uploading_keys.store(false, Ordering::SeqCst);
    }

    /// Get a `/keys/query` request for the users whose device list is
    /// outdated, if any. At most one query is outstanding at a time.
    pub async fn users_for_key_query(&self) -> Option<(OwnedTransactionId, KeysQueryRequest)> {
        self.identity_manager.users_for_key_query().await
    }

    /// Receive a successful `/keys/query` response.
    ///
    /// Devices that came back with a changed ed25519 identity are treated
    /// as new, untrusted devices, and the group sessions their users could
    /// read are invalidated.
    #[instrument(skip(self, response))]
    pub async fn receive_keys_query_response(
        &self,
        request_id: &TransactionId,
        response: &KeysQueryResponse,
    ) -> OlmResult<DeviceChanges> {
        let changes =
            self.identity_manager.receive_keys_query_response(request_id, response).await?;

        if !changes.replaced.is_empty() {
            let rekeyed_users: Vec<&UserId> =
                changes.replaced.iter().map(|d| d.user_id()).collect();

            self.group_session_manager
                .invalidate_sessions_with_users(&rekeyed_users)
                .await?;
        }

        Ok(changes)
    }

    /// Report a failed `/keys/query` so a later tick can retry it.
    pub async fn keys_query_failed(&self, request_id: &TransactionId) {
        self.identity_manager.query_failed(request_id).await;
    }

    /// Get a `/keys/claim` request for all the devices of the given users
    /// that we're missing an Olm session with, if any.
    pub async fn get_missing_sessions(
        &self,
        users: impl Iterator<Item = &UserId>,
    ) -> OlmResult<Option<(OwnedTransactionId, KeysClaimRequest)>> {
        self.session_manager.get_missing_sessions(users).await
    }

    /// Receive a successful `/keys/claim` response and establish the Olm
    /// sessions it allows.
    pub async fn receive_keys_claim_response(
        &self,
        request_id: &TransactionId,
        response: &KeysClaimResponse,
    ) -> OlmResult<()> {
        self.session_manager.receive_keys_claim_response(request_id, response).await
    }

    /// Report a failed `/keys/claim` so a later tick can retry it.
    pub async fn keys_claim_failed(&self, request_id: &TransactionId) {
        self.session_manager.claim_request_failed(request_id).await;
    }

    /// A room's encryption relevant membership changed.
    ///
    /// The given users are tracked from now on and marked as outdated, and
    /// every outbound group session they could read is invalidated so the
    /// next room message uses a fresh one.
    pub async fn encryption_update(&self, users: &[&UserId]) -> OlmResult<()> {
        self.identity_manager.update_tracked_users(users.iter().copied()).await?;
        self.group_session_manager.invalidate_sessions_with_users(users).await?;

        Ok(())
    }

    /// Look up a device record.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> OlmResult<Option<Device>> {
        Ok(self.store.get_device(user_id, device_id).await?)
    }

    /// Look up the curve25519 key a device advertised.
    pub async fn curve_key_for(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> OlmResult<Option<Curve25519PublicKey>> {
        self.identity_manager.curve_key_for(user_id, device_id).await
    }

    /// Does any device of the given user currently advertise the given
    /// curve25519 key.
    pub async fn is_known_curve_key(
        &self,
        user_id: &UserId,
        curve_key: Curve25519PublicKey,
    ) -> OlmResult<bool> {
        self.identity_manager.is_known_curve_key(user_id, curve_key).await
    }

    /// Do we have an Olm session with the given device.
    pub async fn has_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> OlmResult<bool> {
        self.session_manager.has_session(user_id, device_id).await
    }

    /// Mark a device as locally verified.
    ///
    /// The verification is keyed by the device's ed25519 identity; it
    /// doesn't carry over when the device rekeys.
    pub async fn mark_device_verified(&self, device: &Device) -> OlmResult<()> {
        let Some(key) = device.ed25519_key() else {
            return Err(EventError::MissingField("ed25519".to_owned()).into());
        };

        Ok(self.store.mark_device_verified(&key.to_base64()).await?)
    }

    /// Was the given device marked as locally verified.
    pub async fn is_device_verified(&self, device: &Device) -> OlmResult<bool> {
        match device.ed25519_key() {
            Some(key) => Ok(self.store.is_device_verified(&key.to_base64()).await?),
            None => Ok(false),
        }
    }

    /// Get the verification flow with the given transaction id.
    pub fn get_verification(&self, flow_id: &str) -> Option<VerificationSession> {
        self.verification.get(flow_id)
    }

    /// Distribute the current group session key of the room to the given
    /// devices.
    ///
    /// The active session is rotated first if its policy demands it. Only
    /// devices that are still missing the current session key and have an
    /// Olm session with us are included; establishing missing Olm sessions
    /// is the separate `/keys/claim` flow.
    ///
    /// The returned requests have to be confirmed with
    /// [`mark_room_key_request_as_sent`] once the transport accepted them;
    /// only then are the recipients remembered.
    ///
    /// [`mark_room_key_request_as_sent`]: #method.mark_room_key_request_as_sent
    #[instrument(skip(self, recipients, settings))]
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        recipients: &DeviceSet,
        settings: EncryptionSettings,
    ) -> OlmResult<Vec<ToDeviceRequest>> {
        let (session, created) = self
            .group_session_manager
            .get_or_create_outbound_session(room_id, recipients, settings)
            .await?;

        if created {
            debug!(
                %room_id,
                session_id = session.session_id(),
                "Sharing a fresh outbound group session"
            );
        }

        let missing = self
            .store
            .devices_missing_session_key(room_id, session.session_id(), recipients)
            .await?;

        let (room_key, message_index) =
            self.group_session_manager.room_key_content(&session).await;

        let mut request = ToDeviceRequest::new("m.room.encrypted");
        let mut shared_devices: Vec<SharedDevice> = Vec::new();

        for (user_id, device_ids) in missing {
            for device_id in device_ids {
                let Some(device) = self.store.get_device(&user_id, &device_id).await? else {
                    warn!(
                        %user_id,
                        %device_id,
                        "Can't share a room key with an unknown device"
                    );
                    continue;
                };

                match self
                    .session_manager
                    .encrypt(&device, "m.room_key", json!(&room_key))
                    .await
                {
                    Ok(content) => {
                        let curve_key = device
                            .curve25519_key()
                            .expect("an encryptable device has a curve25519 key");

                        request
                            .messages
                            .entry(user_id.clone())
                            .or_default()
                            .insert(device_id.clone(), json!(content));
                        shared_devices.push((user_id.clone(), device_id, curve_key));
                    }
                    Err(OlmError::MissingSession) => {
                        // The device has no Olm session and no fresh
                        // one-time key was claimable, skip it this run.
                        warn!(
                            %user_id,
                            %device_id,
                            "Can't share a room key with a device we have no Olm session with"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if request.messages.is_empty() {
            session.mark_as_shared();
            self.store.save_outbound_group_session(session).await?;

            return Ok(Vec::new());
        }

        info!(
            %room_id,
            session_id = session.session_id(),
            recipients = request.message_count(),
            "Built a room key distribution request"
        );

        self.outgoing_key_shares.insert(
            request.txn_id.clone(),
            PendingKeyShare {
                room_id: room_id.to_owned(),
                session_id: session.session_id().to_owned(),
                message_index,
                devices: shared_devices,
            },
        );

        Ok(vec![request])
    }

    /// Confirm that a room key distribution request was sent out.
    ///
    /// The recipient devices are recorded so they aren't sent the same
    /// session key again, and the session becomes usable for encryption.
    pub async fn mark_room_key_request_as_sent(
        &self,
        request_id: &TransactionId,
    ) -> OlmResult<()> {
        let Some((_, share)) = self.outgoing_key_shares.remove(request_id) else {
            warn!(
                ?request_id,
                "Marking a room key request as sent but no request was found with the given id"
            );
            return Ok(());
        };

        self.store
            .mark_devices_as_received_key(
                &share.room_id,
                &share.session_id,
                share.message_index,
                &share.devices,
            )
            .await?;

        if let Some(session) =
            self.group_session_manager.get_outbound_session(&share.room_id).await?
        {
            if session.session_id() == share.session_id {
                for (user_id, device_id, _) in &share.devices {
                    session.mark_shared_with(user_id, device_id);
                }
                session.mark_as_shared();
                self.store.save_outbound_group_session(session).await?;
            }
        }

        Ok(())
    }

    /// Encrypt a room message with the room's active group session.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        plaintext: &str,
    ) -> MegolmResult<RoomEncryptedContent> {
        self.group_session_manager.encrypt(room_id, plaintext).await
    }

    /// Decrypt a Megolm encrypted room event.
    pub async fn decrypt_room_event(
        &self,
        room_id: &RoomId,
        event: &EncryptedRoomEvent,
    ) -> MegolmResult<(String, u32)> {
        self.group_session_manager.decrypt_room_event(room_id, event).await
    }

    /// Remove all the encryption state of a room.
    pub async fn clear_room_data(&self, room_id: &RoomId) -> OlmResult<()> {
        Ok(self.store.clear_room_data(room_id).await?)
    }

    /// Wipe all the state of the machine.
    ///
    /// The account, all sessions and all device records are deleted; the
    /// machine can't be used afterwards.
    pub async fn clear(&self) -> OlmResult<()> {
        self.store.clear().await?;
        self.pending_encrypted_events.lock().await.clear();
        self.outgoing_key_shares.clear();
        self.verification.clear();
        *self.state.write().unwrap() = MachineState::Cleared;

        Ok(())
    }

    /// Process the encryption relevant parts of a sync response.
    ///
    /// To-device events are handled in received order and the device list
    /// deltas are applied before any later key distribution. A single
    /// undecryptable event never aborts the batch.
    #[instrument(skip_all)]
    pub async fn receive_sync_response(
        &self,
        changes: EncryptionSyncChanges,
    ) -> OlmResult<SyncProcessingResult> {
        *self.state.write().unwrap() = MachineState::Syncing;

        if let Some(count) = changes.one_time_key_counts.get(SIGNED_CURVE25519) {
            self.account.update_uploaded_key_count(*count);
        }

        let mut result = SyncProcessingResult::default();

        for event in &changes.to_device_events {
            self.receive_to_device_event(event, &mut result).await;
        }

        self.identity_manager
            .receive_device_changes(changes.changed_devices.changed.iter().map(|u| u.as_ref()))
            .await?;
        self.identity_manager
            .receive_left_users(changes.changed_devices.left.iter().map(|u| u.as_ref()))
            .await?;

        self.drain_pending_events(&mut result).await?;

        if self.first_sync.swap(false, Ordering::SeqCst) {
            debug!("Processed the first sync response after the setup");
        }

        *self.state.write().unwrap() = MachineState::Ready;

        Ok(result)
    }

    async fn receive_to_device_event(
        &self,
        event: &RawToDeviceEvent,
        result: &mut SyncProcessingResult,
    ) {
        let event = match AnyToDeviceEvent::from_raw(event) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Received a malformed to-device event");
                return;
            }
        };

        match event {
            AnyToDeviceEvent::Encrypted(e) => {
                match self.process_encrypted_event(&e, result).await {
                    Ok(()) => {}
                    Err(OlmError::MissingSession) => self.buffer_pending_event(e).await,
                    Err(error) => {
                        warn!(
                            sender = %e.sender,
                            %error,
                            "Failed to handle an encrypted to-device event"
                        );
                    }
                }
            }
            AnyToDeviceEvent::Verification(e) => {
                if let Some(flow_id) = self.verification.receive_event(&e) {
                    result.new_verification_flows.push(flow_id);
                }
            }
            AnyToDeviceEvent::RoomKey(e) => {
                // Room keys are only trustworthy when they arrive through
                // an Olm channel.
                warn!(sender = %e.sender, "Dropping an unencrypted m.room_key event");
            }
            AnyToDeviceEvent::Other(e) => {
                debug!(event_type = %e.event_type, "Ignoring a to-device event");
            }
        }
    }

    async fn process_encrypted_event(
        &self,
        event: &ToDeviceEvent<EncryptedToDeviceContent>,
        result: &mut SyncProcessingResult,
    ) -> OlmResult<()> {
        let content = &event.content;

        if !content.is_supported() {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        let own_key = self.account.identity_keys().curve25519.to_base64();
        let ciphertext =
            content.ciphertext.get(&own_key).ok_or(EventError::MissingCiphertext)?;

        let decrypted =
            self.session_manager.decrypt_olm_message(content.sender_key, ciphertext).await?;

        let olm_event: DecryptedOlmEvent = serde_json::from_str(&decrypted.plaintext)?;

        if olm_event.recipient != self.user_id {
            return Err(EventError::MismatchedRecipient.into());
        }

        if olm_event.recipient_keys.ed25519 != self.account.identity_keys().ed25519 {
            return Err(EventError::MismatchedKeys.into());
        }

        if olm_event.sender != event.sender {
            return Err(EventError::MismatchedSender.into());
        }

        match olm_event.event_type.as_str() {
            "m.room_key" => {
                let room_key: RoomKeyContent =
                    serde_json::from_value(olm_event.content.clone())?;

                let accepted = self
                    .group_session_manager
                    .receive_room_key(content.sender_key, olm_event.keys.ed25519, &room_key)
                    .await?;

                if accepted {
                    result.room_keys.push(RoomKeyInfo {
                        room_id: room_key.room_id,
                        session_id: room_key.session_id,
                        sender_key: content.sender_key,
                    });
                }
            }
            t if t.starts_with("m.key.verification.") => {
                let inner = RawToDeviceEvent {
                    sender: olm_event.sender.clone(),
                    event_type: olm_event.event_type.clone(),
                    content: olm_event.content.clone(),
                };

                if let Some(flow_id) = self.verification.receive_event(&inner) {
                    result.new_verification_flows.push(flow_id);
                }
            }
            t => {
                debug!(event_type = t, "Ignoring the decrypted content of a to-device event");
            }
        }

        Ok(())
    }

    async fn buffer_pending_event(&self, event: ToDeviceEvent<EncryptedToDeviceContent>) {
        let mut pending = self.pending_encrypted_events.lock().await;

        if pending.len() >= MAX_PENDING_ENCRYPTED_EVENTS {
            pending.pop_front();
            self.discarded_pending_events.fetch_add(1, Ordering::SeqCst);
            warn!("The pending encrypted event buffer overflowed, dropping the oldest event");
        }

        debug!(
            sender = %event.sender,
            sender_key = %event.content.sender_key,
            "Buffering an encrypted to-device event until a session for its \
             sender key shows up"
        );

        pending.push_back(event);
    }

    /// Retry the buffered events whose sender key gained a session, in the
    /// order they were buffered. Events that still have no session stay
    /// buffered.
    async fn drain_pending_events(&self, result: &mut SyncProcessingResult) -> OlmResult<()> {
        let buffered: Vec<_> =
            { self.pending_encrypted_events.lock().await.drain(..).collect() };

        for event in buffered {
            let has_session = match self
                .store
                .get_sessions(&event.content.sender_key.to_base64())
                .await?
            {
                Some(sessions) => !sessions.lock().await.is_empty(),
                None => false,
            };

            if !has_session {
                self.pending_encrypted_events.lock().await.push_back(event);
                continue;
            }

            match self.process_encrypted_event(&event, result).await {
                Ok(()) => {}
                Err(OlmError::MissingSession) => {
                    self.pending_encrypted_events.lock().await.push_back(event);
                }
                Err(error) => {
                    warn!(
                        sender = %event.sender,
                        %error,
                        "Failed to handle a buffered encrypted to-device event"
                    );
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ruma::{device_id, event_id, room_id, user_id, MilliSecondsSinceUnixEpoch, RoomId};
    use serde_json::json;

    use super::{MachineState, OlmMachine};
    use crate::{
        error::MegolmError,
        olm::{EncryptionSettings, OutboundGroupSession},
        store::DeviceSet,
        types::{
            algorithms, EncryptedRoomEvent, EncryptionSyncChanges, KeysClaimResponse,
            KeysQueryResponse, KeysUploadResponse, RawToDeviceEvent, RoomKeyContent,
            ToDeviceRequest, SIGNED_CURVE25519,
        },
    };

    fn room() -> &'static RoomId {
        room_id!("!test:example.org")
    }

    async fn alice() -> OlmMachine {
        OlmMachine::new(user_id!("@alice:example.org"), device_id!("ALICEDEVICE")).await
    }

    async fn bob() -> OlmMachine {
        OlmMachine::new(user_id!("@bob:example.org"), device_id!("BOBDEVICE")).await
    }

    async fn key_query_response_for(machine: &OlmMachine) -> KeysQueryResponse {
        let device_keys = machine.account.device_keys().await;

        let mut devices = BTreeMap::new();
        devices.insert(machine.device_id().to_owned(), device_keys);

        let mut response = KeysQueryResponse::default();
        response.device_keys.insert(machine.user_id().to_owned(), devices);

        response
    }

    async fn claim_response_for(machine: &OlmMachine) -> KeysClaimResponse {
        let mut one_time_keys = machine.account.signed_one_time_keys().await;
        let (key_id, key) = one_time_keys.pop_first().unwrap();

        let mut key_map = BTreeMap::new();
        key_map.insert(key_id, key);

        let mut devices = BTreeMap::new();
        devices.insert(machine.device_id().to_owned(), key_map);

        let mut response = KeysClaimResponse::default();
        response.one_time_keys.insert(machine.user_id().to_owned(), devices);

        response
    }

    /// Teach `machine` about `other`'s device and establish an Olm session
    /// with it, the way the sync loop would.
    async fn connect(machine: &OlmMachine, other: &OlmMachine) {
        machine.encryption_update(&[other.user_id()]).await.unwrap();

        let (request_id, _) = machine.users_for_key_query().await.unwrap();
        machine
            .receive_keys_query_response(&request_id, &key_query_response_for(other).await)
            .await
            .unwrap();

        if let Some((request_id, _)) =
            machine.get_missing_sessions([other.user_id()].into_iter()).await.unwrap()
        {
            machine
                .receive_keys_claim_response(&request_id, &claim_response_for(other).await)
                .await
                .unwrap();
        }
    }

    fn recipients_of(machines: &[&OlmMachine]) -> DeviceSet {
        let mut set = DeviceSet::new();

        for machine in machines {
            set.entry(machine.user_id().to_owned())
                .or_default()
                .insert(machine.device_id().to_owned());
        }

        set
    }

    /// Extract the to-device event a request carries for the given
    /// recipient machine.
    fn event_for(
        request: &ToDeviceRequest,
        sender: &OlmMachine,
        recipient: &OlmMachine,
    ) -> RawToDeviceEvent {
        let content = request
            .messages
            .get(recipient.user_id())
            .and_then(|m| m.get(&recipient.device_id().to_owned()))
            .expect("the request should carry a message for the recipient")
            .clone();

        RawToDeviceEvent {
            sender: sender.user_id().to_owned(),
            event_type: request.event_type.clone(),
            content,
        }
    }

    fn sync_with(events: Vec<RawToDeviceEvent>) -> EncryptionSyncChanges {
        EncryptionSyncChanges { to_device_events: events, ..Default::default() }
    }

    #[tokio::test]
    async fn fresh_setup_uploads_device_keys_and_one_time_keys() {
        let machine = alice().await;

        assert!(machine.first_sync());
        assert_eq!(machine.state(), MachineState::Ready);
        assert!(machine.should_upload_keys().await);

        let request = machine.keys_for_upload().await.unwrap();
        let target = machine.account.max_one_time_keys().await as u64 / 2;

        assert!(request.device_keys.is_some());
        assert_eq!(request.one_time_keys.len() as u64, target);

        // Only one upload may be outstanding.
        assert!(machine.keys_for_upload().await.is_none());

        let mut counts = BTreeMap::new();
        counts.insert(SIGNED_CURVE25519.to_owned(), target);
        machine
            .receive_keys_upload_response(&KeysUploadResponse { one_time_key_counts: counts })
            .await
            .unwrap();

        assert!(!machine.should_upload_keys().await);
        assert!(machine.keys_for_upload().await.is_none());

        machine.receive_sync_response(sync_with(Vec::new())).await.unwrap();
        assert!(!machine.first_sync());
    }

    #[tokio::test]
    async fn the_one_time_key_count_from_sync_drives_the_upload_gate() {
        let machine = alice().await;

        let request = machine.keys_for_upload().await.unwrap();
        let uploaded = request.one_time_keys.len() as u64;

        let mut counts = BTreeMap::new();
        counts.insert(SIGNED_CURVE25519.to_owned(), uploaded);
        machine
            .receive_keys_upload_response(&KeysUploadResponse { one_time_key_counts: counts })
            .await
            .unwrap();
        assert!(!machine.should_upload_keys().await);

        // The server used up most of our keys.
        let mut counts = BTreeMap::new();
        counts.insert(SIGNED_CURVE25519.to_owned(), 2u64);
        machine
            .receive_sync_response(EncryptionSyncChanges {
                one_time_key_counts: counts,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(machine.should_upload_keys().await);

        let request = machine.keys_for_upload().await.unwrap();
        assert!(request.device_keys.is_none());
        assert_eq!(request.one_time_keys.len() as u64, uploaded - 2);
    }

    #[tokio::test]
    async fn room_keys_are_shared_and_decrypt_room_messages() {
        let alice = alice().await;
        let bob = bob().await;

        connect(&alice, &bob).await;

        let recipients = recipients_of(&[&bob]);
        let mut requests = alice
            .share_room_key(room(), &recipients, EncryptionSettings::default())
            .await
            .unwrap();
        assert_eq!(requests.len(), 1);
        let request = requests.pop().unwrap();

        alice.mark_room_key_request_as_sent(&request.txn_id).await.unwrap();

        // Everyone has the key now, nothing further to distribute.
        let requests = alice
            .share_room_key(room(), &recipients, EncryptionSettings::default())
            .await
            .unwrap();
        assert!(requests.is_empty());

        // Bob processes the to-device event; a new Olm session and a new
        // inbound group session appear.
        let result = bob
            .receive_sync_response(sync_with(vec![event_for(&request, &alice, &bob)]))
            .await
            .unwrap();

        assert_eq!(result.room_keys.len(), 1);
        assert_eq!(result.room_keys[0].room_id, room());

        let content = alice.encrypt_room_event(room(), "it's a secret to everybody").await.unwrap();
        let event = EncryptedRoomEvent {
            sender: alice.user_id().to_owned(),
            event_id: event_id!("$a").to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            content,
        };

        let (plaintext, index) = bob.decrypt_room_event(room(), &event).await.unwrap();
        assert_eq!(plaintext, "it's a secret to everybody");
        assert_eq!(index, 0);

        // Replaying the ciphertext under a different event id is rejected.
        let mut replayed = event.clone();
        replayed.event_id = event_id!("$b").to_owned();
        assert!(matches!(
            bob.decrypt_room_event(room(), &replayed).await,
            Err(MegolmError::ReplayDetected { .. })
        ));
    }

    #[tokio::test]
    async fn a_parting_member_forces_a_fresh_session() {
        let alice = alice().await;
        let bob = bob().await;
        let carol =
            OlmMachine::new(user_id!("@carol:example.org"), device_id!("CAROLDEVICE")).await;

        connect(&alice, &bob).await;
        connect(&alice, &carol).await;

        // First message goes out to both.
        let everyone = recipients_of(&[&bob, &carol]);
        let mut requests = alice
            .share_room_key(room(), &everyone, EncryptionSettings::default())
            .await
            .unwrap();
        let request = requests.pop().unwrap();
        assert_eq!(request.message_count(), 2);
        alice.mark_room_key_request_as_sent(&request.txn_id).await.unwrap();

        let first_session =
            alice.store.load_outbound_group_session(room()).await.unwrap().unwrap();
        let first_message = alice.encrypt_room_event(room(), "hello everyone").await.unwrap();

        // Carol leaves; the next send rotates the session and distributes
        // it only to bob's device.
        let only_bob = recipients_of(&[&bob]);
        let mut requests = alice
            .share_room_key(room(), &only_bob, EncryptionSettings::default())
            .await
            .unwrap();
        let request = requests.pop().unwrap();

        assert_eq!(request.message_count(), 1);
        assert!(request.messages.contains_key(bob.user_id()));
        assert!(!request.messages.contains_key(carol.user_id()));
        alice.mark_room_key_request_as_sent(&request.txn_id).await.unwrap();

        let second_session =
            alice.store.load_outbound_group_session(room()).await.unwrap().unwrap();
        assert_ne!(first_session.session_id(), second_session.session_id());

        // The rotated-out session's inbound twin is retained, our own
        // history stays decryptable.
        let old_event = EncryptedRoomEvent {
            sender: alice.user_id().to_owned(),
            event_id: event_id!("$old").to_owned(),
            origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
            content: first_message,
        };
        let (plaintext, _) = alice.decrypt_room_event(room(), &old_event).await.unwrap();
        assert_eq!(plaintext, "hello everyone");
    }

    #[tokio::test]
    async fn encryption_update_invalidates_shared_sessions() {
        let alice = alice().await;
        let bob = bob().await;

        connect(&alice, &bob).await;

        let recipients = recipients_of(&[&bob]);
        let mut requests = alice
            .share_room_key(room(), &recipients, EncryptionSettings::default())
            .await
            .unwrap();
        alice.mark_room_key_request_as_sent(&requests.pop().unwrap().txn_id).await.unwrap();

        let first_session =
            alice.store.load_outbound_group_session(room()).await.unwrap().unwrap();

        alice.encryption_update(&[bob.user_id()]).await.unwrap();

        let mut requests = alice
            .share_room_key(room(), &recipients, EncryptionSettings::default())
            .await
            .unwrap();
        let request = requests.pop().unwrap();
        alice.mark_room_key_request_as_sent(&request.txn_id).await.unwrap();

        let second_session =
            alice.store.load_outbound_group_session(room()).await.unwrap().unwrap();
        assert_ne!(first_session.session_id(), second_session.session_id());
    }

    fn envelope(
        sender: &OlmMachine,
        recipient: &OlmMachine,
        event_type: &str,
        content: serde_json::Value,
    ) -> String {
        json!({
            "sender": sender.user_id(),
            "recipient": recipient.user_id(),
            "keys": { "ed25519": sender.account.identity_keys().ed25519.to_base64() },
            "recipient_keys": { "ed25519": recipient.account.identity_keys().ed25519.to_base64() },
            "type": event_type,
            "content": content,
        })
        .to_string()
    }

    fn encrypted_event(
        sender: &OlmMachine,
        recipient: &OlmMachine,
        message: &vodozemac::olm::OlmMessage,
    ) -> RawToDeviceEvent {
        RawToDeviceEvent {
            sender: sender.user_id().to_owned(),
            event_type: "m.room.encrypted".to_owned(),
            content: json!({
                "algorithm": algorithms::OLM_V1_CURVE25519_AES_SHA2,
                "sender_key": sender.account.identity_keys().curve25519.to_base64(),
                "ciphertext": {
                    (recipient.account.identity_keys().curve25519.to_base64()): message,
                },
            }),
        }
    }

    #[tokio::test]
    async fn events_without_a_session_are_buffered_until_one_appears() {
        use vodozemac::olm::OlmMessage;

        use crate::{olm::Account, store::PicklingKey};

        let alice = alice().await;
        let bob = bob().await;

        // Alice opens a session towards bob and sends a first message.
        let mut bob_keys = bob.account.signed_one_time_keys().await;
        let (_, one_time_key) = bob_keys.pop_first().unwrap();
        let mut alice_session = alice
            .account
            .create_outbound_session(bob.account.identity_keys().curve25519, one_time_key.key)
            .await;

        let first_message =
            alice_session.encrypt(&envelope(&alice, &bob, "m.dummy", json!({}))).await;

        // Bob answers from another process whose state never reaches this
        // machine; we replay that side from a pickled snapshot so the
        // one-time key of the live account stays untouched.
        let pickling_key = PicklingKey::from(*b"itsaseekreeto32byteslongitsaseek");
        let snapshot =
            Account::from_pickle(bob.account.pickle(&pickling_key).await, &pickling_key)
                .unwrap();

        let OlmMessage::PreKey(prekey) = &first_message else {
            panic!("the first message of a session is a pre-key message");
        };
        let mut bob_side = snapshot
            .create_inbound_session(alice.account.identity_keys().curve25519, prekey)
            .await
            .unwrap()
            .session;
        let reply = bob_side.encrypt("the reply").await;
        alice_session.decrypt(&reply).await.unwrap();

        // With the reply received, alice's next message is a normal Olm
        // message that only the established session can read.
        let late_room = room_id!("!late:example.org");
        let late_session = OutboundGroupSession::new(late_room, EncryptionSettings::default());
        let late_room_key = RoomKeyContent {
            algorithm: algorithms::MEGOLM_V1_AES_SHA2.to_owned(),
            room_id: late_room.to_owned(),
            session_id: late_session.session_id().to_owned(),
            session_key: late_session.session_key().await,
        };

        let second_message = alice_session
            .encrypt(&envelope(&alice, &bob, "m.room_key", json!(late_room_key)))
            .await;
        assert!(matches!(second_message, OlmMessage::Normal(_)));

        let later_room = room_id!("!later:example.org");
        let later_session = OutboundGroupSession::new(later_room, EncryptionSettings::default());
        let later_room_key = RoomKeyContent {
            algorithm: algorithms::MEGOLM_V1_AES_SHA2.to_owned(),
            room_id: later_room.to_owned(),
            session_id: later_session.session_id().to_owned(),
            session_key: later_session.session_key().await,
        };
        let third_message = alice_session
            .encrypt(&envelope(&alice, &bob, "m.room_key", json!(later_room_key)))
            .await;

        // This machine never saw the session; the messages can only be
        // buffered, in arrival order.
        let result = bob
            .receive_sync_response(sync_with(vec![
                encrypted_event(&alice, &bob, &second_message),
                encrypted_event(&alice, &bob, &third_message),
            ]))
            .await
            .unwrap();
        assert!(result.room_keys.is_empty());
        assert_eq!(bob.pending_encrypted_events.lock().await.len(), 2);

        // The session for alice's sender key materialises, here straight
        // through the store; the drain of the next sync decrypts the
        // buffered events in the order they were buffered.
        bob.store.save_sessions(&[bob_side.clone()]).await.unwrap();

        let result = bob.receive_sync_response(sync_with(Vec::new())).await.unwrap();

        assert_eq!(result.room_keys.len(), 2);
        assert_eq!(result.room_keys[0].room_id, late_room);
        assert_eq!(result.room_keys[0].session_id, late_session.session_id());
        assert_eq!(result.room_keys[1].room_id, later_room);
        assert_eq!(result.room_keys[1].session_id, later_session.session_id());

        // The buffer is empty again, nothing is delivered twice.
        assert!(bob.pending_encrypted_events.lock().await.is_empty());
        assert_eq!(bob.discarded_pending_events(), 0);
    }

    #[tokio::test]
    async fn verification_events_open_lifecycle_hooks() {
        let machine = alice().await;

        let result = machine
            .receive_sync_response(sync_with(vec![RawToDeviceEvent {
                sender: user_id!("@bob:example.org").to_owned(),
                event_type: "m.key.verification.request".to_owned(),
                content: json!({ "transaction_id": "txn" }),
            }]))
            .await
            .unwrap();

        assert_eq!(result.new_verification_flows, vec!["txn".to_owned()]);
        assert!(machine.get_verification("txn").is_some());
    }

    #[tokio::test]
    async fn clearing_the_machine_is_terminal() {
        let machine = alice().await;
        machine.clear().await.unwrap();

        assert_eq!(machine.state(), MachineState::Cleared);
        assert!(machine.store.load_account().await.unwrap().is_none());
    }
}
