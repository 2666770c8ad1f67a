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

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashSet;
use ruma::{OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId, UserId};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vodozemac::{olm::OlmMessage, Curve25519PublicKey};

use crate::{
    error::{OlmError, OlmResult, SessionCreationError},
    identities::Device,
    olm::Account,
    store::CryptoStore,
    types::{algorithms, EncryptedToDeviceContent, KeysClaimRequest, KeysClaimResponse},
};

/// The outcome of decrypting an Olm encrypted to-device message.
#[derive(Debug)]
pub(crate) struct OlmDecryptionResult {
    /// The decrypted plaintext.
    pub plaintext: String,
    /// Was a fresh inbound session created to decrypt the message.
    pub session_created: bool,
}

/// Manages the Olm sessions with every peer device.
///
/// Sessions for a sender key are kept ordered so that the session that most
/// recently produced valid plaintext is tried, and used for encryption,
/// first.
#[derive(Clone)]
pub(crate) struct SessionManager {
    account: Account,
    store: Arc<dyn CryptoStore>,
    /// Devices we already tried to claim a fresh one-time key for during
    /// this process lifetime. A device that had no keys available is skipped
    /// until the next restart instead of being hammered on every sync.
    tried_devices: Arc<DashSet<(OwnedUserId, OwnedDeviceId)>>,
    /// The in-flight `/keys/claim` request, if any.
    current_claim_request: Arc<Mutex<Option<(OwnedTransactionId, KeysClaimRequest)>>>,
}

impl SessionManager {
    pub fn new(account: Account, store: Arc<dyn CryptoStore>) -> Self {
        Self {
            account,
            store,
            tried_devices: Arc::new(DashSet::new()),
            current_claim_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Do we have an established Olm session with the given device.
    pub async fn has_session(&self, user_id: &UserId, device_id: &ruma::DeviceId) -> OlmResult<bool> {
        let Some(device) = self.store.get_device(user_id, device_id).await? else {
            return Ok(false);
        };
        let Some(sender_key) = device.curve25519_key() else {
            return Ok(false);
        };

        let sessions = self.store.get_sessions(&sender_key.to_base64()).await?;

        Ok(match sessions {
            Some(sessions) => !sessions.lock().await.is_empty(),
            None => false,
        })
    }

    /// Build a `/keys/claim` request for all the given users' devices that
    /// we don't have an Olm session with yet.
    ///
    /// Devices that previously had no one-time key available are skipped
    /// until the next restart. Returns `None` if nothing needs claiming or a
    /// claim is already in flight.
    pub async fn get_missing_sessions(
        &self,
        users: impl Iterator<Item = &UserId>,
    ) -> OlmResult<Option<(OwnedTransactionId, KeysClaimRequest)>> {
        let mut current_request = self.current_claim_request.lock().await;

        if current_request.is_some() {
            return Ok(None);
        }

        let mut missing: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>> = BTreeMap::new();

        for user_id in users {
            let devices = self.store.get_user_devices(user_id).await?;

            for device in devices.devices() {
                if !device.supports_olm() || device.curve25519_key().is_none() {
                    continue;
                }

                let key = (device.user_id().to_owned(), device.device_id().to_owned());

                if self.tried_devices.contains(&key) {
                    continue;
                }

                if !self.has_session(device.user_id(), device.device_id()).await? {
                    missing
                        .entry(device.user_id().to_owned())
                        .or_default()
                        .insert(device.device_id().to_owned(), "signed_curve25519".to_owned());
                }
            }
        }

        if missing.is_empty() {
            return Ok(None);
        }

        debug!(?missing, "Collected user/device pairs that are missing an Olm session");

        let request_id = TransactionId::new();
        let request = KeysClaimRequest { one_time_keys: missing };

        *current_request = Some((request_id.clone(), request.clone()));

        Ok(Some((request_id, request)))
    }

    /// Forget the in-flight claim request after a transient failure so the
    /// next tick can retry it.
    pub async fn claim_request_failed(&self, request_id: &TransactionId) {
        let mut current_request = self.current_claim_request.lock().await;

        if current_request.as_ref().is_some_and(|(id, _)| id == request_id) {
            *current_request = None;
        }
    }

    /// Receive a successful `/keys/claim` response and create new outbound
    /// Olm sessions with the claimed keys.
    ///
    /// Devices that were part of the request but got no key back are
    /// remembered and not asked again until the next restart.
    pub async fn receive_keys_claim_response(
        &self,
        request_id: &TransactionId,
        response: &KeysClaimResponse,
    ) -> OlmResult<()> {
        let request = {
            let mut current_request = self.current_claim_request.lock().await;

            match current_request.take() {
                Some((id, request)) if id == request_id => Some(request),
                Some(other) => {
                    warn!(
                        ?request_id,
                        expected_request_id = ?other.0,
                        "Received a `/keys/claim` response for the wrong request"
                    );
                    *current_request = Some(other);
                    None
                }
                None => None,
            }
        };

        if !response.failures.is_empty() {
            warn!(failures = ?response.failures.keys(), "Some homeservers couldn't be reached");
        }

        let mut new_sessions = Vec::new();

        for (user_id, device_map) in &response.one_time_keys {
            for (device_id, key_map) in device_map {
                let device = match self.store.get_device(user_id, device_id).await? {
                    Some(d) => d,
                    None => {
                        warn!(
                            %user_id,
                            %device_id,
                            "Received a one-time key for an unknown device",
                        );
                        continue;
                    }
                };

                match self.create_outbound_session(&device, key_map.values().next()).await {
                    Ok(session) => new_sessions.push(session),
                    Err(e) => {
                        warn!(
                            %user_id,
                            %device_id,
                            error = %e,
                            "Failed to create an Olm session from a claimed one-time key",
                        );
                    }
                }

                self.tried_devices
                    .insert((user_id.to_owned(), device_id.to_owned()));
            }
        }

        // Devices the server omitted from the response have no keys
        // available; remember them so we don't thrash.
        if let Some(request) = request {
            for (user_id, devices) in &request.one_time_keys {
                for device_id in devices.keys() {
                    let key = (user_id.clone(), device_id.clone());

                    if !self.tried_devices.contains(&key) {
                        info!(
                            %user_id,
                            %device_id,
                            "The device had no one-time key available, skipping it \
                             for the rest of this run",
                        );
                        self.tried_devices.insert(key);
                    }
                }
            }
        }

        if !new_sessions.is_empty() {
            info!(count = new_sessions.len(), "Established new Olm sessions");
            self.store.save_sessions(&new_sessions).await?;
            self.store.save_account(self.account.clone()).await?;
        }

        Ok(())
    }

    async fn create_outbound_session(
        &self,
        device: &Device,
        one_time_key: Option<&crate::types::SignedOneTimeKey>,
    ) -> Result<crate::olm::Session, SessionCreationError> {
        let one_time_key = one_time_key.ok_or_else(|| {
            SessionCreationError::OneTimeKeyMissing(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        device.verify_one_time_key(one_time_key).map_err(|e| {
            SessionCreationError::InvalidSignature(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
                e,
            )
        })?;

        let identity_key = device.curve25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        Ok(self.account.create_outbound_session(identity_key, one_time_key.key).await)
    }

    /// Decrypt an Olm message that arrived from the given sender key.
    ///
    /// Every existing session for the sender key is tried first, most
    /// recently used one leading. If none of them fits and the message is a
    /// pre-key message a fresh inbound session is created; the session that
    /// produced the plaintext is moved to the head of the list and
    /// persisted.
    pub async fn decrypt_olm_message(
        &self,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<OlmDecryptionResult> {
        let sender_key_b64 = sender_key.to_base64();

        if let Some(sessions) = self.store.get_sessions(&sender_key_b64).await? {
            let mut sessions = sessions.lock().await;

            for position in 0..sessions.len() {
                let mut session = sessions[position].clone();

                match session.decrypt(message).await {
                    Ok(plaintext) => {
                        sessions.remove(position);
                        sessions.insert(0, session.clone());
                        drop(sessions);

                        self.store.save_sessions(&[session]).await?;

                        return Ok(OlmDecryptionResult { plaintext, session_created: false });
                    }
                    Err(_) => continue,
                }
            }
        }

        let OlmMessage::PreKey(prekey) = message else {
            // A normal message for a session we don't have; the caller
            // buffers the event until a session for the sender key shows up.
            return Err(OlmError::MissingSession);
        };

        let result = self.account.create_inbound_session(sender_key, prekey).await?;

        debug!(
            sender_key = %sender_key_b64,
            session_id = result.session.session_id(),
            "Created a new inbound Olm session"
        );

        self.store.save_sessions(&[result.session]).await?;
        // Creating an inbound session removed the used one-time key from the
        // account, it has to hit the store before the next restart.
        self.store.save_account(self.account.clone()).await?;

        Ok(OlmDecryptionResult { plaintext: result.plaintext, session_created: true })
    }

    /// Encrypt a to-device event for the given device.
    ///
    /// An Olm session with the device has to exist; the head session of the
    /// sender key is used.
    pub async fn encrypt(
        &self,
        device: &Device,
        event_type: &str,
        content: Value,
    ) -> OlmResult<EncryptedToDeviceContent> {
        let sender_key = device.curve25519_key().ok_or(OlmError::MissingSession)?;
        let recipient_ed25519 = device.ed25519_key().ok_or(OlmError::MissingSession)?;

        let sessions =
            self.store.get_sessions(&sender_key.to_base64()).await?.ok_or(OlmError::MissingSession)?;
        let mut sessions = sessions.lock().await;
        let session = sessions.first_mut().ok_or(OlmError::MissingSession)?;

        let payload = json!({
            "sender": self.account.user_id(),
            "recipient": device.user_id(),
            "keys": { "ed25519": self.account.identity_keys().ed25519.to_base64() },
            "recipient_keys": { "ed25519": recipient_ed25519.to_base64() },
            "type": event_type,
            "content": content,
        });

        let ciphertext = session.encrypt(&payload.to_string()).await;
        let session = session.clone();
        drop(sessions);

        self.store.save_sessions(&[session]).await?;

        let mut ciphertext_map = BTreeMap::new();
        ciphertext_map.insert(sender_key.to_base64(), ciphertext);

        Ok(EncryptedToDeviceContent {
            algorithm: algorithms::OLM_V1_CURVE25519_AES_SHA2.to_owned(),
            sender_key: self.account.identity_keys().curve25519,
            ciphertext: ciphertext_map,
        })
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("user_id", &self.account.user_id())
            .finish()
    }
}
