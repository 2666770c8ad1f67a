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
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use ruma::{
    DeviceKeyAlgorithm, DeviceKeyId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId,
    UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use vodozemac::{
    olm::{
        Account as InnerAccount, AccountPickle, IdentityKeys, PreKeyMessage,
        SessionConfig,
    },
    Curve25519PublicKey, Ed25519Signature, PickleError,
};

use super::Session;
use crate::{
    error::{SessionCreationError, SignatureError},
    store::PicklingKey,
    types::{algorithms, DeviceKeys, SignedOneTimeKey},
};

/// A map from a one-time key id to the signed one-time key, ready to be
/// uploaded.
pub type OneTimeKeys = BTreeMap<String, SignedOneTimeKey>;

/// Account holding the long-lived identity keys of our own device.
///
/// An account is the central identity for encrypted communication between two
/// devices. Exactly one exists per (user, device) pair; it is created on
/// first run and restored from the store on every later run.
#[derive(Clone)]
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    inner: Arc<Mutex<InnerAccount>>,
    identity_keys: Arc<IdentityKeys>,
    shared: Arc<AtomicBool>,
    /// The number of signed one-time keys we have uploaded to the server.
    /// After a sync request the client updates this for us, depending on the
    /// count we suggest uploading new keys.
    uploaded_key_count: Arc<AtomicU64>,
}

/// The result of creating an inbound Olm session from a pre-key message.
pub(crate) struct InboundCreationResult {
    /// The newly created session.
    pub session: Session,
    /// The plaintext the pre-key message carried.
    pub plaintext: String,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .field("shared", &self.shared())
            .finish()
    }
}

impl Account {
    const ALGORITHMS: &'static [&'static str] =
        &[algorithms::OLM_V1_CURVE25519_AES_SHA2, algorithms::MEGOLM_V1_AES_SHA2];

    /// Create a fresh account with new identity keys.
    pub fn new(user_id: &UserId, device_id: &str) -> Self {
        let account = InnerAccount::new();
        let identity_keys = account.identity_keys();

        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.into(),
            inner: Arc::new(Mutex::new(account)),
            identity_keys: Arc::new(identity_keys),
            shared: Arc::new(AtomicBool::new(false)),
            uploaded_key_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The user that owns this account.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The id of the device that holds this account.
    pub fn device_id(&self) -> &OwnedDeviceId {
        &self.device_id
    }

    /// The public parts of the identity keys of the account.
    pub fn identity_keys(&self) -> &IdentityKeys {
        &self.identity_keys
    }

    /// Has the account been published to the server.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// Mark the account as published.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::SeqCst);
    }

    /// The number of one-time keys the server reports as unused.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_key_count.load(Ordering::SeqCst)
    }

    /// Update the count of one-time keys the server still holds for us.
    pub fn update_uploaded_key_count(&self, count: u64) {
        self.uploaded_key_count.store(count, Ordering::SeqCst);
    }

    /// Should new keys be uploaded to the server.
    ///
    /// True if the account was never published or if the server holds less
    /// than half of our one-time key target.
    pub async fn should_upload_keys(&self) -> bool {
        if !self.shared() {
            return true;
        }

        let max_keys = self.max_one_time_keys().await as u64;
        self.uploaded_key_count() < max_keys / 2
    }

    /// The maximum number of one-time keys the account can hold.
    pub async fn max_one_time_keys(&self) -> usize {
        self.inner.lock().await.max_number_of_one_time_keys()
    }

    /// Generate new one-time keys.
    ///
    /// Returns the number of newly generated keys, zero if the server already
    /// holds enough of them.
    pub(crate) async fn generate_one_time_keys(&self) -> u64 {
        let mut account = self.inner.lock().await;

        let max_keys = account.max_number_of_one_time_keys() as u64;
        let target = max_keys / 2;
        let count = target.saturating_sub(self.uploaded_key_count());

        if count != 0 {
            account.generate_one_time_keys(count as usize);
        }

        count
    }

    /// Mark the current set of one-time keys as published.
    pub(crate) async fn mark_keys_as_published(&self) {
        self.inner.lock().await.mark_keys_as_published();
    }

    /// The currently unpublished one-time keys of the account.
    pub(crate) async fn one_time_keys(
        &self,
    ) -> std::collections::HashMap<vodozemac::KeyId, Curve25519PublicKey> {
        self.inner.lock().await.one_time_keys()
    }

    /// Sign the given string using the account's ed25519 signing key.
    pub async fn sign(&self, message: &str) -> Ed25519Signature {
        self.inner.lock().await.sign(message.as_bytes())
    }

    /// Convert a JSON value into canonical form and sign it.
    pub async fn sign_json(&self, json: Value) -> Result<Ed25519Signature, SignatureError> {
        let serialized = super::utility::to_signable_json(json)?;
        Ok(self.sign(&serialized).await)
    }

    /// The signed device keys of this account, ready to be uploaded.
    pub async fn device_keys(&self) -> DeviceKeys {
        let mut keys = BTreeMap::new();

        keys.insert(
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, &self.device_id),
            self.identity_keys.curve25519.to_base64(),
        );
        keys.insert(
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
            self.identity_keys.ed25519.to_base64(),
        );

        let mut device_keys = DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: Self::ALGORITHMS.iter().map(|a| a.to_string()).collect(),
            keys,
            signatures: BTreeMap::new(),
            unsigned: None,
        };

        let signature = self
            .sign_json(json!(&device_keys))
            .await
            .expect("the device keys we construct are a JSON object");

        device_keys
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
                signature.to_base64(),
            );

        device_keys
    }

    /// Generate, sign and prepare one-time keys to be uploaded.
    ///
    /// Returns an empty map if the server already holds enough keys.
    pub async fn signed_one_time_keys(&self) -> OneTimeKeys {
        let generated = self.generate_one_time_keys().await;
        if generated == 0 {
            return OneTimeKeys::new();
        }

        let one_time_keys = self.inner.lock().await.one_time_keys();
        let mut signed_keys = OneTimeKeys::new();

        for (key_id, key) in one_time_keys {
            let signature = self
                .sign_json(json!({ "key": key.to_base64() }))
                .await
                .expect("the one-time key object is a JSON object");

            let mut signatures = BTreeMap::new();
            signatures.entry(self.user_id.clone()).or_insert_with(BTreeMap::new).insert(
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
                signature.to_base64(),
            );

            signed_keys.insert(
                format!("signed_curve25519:{}", key_id.to_base64()),
                SignedOneTimeKey { key, signatures },
            );
        }

        signed_keys
    }

    /// Create a new outbound session with the device that owns
    /// `their_identity_key`, consuming one of its one-time keys.
    ///
    /// The one-time key signature must have been verified by the caller.
    pub(crate) async fn create_outbound_session(
        &self,
        their_identity_key: Curve25519PublicKey,
        their_one_time_key: Curve25519PublicKey,
    ) -> Session {
        let session = self.inner.lock().await.create_outbound_session(
            SessionConfig::version_1(),
            their_identity_key,
            their_one_time_key,
        );

        let now = MilliSecondsSinceUnixEpoch::now();
        let session_id = session.session_id();

        Session {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: their_identity_key,
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Create a new inbound session from a pre-key message another device
    /// sent to us.
    pub(crate) async fn create_inbound_session(
        &self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult, SessionCreationError> {
        let result =
            self.inner.lock().await.create_inbound_session(their_identity_key, message)?;

        let now = MilliSecondsSinceUnixEpoch::now();
        let session_id = result.session.session_id();

        Ok(InboundCreationResult {
            session: Session {
                inner: Arc::new(Mutex::new(result.session)),
                session_id: session_id.into(),
                sender_key: their_identity_key,
                creation_time: now,
                last_use_time: now,
            },
            plaintext: String::from_utf8_lossy(&result.plaintext).to_string(),
        })
    }

    /// Store the account as an encrypted pickle.
    pub async fn pickle(&self, pickling_key: &PicklingKey) -> PickledAccount {
        let pickle = self.inner.lock().await.pickle().encrypt(pickling_key.as_bytes());

        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            pickle,
            shared: self.shared(),
            uploaded_signed_key_count: self.uploaded_key_count(),
        }
    }

    /// Restore an account from a previously stored pickle.
    pub fn from_pickle(
        pickle: PickledAccount,
        pickling_key: &PicklingKey,
    ) -> Result<Self, PickleError> {
        let account = InnerAccount::from_pickle(AccountPickle::from_encrypted(
            &pickle.pickle,
            pickling_key.as_bytes(),
        )?);
        let identity_keys = account.identity_keys();

        Ok(Self {
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            inner: Arc::new(Mutex::new(account)),
            identity_keys: Arc::new(identity_keys),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            uploaded_key_count: Arc::new(AtomicU64::new(pickle.uploaded_signed_key_count)),
        })
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.identity_keys() == other.identity_keys() && self.shared() == other.shared()
    }
}

/// A pickled version of an `Account`.
///
/// Holds all the information that needs to be stored in a database to
/// restore an account. The pickle string itself is encrypted under the
/// pickling key the store was opened with.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device id of the account owner.
    pub device_id: OwnedDeviceId,
    /// The encrypted pickle of the account.
    pub pickle: String,
    /// Was the account published to the server.
    pub shared: bool,
    /// The number of uploaded one-time keys the server reported.
    pub uploaded_signed_key_count: u64,
}
