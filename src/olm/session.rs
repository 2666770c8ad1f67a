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

use std::{fmt, sync::Arc};

use ruma::MilliSecondsSinceUnixEpoch;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::{
    olm::{DecryptionError, OlmMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey, PickleError,
};

use crate::store::PicklingKey;

/// A ciphertext channel between our device and one other device.
///
/// Several sessions may exist for the same peer; the session manager prefers
/// the one that most recently produced valid plaintext.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<Mutex<InnerSession>>,
    pub(crate) session_id: Arc<str>,
    /// The curve25519 identity key of the peer device.
    pub sender_key: Curve25519PublicKey,
    /// When the session was created.
    pub creation_time: MilliSecondsSinceUnixEpoch,
    /// When the session last successfully encrypted or decrypted a message.
    pub last_use_time: MilliSecondsSinceUnixEpoch,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// The globally unique identifier of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Decrypt the given Olm message.
    ///
    /// Returns the decrypted plaintext or a `DecryptionError` if the message
    /// wasn't meant for this session.
    pub async fn decrypt(&mut self, message: &OlmMessage) -> Result<String, DecryptionError> {
        let plaintext = self.inner.lock().await.decrypt(message)?;
        self.last_use_time = MilliSecondsSinceUnixEpoch::now();

        Ok(String::from_utf8_lossy(&plaintext).to_string())
    }

    /// Encrypt the given plaintext as an Olm message.
    pub async fn encrypt(&mut self, plaintext: &str) -> OlmMessage {
        let message = self.inner.lock().await.encrypt(plaintext);
        self.last_use_time = MilliSecondsSinceUnixEpoch::now();

        message
    }

    /// Store the session as an encrypted pickle.
    pub async fn pickle(&self, pickling_key: &PicklingKey) -> PickledSession {
        let pickle = self.inner.lock().await.pickle().encrypt(pickling_key.as_bytes());

        PickledSession {
            pickle,
            sender_key: self.sender_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a session from a previously stored pickle.
    pub fn from_pickle(
        pickle: PickledSession,
        pickling_key: &PicklingKey,
    ) -> Result<Self, PickleError> {
        let session = InnerSession::from_pickle(SessionPickle::from_encrypted(
            &pickle.pickle,
            pickling_key.as_bytes(),
        )?);
        let session_id = session.session_id();

        Ok(Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        })
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of a `Session`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PickledSession {
    /// The encrypted pickle of the session.
    pub pickle: String,
    /// The curve25519 identity key of the peer device.
    pub sender_key: Curve25519PublicKey,
    /// When the session was created.
    pub creation_time: MilliSecondsSinceUnixEpoch,
    /// When the session was last used.
    pub last_use_time: MilliSecondsSinceUnixEpoch,
}

#[cfg(test)]
pub(crate) mod tests {
    use ruma::user_id;

    use super::Session;
    use crate::{olm::Account, store::PicklingKey};

    pub(crate) async fn session_pair() -> (Account, Account, Session) {
        let alice = Account::new(user_id!("@alice:example.org"), "ALICEDEVICE");
        let bob = Account::new(user_id!("@bob:example.org"), "BOBDEVICE");

        bob.generate_one_time_keys().await;
        let one_time_keys = bob.one_time_keys().await;
        let one_time_key =
            *one_time_keys.values().next().expect("bob should have a one-time key");

        let session = alice
            .create_outbound_session(bob.identity_keys().curve25519, one_time_key)
            .await;

        (alice, bob, session)
    }

    #[tokio::test]
    async fn olm_message_round_trip() {
        let (alice, bob, mut session) = session_pair().await;

        let message = session.encrypt("only bob should read this").await;

        let vodozemac::olm::OlmMessage::PreKey(prekey) = message else {
            panic!("the first message of a new session should be a pre-key message");
        };

        let result = bob
            .create_inbound_session(alice.identity_keys().curve25519, &prekey)
            .await
            .expect("bob should be able to create an inbound session");

        assert_eq!(result.plaintext, "only bob should read this");
        assert_eq!(result.session.session_id(), session.session_id());
    }

    #[tokio::test]
    async fn session_pickle_cycle() {
        let key = PicklingKey::from(*b"itsaseekreeto32byteslongitsaseek");
        let (_alice, _bob, session) = session_pair().await;

        let pickle = session.pickle(&key).await;
        let restored = Session::from_pickle(pickle, &key).unwrap();

        assert_eq!(session, restored);
        assert_eq!(session.sender_key, restored.sender_key);
    }
}
