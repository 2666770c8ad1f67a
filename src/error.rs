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

use ruma::{OwnedDeviceId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;
use vodozemac::{
    megolm::DecryptionError as MegolmDecryptionError,
    olm::{DecryptionError as OlmDecryptionError, SessionCreationError as OlmSessionCreationError},
    KeyError, SignatureError as VodozemacSignatureError,
};

use crate::store::CryptoStoreError;

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The underlying Olm session operation returned an error.
    #[error("can't finish the Olm session operation: {0}")]
    OlmSession(#[from] OlmDecryptionError),

    /// A new Olm session couldn't be created.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store: {0}")]
    Store(#[from] CryptoStoreError),

    /// Encryption failed because the device does not have a valid Olm session
    /// with us.
    #[error(
        "encryption failed because the device does not \
            have a valid Olm session with us"
    )]
    MissingSession,

    /// The group session machinery returned an error while a to-device
    /// event was being handled.
    #[error(transparent)]
    Megolm(Box<MegolmError>),
}

impl From<MegolmError> for OlmError {
    fn from(error: MegolmError) -> Self {
        match error {
            MegolmError::Store(e) => OlmError::Store(e),
            e => OlmError::Megolm(Box::new(e)),
        }
    }
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because the session needed to decrypt the event is
    /// missing.
    #[error("decryption failed because the session to decrypt the message is missing")]
    MissingSession,

    /// The underlying group session operation returned an error.
    #[error("can't finish the Megolm session operation: {0}")]
    Decryption(#[from] MegolmDecryptionError),

    /// The same message index was already recorded for a different event,
    /// either the message got replayed or the sender is reusing ratchet
    /// state.
    #[error(
        "the message at index {index} of session {session_id} was already \
         recorded for a different event"
    )]
    ReplayDetected {
        /// The unique id of the group session the replay was detected in.
        session_id: String,
        /// The Megolm message index that collided.
        index: u32,
    },

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error describing the content of events the E2EE core consumes.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("the encrypted message has been encrypted with a unsupported algorithm")]
    UnsupportedAlgorithm,

    #[error("the encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    #[error("the encrypted message is missing the field {0}")]
    MissingField(String),

    #[error("the sender of the plaintext doesn't match the sender of the encrypted message")]
    MismatchedSender,

    #[error("the plaintext wasn't meant for this account")]
    MismatchedRecipient,

    #[error("the keys of the message don't match the keys of the session it arrived through")]
    MismatchedKeys,
}

/// Error type describing failures to verify signed JSON objects.
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("the signature used a unsupported algorithm")]
    UnsupportedAlgorithm,

    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    #[error("the signing key couldn't be decoded: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("the signature couldn't be decoded: {0}")]
    InvalidSignature(#[from] vodozemac::Base64DecodeError),

    #[error("the signature didn't match the provided key: {0}")]
    VerificationError(#[from] VodozemacSignatureError),
}

/// Error type describing why creating a new Olm session with a device failed.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    #[error(
        "tried to create a new Olm session for {0} {1}, but the signed \
        one-time key is missing"
    )]
    OneTimeKeyMissing(OwnedUserId, OwnedDeviceId),

    #[error("failed to verify the one-time key signature for {0} {1}: {2}")]
    InvalidSignature(OwnedUserId, OwnedDeviceId, SignatureError),

    #[error(
        "tried to create an Olm session for {0} {1}, but the device is missing \
        a curve25519 key"
    )]
    DeviceMissingCurveKey(OwnedUserId, OwnedDeviceId),

    #[error("error creating a new inbound Olm session: {0}")]
    InboundCreation(#[from] OlmSessionCreationError),

    #[error("the session key of the room key couldn't be imported: {0}")]
    InvalidSessionKey(#[from] vodozemac::megolm::SessionKeyDecodeError),
}
