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

//! The end-to-end encryption core of a Matrix client.
//!
//! This crate owns a device's long-lived identity keys, negotiates Olm
//! channels with peer devices, derives and distributes per-room Megolm
//! session keys, tracks the device inventory of other users, and persists
//! all of it across restarts in an encrypted store.
//!
//! It performs no I/O of its own: the [`OlmMachine`] consumes sync
//! responses and produces requests, and the surrounding client is
//! responsible for moving them over the wire.
//!
//! # Getting started
//!
//! ```no_run
//! use matrix_e2ee::{store::PicklingKey, OlmMachine};
//! use ruma::{device_id, user_id};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let machine = OlmMachine::with_sqlite_store(
//!     user_id!("@alice:example.org"),
//!     device_id!("ALICEDEVICE"),
//!     "/home/alice/.local/share/client",
//!     PicklingKey::from([0u8; 32]),
//! )
//! .await?;
//!
//! if let Some(_request) = machine.keys_for_upload().await {
//!     // Hand the request to the transport and pass the response back to
//!     // `machine.receive_keys_upload_response()`.
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_debug_implementations)]

mod error;
mod machine;
mod session_manager;
mod verification;

pub mod identities;
pub mod olm;
pub mod store;
pub mod types;

pub use error::{
    EventError, MegolmError, MegolmResult, OlmError, OlmResult, SessionCreationError,
    SignatureError,
};
pub use machine::{MachineState, OlmMachine, RoomKeyInfo, SyncProcessingResult};
pub use verification::VerificationSession;
