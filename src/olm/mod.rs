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

//! Thin wrappers over the vodozemac Olm and Megolm primitives.
//!
//! The primitives are treated as a pure cryptographic oracle; the types here
//! add the bookkeeping the rest of the crate needs: sender keys, timestamps,
//! rotation counters and encrypted pickled forms.

mod account;
mod group_sessions;
pub(crate) mod session;
pub(crate) mod utility;

pub use account::{Account, OneTimeKeys, PickledAccount};
pub use group_sessions::{
    EncryptionSettings, InboundGroupSession, OutboundGroupSession, PickledInboundGroupSession,
    PickledOutboundGroupSession,
};
pub use session::{PickledSession, Session};
pub use vodozemac::olm::IdentityKeys;
