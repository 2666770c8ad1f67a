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

//! Lifecycle hooks for interactive key verification flows.
//!
//! The interactive state machine itself lives outside of the E2EE core; the
//! core only keeps track of which flows exist, keyed by their transaction
//! id, so events can be routed to them and the owning client can be told
//! about new flows.

use std::sync::Arc;

use dashmap::DashMap;
use ruma::OwnedUserId;
use serde_json::Value;
use tracing::debug;

use crate::types::RawToDeviceEvent;

/// A handle to an in-progress key verification flow.
///
/// The handle only carries identity: the interactive steps are driven by the
/// verification subsystem of the owning client.
#[derive(Clone, Debug)]
pub struct VerificationSession {
    flow_id: Arc<str>,
    other_user: OwnedUserId,
}

impl VerificationSession {
    /// The transaction id that identifies this flow across devices.
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// The user on the other end of the verification flow.
    pub fn other_user_id(&self) -> &OwnedUserId {
        &self.other_user
    }
}

/// Registry of the active verification flows, keyed by transaction id.
///
/// Flows hold no back-reference to any crypto state; removing an entry when
/// the flow ends is all the cleanup there is.
#[derive(Clone, Debug, Default)]
pub(crate) struct VerificationRegistry {
    sessions: Arc<DashMap<String, VerificationSession>>,
}

impl VerificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the verification flow with the given transaction id.
    pub fn get(&self, flow_id: &str) -> Option<VerificationSession> {
        self.sessions.get(flow_id).map(|s| s.clone())
    }

    /// Route a `m.key.verification.*` event to the registry.
    ///
    /// Returns the flow id if the event started a flow we didn't know
    /// about yet.
    pub fn receive_event(&self, event: &RawToDeviceEvent) -> Option<String> {
        let flow_id = Self::transaction_id(&event.content)?;

        match event.event_type.as_str() {
            "m.key.verification.request" | "m.key.verification.start" => {
                if self.sessions.contains_key(&flow_id) {
                    None
                } else {
                    debug!(%flow_id, sender = %event.sender, "A new key verification flow started");

                    self.sessions.insert(
                        flow_id.clone(),
                        VerificationSession {
                            flow_id: flow_id.clone().into(),
                            other_user: event.sender.clone(),
                        },
                    );

                    Some(flow_id)
                }
            }
            "m.key.verification.cancel" => {
                if self.sessions.remove(&flow_id).is_some() {
                    debug!(%flow_id, "A key verification flow was cancelled");
                }

                None
            }
            // The intermediate steps belong to the interactive state
            // machine, the registry only needs the flow to exist.
            _ => None,
        }
    }

    fn transaction_id(content: &Value) -> Option<String> {
        content
            .get("transaction_id")
            .and_then(|t| t.as_str())
            .map(|t| t.to_owned())
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}
