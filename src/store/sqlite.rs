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
    collections::{BTreeSet, HashSet},
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use dashmap::DashSet;
use rusqlite::{params, Connection, OptionalExtension};
use ruma::{
    DeviceId, EventId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId,
    OwnedUserId, RoomId, UInt, UserId,
};
use tokio::sync::Mutex;
use tracing::debug;
use vodozemac::Curve25519PublicKey;

use super::{
    caches::{DeviceStore, GroupSessionStore, SessionStore},
    CryptoStore, CryptoStoreError, DeviceSet, PicklingKey, Result, SharedDevice, UserDevices,
};
use crate::{
    identities::Device,
    olm::{
        Account, InboundGroupSession, OutboundGroupSession, PickledAccount,
        PickledInboundGroupSession, PickledOutboundGroupSession, PickledSession, Session,
    },
};

/// The latest schema version; migrations are applied one step at a time
/// until the database reaches it.
const SCHEMA_VERSION: u32 = 5;

static DATABASE_NAME: &str = "matrix-e2ee.db";

/// SQLite based implementation of a `CryptoStore`.
///
/// All pickle blobs are stored encrypted under the `PicklingKey` the store
/// was opened with.
#[derive(Clone)]
pub struct SqliteStore {
    user_id: Arc<OwnedUserId>,
    device_id: Arc<OwnedDeviceId>,
    path: Arc<PathBuf>,

    sessions: SessionStore,
    inbound_group_sessions: GroupSessionStore,
    devices: DeviceStore,
    tracked_users: Arc<DashSet<OwnedUserId>>,
    users_for_key_query: Arc<DashSet<OwnedUserId>>,
    account_stored: Arc<AtomicBool>,

    connection: Arc<Mutex<Connection>>,
    pickling_key: Arc<PicklingKey>,
}

fn timestamp_to_i64(ts: MilliSecondsSinceUnixEpoch) -> i64 {
    u64::from(ts.get()) as i64
}

fn timestamp_from_i64(value: i64) -> MilliSecondsSinceUnixEpoch {
    MilliSecondsSinceUnixEpoch(UInt::try_from(value.max(0) as u64).unwrap_or_default())
}

impl SqliteStore {
    /// Open the store inside the given directory.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user the store belongs to.
    ///
    /// * `device_id` - The unique id of the device the store belongs to.
    ///
    /// * `path` - The directory the database file should reside in.
    ///
    /// * `pickling_key` - The key all pickle blobs are encrypted under. The
    /// key is moved into the store and zeroized when the store is dropped.
    pub async fn open<P: AsRef<Path>>(
        user_id: &UserId,
        device_id: &DeviceId,
        path: P,
        pickling_key: PicklingKey,
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let connection = Connection::open(path.join(DATABASE_NAME))?;

        let store = SqliteStore {
            user_id: Arc::new(user_id.to_owned()),
            device_id: Arc::new(device_id.to_owned()),
            path: Arc::new(path),
            sessions: SessionStore::new(),
            inbound_group_sessions: GroupSessionStore::new(),
            devices: DeviceStore::new(),
            tracked_users: Arc::new(DashSet::new()),
            users_for_key_query: Arc::new(DashSet::new()),
            account_stored: Arc::new(AtomicBool::new(false)),
            connection: Arc::new(Mutex::new(connection)),
            pickling_key: Arc::new(pickling_key),
        };
        store.run_migrations().await?;

        Ok(store)
    }

    /// The schema version of the opened database.
    pub async fn version(&self) -> Result<u32> {
        let connection = self.connection.lock().await;
        Self::read_version(&connection)
    }

    fn read_version(connection: &Connection) -> Result<u32> {
        connection
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .optional()
            .map(|v| v.unwrap_or(0))
            .map_err(CryptoStoreError::from)
    }

    async fn run_migrations(&self) -> Result<()> {
        let connection = self.connection.lock().await;

        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                \"version\" INTEGER NOT NULL
            );",
        )?;

        let mut version = Self::read_version(&connection)?;

        if version > SCHEMA_VERSION {
            return Err(CryptoStoreError::UnsupportedSchemaVersion(version, SCHEMA_VERSION));
        }

        // Each migration advances the schema exactly one step.
        while version < SCHEMA_VERSION {
            let transaction = connection.unchecked_transaction()?;

            match version {
                0 => Self::migrate_to_1(&transaction)?,
                1 => Self::migrate_to_2(&transaction)?,
                2 => Self::migrate_to_3(&transaction)?,
                3 => Self::migrate_to_4(&transaction)?,
                4 => Self::migrate_to_5(&transaction)?,
                _ => unreachable!("the schema version was checked against the supported range"),
            }

            version += 1;
            transaction.execute("DELETE FROM schema_version", [])?;
            transaction.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            transaction.commit()?;

            debug!(version, "Migrated the database schema");
        }

        Ok(())
    }

    fn migrate_to_1(connection: &Connection) -> rusqlite::Result<()> {
        connection.execute_batch(
            "CREATE TABLE accounts (
                \"user_id\" TEXT NOT NULL,
                \"device_id\" TEXT NOT NULL,
                \"pickle\" TEXT NOT NULL,
                \"shared\" INTEGER NOT NULL,
                \"uploaded_key_count\" INTEGER NOT NULL,
                UNIQUE(user_id, device_id)
            );

            CREATE TABLE olm_sessions (
                \"session_id\" TEXT NOT NULL PRIMARY KEY,
                \"sender_key\" TEXT NOT NULL,
                \"pickle\" TEXT NOT NULL,
                \"creation_time\" INTEGER NOT NULL,
                \"last_received\" INTEGER NOT NULL
            );

            CREATE INDEX \"olm_sessions_sender_key\" ON \"olm_sessions\" (\"sender_key\");",
        )
    }

    fn migrate_to_2(connection: &Connection) -> rusqlite::Result<()> {
        connection.execute_batch(
            "CREATE TABLE inbound_megolm (
                \"room_id\" TEXT NOT NULL,
                \"session_id\" TEXT NOT NULL,
                \"sender_key\" TEXT NOT NULL,
                \"signing_key\" TEXT NOT NULL,
                \"pickle\" TEXT NOT NULL,
                PRIMARY KEY(room_id, session_id)
            );

            CREATE TABLE outbound_megolm (
                \"room_id\" TEXT NOT NULL PRIMARY KEY,
                \"pickle\" TEXT NOT NULL,
                \"creation_ts\" INTEGER NOT NULL,
                \"message_count\" INTEGER NOT NULL
            );",
        )
    }

    fn migrate_to_3(connection: &Connection) -> rusqlite::Result<()> {
        connection.execute_batch(
            "CREATE TABLE group_session_index (
                \"room_id\" TEXT NOT NULL,
                \"session_id\" TEXT NOT NULL,
                \"idx\" INTEGER NOT NULL,
                \"event_id\" TEXT NOT NULL,
                \"ts\" INTEGER NOT NULL,
                PRIMARY KEY(room_id, session_id, idx)
            );

            CREATE TABLE sent_megolm_sessions (
                \"room_id\" TEXT NOT NULL,
                \"session_id\" TEXT NOT NULL,
                \"user_id\" TEXT NOT NULL,
                \"device_id\" TEXT NOT NULL,
                \"curve_key\" TEXT NOT NULL,
                \"idx\" INTEGER NOT NULL,
                PRIMARY KEY(room_id, session_id, user_id, device_id)
            );",
        )
    }

    fn migrate_to_4(connection: &Connection) -> rusqlite::Result<()> {
        connection.execute_batch(
            "CREATE TABLE tracked_users (
                \"user_id\" TEXT NOT NULL PRIMARY KEY,
                \"outdated\" INTEGER NOT NULL
            );

            CREATE TABLE device_keys (
                \"user_id\" TEXT NOT NULL,
                \"device_id\" TEXT NOT NULL,
                \"ed25519\" TEXT,
                \"curve25519\" TEXT,
                \"display_name\" TEXT,
                \"json\" TEXT NOT NULL,
                PRIMARY KEY(user_id, device_id)
            );",
        )
    }

    fn migrate_to_5(connection: &Connection) -> rusqlite::Result<()> {
        connection.execute_batch(
            "CREATE TABLE verified_devices (
                \"ed_key_id\" TEXT NOT NULL PRIMARY KEY
            );",
        )
    }

    fn ensure_account_stored(&self) -> Result<()> {
        if self.account_stored.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CryptoStoreError::AccountUnset)
        }
    }

    async fn load_sessions_for(&self, sender_key: &str) -> Result<Vec<Session>> {
        let connection = self.connection.lock().await;

        let mut statement = connection.prepare(
            "SELECT pickle, sender_key, creation_time, last_received
             FROM olm_sessions WHERE sender_key = ?1
             ORDER BY last_received DESC, session_id ASC",
        )?;

        let rows = statement.query_map([sender_key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut sessions = Vec::new();

        for row in rows {
            let (pickle, sender_key, creation_time, last_received) = row?;

            let pickle = PickledSession {
                pickle,
                sender_key: Curve25519PublicKey::from_base64(&sender_key)?,
                creation_time: timestamp_from_i64(creation_time),
                last_use_time: timestamp_from_i64(last_received),
            };

            sessions.push(Session::from_pickle(pickle, &self.pickling_key)?);
        }

        Ok(sessions)
    }

    async fn lazy_load_sessions(&self, sender_key: &str) -> Result<()> {
        if self.sessions.get(sender_key).is_none() {
            let sessions = self.load_sessions_for(sender_key).await?;

            if !sessions.is_empty() {
                self.sessions.set_for_sender(sender_key, sessions);
            }
        }

        Ok(())
    }

    async fn load_inbound_group_sessions(&self) -> Result<()> {
        let connection = self.connection.lock().await;

        let mut statement = connection.prepare(
            "SELECT room_id, sender_key, signing_key, pickle FROM inbound_megolm",
        )?;

        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        for row in rows {
            let (room_id, sender_key, signing_key, pickle) = row?;

            let pickle = PickledInboundGroupSession {
                pickle,
                sender_key: Curve25519PublicKey::from_base64(&sender_key)?,
                signing_key: vodozemac::Ed25519PublicKey::from_base64(&signing_key)?,
                room_id: RoomId::parse(room_id)?,
            };

            self.inbound_group_sessions
                .add(InboundGroupSession::from_pickle(pickle, &self.pickling_key)?);
        }

        Ok(())
    }

    async fn load_devices(&self) -> Result<()> {
        let connection = self.connection.lock().await;

        let mut statement = connection.prepare("SELECT json FROM device_keys")?;
        let rows = statement.query_map([], |row| row.get::<_, String>(0))?;

        for row in rows {
            let device: Device = serde_json::from_str(&row?)?;
            self.devices.add(device);
        }

        Ok(())
    }

    async fn load_tracked_users(&self) -> Result<()> {
        let connection = self.connection.lock().await;

        let mut statement = connection.prepare("SELECT user_id, outdated FROM tracked_users")?;
        let rows = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)))?;

        for row in rows {
            let (user_id, outdated) = row?;

            let Ok(user_id) = UserId::parse(user_id) else { continue };

            self.tracked_users.insert(user_id.clone());
            if outdated {
                self.users_for_key_query.insert(user_id);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl CryptoStore for SqliteStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        let row = {
            let connection = self.connection.lock().await;

            connection
                .query_row(
                    "SELECT pickle, shared, uploaded_key_count FROM accounts
                     WHERE user_id = ?1 AND device_id = ?2",
                    params![self.user_id.as_str(), self.device_id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, bool>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()?
        };

        let Some((pickle, shared, uploaded_key_count)) = row else {
            return Ok(None);
        };

        let pickle = PickledAccount {
            user_id: (*self.user_id).clone(),
            device_id: (*self.device_id).clone(),
            pickle,
            shared,
            uploaded_signed_key_count: uploaded_key_count.max(0) as u64,
        };

        let account = Account::from_pickle(pickle, &self.pickling_key)?;
        self.account_stored.store(true, Ordering::SeqCst);

        self.load_inbound_group_sessions().await?;
        self.load_devices().await?;
        self.load_tracked_users().await?;

        Ok(Some(account))
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        let pickle = account.pickle(&self.pickling_key).await;
        let connection = self.connection.lock().await;

        connection.execute(
            "INSERT INTO accounts (
                user_id, device_id, pickle, shared, uploaded_key_count
             ) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, device_id) DO UPDATE SET
                pickle = excluded.pickle,
                shared = excluded.shared,
                uploaded_key_count = excluded.uploaded_key_count",
            params![
                pickle.user_id.as_str(),
                pickle.device_id.as_str(),
                pickle.pickle,
                pickle.shared,
                pickle.uploaded_signed_key_count as i64,
            ],
        )?;

        self.account_stored.store(true, Ordering::SeqCst);

        Ok(())
    }

    async fn save_sessions(&self, sessions: &[Session]) -> Result<()> {
        self.ensure_account_stored()?;

        for session in sessions {
            self.lazy_load_sessions(&session.sender_key.to_base64()).await?;
            self.sessions.add(session.clone()).await;
        }

        let mut pickles = Vec::with_capacity(sessions.len());
        for session in sessions {
            pickles.push((session, session.pickle(&self.pickling_key).await));
        }

        let connection = self.connection.lock().await;
        let transaction = connection.unchecked_transaction()?;

        for (session, pickle) in &pickles {
            transaction.execute(
                "INSERT INTO olm_sessions (
                    session_id, sender_key, pickle, creation_time, last_received
                 ) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_id) DO UPDATE SET
                    pickle = excluded.pickle,
                    last_received = excluded.last_received",
                params![
                    session.session_id(),
                    pickle.sender_key.to_base64(),
                    pickle.pickle,
                    timestamp_to_i64(pickle.creation_time),
                    timestamp_to_i64(pickle.last_use_time),
                ],
            )?;
        }

        transaction.commit()?;

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        self.lazy_load_sessions(sender_key).await?;
        Ok(self.sessions.get(sender_key))
    }

    async fn save_inbound_group_session(&self, session: InboundGroupSession) -> Result<bool> {
        self.ensure_account_stored()?;

        let pickle = session.pickle(&self.pickling_key).await;
        let session_id = session.session_id().to_owned();

        {
            let connection = self.connection.lock().await;

            connection.execute(
                "INSERT INTO inbound_megolm (
                    room_id, session_id, sender_key, signing_key, pickle
                 ) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(room_id, session_id) DO UPDATE SET
                    sender_key = excluded.sender_key,
                    signing_key = excluded.signing_key,
                    pickle = excluded.pickle",
                params![
                    pickle.room_id.as_str(),
                    session_id,
                    pickle.sender_key.to_base64(),
                    pickle.signing_key.to_base64(),
                    pickle.pickle,
                ],
            )?;
        }

        Ok(self.inbound_group_sessions.add(session))
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.get(room_id, session_id))
    }

    async fn record_message_index(
        &self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
        event_id: &EventId,
        timestamp: MilliSecondsSinceUnixEpoch,
    ) -> Result<Option<(OwnedEventId, MilliSecondsSinceUnixEpoch)>> {
        let connection = self.connection.lock().await;
        let transaction = connection.unchecked_transaction()?;

        let existing = transaction
            .query_row(
                "SELECT event_id, ts FROM group_session_index
                 WHERE room_id = ?1 AND session_id = ?2 AND idx = ?3",
                params![room_id.as_str(), session_id, index],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let result = match existing {
            Some((event_id, ts)) => {
                Some((EventId::parse(event_id)?, timestamp_from_i64(ts)))
            }
            None => {
                transaction.execute(
                    "INSERT INTO group_session_index (room_id, session_id, idx, event_id, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        room_id.as_str(),
                        session_id,
                        index,
                        event_id.as_str(),
                        timestamp_to_i64(timestamp),
                    ],
                )?;

                None
            }
        };

        transaction.commit()?;

        Ok(result)
    }

    async fn get_message_index_record(
        &self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
    ) -> Result<Option<(OwnedEventId, MilliSecondsSinceUnixEpoch)>> {
        let connection = self.connection.lock().await;

        let row = connection
            .query_row(
                "SELECT event_id, ts FROM group_session_index
                 WHERE room_id = ?1 AND session_id = ?2 AND idx = ?3",
                params![room_id.as_str(), session_id, index],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(match row {
            Some((event_id, ts)) => Some((EventId::parse(event_id)?, timestamp_from_i64(ts))),
            None => None,
        })
    }

    async fn save_outbound_group_session(&self, session: OutboundGroupSession) -> Result<()> {
        self.ensure_account_stored()?;

        let pickle = session.pickle(&self.pickling_key).await;
        let serialized = serde_json::to_string(&pickle)?;
        let connection = self.connection.lock().await;

        connection.execute(
            "INSERT INTO outbound_megolm (room_id, pickle, creation_ts, message_count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(room_id) DO UPDATE SET
                pickle = excluded.pickle,
                creation_ts = excluded.creation_ts,
                message_count = excluded.message_count",
            params![
                session.room_id().as_str(),
                serialized,
                timestamp_to_i64(pickle.creation_time),
                pickle.message_count as i64,
            ],
        )?;

        Ok(())
    }

    async fn load_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>> {
        let row = {
            let connection = self.connection.lock().await;

            connection
                .query_row(
                    "SELECT pickle FROM outbound_megolm WHERE room_id = ?1",
                    [room_id.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
        };

        let Some(serialized) = row else { return Ok(None) };

        let pickle: PickledOutboundGroupSession = serde_json::from_str(&serialized)?;

        Ok(Some(OutboundGroupSession::from_pickle(pickle, &self.pickling_key)?))
    }

    async fn devices_missing_session_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
        devices: &DeviceSet,
    ) -> Result<DeviceSet> {
        let connection = self.connection.lock().await;

        let mut statement = connection.prepare(
            "SELECT user_id, device_id FROM sent_megolm_sessions
             WHERE room_id = ?1 AND session_id = ?2",
        )?;

        let rows = statement.query_map(params![room_id.as_str(), session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut sent = DeviceSet::new();

        for row in rows {
            let (user_id, device_id) = row?;
            let Ok(user_id) = UserId::parse(user_id) else { continue };

            sent.entry(user_id).or_default().insert(device_id.into());
        }

        let mut missing = DeviceSet::new();

        for (user_id, device_ids) in devices {
            let user_missing: BTreeSet<_> = match sent.get(user_id) {
                Some(sent) => device_ids.difference(sent).cloned().collect(),
                None => device_ids.clone(),
            };

            if !user_missing.is_empty() {
                missing.insert(user_id.clone(), user_missing);
            }
        }

        Ok(missing)
    }

    async fn mark_devices_as_received_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
        devices: &[SharedDevice],
    ) -> Result<()> {
        let connection = self.connection.lock().await;
        let transaction = connection.unchecked_transaction()?;

        for (user_id, device_id, curve_key) in devices {
            transaction.execute(
                "INSERT OR REPLACE INTO sent_megolm_sessions (
                    room_id, session_id, user_id, device_id, curve_key, idx
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    room_id.as_str(),
                    session_id,
                    user_id.as_str(),
                    device_id.as_str(),
                    curve_key.to_base64(),
                    index,
                ],
            )?;
        }

        transaction.commit()?;

        Ok(())
    }

    async fn update_tracked_user(&self, user: &UserId, dirty: bool) -> Result<bool> {
        let newly_tracked = self.tracked_users.insert(user.to_owned());

        if dirty {
            self.users_for_key_query.insert(user.to_owned());
        } else {
            self.users_for_key_query.remove(user);
        }

        let connection = self.connection.lock().await;

        connection.execute(
            "INSERT INTO tracked_users (user_id, outdated) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET outdated = excluded.outdated",
            params![user.as_str(), dirty],
        )?;

        Ok(newly_tracked)
    }

    async fn untrack_user(&self, user: &UserId) -> Result<bool> {
        self.users_for_key_query.remove(user);
        let was_tracked = self.tracked_users.remove(user).is_some();

        let connection = self.connection.lock().await;
        connection.execute("DELETE FROM tracked_users WHERE user_id = ?1", [user.as_str()])?;

        Ok(was_tracked)
    }

    fn is_user_tracked(&self, user_id: &UserId) -> bool {
        self.tracked_users.contains(user_id)
    }

    fn has_users_for_key_query(&self) -> bool {
        !self.users_for_key_query.is_empty()
    }

    fn users_for_key_query(&self) -> HashSet<OwnedUserId> {
        self.users_for_key_query.iter().map(|u| u.clone()).collect()
    }

    async fn save_devices(&self, devices: &[Device]) -> Result<()> {
        let connection = self.connection.lock().await;
        let transaction = connection.unchecked_transaction()?;

        for device in devices {
            self.devices.add(device.clone());

            transaction.execute(
                "INSERT OR REPLACE INTO device_keys (
                    user_id, device_id, ed25519, curve25519, display_name, json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    device.user_id().as_str(),
                    device.device_id().as_str(),
                    device.ed25519_key().map(|k| k.to_base64()),
                    device.curve25519_key().map(|k| k.to_base64()),
                    device.display_name(),
                    serde_json::to_string(device)?,
                ],
            )?;
        }

        transaction.commit()?;

        Ok(())
    }

    async fn delete_device(&self, device: Device) -> Result<()> {
        self.devices.remove(device.user_id(), device.device_id());

        let connection = self.connection.lock().await;

        connection.execute(
            "DELETE FROM device_keys WHERE user_id = ?1 AND device_id = ?2",
            params![device.user_id().as_str(), device.device_id().as_str()],
        )?;

        Ok(())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<Device>> {
        Ok(self.devices.get(user_id, device_id))
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices> {
        Ok(self.devices.user_devices(user_id))
    }

    async fn is_device_verified(&self, ed25519_key: &str) -> Result<bool> {
        let connection = self.connection.lock().await;

        let row = connection
            .query_row(
                "SELECT ed_key_id FROM verified_devices WHERE ed_key_id = ?1",
                [ed25519_key],
                |_| Ok(()),
            )
            .optional()?;

        Ok(row.is_some())
    }

    async fn mark_device_verified(&self, ed25519_key: &str) -> Result<()> {
        let connection = self.connection.lock().await;

        connection.execute(
            "INSERT OR IGNORE INTO verified_devices (ed_key_id) VALUES (?1)",
            [ed25519_key],
        )?;

        Ok(())
    }

    async fn clear_room_data(&self, room_id: &RoomId) -> Result<()> {
        self.inbound_group_sessions.clear_room(room_id);

        let connection = self.connection.lock().await;
        let transaction = connection.unchecked_transaction()?;

        transaction
            .execute("DELETE FROM inbound_megolm WHERE room_id = ?1", [room_id.as_str()])?;
        transaction
            .execute("DELETE FROM outbound_megolm WHERE room_id = ?1", [room_id.as_str()])?;
        transaction.execute(
            "DELETE FROM group_session_index WHERE room_id = ?1",
            [room_id.as_str()],
        )?;
        transaction.execute(
            "DELETE FROM sent_megolm_sessions WHERE room_id = ?1",
            [room_id.as_str()],
        )?;

        transaction.commit()?;

        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.sessions.clear();
        self.inbound_group_sessions.clear();
        self.devices.clear();
        self.tracked_users.clear();
        self.users_for_key_query.clear();
        self.account_stored.store(false, Ordering::SeqCst);

        let connection = self.connection.lock().await;
        let transaction = connection.unchecked_transaction()?;

        for table in [
            "accounts",
            "olm_sessions",
            "inbound_megolm",
            "outbound_megolm",
            "group_session_index",
            "sent_megolm_sessions",
            "tracked_users",
            "device_keys",
            "verified_devices",
        ] {
            transaction.execute_batch(&format!("DELETE FROM {table};"))?;
        }

        transaction.commit()?;

        Ok(())
    }
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, event_id, room_id, user_id, DeviceId, MilliSecondsSinceUnixEpoch, UserId};
    use tempfile::tempdir;

    use super::SqliteStore;
    use crate::{
        identities::device::tests::get_device,
        olm::{Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession},
        store::{CryptoStore, CryptoStoreError, PicklingKey},
    };

    fn alice_id() -> &'static UserId {
        user_id!("@alice:example.org")
    }

    fn alice_device_id() -> &'static DeviceId {
        device_id!("ALICEDEVICE")
    }

    fn pickling_key() -> PicklingKey {
        PicklingKey::from(*b"itsaseekreeto32byteslongitsaseek")
    }

    async fn get_store(dir: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::open(alice_id(), alice_device_id(), dir.path(), pickling_key())
            .await
            .expect("Can't create the store")
    }

    async fn get_loaded_store(dir: &tempfile::TempDir) -> (Account, SqliteStore) {
        let store = get_store(dir).await;
        let account = Account::new(alice_id(), alice_device_id().as_str());
        store.save_account(account.clone()).await.expect("Can't save the account");

        (account, store)
    }

    #[tokio::test]
    async fn creating_the_store_runs_all_migrations() {
        let dir = tempdir().unwrap();
        let store = get_store(&dir).await;

        assert_eq!(store.version().await.unwrap(), super::SCHEMA_VERSION);

        // Reopening the database doesn't run them again.
        let store = get_store(&dir).await;
        assert_eq!(store.version().await.unwrap(), super::SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn account_round_trip() {
        let dir = tempdir().unwrap();
        let store = get_store(&dir).await;

        assert!(store.load_account().await.unwrap().is_none());

        let account = Account::new(alice_id(), alice_device_id().as_str());
        account.mark_as_shared();
        store.save_account(account.clone()).await.unwrap();

        let store = get_store(&dir).await;
        let loaded = store.load_account().await.unwrap().unwrap();

        assert_eq!(account, loaded);
        assert_eq!(account.identity_keys(), loaded.identity_keys());
    }

    #[tokio::test]
    async fn wrong_pickling_key_is_a_hard_error() {
        let dir = tempdir().unwrap();
        let (_account, store) = get_loaded_store(&dir).await;
        drop(store);

        let store = SqliteStore::open(
            alice_id(),
            alice_device_id(),
            dir.path(),
            PicklingKey::from(*b"adifferentseekreeto32byteslongaa"),
        )
        .await
        .unwrap();

        match store.load_account().await {
            Err(CryptoStoreError::MismatchedPicklingKey(_)) => {}
            other => panic!("expected a pickling key mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sessions_are_ordered_by_last_use() {
        use crate::olm::session::tests::session_pair;

        let dir = tempdir().unwrap();
        let (_account, store) = get_loaded_store(&dir).await;

        let (_alice, _bob, mut first) = session_pair().await;
        let (_, _, mut second) = session_pair().await;
        second.sender_key = first.sender_key;

        first.last_use_time = MilliSecondsSinceUnixEpoch(1_000u32.into());
        second.last_use_time = MilliSecondsSinceUnixEpoch(2_000u32.into());

        store.save_sessions(&[first.clone(), second.clone()]).await.unwrap();
        drop(store);

        let store = get_store(&dir).await;
        store.load_account().await.unwrap();

        let sessions =
            store.get_sessions(&first.sender_key.to_base64()).await.unwrap().unwrap();
        let sessions = sessions.lock().await;

        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id(), second.session_id());
        assert_eq!(sessions[1].session_id(), first.session_id());
    }

    #[tokio::test]
    async fn saving_a_session_requires_an_account() {
        use crate::olm::session::tests::session_pair;

        let dir = tempdir().unwrap();
        let store = get_store(&dir).await;
        let (_alice, _bob, session) = session_pair().await;

        assert!(store.save_sessions(&[session]).await.is_err());
    }

    #[tokio::test]
    async fn inbound_group_session_round_trip() {
        let dir = tempdir().unwrap();
        let (account, store) = get_loaded_store(&dir).await;

        let room_id = room_id!("!test:localhost");
        let outbound = OutboundGroupSession::new(room_id, EncryptionSettings::default());
        let session = InboundGroupSession::new(
            account.identity_keys().curve25519,
            account.identity_keys().ed25519,
            room_id,
            &outbound.session_key().await,
        );

        assert!(store.save_inbound_group_session(session.clone()).await.unwrap());
        drop(store);

        let store = get_store(&dir).await;
        store.load_account().await.unwrap();

        let loaded =
            store.get_inbound_group_session(room_id, session.session_id()).await.unwrap();
        assert_eq!(loaded.unwrap(), session);
    }

    #[tokio::test]
    async fn outbound_group_session_round_trip() {
        let dir = tempdir().unwrap();
        let (_account, store) = get_loaded_store(&dir).await;

        let room_id = room_id!("!test:localhost");
        let session = OutboundGroupSession::new(room_id, EncryptionSettings::default());
        session.encrypt("advance the ratchet once").await;
        session.mark_shared_with(user_id!("@bob:example.org"), device_id!("BOBDEVICE"));

        store.save_outbound_group_session(session.clone()).await.unwrap();

        let loaded = store.load_outbound_group_session(room_id).await.unwrap().unwrap();

        assert_eq!(loaded.session_id(), session.session_id());
        assert_eq!(loaded.message_index().await, session.message_index().await);
        assert!(loaded.is_shared_with(user_id!("@bob:example.org"), device_id!("BOBDEVICE")));
    }

    #[tokio::test]
    async fn message_index_records_survive_a_reopen() {
        let dir = tempdir().unwrap();
        let (_account, store) = get_loaded_store(&dir).await;

        let room_id = room_id!("!test:localhost");
        let now = MilliSecondsSinceUnixEpoch::now();

        let existing = store
            .record_message_index(room_id, "SESSIONID", 5, event_id!("$a"), now)
            .await
            .unwrap();
        assert!(existing.is_none());

        drop(store);
        let store = get_store(&dir).await;

        let existing = store
            .record_message_index(room_id, "SESSIONID", 5, event_id!("$b"), now)
            .await
            .unwrap();
        assert_eq!(existing.unwrap().0, event_id!("$a"));
    }

    #[tokio::test]
    async fn sent_room_keys_are_tracked_per_session() {
        let dir = tempdir().unwrap();
        let (account, store) = get_loaded_store(&dir).await;

        let room_id = room_id!("!test:localhost");
        let bob = user_id!("@bob:example.org");

        let mut candidates = crate::store::DeviceSet::new();
        candidates.entry(bob.to_owned()).or_default().insert("B1".into());
        candidates.entry(bob.to_owned()).or_default().insert("B2".into());

        store
            .mark_devices_as_received_key(
                room_id,
                "SESSIONID",
                0,
                &[(bob.to_owned(), "B1".into(), account.identity_keys().curve25519)],
            )
            .await
            .unwrap();

        let missing = store
            .devices_missing_session_key(room_id, "SESSIONID", &candidates)
            .await
            .unwrap();

        assert_eq!(missing.get(bob).unwrap().len(), 1);

        // A different session still needs both devices.
        let missing = store
            .devices_missing_session_key(room_id, "OTHERSESSION", &candidates)
            .await
            .unwrap();

        assert_eq!(missing.get(bob).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn tracked_users_survive_a_reopen() {
        let dir = tempdir().unwrap();
        let (_account, store) = get_loaded_store(&dir).await;
        let bob = user_id!("@bob:example.org");

        assert!(store.update_tracked_user(bob, true).await.unwrap());
        assert!(!store.update_tracked_user(bob, true).await.unwrap());
        drop(store);

        let store = get_store(&dir).await;
        store.load_account().await.unwrap();

        assert!(store.is_user_tracked(bob));
        assert!(store.users_for_key_query().contains(bob));

        store.update_tracked_user(bob, false).await.unwrap();
        assert!(!store.users_for_key_query().contains(bob));

        store.untrack_user(bob).await.unwrap();
        assert!(!store.is_user_tracked(bob));
    }

    #[tokio::test]
    async fn device_round_trip() {
        let dir = tempdir().unwrap();
        let (_account, store) = get_loaded_store(&dir).await;
        let device = get_device().await;

        store.save_devices(&[device.clone()]).await.unwrap();
        drop(store);

        let store = get_store(&dir).await;
        store.load_account().await.unwrap();

        let loaded = store.get_device(device.user_id(), device.device_id()).await.unwrap();
        assert_eq!(loaded.unwrap(), device);

        store.delete_device(device.clone()).await.unwrap();
        assert!(store
            .get_device(device.user_id(), device.device_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn verified_devices_are_remembered() {
        let dir = tempdir().unwrap();
        let (account, store) = get_loaded_store(&dir).await;

        let ed_key = account.identity_keys().ed25519.to_base64();

        assert!(!store.is_device_verified(&ed_key).await.unwrap());
        store.mark_device_verified(&ed_key).await.unwrap();
        drop(store);

        let store = get_store(&dir).await;
        assert!(store.is_device_verified(&ed_key).await.unwrap());
    }

    #[tokio::test]
    async fn clearing_a_room_removes_only_that_room() {
        let dir = tempdir().unwrap();
        let (account, store) = get_loaded_store(&dir).await;

        let room_id = room_id!("!test:localhost");
        let other_room = room_id!("!other:localhost");
        let now = MilliSecondsSinceUnixEpoch::now();

        for room in [room_id, other_room] {
            let outbound = OutboundGroupSession::new(room, EncryptionSettings::default());
            let inbound = InboundGroupSession::new(
                account.identity_keys().curve25519,
                account.identity_keys().ed25519,
                room,
                &outbound.session_key().await,
            );
            store.save_outbound_group_session(outbound).await.unwrap();
            store.save_inbound_group_session(inbound).await.unwrap();
            store.record_message_index(room, "SESSIONID", 0, event_id!("$a"), now).await.unwrap();
        }

        store.clear_room_data(room_id).await.unwrap();

        assert!(store.load_outbound_group_session(room_id).await.unwrap().is_none());
        assert!(store.load_outbound_group_session(other_room).await.unwrap().is_some());
        assert!(store
            .get_message_index_record(room_id, "SESSIONID", 0)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_message_index_record(other_room, "SESSIONID", 0)
            .await
            .unwrap()
            .is_some());
    }
}
