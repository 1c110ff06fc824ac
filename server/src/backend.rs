//! Stream-store backend.
//!
//! All authoritative state lives in a Redis-compatible store:
//!
//! - `marmot::clients` — hash: guid -> base64 public key
//! - `marmot::channels` — set of channel names
//! - `marmot::<channel>::stream` — ordered log of envelopes
//! - `marmot::<channel>::listeners` — hash: guid -> last-delivered entry id
//! - `marmot::<channel>::whistlers` — set of guids
//!
//! Regular operations share one multiplexed connection. Blocking multi-stream
//! reads would stall every command queued behind them, so each listener gets
//! a dedicated connection through [`Backend::reader`]; the number of such
//! connections is bounded by the configured `max_connections`.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use redis::{
    aio::{ConnectionManager, MultiplexedConnection},
    streams::{StreamInfoStreamReply, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply},
    AsyncCommands,
};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::{
    api::Message,
    config::{ChannelConfig, RedisConfig, ServerConfig},
    crypto,
    error::BackendError,
};

const KEY_CLIENTS: &str = "marmot::clients";
const KEY_CHANNELS: &str = "marmot::channels";

/// How long a blocking multi-stream read waits before returning an empty
/// batch so the delivery loop can re-check liveness.
const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

fn stream_key(channel: &str) -> String {
    format!("marmot::{channel}::stream")
}

fn listeners_key(channel: &str) -> String {
    format!("marmot::{channel}::listeners")
}

fn whistlers_key(channel: &str) -> String {
    format!("marmot::{channel}::whistlers")
}

/// Numeric ordering for `<ms>-<seq>` stream entry ids; lexicographic
/// comparison would put `9-0` after `10-0`.
fn stream_id_ord(id: &str) -> (u64, u64) {
    match id.split_once('-') {
        Some((ms, seq)) => (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
        None => (id.parse().unwrap_or(0), 0),
    }
}

/// Result of a blocking pull
#[derive(Debug)]
pub enum Pull {
    /// The listener no longer holds a cursor on any requested channel.
    Unsubscribed,
    /// Entries strictly newer than each channel cursor, possibly empty when
    /// the blocking read timed out.
    Batch(Vec<(String, Message)>),
}

/// Dedicated blocking-read handle for one listener connection.
///
/// Holds a permit from the reader semaphore for as long as it lives.
pub struct StreamReader {
    conn: MultiplexedConnection,
    block: Duration,
    _permit: OwnedSemaphorePermit,
}

impl StreamReader {
    /// Override the blocking-read timeout (mainly for tests).
    pub fn block(mut self, timeout: Duration) -> Self {
        self.block = timeout;
        self
    }

    /// Blocking multi-stream read of everything newer than the listener's
    /// cursor on each channel. Channels where the cursor is gone (listener
    /// removed or channel deleted) are skipped; when none remain the
    /// unsubscribe sentinel is returned.
    pub async fn pull(&mut self, listener: &str, channels: &[String]) -> Result<Pull, BackendError> {
        let mut keys = Vec::with_capacity(channels.len());
        let mut ids = Vec::with_capacity(channels.len());
        for channel in channels {
            let cursor: Option<String> = self.conn.hget(listeners_key(channel), listener).await?;
            if let Some(cursor) = cursor {
                keys.push(stream_key(channel));
                ids.push(cursor);
            }
        }
        if keys.is_empty() {
            return Ok(Pull::Unsubscribed);
        }

        let options = StreamReadOptions::default().block(self.block.as_millis() as usize);
        let reply: Option<StreamReadReply> =
            self.conn.xread_options(&keys, &ids, &options).await?;

        let mut batch = Vec::new();
        for stream in reply.map(|reply| reply.keys).unwrap_or_default() {
            for entry in stream.ids {
                batch.push((entry.id.clone(), Message::from_entry(&entry.map)?));
            }
        }
        Ok(Pull::Batch(batch))
    }
}

/// Server-side state layer on top of the stream store
pub struct Backend {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    readers: Arc<Semaphore>,
    url: String,
    max_connections: usize,
}

impl Backend {
    /// Create a backend handle. The first operation establishes the shared
    /// connection, so startup surfaces connectivity errors through `load`.
    pub fn new(redis: &RedisConfig) -> Result<Self, BackendError> {
        let client = redis::Client::open(redis.url.as_str())?;
        let max_connections = redis.max_connections.clamp(10, 1 << 15);
        Ok(Self {
            client,
            manager: OnceCell::new(),
            readers: Arc::new(Semaphore::new(max_connections)),
            url: redis.url.clone(),
            max_connections,
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, BackendError> {
        let manager = self
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    /// Liveness of the underlying store.
    pub async fn ping(&self) -> bool {
        match self.conn().await {
            Ok(mut conn) => {
                let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                pong.is_ok()
            }
            Err(_) => false,
        }
    }

    /// Acquire a dedicated connection for blocking reads.
    pub async fn reader(&self) -> Result<StreamReader, BackendError> {
        let permit = self
            .readers
            .clone()
            .acquire_owned()
            .await
            .expect("reader semaphore closed");
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(StreamReader {
            conn,
            block: DEFAULT_BLOCK_TIMEOUT,
            _permit: permit,
        })
    }

    /// Add or update a client.
    pub async fn add_client(&self, guid: &str, pubkey: &str) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset(KEY_CLIENTS, guid, pubkey).await?;
        Ok(())
    }

    /// Delete a client and cascade it out of every channel ACL.
    pub async fn remove_client(&self, guid: &str) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let _: () = conn.hdel(KEY_CLIENTS, guid).await?;
        for key in self.scan_keys(&listeners_key("*")).await? {
            let _: () = conn.hdel(key, guid).await?;
        }
        for key in self.scan_keys(&whistlers_key("*")).await? {
            let _: () = conn.srem(key, guid).await?;
        }
        Ok(())
    }

    /// Cursor-based key iteration so large channel counts do not block the
    /// store.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    /// Add or update a channel, reconciling its ACLs with the given
    /// configuration.
    pub async fn add_channel(&self, name: &str, channel: &ChannelConfig) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;

        // ensure the stream exists so a last-generated id is always defined
        let key = stream_key(name);
        let present: bool = conn.exists(&key).await?;
        if !present {
            let sentinel = Message::default().to_entry();
            let _: String = conn.xadd(&key, "*", &sentinel).await?;
        }

        let current: HashSet<String> = conn.smembers(whistlers_key(name)).await?;
        for whistler in current.iter().filter(|w| !channel.whistlers.contains(*w)) {
            self.remove_whistler(name, whistler).await?;
        }
        for whistler in &channel.whistlers {
            self.add_whistler(name, whistler).await?;
        }

        let current: Vec<String> = conn.hkeys(listeners_key(name)).await?;
        for listener in current.iter().filter(|l| !channel.listeners.contains(*l)) {
            self.remove_listener(name, listener).await?;
        }
        for listener in &channel.listeners {
            self.add_listener(name, listener).await?;
        }

        let _: () = conn.sadd(KEY_CHANNELS, name).await?;
        Ok(())
    }

    /// Delete a channel: stream, cursors, whistlers and registration.
    pub async fn remove_channel(&self, name: &str) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let _: () = conn.srem(KEY_CHANNELS, name).await?;
        let _: () = conn.del(stream_key(name)).await?;
        let _: () = conn.del(listeners_key(name)).await?;
        let _: () = conn.del(whistlers_key(name)).await?;
        Ok(())
    }

    /// Enroll a listener; its cursor starts at the stream's current
    /// last-generated id, so it never sees messages predating enrollment.
    pub async fn add_listener(&self, channel: &str, listener: &str) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let key = listeners_key(channel);
        let present: bool = conn.hexists(&key, listener).await?;
        if present {
            return Ok(());
        }
        let info: StreamInfoStreamReply = conn.xinfo_stream(stream_key(channel)).await?;
        let _: () = conn.hset(&key, listener, info.last_generated_id).await?;
        Ok(())
    }

    pub async fn remove_listener(&self, channel: &str, listener: &str) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let _: () = conn.hdel(listeners_key(channel), listener).await?;
        Ok(())
    }

    pub async fn add_whistler(&self, channel: &str, whistler: &str) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let _: () = conn.sadd(whistlers_key(channel), whistler).await?;
        Ok(())
    }

    pub async fn remove_whistler(&self, channel: &str, whistler: &str) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let _: () = conn.srem(whistlers_key(channel), whistler).await?;
        Ok(())
    }

    /// Append an envelope to its channel stream; the store assigns the id.
    pub async fn push(&self, message: &Message) -> Result<String, BackendError> {
        let mut conn = self.conn().await?;
        let entry = message.to_entry();
        let id: String = conn.xadd(stream_key(&message.channel), "*", &entry).await?;
        Ok(id)
    }

    /// Record that `id` was delivered to `listener` on `channel`.
    pub async fn ack(&self, channel: &str, listener: &str, id: &str) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset(listeners_key(channel), listener, id).await?;
        Ok(())
    }

    /// Drop delivered entries from a channel stream.
    ///
    /// Entries older than the minimum listener cursor are removed; with no
    /// listeners the stream is truncated to a single entry so its
    /// last-generated id stays defined. Returns the number of entries that
    /// were candidates for removal, `None` when the channel had no listener.
    pub async fn trim(&self, channel: &str) -> Result<Option<u64>, BackendError> {
        let mut conn = self.conn().await?;
        let cursors: HashMap<String, String> = conn.hgetall(listeners_key(channel)).await?;
        let key = stream_key(channel);

        let Some(minid) = cursors.values().min_by_key(|id| stream_id_ord(id.as_str())) else {
            let _: u64 = conn.xtrim(&key, StreamMaxlen::Equals(1)).await?;
            info!(channel, "trimmed idle channel down to a single entry");
            return Ok(None);
        };

        let older: StreamRangeReply = conn.xrange(&key, "-", format!("({minid}")).await?;
        let count = older.ids.len() as u64;
        let _: u64 = redis::cmd("XTRIM")
            .arg(&key)
            .arg("MINID")
            .arg(minid)
            .query_async(&mut conn)
            .await?;
        info!(channel, count, "trimmed delivered messages");
        Ok(Some(count))
    }

    /// Trim every registered channel, sequentially.
    pub async fn trim_all(&self) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let channels: Vec<String> = conn.smembers(KEY_CHANNELS).await?;
        for channel in channels {
            self.trim(&channel).await?;
        }
        Ok(())
    }

    /// Push a configuration into the store as a total state transition:
    /// stale clients and channels are removed first, then everything in the
    /// configuration is upserted.
    pub async fn load(&self, config: &ServerConfig) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let be_clients: Vec<String> = conn.hkeys(KEY_CLIENTS).await?;
        let be_channels: Vec<String> = conn.smembers(KEY_CHANNELS).await?;

        for channel in be_channels.iter().filter(|c| !config.channels.contains_key(*c)) {
            self.remove_channel(channel).await?;
        }
        for client in be_clients.iter().filter(|c| !config.clients.contains_key(*c)) {
            self.remove_client(client).await?;
        }
        for (guid, pubkey) in &config.clients {
            self.add_client(guid, pubkey).await?;
        }
        for (name, channel) in &config.channels {
            self.add_channel(name, channel).await?;
        }
        Ok(())
    }

    /// Snapshot the store as a configuration. Transport fields carry only
    /// what the store handle knows about itself.
    pub async fn dump(&self) -> Result<ServerConfig, BackendError> {
        let mut conn = self.conn().await?;
        let clients: BTreeMap<String, String> = conn.hgetall(KEY_CLIENTS).await?;
        let names: Vec<String> = conn.smembers(KEY_CHANNELS).await?;

        let mut channels = BTreeMap::new();
        for name in names {
            let listeners: BTreeSet<String> = conn.hkeys(listeners_key(&name)).await?;
            let whistlers: BTreeSet<String> = conn.smembers(whistlers_key(&name)).await?;
            channels.insert(
                name,
                ChannelConfig {
                    whistlers,
                    listeners,
                },
            );
        }

        Ok(ServerConfig {
            host: String::new(),
            port: 0,
            redis: RedisConfig {
                url: self.url.clone(),
                max_connections: self.max_connections,
                ..RedisConfig::default()
            },
            clients,
            channels,
        })
    }

    /// Authorize a multi-channel subscription: known client, every channel
    /// registered, the client enrolled as listener on each, and a valid
    /// signature over the listen-request digest.
    pub async fn can_listen(
        &self,
        guid: &str,
        channels: &[String],
        signature: &str,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn().await?;
        let pubkey: Option<String> = conn.hget(KEY_CLIENTS, guid).await?;
        let Some(pubkey) = pubkey else {
            warn!(guid, "unknown client");
            return Ok(false);
        };
        for channel in channels {
            let registered: bool = conn.sismember(KEY_CHANNELS, channel.as_str()).await?;
            if !registered {
                warn!(%channel, "unknown channel");
                return Ok(false);
            }
            let enrolled: bool = conn.hexists(listeners_key(channel), guid).await?;
            if !enrolled {
                warn!(guid, %channel, "client is not a channel listener");
                return Ok(false);
            }
        }
        let Ok(pubkey) = crypto::load_public_key(&pubkey) else {
            warn!(guid, "stored public key is unreadable");
            return Ok(false);
        };
        let digest = crypto::hash_listen_params(guid, channels);
        if !crypto::verify_digest(&pubkey, &digest, signature) {
            warn!(guid, "listen signature verification failed");
            return Ok(false);
        }
        Ok(true)
    }

    /// Authorize a publication: known client, registered channel, the client
    /// in the channel whistler set, and a valid envelope signature.
    pub async fn can_whistle(&self, message: &Message) -> Result<bool, BackendError> {
        let mut conn = self.conn().await?;
        let guid = message.whistler.as_str();
        let channel = message.channel.as_str();

        let pubkey: Option<String> = conn.hget(KEY_CLIENTS, guid).await?;
        let Some(pubkey) = pubkey else {
            warn!(guid, "unknown client");
            return Ok(false);
        };
        let registered: bool = conn.sismember(KEY_CHANNELS, channel).await?;
        if !registered {
            warn!(channel, "unknown channel");
            return Ok(false);
        }
        let allowed: bool = conn.sismember(whistlers_key(channel), guid).await?;
        if !allowed {
            warn!(guid, channel, "client is not a channel whistler");
            return Ok(false);
        }
        let Ok(pubkey) = crypto::load_public_key(&pubkey) else {
            warn!(guid, "stored public key is unreadable");
            return Ok(false);
        };
        if !message.verify(&pubkey) {
            warn!(guid, channel, "whistle signature verification failed");
            return Ok(false);
        }
        Ok(true)
    }
}
