//! RocksDB-backed message store.
//!
//! Column families:
//! - `messages`: every persisted message (bincode + LZ4), keyed by partition
//! - `unread`: index of messages not yet marked read (empty values)
//!
//! Key format (both CFs): `<recipient bytes><0x00><message id: 16 bytes>`.
//! Recipients never contain NUL, so the `recipient ‖ 0x00` prefix selects
//! exactly one partition, and UUIDv7 ids sort by persistence time inside it.
//!
//! ```text
//! append(bob, m1)     messages: bob\0<m1> → {..}    unread: bob\0<m1>
//! mark_read(bob, m1)  messages: bob\0<m1> → {read}  unread: (deleted)
//! fetch_unread(bob)   prefix scan of `unread`, point lookups in `messages`
//! ```

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{validate_recipient, Backlog, MessageStore, StoreError};
use crate::protocol::Message;

/// Column family names.
const CF_MESSAGES: &str = "messages";
const CF_UNREAD: &str = "unread";

const COLUMN_FAMILIES: &[&str] = &[CF_MESSAGES, CF_UNREAD];

/// Separator between recipient and id in every key.
const KEY_SEPARATOR: u8 = 0x00;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("chatmesh_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk record. Kept separate from [`Message`] because bincode needs
/// every field present.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    id: [u8; 16],
    sender: String,
    recipient: String,
    content: String,
    timestamp_micros: i64,
    read: bool,
}

impl StoredMessage {
    fn from_message(message: &Message, id: Uuid) -> Self {
        Self {
            id: *id.as_bytes(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            content: message.content.clone(),
            timestamp_micros: message.timestamp.timestamp_micros(),
            read: false,
        }
    }

    fn into_message(self) -> Message {
        Message {
            id: Some(Uuid::from_bytes(self.id)),
            sender: self.sender,
            recipient: self.recipient,
            content: self.content,
            timestamp: DateTime::from_timestamp_micros(self.timestamp_micros)
                .unwrap_or_else(Utc::now),
            read: self.read,
        }
    }

    /// bincode, then LZ4 with the size prepended.
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (stored, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(stored)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed message store.
///
/// Durable across restarts. Several nodes can share one store only through
/// something that shares the data directory's contents, so multi-node
/// deployments in one process use [`super::MemoryStore`] instead.
pub struct RocksMessageStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write sequences (insert-if-absent, mark_read).
    write_lock: Mutex<()>,
}

impl RocksMessageStore {
    /// Open the store at the configured path, creating it if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened message store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_MESSAGES => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_UNREAD => {
                // Keys only, churned by mark_read.
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self, key: &[u8]) -> Result<Option<StoredMessage>, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        self.db
            .get_cf(cf, key)?
            .map(|bytes| StoredMessage::decode(&bytes))
            .transpose()
    }

    /// Keys of one partition in a CF, in id order.
    fn scan_keys<'a>(
        &'a self,
        cf_name: &str,
        recipient: &str,
    ) -> Result<impl Iterator<Item = Result<Box<[u8]>, StoreError>> + 'a, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = partition_prefix(recipient);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        Ok(iter.map_while(move |item| match item {
            Ok((key, _)) if key.starts_with(&prefix) => Some(Ok(key)),
            Ok(_) => None,
            Err(e) => Some(Err(StoreError::from(e))),
        }))
    }
}

impl MessageStore for RocksMessageStore {
    fn append(&self, message: &Message) -> Result<Uuid, StoreError> {
        validate_recipient(&message.recipient)?;
        let id = message.id.unwrap_or_else(Uuid::now_v7);
        let key = message_key(&message.recipient, id);

        let _guard = self.lock();
        let cf_messages = self.cf(CF_MESSAGES)?;
        if self.db.get_pinned_cf(cf_messages, &key)?.is_some() {
            log::debug!("Message {id} for {} already stored", message.recipient);
            return Ok(id);
        }

        let stored = StoredMessage::from_message(message, id);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_messages, &key, stored.encode()?);
        batch.put_cf(self.cf(CF_UNREAD)?, &key, b"");
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(id)
    }

    fn mark_read(&self, recipient: &str, id: Uuid) -> Result<bool, StoreError> {
        validate_recipient(recipient)?;
        let key = message_key(recipient, id);

        let _guard = self.lock();
        let Some(mut stored) = self.load(&key)? else {
            return Ok(false);
        };
        if stored.read {
            return Ok(false);
        }
        stored.read = true;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_MESSAGES)?, &key, stored.encode()?);
        batch.delete_cf(self.cf(CF_UNREAD)?, &key);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(true)
    }

    fn fetch_unread(&self, recipient: &str) -> Result<Option<Backlog<'_>>, StoreError> {
        validate_recipient(recipient)?;
        let keys = self.scan_keys(CF_UNREAD, recipient)?;

        let backlog = keys.filter_map(move |key| {
            let key = match key {
                Ok(key) => key,
                Err(e) => return Some(Err(e)),
            };
            // An index entry without its row is skipped.
            self.load(&key)
                .map(|stored| stored.map(StoredMessage::into_message))
                .transpose()
        });
        Ok(Some(Box::new(backlog)))
    }

    fn get(&self, recipient: &str, id: Uuid) -> Result<Option<Message>, StoreError> {
        validate_recipient(recipient)?;
        Ok(self
            .load(&message_key(recipient, id))?
            .map(StoredMessage::into_message))
    }

    fn history(&self, recipient: &str) -> Result<Vec<Message>, StoreError> {
        validate_recipient(recipient)?;
        let cf = self.cf(CF_MESSAGES)?;
        let prefix = partition_prefix(recipient);

        let mut messages = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            messages.push(StoredMessage::decode(&value)?.into_message());
        }
        Ok(messages)
    }

    fn count(&self, recipient: &str) -> Result<usize, StoreError> {
        validate_recipient(recipient)?;
        let mut count = 0;
        for key in self.scan_keys(CF_MESSAGES, recipient)? {
            key?;
            count += 1;
        }
        Ok(count)
    }

    fn health_check(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.cf(name)?;
        }
        self.db.get_pinned_cf(self.cf(CF_MESSAGES)?, [KEY_SEPARATOR])?;
        Ok(())
    }
}

/// `recipient ‖ 0x00`
fn partition_prefix(recipient: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(recipient.len() + 1);
    prefix.extend_from_slice(recipient.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// `recipient ‖ 0x00 ‖ id`
fn message_key(recipient: &str, id: Uuid) -> Vec<u8> {
    let mut key = partition_prefix(recipient);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
