//! Canonical draw store
//!
//! Append-only record of every ingested draw. Two indexes share one
//! transaction per insert:
//!
//! - `draw:num:{draw_number}` holds the event JSON, giving draw-number order
//! - `draw:id:{id}` holds the draw number, giving arrival order
//!
//! Inserts for different draw numbers touch disjoint keys, so they never wait
//! on each other.

use crate::{
    errors::{DrawGuardResult, StorageError, ValidationError},
    storage::{key_number, numbered_key, DbTransaction, DrawStorage},
    types::{DrawColor, DrawEvent},
};
use chrono::{DateTime, Utc};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

const DRAW_BY_NUMBER: &[u8] = b"draw:num:";
const DRAW_BY_ID: &[u8] = b"draw:id:";
const SCAN_PAGE: usize = 1024;

enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Clone)]
pub struct DrawStore {
    storage: DrawStorage,
    next_id: Arc<AtomicU64>,
}

impl DrawStore {
    /// Attach to `storage`, resuming id assignment after the last stored event
    pub fn new(storage: DrawStorage) -> Result<Self, StorageError> {
        let last_id = storage
            .scan_prefix_rev(DRAW_BY_ID, 1)?
            .first()
            .and_then(|(key, _)| key_number(DRAW_BY_ID, key))
            .unwrap_or(0);

        Ok(Self {
            storage,
            next_id: Arc::new(AtomicU64::new(last_id + 1)),
        })
    }

    /// Append a draw. Rejects a draw number that is already stored.
    pub fn insert(
        &self,
        draw_number: u64,
        winning_number: u8,
        timestamp: DateTime<Utc>,
    ) -> DrawGuardResult<DrawEvent> {
        self.insert_with(draw_number, winning_number, timestamp, |_| Ok(()))
    }

    /// Append a draw and run `also` in the same transaction, so its writes
    /// commit together with the event or not at all
    pub fn insert_with<F>(
        &self,
        draw_number: u64,
        winning_number: u8,
        timestamp: DateTime<Utc>,
        mut also: F,
    ) -> DrawGuardResult<DrawEvent>
    where
        F: FnMut(&DbTransaction<'_>) -> Result<(), rocksdb::Error>,
    {
        let event = DrawEvent {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            draw_number,
            winning_number,
            color: DrawColor::for_number(winning_number),
            timestamp,
        };
        let encoded = serde_json::to_vec(&event).map_err(StorageError::from)?;
        let number_key = numbered_key(DRAW_BY_NUMBER, draw_number);
        let id_key = numbered_key(DRAW_BY_ID, event.id);

        let outcome = self.storage.transaction(|txn| {
            if txn.get_for_update(&number_key, true)?.is_some() {
                return Ok(InsertOutcome::Duplicate);
            }
            txn.put(&number_key, &encoded)?;
            txn.put(&id_key, draw_number.to_be_bytes())?;
            also(txn)?;
            Ok(InsertOutcome::Inserted)
        })?;

        match outcome {
            InsertOutcome::Inserted => Ok(event),
            InsertOutcome::Duplicate => Err(ValidationError::DuplicateDraw(draw_number).into()),
        }
    }

    pub fn get(&self, draw_number: u64) -> Result<Option<DrawEvent>, StorageError> {
        self.storage
            .get(&numbered_key(DRAW_BY_NUMBER, draw_number))?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StorageError::from))
            .transpose()
    }

    /// Highest `limit` draws by draw number, highest first
    pub fn latest_by_number(&self, limit: usize) -> Result<Vec<DrawEvent>, StorageError> {
        self.storage
            .scan_prefix_rev(DRAW_BY_NUMBER, limit)?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StorageError::from))
            .collect()
    }

    /// Most recently ingested draw, by arrival order
    pub fn latest_ingested(&self) -> Result<Option<DrawEvent>, StorageError> {
        let Some((_, value)) = self.storage.scan_prefix_rev(DRAW_BY_ID, 1)?.into_iter().next() else {
            return Ok(None);
        };
        let bytes: [u8; 8] = value
            .as_slice()
            .try_into()
            .map_err(|_| StorageError::CorruptedData("draw id index entry".to_string()))?;
        self.get(u64::from_be_bytes(bytes))
    }

    pub fn max_draw_number(&self) -> Result<Option<u64>, StorageError> {
        Ok(self
            .storage
            .scan_prefix_rev(DRAW_BY_NUMBER, 1)?
            .first()
            .and_then(|(key, _)| key_number(DRAW_BY_NUMBER, key)))
    }

    /// Every stored draw number, ascending
    pub fn draw_numbers(&self) -> Result<Vec<u64>, StorageError> {
        let mut numbers = Vec::new();
        self.for_each_draw_number(|number| numbers.push(number))?;
        Ok(numbers)
    }

    /// Visit stored draw numbers in ascending order, one page in memory at a time
    pub fn for_each_draw_number<F>(&self, mut visit: F) -> Result<(), StorageError>
    where
        F: FnMut(u64),
    {
        let mut cursor: Option<Vec<u8>> = None;

        loop {
            let page = self.storage.scan_prefix(DRAW_BY_NUMBER, cursor.as_deref(), SCAN_PAGE)?;
            let full = page.len() == SCAN_PAGE;
            page.iter()
                .filter_map(|(key, _)| key_number(DRAW_BY_NUMBER, key))
                .for_each(&mut visit);
            cursor = page.into_iter().last().map(|(key, _)| key);
            if !full {
                break;
            }
        }

        Ok(())
    }
}
