//! In-memory backends with fault injection, for development and tests.

use super::{BackendError, BackendResult, ByteStream, PrimaryStore, SecondaryStore, collect};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mirrorpool_common::{AccountEndpoint, AccountId, ObjectId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const STREAM_CHUNK: usize = 64 * 1024;

fn stream_from(data: Vec<u8>) -> ByteStream {
    let chunks: Vec<std::io::Result<Bytes>> = data
        .chunks(STREAM_CHUNK)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    futures::stream::iter(chunks).boxed()
}

#[derive(Default)]
struct StoredObject {
    data: Vec<u8>,
    complete: bool,
}

/// Primary store keeping every account's objects in memory
#[derive(Default)]
pub struct MemoryPrimaryStore {
    objects: Mutex<HashMap<(AccountId, String), StoredObject>>,
    failing_probes: Mutex<HashSet<AccountId>>,
    begin_faults: Mutex<VecDeque<BackendError>>,
    write_faults: Mutex<VecDeque<BackendError>>,
    complete_faults: Mutex<VecDeque<BackendError>>,
    write_delay: Mutex<Option<Duration>>,
    read_failing: AtomicBool,
    read_cut_short: AtomicBool,
    reads_opened: AtomicU64,
    aborts: AtomicU64,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make probes of `account_id` fail until switched off
    pub fn set_probe_failing(&self, account_id: &AccountId, failing: bool) {
        let mut failing_probes = self.failing_probes.lock();
        if failing {
            failing_probes.insert(account_id.clone());
        } else {
            failing_probes.remove(account_id);
        }
    }

    /// Fail the next `begin` with `error`
    pub fn inject_begin_fault(&self, error: BackendError) {
        self.begin_faults.lock().push_back(error);
    }

    /// Fail the next chunk write with `error`; faults queue in order
    pub fn inject_write_fault(&self, error: BackendError) {
        self.write_faults.lock().push_back(error);
    }

    /// Fail the next `complete` with `error`
    pub fn inject_complete_fault(&self, error: BackendError) {
        self.complete_faults.lock().push_back(error);
    }

    /// Delay every chunk write, to hold sessions open in tests
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    pub fn set_read_failing(&self, failing: bool) {
        self.read_failing.store(failing, Ordering::SeqCst);
    }

    /// Streams end with an error right after their first chunk
    pub fn set_read_cut_short(&self, cut_short: bool) {
        self.read_cut_short.store(cut_short, Ordering::SeqCst);
    }

    pub fn reads_opened(&self) -> u64 {
        self.reads_opened.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Bytes of a completed object
    pub fn object(&self, account_id: &AccountId, locator: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(account_id.clone(), locator.to_string()))
            .filter(|object| object.complete)
            .map(|object| object.data.clone())
    }

    /// Objects begun but neither completed nor aborted
    pub fn partial_count(&self) -> usize {
        self.objects
            .lock()
            .values()
            .filter(|object| !object.complete)
            .count()
    }

    fn key(account: &AccountEndpoint, locator: &str) -> (AccountId, String) {
        (account.account_id.clone(), locator.to_string())
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn probe(&self, account: &AccountEndpoint) -> BackendResult<()> {
        if self.failing_probes.lock().contains(&account.account_id) {
            return Err(BackendError::Transient(format!(
                "probe of {} failed",
                account.account_id
            )));
        }
        Ok(())
    }

    async fn begin(&self, account: &AccountEndpoint, object_id: ObjectId) -> BackendResult<String> {
        if let Some(fault) = self.begin_faults.lock().pop_front() {
            return Err(fault);
        }
        let locator = object_id.to_string();
        self.objects
            .lock()
            .insert(Self::key(account, &locator), StoredObject::default());
        Ok(locator)
    }

    async fn write_chunk(
        &self,
        account: &AccountEndpoint,
        locator: &str,
        offset: u64,
        data: Bytes,
    ) -> BackendResult<()> {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(fault) = self.write_faults.lock().pop_front() {
            return Err(fault);
        }

        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(&Self::key(account, locator))
            .ok_or_else(|| BackendError::NotFound(locator.to_string()))?;
        if object.data.len() as u64 != offset {
            return Err(BackendError::Permanent(format!(
                "write at {offset} but object holds {} bytes",
                object.data.len()
            )));
        }
        object.data.extend_from_slice(&data);
        Ok(())
    }

    async fn complete(&self, account: &AccountEndpoint, locator: &str) -> BackendResult<()> {
        if let Some(fault) = self.complete_faults.lock().pop_front() {
            return Err(fault);
        }
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(&Self::key(account, locator))
            .ok_or_else(|| BackendError::NotFound(locator.to_string()))?;
        object.complete = true;
        Ok(())
    }

    async fn abort(&self, account: &AccountEndpoint, locator: &str) -> BackendResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().remove(&Self::key(account, locator));
        Ok(())
    }

    async fn open_read(&self, account: &AccountEndpoint, locator: &str) -> BackendResult<ByteStream> {
        self.reads_opened.fetch_add(1, Ordering::SeqCst);
        if self.read_failing.load(Ordering::SeqCst) {
            return Err(BackendError::Transient(format!(
                "account {} unreachable",
                account.account_id
            )));
        }
        let data = self
            .object(&account.account_id, locator)
            .ok_or_else(|| BackendError::NotFound(locator.to_string()))?;
        if self.read_cut_short.load(Ordering::SeqCst) {
            let first = data[..data.len().min(STREAM_CHUNK)].to_vec();
            let cut = futures::stream::iter([Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset mid-stream",
            ))]);
            return Ok(stream_from(first).chain(cut).boxed());
        }
        Ok(stream_from(data))
    }
}

/// Backup store keeping objects in memory
#[derive(Default)]
pub struct MemorySecondaryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    put_faults: Mutex<VecDeque<BackendError>>,
    put_failing: Mutex<Option<BackendError>>,
    get_failing: AtomicBool,
    puts: AtomicU64,
    gets: AtomicU64,
}

impl MemorySecondaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next put with `error`; faults queue in order
    pub fn inject_put_fault(&self, error: BackendError) {
        self.put_faults.lock().push_back(error);
    }

    /// Fail every put with `error` until cleared
    pub fn set_put_failing(&self, error: Option<BackendError>) {
        *self.put_failing.lock() = error;
    }

    pub fn set_get_failing(&self, failing: bool) {
        self.get_failing.store(failing, Ordering::SeqCst);
    }

    /// Put calls made, including failed ones
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Get calls made, including failed ones
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn object(&self, locator: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(locator).cloned()
    }
}

#[async_trait]
impl SecondaryStore for MemorySecondaryStore {
    async fn put(
        &self,
        object_id: ObjectId,
        size_bytes: u64,
        data: ByteStream,
    ) -> BackendResult<String> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.put_faults.lock().pop_front() {
            return Err(fault);
        }
        if let Some(fault) = self.put_failing.lock().clone() {
            return Err(fault);
        }

        let data = collect(data).await?;
        if data.len() as u64 != size_bytes {
            return Err(BackendError::Transient(format!(
                "short stream: {} of {size_bytes} bytes",
                data.len()
            )));
        }
        let locator = format!("backup-{object_id}");
        self.objects.lock().insert(locator.clone(), data);
        Ok(locator)
    }

    async fn get(&self, locator: &str) -> BackendResult<ByteStream> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.get_failing.load(Ordering::SeqCst) {
            return Err(BackendError::Transient("backup backend unreachable".to_string()));
        }
        let data = self
            .object(locator)
            .ok_or_else(|| BackendError::NotFound(locator.to_string()))?;
        Ok(stream_from(data))
    }
}
