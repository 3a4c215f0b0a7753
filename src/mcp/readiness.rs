use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mcp::descriptor::{
    CredentialSource, DescriptorStore, ServerDescriptor, ServerKey,
};
use crate::mcp::events::{ReadinessEvent, ReadinessEventBus};
use crate::mcp::probe::{ProbeClassification, Prober};

/// Backoff between attempts for transient probe failures. Three retries,
/// four attempts total.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(30),
    Duration::from_secs(30),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessStatus {
    Connecting,
    Connected,
    Failed,
    Timeout,
    Retrying,
    NeedsAuth,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Warming,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessEntry {
    pub status: ReadinessStatus,
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub operations: Vec<String>,
}

impl ReadinessEntry {
    fn pending() -> Self {
        Self {
            status: ReadinessStatus::Pending,
            retry_count: 0,
            last_attempt: None,
            last_success: None,
            operations: Vec::new(),
        }
    }
}

/// Aggregate view reported upward; individual probe failures never
/// surface beyond these counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadinessSummary {
    pub connected: usize,
    pub total: usize,
}

struct ManagerInner {
    descriptors: Arc<dyn DescriptorStore>,
    credentials: Arc<dyn CredentialSource>,
    prober: Arc<dyn Prober>,
    cache: Mutex<HashMap<ServerKey, ReadinessEntry>>,
    bus: Mutex<ReadinessEventBus>,
    state: Mutex<ManagerState>,
    warmup: Mutex<Option<watch::Receiver<bool>>>,
    cancel: CancellationToken,
}

/// Discovers and continuously tracks which capability servers are
/// currently usable. One instance per process, injected where needed;
/// resettable for tests.
#[derive(Clone)]
pub struct ReadinessManager {
    inner: Arc<ManagerInner>,
}

impl ReadinessManager {
    pub fn new(
        descriptors: Arc<dyn DescriptorStore>,
        credentials: Arc<dyn CredentialSource>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                descriptors,
                credentials,
                prober,
                cache: Mutex::new(HashMap::new()),
                bus: Mutex::new(ReadinessEventBus::default()),
                state: Mutex::new(ManagerState::Idle),
                warmup: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ReadinessEvent> {
        self.inner.bus.lock().expect("bus lock").subscribe()
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state.lock().expect("state lock")
    }

    /// Starts the one-shot concurrent probing pass over all known
    /// descriptors. Idempotent: a second call while a run is in flight
    /// observes the first run's pending result.
    pub fn start_warmup(&self) -> watch::Receiver<bool> {
        let mut slot = self.inner.warmup.lock().expect("warmup lock");
        if let Some(handle) = slot.as_ref() {
            return handle.clone();
        }

        let (done_tx, done_rx) = watch::channel(false);
        *slot = Some(done_rx.clone());
        drop(slot);

        self.set_state(ManagerState::Warming);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_warmup(&inner).await;
            let _ = done_tx.send(true);
        });
        done_rx
    }

    /// Peeks at the in-flight warmup without re-triggering probing.
    pub fn warmup_handle(&self) -> Option<watch::Receiver<bool>> {
        self.inner.warmup.lock().expect("warmup lock").clone()
    }

    /// Awaits warmup completion, starting it if nobody has yet.
    pub async fn wait_for_warmup(&self) {
        let mut handle = self.start_warmup();
        let _ = handle.wait_for(|done| *done).await;
    }

    /// Marks the whole run failed and stops scheduling further retries.
    /// In-flight probes are not force-killed; their results are
    /// discarded.
    pub fn abort(&self) {
        self.inner.cancel.cancel();
        self.set_state(ManagerState::Failed);
    }

    /// Re-probes a single descriptor outside the startup pass, preserving
    /// its accumulated retry count. The cache is last-write-wins: a race
    /// with the warmup pass is settled by whichever write lands last.
    pub async fn retry_server(&self, name: &str) -> Option<ReadinessEntry> {
        let descriptor = self.find_descriptor(name).await?;
        probe_once(&self.inner, &descriptor).await;
        self.get_server_state(name)
    }

    pub fn get_server_state(&self, name: &str) -> Option<ReadinessEntry> {
        let wanted = name.to_ascii_lowercase();
        let cache = self.inner.cache.lock().expect("cache lock");
        cache
            .iter()
            .find(|(key, _)| key.name == wanted)
            .map(|(_, entry)| entry.clone())
    }

    pub fn entry(&self, key: &ServerKey) -> Option<ReadinessEntry> {
        self.inner.cache.lock().expect("cache lock").get(key).cloned()
    }

    pub fn summary(&self) -> ReadinessSummary {
        let cache = self.inner.cache.lock().expect("cache lock");
        ReadinessSummary {
            connected: cache
                .values()
                .filter(|entry| entry.status == ReadinessStatus::Connected)
                .count(),
            total: cache.len(),
        }
    }

    /// The readiness-filtered descriptor set offered to the completion
    /// engine: connected or never-probed servers only. Failed and
    /// needs-auth servers are withheld to avoid guaranteed-useless
    /// round trips.
    pub fn connected_descriptors(
        &self,
        descriptors: &[ServerDescriptor],
    ) -> Vec<ServerDescriptor> {
        let cache = self.inner.cache.lock().expect("cache lock");
        descriptors
            .iter()
            .filter(|descriptor| {
                match cache.get(&descriptor.key()) {
                    None => true,
                    Some(entry) => matches!(
                        entry.status,
                        ReadinessStatus::Connected | ReadinessStatus::Pending
                    ),
                }
            })
            .cloned()
            .collect()
    }

    /// Clears all cached state. Test hook; process code never calls it.
    pub fn reset(&self) {
        self.inner.cache.lock().expect("cache lock").clear();
        *self.inner.warmup.lock().expect("warmup lock") = None;
        self.set_state(ManagerState::Idle);
    }

    async fn find_descriptor(&self, name: &str) -> Option<ServerDescriptor> {
        self.inner
            .descriptors
            .descriptors()
            .await
            .into_iter()
            .find(|descriptor| descriptor.name.eq_ignore_ascii_case(name))
    }

    fn set_state(&self, state: ManagerState) {
        set_manager_state(&self.inner, state);
    }
}

fn set_manager_state(inner: &ManagerInner, state: ManagerState) {
    *inner.state.lock().expect("state lock") = state;
    inner
        .bus
        .lock()
        .expect("bus lock")
        .publish(ReadinessEvent::ManagerState(state));
}

fn update_entry(
    inner: &ManagerInner,
    key: &ServerKey,
    update: impl FnOnce(&mut ReadinessEntry),
) {
    let (status, retry_count) = {
        let mut cache = inner.cache.lock().expect("cache lock");
        let entry = cache
            .entry(key.clone())
            .or_insert_with(ReadinessEntry::pending);
        update(entry);
        (entry.status, entry.retry_count)
    };
    inner
        .bus
        .lock()
        .expect("bus lock")
        .publish(ReadinessEvent::ServerStatusChanged {
            key: key.clone(),
            status,
            retry_count,
        });
}

async fn run_warmup(inner: &Arc<ManagerInner>) {
    let descriptors: Vec<ServerDescriptor> = inner
        .descriptors
        .descriptors()
        .await
        .into_iter()
        .filter(|descriptor| !descriptor.ephemeral)
        .collect();
    debug!(count = descriptors.len(), "Starting capability-server warmup");

    for descriptor in &descriptors {
        update_entry(inner, &descriptor.key(), |entry| {
            entry.status = ReadinessStatus::Pending;
        });
    }

    stream::iter(descriptors)
        .for_each_concurrent(None, |descriptor| {
            let inner = inner.clone();
            async move {
                probe_with_retries(&inner, &descriptor).await;
            }
        })
        .await;

    if inner.cancel.is_cancelled() {
        if *inner.state.lock().expect("state lock") != ManagerState::Failed {
            set_manager_state(inner, ManagerState::Failed);
        }
        return;
    }
    set_manager_state(inner, ManagerState::Completed);
}

/// One probe attempt with cache/event bookkeeping. Reused by the startup
/// fan-out and the on-demand retry path; retry_count is left untouched.
async fn probe_once(
    inner: &ManagerInner,
    descriptor: &ServerDescriptor,
) -> ProbeClassification {
    let key = descriptor.key();
    update_entry(inner, &key, |entry| {
        entry.status = ReadinessStatus::Connecting;
        entry.last_attempt = Some(Utc::now());
    });

    let credential = inner.credentials.credential_for(&descriptor.name).await;
    let outcome = inner
        .prober
        .probe(descriptor, credential.as_deref())
        .await;

    if inner.cancel.is_cancelled() {
        // The run was aborted while this probe was in flight; discard.
        return outcome.classification;
    }

    let status = match outcome.classification {
        ProbeClassification::Connected => ReadinessStatus::Connected,
        ProbeClassification::NeedsAuth => ReadinessStatus::NeedsAuth,
        ProbeClassification::Failed => ReadinessStatus::Failed,
        ProbeClassification::TimedOut => ReadinessStatus::Timeout,
    };
    update_entry(inner, &key, |entry| {
        entry.status = status;
        if status == ReadinessStatus::Connected {
            entry.last_success = Some(Utc::now());
            entry.operations = outcome.operations.clone();
        }
    });
    outcome.classification
}

async fn probe_with_retries(inner: &ManagerInner, descriptor: &ServerDescriptor) {
    let key = descriptor.key();
    for delay in RETRY_DELAYS.iter().map(Some).chain([None]) {
        if inner.cancel.is_cancelled() {
            return;
        }

        let classification = probe_once(inner, descriptor).await;
        if !classification.is_transient() {
            return;
        }

        let Some(delay) = delay else {
            // Retry budget exhausted; the Timeout status from the last
            // attempt stands.
            return;
        };

        update_entry(inner, &key, |entry| {
            entry.status = ReadinessStatus::Retrying;
            entry.retry_count += 1;
        });
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(*delay) => {}
        }
    }
}
