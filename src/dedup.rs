//! Content-addressed request coalescing and short-TTL replay.
//!
//! Identical requests — in flight or recently completed — share one upstream
//! send. The cache maps a request [`Fingerprint`] to an entry holding the
//! client-visible byte sequence; the origin request's pump appends chunks as
//! upstream delivers them, and every client (origin included) consumes the
//! entry through an [`EntryReader`]: buffered prefix first, then live bytes.
//!
//! Lifecycle rules:
//! - at most one in-flight entry per fingerprint; concurrent lookups attach
//!   as readers rather than sending upstream again
//! - the pump is cancelled within 100 ms of the last reader detaching
//! - completed entries replay for a short TTL, unless they failed or
//!   overflowed the replay buffer knob
//! - capacity-based eviction only ever removes completed entries

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::DedupConfig;

/// SHA-256 over the canonicalized request. Collisions are treated as equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..8]))
    }
}

/// Fingerprint a request over its routing-relevant content.
///
/// Canonical form: resolved model id, messages normalized to
/// `{role, content}` with string content trimmed, tools sorted by function
/// name, temperature, and max_tokens. The stream flag is deliberately
/// excluded — streaming and buffered renditions of the same prompt share an
/// upstream send.
pub fn fingerprint(resolved_model: &str, body: &serde_json::Value) -> Fingerprint {
    use serde_json::Value;

    let messages: Vec<Value> = body["messages"]
        .as_array()
        .map(|msgs| {
            msgs.iter()
                .map(|m| {
                    let role = m["role"].as_str().unwrap_or_default();
                    let content = match &m["content"] {
                        Value::String(s) => Value::String(s.trim().to_string()),
                        other => other.clone(),
                    };
                    serde_json::json!({ "role": role, "content": content })
                })
                .collect()
        })
        .unwrap_or_default();

    let mut tools: Vec<Value> = body["tools"].as_array().cloned().unwrap_or_default();
    tools.sort_by(|a, b| {
        let name = |t: &Value| {
            t.pointer("/function/name")
                .or_else(|| t.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        name(a).cmp(&name(b))
    });

    // serde_json maps serialize with sorted keys, so this string is stable
    // under any key ordering in the incoming body.
    let canonical = serde_json::json!({
        "model": resolved_model,
        "messages": messages,
        "tools": tools,
        "temperature": body.get("temperature").cloned().unwrap_or(Value::Null),
        "max_tokens": body.get("max_tokens").cloned().unwrap_or(Value::Null),
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    Fingerprint(hasher.finalize().into())
}

// ──────────────────────────────────────────────────────────────────────────────
// Entries
// ──────────────────────────────────────────────────────────────────────────────

struct EntryState {
    status: Option<u16>,
    content_type: String,
    chunks: Vec<Bytes>,
    total_bytes: usize,
    done: bool,
    /// Cleared on failure or replay-buffer overflow.
    replayable: bool,
    completed_at: Option<Instant>,
}

/// One coalesced request. The pump writes; readers consume.
pub struct DedupEntry {
    state: Mutex<EntryState>,
    notify: Notify,
    readers: AtomicUsize,
    cancel: CancellationToken,
    max_entry_bytes: usize,
}

impl DedupEntry {
    fn new(max_entry_bytes: usize) -> Self {
        Self {
            state: Mutex::new(EntryState {
                status: None,
                content_type: "application/json".into(),
                chunks: Vec::new(),
                total_bytes: 0,
                done: false,
                replayable: true,
                completed_at: None,
            }),
            notify: Notify::new(),
            readers: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            max_entry_bytes,
        }
    }

    /// Token the pump watches: fires when the last reader detaches before
    /// completion, so upstream is cancelled promptly.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record the upstream response line. Called once, before any chunk.
    pub fn set_headers(&self, status: u16, content_type: &str) {
        let mut state = self.state.lock().expect("entry state poisoned");
        state.status = Some(status);
        state.content_type = content_type.to_string();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Append one client-visible chunk.
    pub fn push_chunk(&self, chunk: Bytes) {
        let mut state = self.state.lock().expect("entry state poisoned");
        state.total_bytes += chunk.len();
        if state.total_bytes > self.max_entry_bytes {
            // Attached readers still get everything; the entry just is not
            // retained for replay after completion.
            state.replayable = false;
        }
        state.chunks.push(chunk);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Terminal publish. `replayable: false` marks failures so the entry is
    /// never served from the completed cache.
    pub fn finish(&self, replayable: bool) {
        let mut state = self.state.lock().expect("entry state poisoned");
        state.done = true;
        state.completed_at = Some(Instant::now());
        state.replayable = state.replayable && replayable;
        drop(state);
        self.notify.notify_waiters();
    }

    fn is_done(&self) -> bool {
        self.state.lock().expect("entry state poisoned").done
    }

    fn attach(self: &Arc<Self>) -> EntryReader {
        self.readers.fetch_add(1, Ordering::SeqCst);
        EntryReader {
            entry: Arc::clone(self),
            pos: 0,
            guard: ReaderGuard { entry: Arc::clone(self) },
        }
    }
}

/// Decrements the reader count; cancels the pump when the last reader of an
/// unfinished entry goes away.
struct ReaderGuard {
    entry: Arc<DedupEntry>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let previous = self.entry.readers.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && !self.entry.is_done() {
            self.entry.cancel.cancel();
        }
    }
}

/// A reader over one entry: backfills the buffered prefix, then follows live.
pub struct EntryReader {
    entry: Arc<DedupEntry>,
    pos: usize,
    #[allow(dead_code)]
    guard: ReaderGuard,
}

impl EntryReader {
    /// Wait for the upstream response line. For entries that fail before any
    /// headers the terminal publish supplies them.
    pub async fn headers(&self) -> (u16, String) {
        loop {
            let notified = self.entry.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.entry.state.lock().expect("entry state poisoned");
                if let Some(status) = state.status {
                    return (status, state.content_type.clone());
                }
                if state.done {
                    return (502, state.content_type.clone());
                }
            }
            notified.await;
        }
    }

    /// Next chunk in upstream order; `None` once the entry is complete and
    /// the buffer is drained.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            let notified = self.entry.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.entry.state.lock().expect("entry state poisoned");
                if self.pos < state.chunks.len() {
                    let chunk = state.chunks[self.pos].clone();
                    self.pos += 1;
                    return Some(chunk);
                }
                if state.done {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Drain the whole entry into one buffer (non-streaming clients).
    pub async fn collect(mut self) -> (u16, String, Vec<u8>) {
        let (status, content_type) = self.headers().await;
        let mut body = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            body.extend_from_slice(&chunk);
        }
        (status, content_type, body)
    }
}

/// Returned to the one caller that must forward upstream and publish.
pub struct OriginHandle {
    entry: Arc<DedupEntry>,
    fingerprint: Fingerprint,
    reader: Option<EntryReader>,
}

impl OriginHandle {
    pub fn entry(&self) -> Arc<DedupEntry> {
        Arc::clone(&self.entry)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The origin's own reader over the entry it publishes into.
    pub fn reader(&mut self) -> EntryReader {
        self.reader.take().expect("origin reader taken twice")
    }

    /// Finalize with an error response so attached subscribers observe the
    /// same bytes the origin client will. Failed entries never replay.
    pub fn publish_error(&self, status: u16, content_type: &str, body: &[u8]) {
        self.entry.set_headers(status, content_type);
        self.entry.push_chunk(Bytes::copy_from_slice(body));
        self.entry.finish(false);
    }
}

impl Drop for OriginHandle {
    /// The origin's handler can be cancelled at any await point (client
    /// disconnect) before it hands the entry to a pump. Finalize the entry
    /// here so attached subscribers are never stranded on a publish that
    /// will not come; the entry is marked failed and never replays.
    fn drop(&mut self) {
        if self.reader.is_some() && !self.entry.is_done() {
            self.entry.set_headers(502, "application/json");
            self.entry.push_chunk(Bytes::from_static(
                b"{\"error\":{\"message\":\"origin request cancelled before completion\",\"type\":\"upstream_error\",\"code\":502}}",
            ));
            self.entry.finish(false);
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Cache
// ──────────────────────────────────────────────────────────────────────────────

/// Result of a cache probe.
pub enum Lookup {
    /// First request for this fingerprint: caller forwards and publishes.
    Miss(OriginHandle),
    /// Attached to an in-flight or completed entry.
    Join { reader: EntryReader, replay: bool },
}

struct CacheSlot {
    entry: Arc<DedupEntry>,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<Fingerprint, CacheSlot>,
    tick: u64,
}

/// Fingerprint-keyed singleflight index. Mutex-guarded; critical sections
/// never span I/O.
pub struct DedupCache {
    inner: Mutex<CacheInner>,
    config: DedupConfig,
}

impl DedupCache {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner { entries: HashMap::new(), tick: 0 }),
            config,
        }
    }

    /// Probe the cache, attaching to existing work or claiming origin duty.
    pub fn lookup(&self, fp: Fingerprint) -> Lookup {
        let ttl = Duration::from_millis(self.config.replay_ttl_ms);
        let mut inner = self.inner.lock().expect("dedup cache poisoned");
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(slot) = inner.entries.get_mut(&fp) {
            slot.last_used = tick;
            let entry = Arc::clone(&slot.entry);
            let state = entry.state.lock().expect("entry state poisoned");
            if !state.done {
                drop(state);
                return Lookup::Join { reader: entry.attach(), replay: false };
            }
            let fresh = state.replayable
                && state.completed_at.is_some_and(|t| t.elapsed() < ttl);
            drop(state);
            if fresh {
                return Lookup::Join { reader: entry.attach(), replay: true };
            }
            // Stale or failed: replace below.
            inner.entries.remove(&fp);
        }

        if inner.entries.len() >= self.config.capacity {
            Self::evict_one(&mut inner);
        }

        let entry = Arc::new(DedupEntry::new(self.config.max_entry_bytes));
        let reader = entry.attach();
        inner.entries.insert(fp, CacheSlot { entry: Arc::clone(&entry), last_used: tick });

        Lookup::Miss(OriginHandle { entry, fingerprint: fp, reader: Some(reader) })
    }

    /// Evict the least-recently-used *completed* entry. In-flight entries are
    /// never evicted; the cap may be temporarily exceeded while many distinct
    /// requests are in flight.
    fn evict_one(inner: &mut CacheInner) {
        let victim = inner
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_done())
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(fp, _)| *fp);
        if let Some(fp) = victim {
            inner.entries.remove(&fp);
        }
    }

    /// Drop failed and TTL-expired completed entries. Run by the reaper.
    pub fn sweep(&self) {
        let ttl = Duration::from_millis(self.config.replay_ttl_ms);
        let mut inner = self.inner.lock().expect("dedup cache poisoned");
        inner.entries.retain(|_, slot| {
            let state = slot.entry.state.lock().expect("entry state poisoned");
            if !state.done {
                return true;
            }
            state.replayable && state.completed_at.is_some_and(|t| t.elapsed() < ttl)
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}
