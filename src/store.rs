use crate::error::SegmentError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Metadata for one published segment.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// Session-monotonic sequence number, never reused
    pub sequence: u64,
    /// Segment duration in milliseconds
    pub duration_ms: u64,
    /// Timing/encoding reset point (transcoder restart)
    pub discontinuity: bool,
    pub created_at: DateTime<Utc>,
}

struct StoreInner {
    window: VecDeque<SegmentInfo>,
    payloads: HashMap<u64, Bytes>,
    next_sequence: u64,
    ended: bool,
    /// Rendered playlist, swapped wholesale on every mutation so readers
    /// always observe an internally consistent snapshot.
    manifest: Option<Arc<String>>,
}

/// Rolling window of segments plus the rendered manifest for one stream.
///
/// Single writer (the session's transcoder supervisor), many readers (HTTP
/// handlers). Readers clone `Arc`/`Bytes` under a read lock and never block a
/// publish for longer than the snapshot swap; an evicted payload stays alive
/// for any response still streaming it.
pub struct SegmentStore {
    key: String,
    window_size: usize,
    target_duration: u32,
    inner: RwLock<StoreInner>,
}

impl SegmentStore {
    pub fn new(key: &str, window_size: usize, target_duration: u32) -> Self {
        Self {
            key: key.to_string(),
            window_size,
            target_duration,
            inner: RwLock::new(StoreInner {
                window: VecDeque::new(),
                payloads: HashMap::new(),
                next_sequence: 0,
                ended: false,
                manifest: None,
            }),
        }
    }

    /// Append one segment, slide the window, and publish a fresh manifest
    /// snapshot. Returns the assigned sequence number. The payload is
    /// retrievable before the snapshot referencing it is swapped in.
    pub fn publish(&self, duration_ms: u64, payload: Bytes, discontinuity: bool) -> u64 {
        let mut inner = self.inner.write();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        inner.payloads.insert(sequence, payload);
        inner.window.push_back(SegmentInfo {
            sequence,
            duration_ms,
            discontinuity,
            created_at: Utc::now(),
        });

        while inner.window.len() > self.window_size {
            // Eviction removes exactly the oldest entry; readers holding the
            // payload's Bytes keep it alive until their response completes.
            if let Some(evicted) = inner.window.pop_front() {
                inner.payloads.remove(&evicted.sequence);
                debug!(key = %self.key, sequence = evicted.sequence, "Evicted segment");
            }
        }

        inner.manifest = Some(Arc::new(self.render(&inner)));
        sequence
    }

    /// Mark the stream ended; the final snapshot carries `#EXT-X-ENDLIST`.
    pub fn end(&self) {
        let mut inner = self.inner.write();
        if inner.ended {
            return;
        }
        inner.ended = true;
        if !inner.window.is_empty() {
            inner.manifest = Some(Arc::new(self.render(&inner)));
        }
    }

    /// Current manifest snapshot. `None` until the first segment is published
    /// (players must get 404, not an empty playlist).
    pub fn manifest(&self) -> Option<Arc<String>> {
        self.inner.read().manifest.clone()
    }

    pub fn segment(&self, sequence: u64) -> Result<Bytes, SegmentError> {
        let inner = self.inner.read();
        if let Some(payload) = inner.payloads.get(&sequence) {
            return Ok(payload.clone());
        }
        if sequence < inner.next_sequence {
            Err(SegmentError::Expired(sequence))
        } else {
            Err(SegmentError::NotFound(sequence))
        }
    }

    /// Sequence number the next published segment will get.
    pub fn next_sequence(&self) -> u64 {
        self.inner.read().next_sequence
    }

    pub fn is_ended(&self) -> bool {
        self.inner.read().ended
    }

    /// Window metadata snapshot, oldest first.
    pub fn window(&self) -> Vec<SegmentInfo> {
        self.inner.read().window.iter().cloned().collect()
    }

    fn render(&self, inner: &StoreInner) -> String {
        let mut out = String::new();
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");

        let max_duration_sec = inner
            .window
            .iter()
            .map(|s| s.duration_ms.div_ceil(1000))
            .max()
            .unwrap_or(u64::from(self.target_duration));
        out.push_str(&format!("#EXT-X-TARGETDURATION:{max_duration_sec}\n"));

        let first_seq = inner.window.front().map_or(0, |s| s.sequence);
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{first_seq}\n"));

        for segment in &inner.window {
            if segment.discontinuity {
                out.push_str("#EXT-X-DISCONTINUITY\n");
            }
            let duration_sec = segment.duration_ms as f64 / 1000.0;
            out.push_str(&format!("#EXTINF:{duration_sec:.3},\n"));
            out.push_str(&format!("{}-{}.ts\n", self.key, segment.sequence));
        }

        if inner.ended {
            out.push_str("#EXT-X-ENDLIST\n");
        }

        out
    }
}
