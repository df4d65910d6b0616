//! Per-model bounded request queue, model-state registry, and metrics.
//!
//! Grounded on `examples/original_source/src/llm_proxifier/queue_manager.py`
//! (`QueueManager`, `RequestQueue`, `QueuedRequest`), reworked onto a single
//! `tokio::sync::Mutex`-guarded registry with `VecDeque`-backed FIFOs in the
//! style of the teacher's `Arc<Mutex<...>>` state (`runtime/src/main.rs`).

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
const MAX_HISTORY_ENTRIES: usize = 100;
const RPM_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

/// Mirrors `ModelInstance`'s lifecycle; the authoritative answer to
/// "should new requests queue?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Reloading,
}

impl Default for ModelState {
    fn default() -> Self {
        ModelState::Stopped
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelState::Stopped => "stopped",
            ModelState::Starting => "starting",
            ModelState::Running => "running",
            ModelState::Stopping => "stopping",
            ModelState::Reloading => "reloading",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request_id: String,
    pub client_id: String,
    pub endpoint: String,
    pub enqueue_time: DateTime<Utc>,
    pub timeout: Duration,
}

impl QueuedRequest {
    pub fn is_expired(&self) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.enqueue_time);
        elapsed
            > chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::seconds(30))
    }
}

struct PerModelQueue {
    max_size: usize,
    fifo: VecDeque<String>,
    pending: HashMap<String, QueuedRequest>,
}

impl PerModelQueue {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            fifo: VecDeque::new(),
            pending: HashMap::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.fifo.len() >= self.max_size
    }

    fn enqueue(&mut self, req: QueuedRequest) -> bool {
        if self.is_full() {
            return false;
        }
        self.fifo.push_back(req.request_id.clone());
        self.pending.insert(req.request_id.clone(), req);
        true
    }

    fn dequeue(&mut self) -> Option<QueuedRequest> {
        while let Some(id) = self.fifo.pop_front() {
            if let Some(req) = self.pending.remove(&id) {
                return Some(req);
            }
            // Already expired and evicted by the sweep; keep draining.
        }
        None
    }

    fn remove_expired(&mut self) -> usize {
        let expired: HashSet<String> = self
            .pending
            .iter()
            .filter(|(_, r)| r.is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.pending.remove(id);
        }
        expired.len()
    }

    fn clear(&mut self) {
        self.fifo.clear();
        self.pending.clear();
    }

    fn depth(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_wait_time: f64,
    pub total_processing_time: f64,
    pub peak_depth: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

impl QueueMetrics {
    pub fn avg_wait_time(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_wait_time / self.total_requests as f64
        }
    }

    pub fn avg_processing_time(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_processing_time / self.total_requests as f64
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoricalMetric {
    pub timestamp: DateTime<Utc>,
    pub queue_depth: usize,
    pub wait_time: f64,
    pub processing_time: f64,
    pub success: bool,
    pub avg_wait_time: f64,
    pub requests_per_minute: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelStats {
    pub model_name: String,
    pub state: ModelState,
    pub queue_size: usize,
    pub max_size: usize,
    pub pending_requests: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_wait_time: f64,
    pub avg_processing_time: f64,
    pub peak_depth: usize,
    pub requests_per_minute: f64,
    pub last_activity: Option<DateTime<Utc>>,
    pub success_rate: f64,
}

struct PerModel {
    queue: PerModelQueue,
    state: ModelState,
    metrics: QueueMetrics,
    history: VecDeque<HistoricalMetric>,
}

impl PerModel {
    fn new(max_size: usize) -> Self {
        Self {
            queue: PerModelQueue::new(max_size),
            state: ModelState::Stopped,
            metrics: QueueMetrics::default(),
            history: VecDeque::new(),
        }
    }

    fn requests_per_minute(&self) -> f64 {
        let cutoff = Utc::now() - RPM_WINDOW;
        let recent = self
            .history
            .iter()
            .filter(|h| h.timestamp >= cutoff)
            .count();
        recent as f64 / 5.0
    }

    fn stats(&self, name: &str) -> ModelStats {
        let total = self.metrics.total_requests;
        ModelStats {
            model_name: name.to_string(),
            state: self.state,
            queue_size: self.queue.depth(),
            max_size: self.queue.max_size,
            pending_requests: self.queue.pending.len(),
            total_requests: total,
            successful_requests: self.metrics.successful_requests,
            failed_requests: self.metrics.failed_requests,
            avg_wait_time: self.metrics.avg_wait_time(),
            avg_processing_time: self.metrics.avg_processing_time(),
            peak_depth: self.metrics.peak_depth,
            requests_per_minute: self.requests_per_minute(),
            last_activity: self.metrics.last_activity,
            success_rate: if total == 0 {
                0.0
            } else {
                self.metrics.successful_requests as f64 / total as f64 * 100.0
            },
        }
    }
}

/// Owns all per-model queues, state, and metrics. A single mutex guards the
/// whole registry, matching the source's one `asyncio.Lock` for metrics plus
/// plain dict access for state (queue FIFOs are internally bounded, but we
/// fold everything under one lock since the registry is small and
/// operations are O(1) / O(history-length)).
pub struct QueueManager {
    inner: Mutex<HashMap<String, PerModel>>,
}

impl QueueManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent creation of a queue + metrics + history for `name`.
    pub async fn ensure_queue(&self, name: &str, max_size: usize) {
        let mut guard = self.inner.lock().await;
        guard
            .entry(name.to_string())
            .or_insert_with(|| PerModel::new(max_size));
    }

    pub async fn ensure_queue_default(&self, name: &str) {
        self.ensure_queue(name, DEFAULT_MAX_QUEUE_SIZE).await;
    }

    pub async fn set_state(&self, name: &str, new_state: ModelState) {
        let mut guard = self.inner.lock().await;
        let entry = guard
            .entry(name.to_string())
            .or_insert_with(|| PerModel::new(DEFAULT_MAX_QUEUE_SIZE));
        entry.state = new_state;
        info!(model = %name, state = %new_state, "model state changed");

        if new_state == ModelState::Running {
            // The FIFO drains lazily as future forwards dequeue from it;
            // we just sweep expired entries now so stale ones don't count
            // toward queue depth. We never replay: the client that got a
            // 202 is expected to retry.
            entry.queue.remove_expired();
        }
    }

    pub async fn get_state(&self, name: &str) -> ModelState {
        let guard = self.inner.lock().await;
        guard.get(name).map(|m| m.state).unwrap_or(ModelState::Stopped)
    }

    pub async fn should_queue(&self, name: &str) -> bool {
        matches!(
            self.get_state(name).await,
            ModelState::Starting | ModelState::Reloading
        )
    }

    pub async fn enqueue(
        &self,
        name: &str,
        request_id: String,
        client_id: String,
        endpoint: String,
        timeout: Duration,
    ) -> bool {
        let mut guard = self.inner.lock().await;
        let entry = guard
            .entry(name.to_string())
            .or_insert_with(|| PerModel::new(DEFAULT_MAX_QUEUE_SIZE));
        let accepted = entry.queue.enqueue(QueuedRequest {
            request_id: request_id.clone(),
            client_id,
            endpoint,
            enqueue_time: Utc::now(),
            timeout,
        });
        if accepted {
            info!(model = %name, request_id = %request_id, "queued request");
        }
        accepted
    }

    /// Pull the next non-expired request off `name`'s queue, if any.
    pub async fn dequeue(&self, name: &str) -> Option<QueuedRequest> {
        let mut guard = self.inner.lock().await;
        let entry = guard.get_mut(name)?;
        loop {
            let req = entry.queue.dequeue()?;
            if req.is_expired() {
                continue;
            }
            return Some(req);
        }
    }

    pub async fn track(&self, name: &str, wait_time: f64, processing_time: f64, success: bool) {
        let mut guard = self.inner.lock().await;
        let entry = guard
            .entry(name.to_string())
            .or_insert_with(|| PerModel::new(DEFAULT_MAX_QUEUE_SIZE));

        entry.metrics.total_requests += 1;
        entry.metrics.total_wait_time += wait_time;
        entry.metrics.total_processing_time += processing_time;
        entry.metrics.last_activity = Some(Utc::now());
        if success {
            entry.metrics.successful_requests += 1;
        } else {
            entry.metrics.failed_requests += 1;
        }

        let depth = entry.queue.depth();
        if depth > entry.metrics.peak_depth {
            entry.metrics.peak_depth = depth;
        }

        let rpm = entry.requests_per_minute();
        let avg_wait = entry.metrics.avg_wait_time();
        entry.history.push_back(HistoricalMetric {
            timestamp: Utc::now(),
            queue_depth: depth,
            wait_time,
            processing_time,
            success,
            avg_wait_time: avg_wait,
            requests_per_minute: rpm,
        });
        if entry.history.len() > MAX_HISTORY_ENTRIES {
            entry.history.pop_front();
        }
    }

    pub async fn stats(&self, name: &str) -> ModelStats {
        let guard = self.inner.lock().await;
        match guard.get(name) {
            Some(entry) => entry.stats(name),
            None => ModelStats {
                model_name: name.to_string(),
                state: ModelState::Stopped,
                queue_size: 0,
                max_size: DEFAULT_MAX_QUEUE_SIZE,
                pending_requests: 0,
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                avg_wait_time: 0.0,
                avg_processing_time: 0.0,
                peak_depth: 0,
                requests_per_minute: 0.0,
                last_activity: None,
                success_rate: 0.0,
            },
        }
    }

    pub async fn all_stats(&self) -> HashMap<String, ModelStats> {
        let guard = self.inner.lock().await;
        guard.iter().map(|(name, entry)| (name.clone(), entry.stats(name))).collect()
    }

    pub async fn history(&self, name: &str, limit: Option<usize>) -> Vec<HistoricalMetric> {
        let guard = self.inner.lock().await;
        let Some(entry) = guard.get(name) else {
            return Vec::new();
        };
        let all: Vec<HistoricalMetric> = entry.history.iter().cloned().collect();
        match limit {
            Some(n) if n < all.len() => all[all.len() - n..].to_vec(),
            _ => all,
        }
    }

    pub async fn clear(&self, name: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard.get_mut(name) {
            entry.queue.clear();
            info!(model = %name, "cleared queue");
        }
    }

    pub async fn reset_metrics(&self, name: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard.get_mut(name) {
            entry.metrics = QueueMetrics::default();
            entry.history.clear();
        }
    }

    pub async fn reset_all_metrics(&self) {
        let mut guard = self.inner.lock().await;
        for entry in guard.values_mut() {
            entry.metrics = QueueMetrics::default();
            entry.history.clear();
        }
    }

    /// One sweep: remove expired pending entries from every queue's side
    /// index. Already-dequeued entries need no action.
    pub async fn sweep_expired(&self) {
        let mut guard = self.inner.lock().await;
        for (name, entry) in guard.iter_mut() {
            let removed = entry.queue.remove_expired();
            if removed > 0 {
                info!(model = %name, removed, "swept expired queued requests");
            }
        }
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Background task: every 10s, sweep expired entries across all queues.
/// Cancel-safe — the caller holds the `JoinHandle` and aborts it on
/// shutdown.
pub async fn run_cleanup_loop(queue_manager: std::sync::Arc<QueueManager>) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        interval.tick().await;
        queue_manager.sweep_expired().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_respects_bound() {
        let qm = QueueManager::new();
        qm.ensure_queue("m1", 2).await;
        assert!(
            qm.enqueue(
                "m1",
                "r1".into(),
                "c1".into(),
                "/v1/chat/completions".into(),
                Duration::from_secs(30)
            )
            .await
        );
        assert!(
            qm.enqueue(
                "m1",
                "r2".into(),
                "c1".into(),
                "/v1/chat/completions".into(),
                Duration::from_secs(30)
            )
            .await
        );
        assert!(
            !qm.enqueue(
                "m1",
                "r3".into(),
                "c1".into(),
                "/v1/chat/completions".into(),
                Duration::from_secs(30)
            )
            .await
        );
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let qm = QueueManager::new();
        qm.ensure_queue("m1", 10).await;
        qm.enqueue("m1", "r1".into(), "c".into(), "/e".into(), Duration::from_secs(30))
            .await;
        qm.enqueue("m1", "r2".into(), "c".into(), "/e".into(), Duration::from_secs(30))
            .await;
        let first = qm.dequeue("m1").await.unwrap();
        let second = qm.dequeue("m1").await.unwrap();
        assert_eq!(first.request_id, "r1");
        assert_eq!(second.request_id, "r2");
    }

    #[tokio::test]
    async fn expired_requests_are_skipped_on_dequeue() {
        let qm = QueueManager::new();
        qm.ensure_queue("m1", 10).await;
        qm.enqueue(
            "m1",
            "expired".into(),
            "c".into(),
            "/e".into(),
            Duration::from_millis(1),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        qm.enqueue("m1", "fresh".into(), "c".into(), "/e".into(), Duration::from_secs(30))
            .await;
        let req = qm.dequeue("m1").await.unwrap();
        assert_eq!(req.request_id, "fresh");
    }

    #[tokio::test]
    async fn should_queue_true_only_for_starting_or_reloading() {
        let qm = QueueManager::new();
        qm.set_state("m1", ModelState::Stopped).await;
        assert!(!qm.should_queue("m1").await);
        qm.set_state("m1", ModelState::Starting).await;
        assert!(qm.should_queue("m1").await);
        qm.set_state("m1", ModelState::Reloading).await;
        assert!(qm.should_queue("m1").await);
        qm.set_state("m1", ModelState::Running).await;
        assert!(!qm.should_queue("m1").await);
    }

    #[tokio::test]
    async fn metrics_additivity_holds() {
        let qm = QueueManager::new();
        qm.track("m1", 1.0, 2.0, true).await;
        qm.track("m1", 0.5, 1.5, false).await;
        let stats = qm.stats("m1").await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.successful_requests + stats.failed_requests, 2);
        assert!((stats.avg_wait_time - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn clear_empties_queue_and_pending() {
        let qm = QueueManager::new();
        qm.ensure_queue("m1", 10).await;
        qm.enqueue("m1", "r1".into(), "c".into(), "/e".into(), Duration::from_secs(30))
            .await;
        qm.clear("m1").await;
        let stats = qm.stats("m1").await;
        assert_eq!(stats.queue_size, 0);
    }
}
