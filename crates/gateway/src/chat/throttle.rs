//! Per-channel ordered egress with merging, priorities, and rate limits.
//!
//! Guarantees:
//! - FIFO within `(channel, priority)`; high-priority items go ahead of
//!   queued normal items but never preempt an in-flight send.
//! - Same-`merge_key` text payloads enqueued within the merge window fold
//!   into the earlier item (joined with `\n`, capped at 2,000 chars); the
//!   target keeps its queue position unless the caller's high priority
//!   promotes it to the head.
//! - Per-channel queues are capped; on excess the oldest queued item is
//!   dropped and its waiters rejected with a typed overflow failure.
//! - One dispatcher loop round-robins across channels with work, skipping
//!   channels whose limiter is waiting; the global limiter gates each send.
//! - A rate-limit error pauses the appropriate limiter and requeues the
//!   same item — waiters intact — at the head of its channel. This is the
//!   only path where a dequeued item re-enters the queue.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use sb_domain::config::ThrottleConfig;

use super::limiter::SlidingWindowLimiter;
use super::{ChatError, OutboundMessage};

const MERGED_TEXT_MAX_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub merge_key: Option<String>,
    pub high_priority: bool,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("channel queue overflow")]
    QueueOverflow,
    #[error("throttle queue destroyed")]
    Destroyed,
    #[error("send failed: {0}")]
    Failed(String),
}

/// Performs the actual platform call for one dequeued item.
#[async_trait]
pub trait ChatExecutor: Send + Sync {
    async fn execute(&self, channel_id: &str, message: &OutboundMessage) -> Result<(), ChatError>;
}

type Waiter = oneshot::Sender<Result<(), SendError>>;

struct QueueItem {
    message: OutboundMessage,
    merge_key: Option<String>,
    priority: Priority,
    enqueued_at: Instant,
    waiters: Vec<Waiter>,
}

impl QueueItem {
    fn resolve(self, result: Result<(), SendError>) {
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

struct Inner {
    queues: HashMap<String, VecDeque<QueueItem>>,
    limiters: HashMap<String, Arc<SlidingWindowLimiter>>,
    /// Round-robin order over channels.
    rotation: VecDeque<String>,
    destroyed: bool,
}

pub struct ThrottleQueue {
    inner: Mutex<Inner>,
    global: SlidingWindowLimiter,
    executor: Arc<dyn ChatExecutor>,
    config: ThrottleConfig,
    dispatcher_running: AtomicBool,
}

impl ThrottleQueue {
    pub fn new(executor: Arc<dyn ChatExecutor>, config: ThrottleConfig) -> Arc<Self> {
        let global = SlidingWindowLimiter::new(
            config.global_limit,
            Duration::from_millis(config.global_window_ms),
        );
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                limiters: HashMap::new(),
                rotation: VecDeque::new(),
                destroyed: false,
            }),
            global,
            executor,
            config,
            dispatcher_running: AtomicBool::new(false),
        })
    }

    /// Enqueue a message. Enqueueing (and merging / overflow) happens
    /// synchronously; the returned future resolves when the platform call
    /// for the (possibly merged) item completes.
    pub fn send(
        self: &Arc<Self>,
        channel_id: &str,
        message: OutboundMessage,
        options: SendOptions,
    ) -> impl Future<Output = Result<(), SendError>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(channel_id, message, options, tx);
        async move { rx.await.unwrap_or(Err(SendError::Destroyed)) }
    }

    fn enqueue(self: &Arc<Self>, channel_id: &str, message: OutboundMessage, options: SendOptions, tx: Waiter) {
        let priority = if options.high_priority {
            Priority::High
        } else {
            Priority::Normal
        };
        let now = Instant::now();
        let merge_window = Duration::from_millis(self.config.merge_window_ms);

        let mut inner = self.inner.lock();
        if inner.destroyed {
            let _ = tx.send(Err(SendError::Destroyed));
            return;
        }

        let queue = inner.queues.entry(channel_id.to_string()).or_default();

        // ── Merge path ──────────────────────────────────────────────────
        if let Some(key) = options.merge_key.as_deref().filter(|k| !k.is_empty()) {
            if message.components.is_empty() {
                let target_index = queue.iter().position(|item| {
                    item.merge_key.as_deref() == Some(key)
                        && item.message.components.is_empty()
                        && now.duration_since(item.enqueued_at) <= merge_window
                        && item.message.text.chars().count() + 1 + message.text.chars().count()
                            <= MERGED_TEXT_MAX_CHARS
                });
                if let Some(index) = target_index {
                    let target = &mut queue[index];
                    target.message.text.push('\n');
                    target.message.text.push_str(&message.text);
                    target.waiters.push(tx);
                    // A high caller promotes the target and moves it to the
                    // queue head; a normal merge leaves position (and an
                    // already-high target) untouched.
                    if priority == Priority::High && target.priority == Priority::Normal {
                        target.priority = Priority::High;
                        let item = queue.remove(index).expect("index valid");
                        queue.push_front(item);
                    }
                    drop(inner);
                    self.schedule_dispatch();
                    return;
                }
            }
        }

        // ── Insert path ─────────────────────────────────────────────────
        let item = QueueItem {
            message,
            merge_key: options.merge_key,
            priority,
            enqueued_at: now,
            waiters: vec![tx],
        };
        match priority {
            Priority::Normal => queue.push_back(item),
            Priority::High => {
                // Behind existing high items, ahead of normal ones.
                let index = queue
                    .iter()
                    .position(|existing| existing.priority == Priority::Normal)
                    .unwrap_or(queue.len());
                queue.insert(index, item);
            }
        }

        // ── Overflow ────────────────────────────────────────────────────
        while queue.len() > self.config.channel_max_queue_size {
            let oldest_index = queue
                .iter()
                .enumerate()
                .min_by_key(|(_, item)| item.enqueued_at)
                .map(|(i, _)| i)
                .expect("queue non-empty");
            if let Some(dropped) = queue.remove(oldest_index) {
                tracing::warn!(channel = %channel_id, "channel queue overflow, dropping oldest item");
                dropped.resolve(Err(SendError::QueueOverflow));
            }
        }

        if !inner.rotation.iter().any(|c| c == channel_id) {
            inner.rotation.push_back(channel_id.to_string());
        }
        drop(inner);
        self.schedule_dispatch();
    }

    /// Start the dispatcher unless one is already running.
    fn schedule_dispatch(self: &Arc<Self>) {
        if self.dispatcher_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            queue.dispatch_loop().await;
        });
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let next = self.pick_next();
            match next {
                Pick::Item { channel_id, item } => {
                    self.global.acquire().await;
                    self.global.record();
                    self.channel_limiter(&channel_id).record();

                    match self.executor.execute(&channel_id, &item.message).await {
                        Ok(()) => item.resolve(Ok(())),
                        Err(ChatError::RateLimited {
                            retry_after_ms,
                            global,
                        }) => {
                            let pause = Duration::from_millis(retry_after_ms);
                            if global {
                                self.global.pause(pause);
                            } else {
                                self.channel_limiter(&channel_id).pause(pause);
                            }
                            // Same item, same waiters, head of its channel.
                            let mut inner = self.inner.lock();
                            if inner.destroyed {
                                item.resolve(Err(SendError::Destroyed));
                            } else {
                                inner
                                    .queues
                                    .entry(channel_id.clone())
                                    .or_default()
                                    .push_front(item);
                            }
                        }
                        Err(ChatError::Api(message)) => {
                            item.resolve(Err(SendError::Failed(message)));
                        }
                    }
                }
                Pick::Sleep(wait) => tokio::time::sleep(wait).await,
                Pick::Idle => {
                    self.dispatcher_running.store(false, Ordering::SeqCst);
                    // Work may have arrived between the emptiness check and
                    // clearing the flag; reclaim the dispatcher if so.
                    let has_work = {
                        let inner = self.inner.lock();
                        !inner.destroyed && inner.queues.values().any(|q| !q.is_empty())
                    };
                    if has_work && !self.dispatcher_running.swap(true, Ordering::SeqCst) {
                        continue;
                    }
                    return;
                }
            }
        }
    }

    fn pick_next(&self) -> Pick {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Pick::Idle;
        }

        let rotation: Vec<String> = inner.rotation.iter().cloned().collect();
        let mut min_wait: Option<Duration> = None;

        for channel_id in rotation {
            let Some(queue) = inner.queues.get(&channel_id) else {
                continue;
            };
            if queue.is_empty() {
                continue;
            }
            let limiter = self
                .limiter_entry(&mut inner, &channel_id);
            let wait = limiter.wait_time();
            if wait.is_zero() {
                let item = inner
                    .queues
                    .get_mut(&channel_id)
                    .and_then(|q| q.pop_front())
                    .expect("checked non-empty");
                // Rotate the served channel to the back for fairness.
                if let Some(pos) = inner.rotation.iter().position(|c| *c == channel_id) {
                    inner.rotation.remove(pos);
                    inner.rotation.push_back(channel_id.clone());
                }
                return Pick::Item { channel_id, item };
            }
            min_wait = Some(match min_wait {
                Some(current) => current.min(wait),
                None => wait,
            });
        }

        match min_wait {
            // Every channel with work is rate-limited: sleep to the
            // earliest unblock.
            Some(wait) => Pick::Sleep(wait),
            None => Pick::Idle,
        }
    }

    fn channel_limiter(&self, channel_id: &str) -> Arc<SlidingWindowLimiter> {
        let mut inner = self.inner.lock();
        self.limiter_entry(&mut inner, channel_id)
    }

    fn limiter_entry(&self, inner: &mut Inner, channel_id: &str) -> Arc<SlidingWindowLimiter> {
        inner
            .limiters
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                Arc::new(SlidingWindowLimiter::new(
                    self.config.channel_limit,
                    Duration::from_millis(self.config.channel_window_ms),
                ))
            })
            .clone()
    }

    /// Flush: reject every queued item and refuse further sends.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        inner.destroyed = true;
        for (_, queue) in inner.queues.drain() {
            for item in queue {
                item.resolve(Err(SendError::Destroyed));
            }
        }
    }

    /// Queued item count for one channel (introspection).
    pub fn queue_depth(&self, channel_id: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(channel_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

enum Pick {
    Item { channel_id: String, item: QueueItem },
    Sleep(Duration),
    Idle,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockExecutor {
        calls: Mutex<Vec<(String, String)>>,
        /// Scripted failures consumed in order before the first success.
        failures: Mutex<VecDeque<ChatError>>,
    }

    impl MockExecutor {
        fn new() -> Arc<Self> {
            Self::with_failures(Vec::new())
        }

        fn with_failures(failures: Vec<ChatError>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(failures.into()),
            })
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ChatExecutor for MockExecutor {
        async fn execute(
            &self,
            channel_id: &str,
            message: &OutboundMessage,
        ) -> Result<(), ChatError> {
            self.calls
                .lock()
                .push((channel_id.to_string(), message.text.clone()));
            if let Some(failure) = self.failures.lock().pop_front() {
                return Err(failure);
            }
            Ok(())
        }
    }

    fn config() -> ThrottleConfig {
        ThrottleConfig::default()
    }

    #[tokio::test]
    async fn single_channel_fifo_order() {
        let executor = MockExecutor::new();
        let queue = ThrottleQueue::new(executor.clone(), config());

        let sends: Vec<_> = (0..5)
            .map(|i| {
                queue.send(
                    "c1",
                    OutboundMessage::text(format!("msg-{i}")),
                    SendOptions::default(),
                )
            })
            .collect();
        for send in sends {
            send.await.unwrap();
        }

        let texts: Vec<String> = executor.calls().into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]);
    }

    #[tokio::test]
    async fn merge_folds_within_window() {
        let executor = MockExecutor::new();
        let queue = ThrottleQueue::new(executor.clone(), {
            // Keep the channel limiter busy so both sends stay queued long
            // enough to merge deterministically.
            let mut c = config();
            c.merge_window_ms = 300;
            c
        });
        // Block dispatching for a beat by saturating the channel limiter.
        queue.channel_limiter("c1").pause(Duration::from_millis(50));

        let a = queue.send(
            "c1",
            OutboundMessage::text("a"),
            SendOptions {
                merge_key: Some("m".into()),
                high_priority: false,
            },
        );
        let b = queue.send(
            "c1",
            OutboundMessage::text("b"),
            SendOptions {
                merge_key: Some("m".into()),
                high_priority: false,
            },
        );

        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();

        let calls = executor.calls();
        assert_eq!(calls.len(), 1, "exactly one merged payload");
        assert_eq!(calls[0].1, "a\nb");
    }

    #[tokio::test]
    async fn oversized_merge_stays_separate() {
        let executor = MockExecutor::new();
        let queue = ThrottleQueue::new(executor.clone(), config());
        queue.channel_limiter("c1").pause(Duration::from_millis(50));

        let big_a = "x".repeat(1_500);
        let big_b = "y".repeat(600);
        let a = queue.send(
            "c1",
            OutboundMessage::text(big_a.clone()),
            SendOptions {
                merge_key: Some("m".into()),
                high_priority: false,
            },
        );
        let b = queue.send(
            "c1",
            OutboundMessage::text(big_b.clone()),
            SendOptions {
                merge_key: Some("m".into()),
                high_priority: false,
            },
        );
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();

        let texts: Vec<String> = executor.calls().into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts, vec![big_a, big_b], "two payloads in order");
    }

    #[tokio::test]
    async fn overflow_rejects_the_oldest_items() {
        let executor = MockExecutor::new();
        let mut c = config();
        c.channel_max_queue_size = 2;
        let queue = ThrottleQueue::new(executor.clone(), c);
        // Block dispatch entirely while enqueueing.
        queue.channel_limiter("c1").pause(Duration::from_millis(100));

        let first = queue.send("c1", OutboundMessage::text("first"), SendOptions::default());
        let second = queue.send("c1", OutboundMessage::text("second"), SendOptions::default());
        let third = queue.send("c1", OutboundMessage::text("third"), SendOptions::default());
        let fourth = queue.send("c1", OutboundMessage::text("fourth"), SendOptions::default());

        let (r1, r2, r3, r4) = tokio::join!(first, second, third, fourth);
        assert_eq!(r1, Err(SendError::QueueOverflow));
        assert_eq!(r2, Err(SendError::QueueOverflow));
        r3.unwrap();
        r4.unwrap();

        let texts: Vec<String> = executor.calls().into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts, vec!["third", "fourth"]);
    }

    #[tokio::test]
    async fn rate_limit_retries_same_item_and_resolves_once() {
        let executor = MockExecutor::with_failures(vec![ChatError::RateLimited {
            retry_after_ms: 10,
            global: false,
        }]);
        let queue = ThrottleQueue::new(executor.clone(), config());

        queue
            .send("c1", OutboundMessage::text("retry me"), SendOptions::default())
            .await
            .unwrap();

        let calls = executor.calls();
        assert_eq!(calls.len(), 2, "exactly two executor invocations");
        assert_eq!(calls[0].1, "retry me");
        assert_eq!(calls[1].1, "retry me");
    }

    #[tokio::test]
    async fn global_rate_limit_pauses_all_channels() {
        let executor = MockExecutor::with_failures(vec![ChatError::RateLimited {
            retry_after_ms: 20,
            global: true,
        }]);
        let queue = ThrottleQueue::new(executor.clone(), config());

        let start = Instant::now();
        queue
            .send("c1", OutboundMessage::text("x"), SendOptions::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn api_failure_rejects_with_detail() {
        let executor = MockExecutor::with_failures(vec![ChatError::Api("boom".into())]);
        let queue = ThrottleQueue::new(executor.clone(), config());

        let err = queue
            .send("c1", OutboundMessage::text("x"), SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, SendError::Failed("boom".into()));
        assert_eq!(executor.calls().len(), 1, "api failures are not retried");
    }

    #[tokio::test]
    async fn high_priority_goes_ahead_of_queued_normals() {
        let executor = MockExecutor::new();
        let queue = ThrottleQueue::new(executor.clone(), config());
        queue.channel_limiter("c1").pause(Duration::from_millis(50));

        let normal = queue.send("c1", OutboundMessage::text("normal"), SendOptions::default());
        let urgent = queue.send(
            "c1",
            OutboundMessage::text("urgent"),
            SendOptions {
                merge_key: None,
                high_priority: true,
            },
        );

        let (rn, ru) = tokio::join!(normal, urgent);
        rn.unwrap();
        ru.unwrap();

        let texts: Vec<String> = executor.calls().into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts, vec!["urgent", "normal"]);
    }

    #[tokio::test]
    async fn high_merge_promotes_target_to_head() {
        let executor = MockExecutor::new();
        let queue = ThrottleQueue::new(executor.clone(), config());
        queue.channel_limiter("c1").pause(Duration::from_millis(50));

        let other = queue.send("c1", OutboundMessage::text("other"), SendOptions::default());
        let target = queue.send(
            "c1",
            OutboundMessage::text("target"),
            SendOptions {
                merge_key: Some("k".into()),
                high_priority: false,
            },
        );
        let promoter = queue.send(
            "c1",
            OutboundMessage::text("promoter"),
            SendOptions {
                merge_key: Some("k".into()),
                high_priority: true,
            },
        );

        let (ro, rt, rp) = tokio::join!(other, target, promoter);
        ro.unwrap();
        rt.unwrap();
        rp.unwrap();

        let texts: Vec<String> = executor.calls().into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts, vec!["target\npromoter", "other"]);
    }

    #[tokio::test]
    async fn destroy_rejects_everything_pending() {
        let executor = MockExecutor::new();
        let queue = ThrottleQueue::new(executor.clone(), config());
        queue.channel_limiter("c1").pause(Duration::from_secs(60));

        let pending = queue.send("c1", OutboundMessage::text("never"), SendOptions::default());
        queue.destroy();
        assert_eq!(pending.await, Err(SendError::Destroyed));

        let after = queue
            .send("c1", OutboundMessage::text("late"), SendOptions::default())
            .await;
        assert_eq!(after, Err(SendError::Destroyed));
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let executor = MockExecutor::new();
        let queue = ThrottleQueue::new(executor.clone(), config());
        // c1 is paused, c2 flows.
        queue.channel_limiter("c1").pause(Duration::from_millis(100));

        let slow = queue.send("c1", OutboundMessage::text("slow"), SendOptions::default());
        queue
            .send("c2", OutboundMessage::text("fast"), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(executor.calls()[0].1, "fast");
        slow.await.unwrap();
    }
}
