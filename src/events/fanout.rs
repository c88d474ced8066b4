use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::types::SessionEvent;
use crate::configuration::types::{SinkConfig, SINK_QUEUE_CAPACITY};
use crate::error_handling::types::SinkError;

/// Consumer of session events. Implementations may block or fail; the bus
/// isolates them from sessions and from each other.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, event: &SessionEvent) -> Result<(), SinkError>;
}

struct SinkWorker {
    tx: mpsc::Sender<SessionEvent>,
    handle: JoinHandle<()>,
}

/// Fan-out hub between session proxies and event sinks.
///
/// Each sink gets its own bounded queue and drain task. Publishing never
/// waits: when a sink's queue is full the event is dropped for that sink
/// only, with an operational log line. Sink registrations can change at
/// runtime without touching active sessions.
pub struct EventBus {
    workers: Mutex<HashMap<String, SinkWorker>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SinkWorker>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a sink and spawns its drain task. A sink with the same
    /// name replaces the old one.
    pub fn register(&self, sink: Arc<dyn EventSink>) {
        let name = sink.name().to_string();
        let (tx, mut rx) = mpsc::channel::<SessionEvent>(SINK_QUEUE_CAPACITY);
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.publish(&event).await {
                    // The sink's problem stays the sink's problem.
                    warn!("Sink '{}' failed to take event: {}", task_name, e);
                }
            }
            debug!("Sink '{}' drain task finished", task_name);
        });
        info!("Event sink '{}' registered", name);
        if let Some(old) = self.lock().insert(name, SinkWorker { tx, handle }) {
            drop(old.tx);
        }
    }

    pub fn unregister(&self, name: &str) {
        if let Some(worker) = self.lock().remove(name) {
            info!("Event sink '{}' unregistered", name);
            drop(worker.tx);
            worker.handle.abort();
        }
    }

    /// Delivers one event to every registered sink. Non-blocking; a full
    /// queue means a drop for that sink only.
    pub fn publish(&self, event: SessionEvent) {
        let workers = self.lock();
        for (name, worker) in workers.iter() {
            if let Err(e) = worker.tx.try_send(event.clone()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!("Sink '{}' queue full, event dropped for this sink", name);
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        warn!("Sink '{}' queue closed, event dropped for this sink", name);
                    }
                }
            }
        }
    }

    /// Reconciles registrations against a configuration snapshot: sinks
    /// absent from the new list are removed, new names are built and
    /// added. Unchanged names are left alone so their queues survive.
    pub fn apply_config(&self, configs: &[SinkConfig]) {
        let existing: Vec<String> = self.lock().keys().cloned().collect();
        for name in &existing {
            if !configs.iter().any(|c| &c.name == name) {
                self.unregister(name);
            }
        }
        for config in configs {
            if !existing.contains(&config.name) {
                match super::sinks::build(config) {
                    Ok(sink) => self.register(sink),
                    Err(e) => warn!("Sink '{}' could not be built: {}", config.name, e),
                }
            }
        }
    }

    pub fn sink_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Closes all queues and waits for the drain tasks to finish what they
    /// already accepted.
    pub async fn shutdown(&self) {
        let workers: Vec<(String, SinkWorker)> = self.lock().drain().collect();
        for (name, worker) in workers {
            drop(worker.tx);
            if worker.handle.await.is_err() {
                warn!("Sink '{}' drain task ended abnormally", name);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;
    use uuid::Uuid;

    /// Test sink that records what it sees and can be made slow or broken.
    struct ProbeSink {
        name: String,
        seen: AsyncMutex<Vec<SessionEvent>>,
        delay: Duration,
        fail: bool,
    }

    impl ProbeSink {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: AsyncMutex::new(Vec::new()),
                delay: Duration::ZERO,
                fail: false,
            })
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: AsyncMutex::new(Vec::new()),
                delay,
                fail: false,
            })
        }

        fn broken(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: AsyncMutex::new(Vec::new()),
                delay: Duration::ZERO,
                fail: true,
            })
        }

        async fn count(&self) -> usize {
            self.seen.lock().await.len()
        }
    }

    #[async_trait]
    impl EventSink for ProbeSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn publish(&self, event: &SessionEvent) -> Result<(), SinkError> {
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(SinkError::Unavailable("broken on purpose".to_string()));
            }
            self.seen.lock().await.push(event.clone());
            Ok(())
        }
    }

    fn some_event() -> SessionEvent {
        SessionEvent::disconnect(Uuid::new_v4(), "attacker closed the connection")
    }

    #[tokio::test]
    async fn every_sink_sees_every_event() {
        let bus = EventBus::new();
        let a = ProbeSink::new("a");
        let b = ProbeSink::new("b");
        bus.register(a.clone());
        bus.register(b.clone());

        for _ in 0..10 {
            bus.publish(some_event());
        }
        bus.shutdown().await;

        assert_eq!(a.count().await, 10);
        assert_eq!(b.count().await, 10);
    }

    #[tokio::test]
    async fn failing_sink_does_not_starve_the_healthy_one() {
        let bus = EventBus::new();
        let healthy = ProbeSink::new("healthy");
        let broken = ProbeSink::broken("broken");
        bus.register(healthy.clone());
        bus.register(broken.clone());

        for _ in 0..25 {
            bus.publish(some_event());
        }
        bus.shutdown().await;

        assert_eq!(healthy.count().await, 25);
        assert_eq!(broken.count().await, 0);
    }

    #[tokio::test]
    async fn slow_sink_overflows_alone_and_publish_never_blocks() {
        let bus = EventBus::new();
        let fast = ProbeSink::new("fast");
        let slow = ProbeSink::slow("slow", Duration::from_secs(30));
        bus.register(fast.clone());
        bus.register(slow.clone());

        let burst = SINK_QUEUE_CAPACITY + 50;
        let started = std::time::Instant::now();
        for _ in 0..burst {
            bus.publish(some_event());
        }
        // The slow sink is stuck on its first event; publishing stayed
        // instantaneous regardless.
        assert!(started.elapsed() < Duration::from_secs(1));

        // Give the fast drain task a moment, then drop the slow worker
        // instead of waiting thirty seconds for it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fast.count().await, burst);
        bus.unregister("slow");
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn apply_config_adds_and_removes_by_name() {
        let bus = EventBus::new();
        bus.register(ProbeSink::new("keep"));
        bus.register(ProbeSink::new("drop"));

        let configs = vec![
            SinkConfig {
                name: "keep".to_string(),
                kind: crate::configuration::types::SinkKind::Log,
            },
            SinkConfig {
                name: "ops-log".to_string(),
                kind: crate::configuration::types::SinkKind::Log,
            },
        ];
        bus.apply_config(&configs);

        assert_eq!(bus.sink_names(), vec!["keep".to_string(), "ops-log".to_string()]);
    }
}
