//! Dispatch loop: poll, advance the cursor, match, spawn.
//!
//! Matching is sequential and in batch order; handlers run on their own
//! tasks so a slow or panicking handler never stalls polling.

use crate::config::PollConfig;
use crate::error::TransportError;
use crate::handler::Handler;
use crate::rules::RuleTable;
use crate::transport::{InboundMessage, Transport};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Next update id to request. Never decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor(u32);

impl Cursor {
    pub fn value(self) -> u32 {
        self.0
    }

    /// Move past `id` unless the cursor is already beyond it.
    pub fn advance(&mut self, id: u32) {
        self.0 = self.0.max(id.saturating_add(1));
    }
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    rules: RuleTable,
    handler: Arc<dyn Handler>,
    poll: PollConfig,
    cursor: Cursor,
    limiter: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        rules: RuleTable,
        handler: Arc<dyn Handler>,
        poll: PollConfig,
    ) -> Self {
        let limiter = poll
            .max_concurrent_handlers
            .filter(|limit| *limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            transport,
            rules,
            handler,
            poll,
            cursor: Cursor::default(),
            limiter,
            tracker: TaskTracker::new(),
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Match each message in order and spawn its handler.
    ///
    /// Returns the handler tasks; the loop itself never waits on them.
    pub fn dispatch_batch(&mut self, batch: Vec<InboundMessage>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(batch.len());
        for message in batch {
            self.cursor.advance(message.id);
            let action = self.rules.evaluate(&message);
            debug!(
                "Update {} from {:?} -> {:?}",
                message.id, message.conversation_id, action
            );

            let handler = Arc::clone(&self.handler);
            let limiter = self.limiter.clone();
            handles.push(self.tracker.spawn(async move {
                let _permit = match limiter {
                    Some(limiter) => match limiter.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                    None => None,
                };
                handler.handle(action, message).await;
            }));
        }
        handles
    }

    /// One polling cycle.
    pub async fn poll_once(&mut self) -> Result<Vec<JoinHandle<()>>, TransportError> {
        let batch = self
            .transport
            .poll(self.cursor.value(), self.poll.timeout_seconds)
            .await?;
        Ok(self.dispatch_batch(batch))
    }

    /// Poll until `shutdown` is cancelled, then wait (bounded) for in-flight
    /// handlers.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            "Polling {} (timeout {}s)",
            self.transport.platform_name(),
            self.poll.timeout_seconds
        );

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.poll_once() => polled,
            };

            if let Err(e) = polled {
                warn!(
                    "Error while getting updates: {} (retrying in {:?})",
                    e,
                    self.poll.retry_delay()
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll.retry_delay()) => {}
                }
            }
        }

        self.tracker.close();
        let in_flight = self.tracker.len();
        if in_flight > 0 {
            info!("Waiting for {} in-flight handlers", in_flight);
        }
        if tokio::time::timeout(self.poll.shutdown_grace(), self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Handlers still running after {:?}", self.poll.shutdown_grace());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForwardTunnelConfig, ReverseTunnelConfig};
    use crate::handler::CommandHandler;
    use crate::rules::{Action, AllowList};
    use crate::transport::testing::RecordingTransport;
    use crate::transport::ConversationId;
    use crate::tunnel::TunnelManager;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const ALLOWED: ConversationId = ConversationId(1);
    const STRANGER: ConversationId = ConversationId(2);

    fn poll_config() -> PollConfig {
        PollConfig {
            retry_delay_seconds: 0,
            shutdown_grace_seconds: 1,
            ..PollConfig::default()
        }
    }

    fn command_dispatcher(transport: &Arc<RecordingTransport>) -> Dispatcher {
        let tunnels = TunnelManager::new(
            transport.clone(),
            ReverseTunnelConfig::default(),
            ForwardTunnelConfig::default(),
        )
        .unwrap();
        let handler = CommandHandler::new(transport.clone(), Arc::new(tunnels));
        Dispatcher::new(
            transport.clone(),
            RuleTable::standard(AllowList::new([ALLOWED])),
            Arc::new(handler),
            poll_config(),
        )
    }

    /// Records actions instead of executing them.
    #[derive(Default)]
    struct ActionLog {
        actions: Mutex<Vec<(u32, Action)>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl Handler for ActionLog {
        async fn handle(&self, action: Action, message: InboundMessage) {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.actions.lock().unwrap().push((message.id, action));
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct PanicOnPing;

    #[async_trait]
    impl Handler for PanicOnPing {
        async fn handle(&self, action: Action, _message: InboundMessage) {
            if action == Action::Pong {
                panic!("handler failure");
            }
        }
    }

    async fn join_all(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_batch_scenario() {
        let transport = Arc::new(RecordingTransport::new());
        let mut dispatcher = command_dispatcher(&transport);

        let handles = dispatcher.dispatch_batch(vec![
            InboundMessage::new(10, ALLOWED, "/ping"),
            InboundMessage::new(11, ALLOWED, "/unknown"),
            InboundMessage::new(12, ALLOWED, "/ping"),
        ]);
        join_all(handles).await;

        assert_eq!(dispatcher.cursor().value(), 13);
        let mut texts = transport.sent_texts();
        texts.sort();
        assert_eq!(texts, vec!["pong", "pong", "unknown command"]);
    }

    #[tokio::test]
    async fn test_unauthorized_messages_only_ignored() {
        let log = Arc::new(ActionLog::default());
        let transport = Arc::new(RecordingTransport::new());
        let mut dispatcher = Dispatcher::new(
            transport,
            RuleTable::standard(AllowList::new([ALLOWED])),
            log.clone(),
            poll_config(),
        );

        let texts = ["/ping", "/opentunnel", "/stopconnecting", "/openngrok", "hi"];
        let batch = texts
            .iter()
            .enumerate()
            .map(|(i, text)| InboundMessage::new(i as u32, STRANGER, *text))
            .collect();
        join_all(dispatcher.dispatch_batch(batch)).await;

        let actions = log.actions.lock().unwrap().clone();
        assert_eq!(actions.len(), texts.len());
        assert!(actions.iter().all(|(_, action)| *action == Action::Ignore));
    }

    #[tokio::test]
    async fn test_cursor_is_monotonic() {
        let transport = Arc::new(RecordingTransport::new());
        let log = Arc::new(ActionLog::default());
        let mut dispatcher = Dispatcher::new(
            transport.clone(),
            RuleTable::standard(AllowList::new([ALLOWED])),
            log,
            poll_config(),
        );

        transport.push_batch(vec![
            InboundMessage::new(5, ALLOWED, "/ping"),
            InboundMessage::new(3, ALLOWED, "/ping"),
        ]);
        transport.push_batch(vec![]);
        transport.push_batch(vec![InboundMessage::new(4, ALLOWED, "/ping")]);
        transport.push_batch(vec![InboundMessage::new(9, ALLOWED, "/ping")]);

        for _ in 0..4 {
            join_all(dispatcher.poll_once().await.unwrap()).await;
        }

        assert_eq!(transport.polls(), vec![0, 6, 6, 6]);
        assert_eq!(dispatcher.cursor().value(), 10);
    }

    #[tokio::test]
    async fn test_transport_error_keeps_cursor() {
        let transport = Arc::new(RecordingTransport::new());
        let mut dispatcher = command_dispatcher(&transport);

        transport.push_batch(vec![InboundMessage::new(1, ALLOWED, "/ping")]);
        transport.push_error("connection reset");
        join_all(dispatcher.poll_once().await.unwrap()).await;

        assert!(dispatcher.poll_once().await.is_err());
        assert_eq!(dispatcher.cursor().value(), 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let transport = Arc::new(RecordingTransport::new());
        let mut dispatcher = Dispatcher::new(
            transport,
            RuleTable::standard(AllowList::new([ALLOWED])),
            Arc::new(PanicOnPing),
            poll_config(),
        );

        let handles = dispatcher.dispatch_batch(vec![
            InboundMessage::new(1, ALLOWED, "/ping"),
            InboundMessage::new(2, ALLOWED, "/other"),
        ]);
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await);
        }

        assert!(results[0].as_ref().unwrap_err().is_panic());
        assert!(results[1].is_ok());

        let more = dispatcher.dispatch_batch(vec![InboundMessage::new(3, ALLOWED, "/x")]);
        join_all(more).await;
        assert_eq!(dispatcher.cursor().value(), 4);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let log = Arc::new(ActionLog::default());
        let poll = PollConfig {
            max_concurrent_handlers: Some(1),
            ..poll_config()
        };
        let mut dispatcher = Dispatcher::new(
            Arc::new(RecordingTransport::new()),
            RuleTable::standard(AllowList::new([ALLOWED])),
            log.clone(),
            poll,
        );

        let batch = (0..4)
            .map(|id| InboundMessage::new(id, ALLOWED, "/ping"))
            .collect();
        join_all(dispatcher.dispatch_batch(batch)).await;

        assert_eq!(log.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(log.actions.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently_by_default() {
        let log = Arc::new(ActionLog::default());
        let mut dispatcher = Dispatcher::new(
            Arc::new(RecordingTransport::new()),
            RuleTable::standard(AllowList::new([ALLOWED])),
            log.clone(),
            poll_config(),
        );

        let batch = (0..4)
            .map(|id| InboundMessage::new(id, ALLOWED, "/ping"))
            .collect();
        join_all(dispatcher.dispatch_batch(batch)).await;

        assert!(log.max_running.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_run_recovers_from_errors_and_stops_on_shutdown() {
        let transport = Arc::new(RecordingTransport::new());
        let mut dispatcher = command_dispatcher(&transport);

        transport.push_error("timeout");
        transport.push_batch(vec![InboundMessage::new(20, ALLOWED, "/ping")]);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                dispatcher.run(shutdown).await;
                dispatcher
            }
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while transport.sent_texts().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no reply received");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        let dispatcher = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run should stop after shutdown")
            .unwrap();

        assert_eq!(transport.sent_texts(), vec!["pong"]);
        assert_eq!(dispatcher.cursor().value(), 21);
        assert_eq!(&transport.polls()[..3], &[0, 0, 21]);
    }

    #[test]
    fn test_cursor_advance() {
        let mut cursor = Cursor::default();
        cursor.advance(10);
        assert_eq!(cursor.value(), 11);
        cursor.advance(3);
        assert_eq!(cursor.value(), 11);
        cursor.advance(u32::MAX);
        assert_eq!(cursor.value(), u32::MAX);
    }
}
