//! Executes invocation effects as spawned tasks and feeds their outcomes back
//! onto the event loop queue.
//!
//! At most one task runs per [`EffectFamily`]. Starting a new one aborts the
//! previous task; a completion that was already queued when its task was
//! superseded is recognised by its stale generation and dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::client::Command;
use crate::config::ResolvedConfig;
use crate::event_engine::EffectFamily;
use crate::event_engine::presence::HeartbeatEvent;
use crate::event_engine::subscribe::SubscribeEvent;
use crate::protocol;
use crate::transport::Transport;
use crate::types::{Cursor, Membership};

/// Outcome of a finished effect, routed to the engine that requested it.
#[derive(Debug)]
pub(crate) enum Completion {
    Subscribe(SubscribeEvent),
    Heartbeat(HeartbeatEvent),
}

/// Everything the event loop consumes, in arrival order.
#[derive(Debug)]
pub(crate) enum LoopMessage {
    Command(Command),
    Completion {
        family: EffectFamily,
        generation: u64,
        completion: Completion,
    },
}

struct Inflight {
    generation: u64,
    handle: JoinHandle<()>,
}

pub(crate) struct Dispatcher {
    transport: Arc<dyn Transport>,
    config: Arc<ResolvedConfig>,
    queue: mpsc::WeakUnboundedSender<LoopMessage>,
    inflight: HashMap<EffectFamily, Inflight>,
    next_generation: u64,
}

impl Dispatcher {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        config: Arc<ResolvedConfig>,
        queue: mpsc::WeakUnboundedSender<LoopMessage>,
    ) -> Self {
        Self {
            transport,
            config,
            queue,
            inflight: HashMap::new(),
            next_generation: 0,
        }
    }

    fn invoke<F>(&mut self, family: EffectFamily, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.cancel(family);
        self.next_generation += 1;
        let generation = self.next_generation;
        let queue = self.queue.clone();

        let handle = tokio::spawn(async move {
            let completion = work.await;
            if let Some(queue) = queue.upgrade() {
                let _ = queue.send(LoopMessage::Completion {
                    family,
                    generation,
                    completion,
                });
            }
        });
        trace!(?family, generation, "effect started");
        self.inflight.insert(family, Inflight { generation, handle });
    }

    /// Abort the running task of `family`, if any.
    pub(crate) fn cancel(&mut self, family: EffectFamily) {
        if let Some(inflight) = self.inflight.remove(&family) {
            inflight.handle.abort();
            trace!(?family, generation = inflight.generation, "effect cancelled");
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, inflight) in self.inflight.drain() {
            inflight.handle.abort();
        }
    }

    /// Whether a completion belongs to the current task of its family.
    /// Accepting it retires the task.
    pub(crate) fn accept(&mut self, family: EffectFamily, generation: u64) -> bool {
        match self.inflight.get(&family) {
            Some(inflight) if inflight.generation == generation => {
                self.inflight.remove(&family);
                true
            }
            _ => {
                debug!(?family, generation, "discarding stale completion");
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self, family: EffectFamily) -> bool {
        self.inflight.contains_key(&family)
    }

    // -----------------------------------------------------------------------
    // Invocations
    // -----------------------------------------------------------------------

    /// A restored valid cursor completes immediately without a network call.
    pub(crate) fn handshake(
        &mut self,
        membership: Membership,
        cursor: Option<Cursor>,
        state: Option<Value>,
    ) {
        let transport = Arc::clone(&self.transport);
        let config = Arc::clone(&self.config);
        self.invoke(EffectFamily::Subscribe, async move {
            if let Some(cursor) = cursor.filter(Cursor::is_valid) {
                return Completion::Subscribe(SubscribeEvent::HandshakeSuccess { cursor });
            }
            let request = protocol::handshake_request(&config, &membership, state.as_ref());
            let outcome = match transport.send(request).await {
                Ok(response) => protocol::parse_subscribe_response(&response),
                Err(e) => Err(e),
            };
            Completion::Subscribe(match outcome {
                Ok(response) => SubscribeEvent::HandshakeSuccess {
                    cursor: response.cursor,
                },
                Err(error) => {
                    warn!(error = %error, "handshake failed");
                    SubscribeEvent::HandshakeFailure { error }
                }
            })
        });
    }

    pub(crate) fn receive(&mut self, membership: Membership, cursor: Cursor) {
        let transport = Arc::clone(&self.transport);
        let config = Arc::clone(&self.config);
        self.invoke(EffectFamily::Subscribe, async move {
            let request = protocol::receive_request(&config, &membership, cursor);
            let outcome = match transport.send(request).await {
                Ok(response) => protocol::parse_subscribe_response(&response),
                Err(e) => Err(e),
            };
            Completion::Subscribe(match outcome {
                Ok(response) => SubscribeEvent::ReceiveSuccess {
                    cursor: response.cursor,
                    messages: response.messages,
                },
                Err(error) => {
                    warn!(error = %error, cursor = %cursor, "receive failed");
                    SubscribeEvent::ReceiveFailure { error }
                }
            })
        });
    }

    pub(crate) fn heartbeat(&mut self, membership: Membership, state: Option<Value>) {
        let transport = Arc::clone(&self.transport);
        let config = Arc::clone(&self.config);
        self.invoke(EffectFamily::Heartbeat, async move {
            let request = protocol::heartbeat_request(&config, &membership, state.as_ref());
            let outcome = match transport.send(request).await {
                Ok(response) => protocol::parse_ack_response(&response),
                Err(e) => Err(e),
            };
            Completion::Heartbeat(match outcome {
                Ok(()) => HeartbeatEvent::HeartbeatSuccess,
                Err(error) => {
                    warn!(error = %error, "heartbeat failed");
                    HeartbeatEvent::HeartbeatFailure { error }
                }
            })
        });
    }

    pub(crate) fn wait(&mut self, family: EffectFamily, delay: Duration, completion: Completion) {
        debug!(?family, ?delay, "waiting before retry");
        self.invoke(family, async move {
            tokio::time::sleep(delay).await;
            completion
        });
    }

    /// Fire-and-forget: leave calls are not tracked or retried.
    pub(crate) fn leave(&self, membership: Membership) {
        let transport = Arc::clone(&self.transport);
        let request = protocol::leave_request(&self.config, &membership);
        tokio::spawn(async move {
            let outcome = match transport.send(request).await {
                Ok(response) => protocol::parse_ack_response(&response),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => debug!(channels = ?membership.channels, "left"),
                Err(error) => warn!(error = %error, "leave failed"),
            }
        });
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::transport::{TransportRequest, TransportResponse};
    use crate::types::{Error, Result};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<TransportRequest>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
            self.requests.lock().unwrap().push(request);
            Ok(TransportResponse {
                status: 200,
                body: Bytes::from_static(br#"{"t":{"t":"5","r":1},"m":[]}"#),
            })
        }
    }

    struct Hanging;

    #[async_trait]
    impl Transport for Hanging {
        async fn send(&self, _request: TransportRequest) -> Result<TransportResponse> {
            std::future::pending::<()>().await;
            Err(Error::Timeout)
        }
    }

    fn config() -> Arc<ResolvedConfig> {
        Arc::new(Configuration::new("demo", "user-1").resolve().unwrap())
    }

    fn membership() -> Membership {
        Membership::new(["ch1"], Vec::<String>::new())
    }

    #[tokio::test]
    async fn completion_carries_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new(transport.clone(), config(), tx.downgrade());

        dispatcher.handshake(membership(), None, None);
        match rx.recv().await {
            Some(LoopMessage::Completion {
                family,
                generation,
                completion: Completion::Subscribe(SubscribeEvent::HandshakeSuccess { cursor }),
            }) => {
                assert_eq!(family, EffectFamily::Subscribe);
                assert_eq!(cursor, Cursor::new(5, 1));
                assert!(dispatcher.accept(family, generation));
                assert!(!dispatcher.is_running(EffectFamily::Subscribe));
            }
            other => panic!("expected handshake completion, got {other:?}"),
        }
        assert_eq!(transport.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restored_cursor_skips_network() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new(transport.clone(), config(), tx.downgrade());

        dispatcher.handshake(membership(), Some(Cursor::new(42, 3)), None);
        match rx.recv().await {
            Some(LoopMessage::Completion {
                completion: Completion::Subscribe(SubscribeEvent::HandshakeSuccess { cursor }),
                ..
            }) => assert_eq!(cursor, Cursor::new(42, 3)),
            other => panic!("expected handshake completion, got {other:?}"),
        }
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn superseded_generation_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(Arc::new(Hanging), config(), tx.downgrade());

        dispatcher.receive(membership(), Cursor::new(1, 1));
        dispatcher.receive(membership(), Cursor::new(2, 1));
        assert!(!dispatcher.accept(EffectFamily::Subscribe, 1));
        assert!(dispatcher.accept(EffectFamily::Subscribe, 2));
    }

    #[tokio::test]
    async fn cancelled_family_rejects_late_completion() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(Arc::new(Hanging), config(), tx.downgrade());

        dispatcher.heartbeat(membership(), None);
        dispatcher.cancel(EffectFamily::Heartbeat);
        assert!(!dispatcher.is_running(EffectFamily::Heartbeat));
        assert!(!dispatcher.accept(EffectFamily::Heartbeat, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(Arc::new(Hanging), config(), tx.downgrade());

        dispatcher.wait(
            EffectFamily::SubscribeTimer,
            Duration::from_secs(2),
            Completion::Subscribe(SubscribeEvent::RetryTimerFired),
        );
        let started = tokio::time::Instant::now();
        let message = rx.recv().await;
        assert!(matches!(
            message,
            Some(LoopMessage::Completion {
                family: EffectFamily::SubscribeTimer,
                ..
            })
        ));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_wait_stays_pending_until_cancelled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(Arc::new(Hanging), config(), tx.downgrade());

        dispatcher.wait(
            EffectFamily::HeartbeatTimer,
            Duration::MAX,
            Completion::Heartbeat(HeartbeatEvent::TimerFired),
        );
        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert!(rx.try_recv().is_err());
        assert!(dispatcher.is_running(EffectFamily::HeartbeatTimer));

        dispatcher.cancel(EffectFamily::HeartbeatTimer);
        assert!(!dispatcher.is_running(EffectFamily::HeartbeatTimer));
    }
}
