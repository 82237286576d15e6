//! Observer hooks for connection and speaker lifecycle.
//!
//! Handlers are registered per [`EventKind`] and run on a detached task, one
//! after another, each in its own task so an error or panic in one handler is
//! logged and never stops the rest. Dispatch never blocks the caller.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

use crate::signaling::Member;
use crate::speaker::{SpeakerState, SpeakingFlags};

/// Names of the observable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionCreated,
    ConnectionDestroyed,
    UserConnected,
    UserDisconnected,
    UserSpeaking,
}

/// Payload of a Speaking notification.
#[derive(Debug, Clone)]
pub struct SpeakingEvent {
    // ---
    pub server_id: u64,
    pub ssrc: u32,
    pub user_id: Option<u64>,
    pub flags: SpeakingFlags,
    /// Resolved through the member directory, when one is configured
    pub member: Option<Member>,
    pub speaker: Arc<SpeakerState>,
}

/// An observable event.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    ConnectionCreated {
        server_id: u64,
        channel_id: u64,
    },
    ConnectionDestroyed {
        server_id: u64,
        reason: String,
    },
    UserConnected {
        server_id: u64,
        user_id: u64,
        ssrc: Option<u32>,
    },
    UserDisconnected {
        server_id: u64,
        user_id: u64,
    },
    UserSpeaking(SpeakingEvent),
}

impl VoiceEvent {
    // ---
    pub fn kind(&self) -> EventKind {
        // ---
        match self {
            VoiceEvent::ConnectionCreated { .. } => EventKind::ConnectionCreated,
            VoiceEvent::ConnectionDestroyed { .. } => EventKind::ConnectionDestroyed,
            VoiceEvent::UserConnected { .. } => EventKind::UserConnected,
            VoiceEvent::UserDisconnected { .. } => EventKind::UserDisconnected,
            VoiceEvent::UserSpeaking(_) => EventKind::UserSpeaking,
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Handler = Arc<dyn Fn(VoiceEvent) -> HandlerFuture + Send + Sync>;

/// Registered handlers, shared by every connection of one `VoiceLink`.
#[derive(Clone, Default)]
pub struct EventHub {
    // ---
    handlers: Arc<RwLock<HashMap<EventKind, Vec<Handler>>>>,
}

impl EventHub {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Registers `handler` for events of `kind`.
    ///
    /// # Example
    ///
    /// ```
    /// use voicelink::{EventHub, EventKind, VoiceEvent};
    ///
    /// let hub = EventHub::new();
    /// hub.subscribe(EventKind::UserSpeaking, |event: VoiceEvent| async move {
    ///     if let VoiceEvent::UserSpeaking(speaking) = event {
    ///         println!("{} is speaking", speaking.ssrc);
    ///     }
    ///     Ok::<_, anyhow::Error>(())
    /// });
    /// ```
    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(VoiceEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // ---
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(handler);
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        // ---
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Fires `event` on a detached task and returns immediately.
    ///
    /// The returned handle resolves once every handler has finished; callers
    /// on the control or media path drop it without awaiting.
    pub fn dispatch(&self, event: VoiceEvent) -> JoinHandle<()> {
        // ---
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        trace!("Dispatching {:?} to {} handlers", kind, handlers.len());

        tokio::spawn(async move {
            // ---
            for (index, handler) in handlers.into_iter().enumerate() {
                let event = event.clone();
                match tokio::spawn(async move { handler(event).await }).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("{:?} handler #{} failed: {:#}", kind, index, e),
                    Err(e) => error!("{:?} handler #{} panicked: {}", kind, index, e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn disconnected(user_id: u64) -> VoiceEvent {
        // ---
        VoiceEvent::UserDisconnected {
            server_id: 1,
            user_id,
        }
    }

    async fn failing_handler(_: VoiceEvent) -> anyhow::Result<()> {
        // ---
        anyhow::bail!("handler broke")
    }

    async fn panicking_handler(_: VoiceEvent) -> anyhow::Result<()> {
        // ---
        panic!("handler panicked")
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others() {
        // ---
        let hub = EventHub::new();
        let calls = Arc::new(AtomicUsize::new(0));

        hub.subscribe(EventKind::UserDisconnected, failing_handler);
        hub.subscribe(EventKind::UserDisconnected, panicking_handler);
        let counter = Arc::clone(&calls);
        hub.subscribe(EventKind::UserDisconnected, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        });

        hub.dispatch(disconnected(9)).await.expect("dispatch task");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_route_by_kind() {
        // ---
        let hub = EventHub::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        hub.subscribe(EventKind::ConnectionCreated, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        });

        hub.dispatch(disconnected(1)).await.expect("dispatch task");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        hub.dispatch(VoiceEvent::ConnectionCreated {
            server_id: 1,
            channel_id: 2,
        })
        .await
        .expect("dispatch task");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hub.handler_count(EventKind::ConnectionCreated), 1);
        assert_eq!(hub.handler_count(EventKind::UserSpeaking), 0);
    }

    #[tokio::test]
    async fn test_dispatch_does_not_wait_for_handlers() {
        // ---
        let hub = EventHub::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        hub.subscribe(EventKind::UserDisconnected, move |_| {
            let release_rx = Arc::clone(&release_rx);
            async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok::<_, anyhow::Error>(())
            }
        });

        let handle = hub.dispatch(disconnected(3));
        assert!(!handle.is_finished());
        release_tx.send(()).expect("handler waiting");
        handle.await.expect("dispatch task");
    }
}
