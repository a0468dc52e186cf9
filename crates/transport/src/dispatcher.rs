//! Topic-based routing of inbound messages.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Message, Result, TopicFilter};

/// Receives messages routed by a [`Dispatcher`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, message: Message) {
        (self)(message).await
    }
}

/// Single consumer of the inbound channel.
///
/// Routes are tried in registration order; the first whose filter matches
/// the topic receives the message. Handlers run inline, so a handler that
/// does slow work should spawn it.
#[derive(Default, Clone)]
pub struct Dispatcher {
    routes: Vec<(TopicFilter, Arc<dyn MessageHandler>)>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for topics matching `pattern`.
    pub fn on_message<H>(mut self, pattern: &str, handler: H) -> Result<Self>
    where
        H: MessageHandler + 'static,
    {
        let filter = TopicFilter::parse(pattern)?;
        self.routes.push((filter, Arc::new(handler)));
        Ok(self)
    }

    /// Filters of every registered route, for subscribing.
    pub fn filters(&self) -> Vec<TopicFilter> {
        self.routes.iter().map(|(f, _)| f.clone()).collect()
    }

    /// Routes one message. Returns false if no route matched.
    pub async fn dispatch(&self, message: Message) -> bool {
        let handler = self
            .routes
            .iter()
            .find(|(filter, _)| filter.matches(&message.topic))
            .map(|(_, handler)| handler.clone());

        match handler {
            Some(handler) => {
                handler.handle(message).await;
                true
            }
            None => {
                metrics::counter!("transport_unrouted_total").increment(1);
                tracing::debug!(topic = %message.topic, "No route for message; dropped");
                false
            }
        }
    }

    /// Consumes `inbound` until it closes.
    pub async fn run(self, mut inbound: mpsc::Receiver<Message>) {
        while let Some(message) = inbound.recv().await {
            self.dispatch(message).await;
        }
        tracing::debug!("Inbound channel closed; dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn first_matching_route_wins() {
        let specific = Arc::new(AtomicUsize::new(0));
        let general = Arc::new(AtomicUsize::new(0));

        let s = specific.clone();
        let g = general.clone();
        let dispatcher = Dispatcher::new()
            .on_message("responses/c1", move |_m: Message| {
                let s = s.clone();
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap()
            .on_message("responses/#", move |_m: Message| {
                let g = g.clone();
                async move {
                    g.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        assert!(dispatcher.dispatch(Message::new("responses/c1", "x")).await);
        assert!(dispatcher.dispatch(Message::new("responses/c2", "x")).await);
        assert!(!dispatcher.dispatch(Message::new("other", "x")).await);

        assert_eq!(specific.load(Ordering::SeqCst), 1);
        assert_eq!(general.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_stops_when_channel_closes() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let dispatcher = Dispatcher::new()
            .on_message("#", move |_m: Message| {
                let s = s.clone();
                async move {
                    s.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(Message::new("a", "1")).await.unwrap();
        tx.send(Message::new("b", "2")).await.unwrap();
        drop(tx);

        dispatcher.run(rx).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bad_pattern_is_rejected() {
        assert!(Dispatcher::new().on_message("a/#/b", |_m: Message| async {}).is_err());
    }
}
