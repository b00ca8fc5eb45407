// src/stream/dispatch.rs
// The dispatch side of the bridge: whatever executes inbound requests

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::message::{Notification, Request, Response};

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

/// Executes inbound requests and notifications.
///
/// An `Err` from `handle_request` means the dispatcher itself failed; a
/// request that merely failed should come back as an error response.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn handle_request(&self, request: Request) -> anyhow::Result<Option<Response>>;

    async fn handle_notification(&self, notification: Notification) -> anyhow::Result<()>;

    /// Notifications the dispatcher emits on its own, to be forwarded onto the
    /// stream. Each call opens a new unbounded subscription.
    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        None
    }
}

/// Receives notifications arriving from the stream, or leaving through it.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn on_notification(&self, notification: &Notification) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> NotificationHandler for F
where
    F: Fn(&Notification) + Send + Sync,
{
    async fn on_notification(&self, notification: &Notification) -> anyhow::Result<()> {
        self(notification);
        Ok(())
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
type RequestHandler = Arc<dyn Fn(Option<Value>) -> HandlerFuture + Send + Sync>;
type NotificationCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Method-name routing to registered async handlers.
pub struct HandlerRegistry {
    handlers: HashMap<String, RequestHandler>,
    notification_handlers: HashMap<String, NotificationCallback>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: HashMap::new(),
            notification_handlers: HashMap::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn register_handler<F, Fut>(&mut self, method: &str, handler: F) -> &mut Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: RequestHandler =
            Arc::new(move |params| -> HandlerFuture { Box::pin(handler(params)) });
        self.handlers.insert(method.to_string(), handler);
        self
    }

    pub fn register_notification_handler<F>(&mut self, method: &str, handler: F) -> &mut Self
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.notification_handlers
            .insert(method.to_string(), Arc::new(handler));
        self
    }

    /// Publishes a notification that was not asked for by any request.
    /// Returns how many engines were listening. Subscribers that went away
    /// are dropped here.
    pub fn emit_notification(&self, method: &str, params: Option<Value>) -> usize {
        let notification = Notification::new(method, params);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|subscriber| subscriber.send(notification.clone()).is_ok());
        subscribers.len()
    }
}

#[async_trait]
impl Dispatcher for HandlerRegistry {
    async fn handle_request(&self, request: Request) -> anyhow::Result<Option<Response>> {
        let id = request.id().clone();
        let handler = match self.handlers.get(request.method()) {
            Some(handler) => handler.clone(),
            None => {
                debug!(method = %request.method(), "No handler registered");
                return Ok(Some(Response::error(
                    id,
                    METHOD_NOT_FOUND,
                    &format!("Method not found: {}", request.method()),
                )));
            }
        };

        let response = match handler(request.params().cloned()).await {
            Ok(result) => Response::ok(id, result),
            Err(e) => {
                error!(method = %request.method(), error = %e, "Handler failed");
                Response::error(id, INTERNAL_ERROR, &e.to_string())
            }
        };
        Ok(Some(response))
    }

    async fn handle_notification(&self, notification: Notification) -> anyhow::Result<()> {
        if let Some(handler) = self.notification_handlers.get(notification.method()) {
            handler(notification.params().cloned());
        }
        Ok(())
    }

    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sender);
        Some(receiver)
    }
}
