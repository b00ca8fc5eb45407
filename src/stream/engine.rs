// src/stream/engine.rs
// Correlates outbound calls with responses arriving over the stream, and feeds
// inbound calls to the dispatcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::dispatch::{Dispatcher, NotificationHandler};
use super::errors::{Result, StreamError};
use super::message::{JsonObject, Message, Notification, Request, RequestId, Response, ResponseSlot};
use super::pending::{Completion, PendingCall, PendingCallTable};
use super::transport::{self, MessageSink, MessageStream, Outbound};
use crate::config::BridgeConfig;

const EVENT_CAPACITY: usize = 64;

/// Configures a [`CorrelationEngine`].
#[derive(Default)]
pub struct EngineBuilder {
    dispatcher: Option<Arc<dyn Dispatcher>>,
    notification_handler: Option<Arc<dyn NotificationHandler>>,
    outbound_notification_hook: Option<Arc<dyn NotificationHandler>>,
    retry_on: Option<String>,
    pending: Option<PendingCallTable>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        let mut builder = Self::new();
        builder.retry_on = config.retry_on_method.clone();
        builder
    }

    /// Inbound requests and notifications go here.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Called for each inbound notification, before any recovery it triggers.
    pub fn notification_handler<H>(mut self, handler: H) -> Self
    where
        H: NotificationHandler + 'static,
    {
        self.notification_handler = Some(Arc::new(handler));
        self
    }

    /// Awaited for each outbound notification before it is pushed.
    pub fn outbound_notification_hook<H>(mut self, hook: H) -> Self
    where
        H: NotificationHandler + 'static,
    {
        self.outbound_notification_hook = Some(Arc::new(hook));
        self
    }

    /// An inbound notification with this method re-sends every pending request.
    pub fn retry_on(mut self, method: &str) -> Self {
        self.retry_on = Some(method.to_string());
        self
    }

    /// Uses `table` as the engine's pending-call store instead of a fresh one.
    /// Calls already registered in it resolve like any other.
    pub fn pending_table(mut self, table: PendingCallTable) -> Self {
        self.pending = Some(table);
        self
    }

    /// Must be called from within a tokio runtime.
    pub fn build(self) -> (CorrelationEngine, MessageStream) {
        let (outbound, stream) = transport::channel();
        let (completions, mut queue) = mpsc::unbounded_channel::<Completion>();

        // Completions fire here, in arrival order, never on the stack of the
        // write that matched them.
        tokio::spawn(async move {
            while let Some(completion) = queue.recv().await {
                let _ = completion.send(());
            }
        });

        // The forwarder stops once the engine is dropped, releasing its
        // handle on the stream.
        let (shutdown, mut stopped) = oneshot::channel::<()>();
        if let Some(mut notifications) = self.dispatcher.as_ref().and_then(|d| d.notifications()) {
            let outbound = outbound.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        received = notifications.recv() => match received {
                            Some(notification) => {
                                if outbound.push(notification.into_value()).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        _ = &mut stopped => break,
                    }
                }
                debug!("Dispatcher notification forwarder stopped");
            });
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let engine = CorrelationEngine {
            inner: Arc::new(Inner {
                pending: Mutex::new(self.pending.unwrap_or_default()),
                outbound,
                completions,
                events,
                dispatcher: self.dispatcher,
                notification_handler: self.notification_handler,
                outbound_notification_hook: self.outbound_notification_hook,
                retry_on: self.retry_on,
                _shutdown: shutdown,
            }),
        };

        (engine, stream)
    }
}

struct Inner {
    pending: Mutex<PendingCallTable>,
    outbound: Outbound,
    completions: mpsc::UnboundedSender<Completion>,
    events: broadcast::Sender<Notification>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    notification_handler: Option<Arc<dyn NotificationHandler>>,
    outbound_notification_hook: Option<Arc<dyn NotificationHandler>>,
    retry_on: Option<String>,
    _shutdown: oneshot::Sender<()>,
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, PendingCallTable> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn schedule_completion(&self, completion: Completion) {
        if let Err(mpsc::error::SendError(completion)) = self.completions.send(completion) {
            // Queue task is gone (runtime shutting down); complete in place.
            let _ = completion.send(());
        }
    }
}

/// Handle to one correlation engine. Clones share the same pending table and
/// stream.
#[derive(Clone)]
pub struct CorrelationEngine {
    inner: Arc<Inner>,
}

impl CorrelationEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Registers the call and pushes the request, with no await in between,
    /// so its response cannot be processed before the entry exists.
    ///
    /// Reusing an id that is still pending is rejected and nothing is pushed.
    pub fn send_request(
        &self,
        request: Request,
        slot: ResponseSlot,
        completion: Completion,
    ) -> Result<()> {
        let id = request.id().clone();
        let message = request.to_value();

        let mut pending = self.inner.lock_pending();
        pending.register(PendingCall::new(request, slot, completion))?;
        if let Err(e) = self.inner.outbound.push(message) {
            pending.take(&id);
            return Err(e);
        }
        debug!(id = %id, pending = pending.len(), "Pushed request");
        Ok(())
    }

    /// Fire and forget; never touches the pending table.
    pub async fn send_notification(&self, notification: Notification) -> Result<()> {
        if let Some(hook) = &self.inner.outbound_notification_hook {
            hook.on_notification(&notification)
                .await
                .map_err(|e| StreamError::DispatchFailure(format!("{:#}", e)))?;
        }
        debug!(method = %notification.method(), "Pushed notification");
        self.inner.outbound.push(notification.into_value())
    }

    /// Sends a request and waits for its response, returning the caller's
    /// response object once the response has been copied onto it.
    pub async fn call_request(&self, request: Request) -> Result<JsonObject> {
        let slot = ResponseSlot::for_request(&request);
        let (completion, done) = oneshot::channel();
        self.send_request(request, slot.clone(), completion)?;
        done.await.map_err(|_| StreamError::CompletionDropped)?;
        Ok(slot.snapshot())
    }

    /// Like [`call_request`](Self::call_request) with a deadline on the caller's side.
    ///
    /// On timeout the entry stays pending: there is no cancellation, and a late
    /// response is still consumed.
    pub async fn call_request_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<JsonObject> {
        tokio::time::timeout(timeout, self.call_request(request))
            .await
            .map_err(|_| StreamError::Timeout(timeout))?
    }

    /// Calls `method` under a freshly generated id.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<JsonObject> {
        self.call_request(Request::new(method, params)).await
    }

    /// Typed [`call`](Self::call): `params` are serialized, and the `result`
    /// field is deserialized into `R`. An `error` response is returned as
    /// [`StreamError::Remote`].
    pub async fn call_typed<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let params = serde_json::to_value(params)?;
        let mut response = self.call(method, Some(params)).await?;

        match response.remove("error") {
            Some(error) if !error.is_null() => Err(StreamError::Remote(error)),
            _ => {
                let result = response.remove("result").unwrap_or(Value::Null);
                Ok(serde_json::from_value(result)?)
            }
        }
    }

    /// Sends any outbound message. Requests resolve to their response,
    /// notifications resolve immediately to `None`, responses are pushed as is.
    pub async fn send(&self, message: Value) -> Result<Option<JsonObject>> {
        match Message::decode(message)? {
            Message::Request(request) => self.call_request(request).await.map(Some),
            Message::Notification(notification) => {
                self.send_notification(notification).await?;
                Ok(None)
            }
            Message::Response(response) => {
                self.inner.outbound.push(response.into_value())?;
                Ok(None)
            }
        }
    }

    /// Processes one inbound message. The returned `Result` is the
    /// acknowledgment for that message; an error never leaves the engine
    /// unusable for the next one.
    pub async fn write(&self, message: Value) -> Result<()> {
        let message = Message::decode(message)?;
        debug!(kind = ?message.kind(), "Received message");
        match message {
            Message::Response(response) => self.receive_response(response),
            Message::Request(request) => self.receive_request(request).await,
            Message::Notification(notification) => self.receive_notification(notification).await,
        }
    }

    fn receive_response(&self, response: Response) -> Result<()> {
        let call = match response.id() {
            Some(id) => self.inner.lock_pending().take(id),
            None => None,
        };
        let call = call.ok_or_else(|| StreamError::UnknownResponseId(response.id_label()))?;

        // Copy onto the caller's object rather than replacing it.
        debug!(id = %call.request.id(), resent = call.resent, "Matched response");
        call.slot.merge(response.into_object());
        self.inner.schedule_completion(call.completion);
        Ok(())
    }

    async fn receive_request(&self, request: Request) -> Result<()> {
        let dispatcher = self
            .inner
            .dispatcher
            .as_ref()
            .ok_or_else(|| StreamError::NoDispatcher(request.method().to_string()))?;

        let response = dispatcher
            .handle_request(request)
            .await
            .map_err(|e| StreamError::DispatchFailure(format!("{:#}", e)))?;

        if let Some(response) = response {
            self.inner.outbound.push(response.into_value())?;
        }
        Ok(())
    }

    async fn receive_notification(&self, notification: Notification) -> Result<()> {
        let handled = self.handle_notification(&notification).await;

        // Nobody listening is fine.
        let _ = self.inner.events.send(notification.clone());

        if self.inner.retry_on.as_deref() == Some(notification.method()) {
            self.retry_pending();
        }
        handled
    }

    async fn handle_notification(&self, notification: &Notification) -> Result<()> {
        if let Some(handler) = &self.inner.notification_handler {
            handler
                .on_notification(notification)
                .await
                .map_err(|e| StreamError::DispatchFailure(format!("{:#}", e)))?;
        }
        if let Some(dispatcher) = &self.inner.dispatcher {
            dispatcher
                .handle_notification(notification.clone())
                .await
                .map_err(|e| StreamError::DispatchFailure(format!("{:#}", e)))?;
        }
        Ok(())
    }

    /// Re-pushes every pending request verbatim, in registration order.
    /// Entries stay pending under the same id, so the peer must tolerate
    /// duplicates. There is no retry limit.
    pub fn retry_pending(&self) -> usize {
        let requests: Vec<Request> = self.inner.lock_pending().entries().collect();
        let mut resent: Vec<RequestId> = Vec::with_capacity(requests.len());
        for request in requests {
            let id = request.id().clone();
            if let Err(e) = self.inner.outbound.push(request.into_value()) {
                warn!(error = %e, "Could not re-send pending request");
                break;
            }
            resent.push(id);
        }
        let max_resent = self.inner.lock_pending().record_resent(&resent);
        info!(count = resent.len(), max_resent, "Re-sent pending requests");
        resent.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// How many times recovery has re-sent the pending call `id`.
    pub fn resent_count(&self, id: &RequestId) -> Option<u32> {
        self.inner.lock_pending().resent_count(id)
    }

    /// Inbound notifications, after their handler has run.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.events.subscribe()
    }
}

#[async_trait]
impl MessageSink for CorrelationEngine {
    async fn write(&self, message: Value) -> Result<()> {
        CorrelationEngine::write(self, message).await
    }
}

/// Client role: outbound calls are correlated, nothing is dispatched locally.
pub fn stream_middleware(retry_on: Option<&str>) -> (CorrelationEngine, MessageStream) {
    let builder = EngineBuilder::new();
    match retry_on {
        Some(method) => builder.retry_on(method).build(),
        None => builder.build(),
    }
}

/// Server role: inbound calls go to `dispatcher`, responses go back out.
pub fn engine_stream(dispatcher: Arc<dyn Dispatcher>) -> (CorrelationEngine, MessageStream) {
    EngineBuilder::new().dispatcher(dispatcher).build()
}
