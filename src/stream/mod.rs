// src/stream/mod.rs
// JSON-RPC over an object-mode duplex stream

pub mod errors;
pub mod message;
pub mod transport;

mod dispatch;
mod engine;
mod pending;

// Re-export specific items to simplify imports elsewhere
pub use dispatch::{Dispatcher, HandlerRegistry, NotificationHandler, INTERNAL_ERROR, METHOD_NOT_FOUND};
pub use engine::{engine_stream, stream_middleware, CorrelationEngine, EngineBuilder};
pub use errors::{Result, StreamError};
pub use message::{
    classify, JsonObject, Message, MessageKind, Notification, Request, RequestId, Response,
    ResponseSlot,
};
pub use pending::{Completion, PendingCall, PendingCallTable};
pub use transport::{pipe, MessageSink, MessageStream};
