pub mod config;
pub mod stream;

pub use config::BridgeConfig;
pub use stream::{
    engine_stream, pipe, stream_middleware, CorrelationEngine, Dispatcher, EngineBuilder,
    HandlerRegistry, StreamError,
};
