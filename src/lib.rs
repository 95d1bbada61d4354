pub mod cache;
pub mod config;
pub mod dataformat;
pub mod endpoint;
pub mod engine;
pub mod exchange;
pub mod executor;
pub mod handler;
pub mod inflight;
pub mod logger;
pub mod polling;
pub mod pool;
pub mod processor;
pub mod route;
pub mod service;
pub mod status;
pub mod unit_of_work;

#[cfg(test)]
mod testing;

pub use engine::{Engine, EngineError};
pub use exchange::{Body, Exchange, ExchangePattern, Message};
pub use processor::{AsyncCallback, AsyncProcessor, Processor};
pub use route::Route;
