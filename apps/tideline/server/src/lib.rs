//! Tideline server: websocket connections, the trigger API and the Redis
//! backed worker.

pub mod app;
pub mod cache_redis;
pub mod config;
pub mod multiplexer;
pub mod queue_redis;
pub mod relay;
pub mod routes;
pub mod signals;
pub mod state;
pub mod telemetry;
pub mod ws;
