pub mod bookkeeping;
pub mod candidates;
pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod negotiation;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod room;
pub mod routes;
pub mod server;
pub mod telemetry;
pub mod websocket;
