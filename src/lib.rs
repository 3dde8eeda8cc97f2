pub mod api;
pub mod auth;
pub mod connect;
pub mod disguise;
pub mod message;
pub mod mqtt;
pub mod mysa;
pub mod registry;
pub mod render;
pub mod sigv4;
pub mod signal;
pub mod telemetry;
pub mod watch;
