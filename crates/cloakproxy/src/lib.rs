pub mod config;
pub mod detect;
pub mod http;
pub mod management;
pub mod policy;
pub mod proxy;
pub mod sanitize;
pub mod telemetry;
pub mod tls;
