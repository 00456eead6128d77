pub mod ca;
pub mod config;
pub mod error;
pub mod intercept;
pub mod logging;
pub mod proxy;
pub mod record;
pub mod repeater;
pub mod storage;
pub mod tls;
