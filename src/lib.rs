pub mod config;
pub mod dispatch;
pub mod relay;
pub mod session;
pub mod storage;

pub mod error;
pub mod logger;
