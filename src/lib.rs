pub mod arbitrator;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod model;
pub mod session;
pub mod sse;
pub mod view;
pub mod watchdog;
