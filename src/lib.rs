pub mod account;
pub mod config;
pub mod context;
pub mod event;
pub mod event_queue;
pub mod market_data;
pub mod matching;
pub mod metrics;
pub mod model;
pub mod order_fsm;
pub mod performance;
pub mod persistence;
pub mod recovery;
pub mod session;
pub mod session_manager;
pub mod time_engine;

pub use session_manager::{SessionError, SessionManager};
