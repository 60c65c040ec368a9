//! Control-plane connection managers.
//!
//! - `get_poller`: periodic GET of the desired watch list
//! - `ws`: persistent WebSocket for pushed watch-list deltas

pub mod get_poller;
pub mod ws;

pub use get_poller::HttpGetStatusPoller;
pub use ws::start_ws_connection_manager;
