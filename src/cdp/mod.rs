//! Chrome DevTools Protocol transport
//!
//! Raw WebSocket session against a browser's remote debugging endpoint:
//! command/response multiplexing by request id, asynchronous event fan-out,
//! and HTTP discovery of the debugger URL and open tabs.

pub mod discovery;
pub mod session;

pub use discovery::{debugger_ws_url, list_tabs, ChromeTab};
pub use session::{CdpSession, SessionConfig};
