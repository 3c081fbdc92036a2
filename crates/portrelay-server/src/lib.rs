//! portrelay-server: the relay runtime behind the `portrelay` binary.
//!
//! - [`config`] loads and validates the mapping document.
//! - [`supervisor`] starts one [`listener::PortListener`] per mapping.
//! - [`listener`] accepts connections and admits them through [`limiter`].
//! - [`session`] relays one client to its backend.
//! - [`shutdown`] carries the stop signal to all of the above.

pub mod config;
pub mod limiter;
pub mod listener;
pub mod session;
pub mod shutdown;
pub mod supervisor;
