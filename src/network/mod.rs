//! Network subsystem: TCP transport and per-connection session

pub mod connection;
pub mod session;

pub use connection::Connection;
pub use session::{PlayoutClock, Session, SessionStats};
