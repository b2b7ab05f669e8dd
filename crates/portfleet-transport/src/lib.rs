//! Portfleet tunnel transports
//!
//! [`TcpForwarder`] is the default [`portfleet_supervisor::TunnelProvider`]:
//! it listens on a loopback port and relays every accepted connection to the
//! workspace's SSH port.

pub mod forwarder;

pub use forwarder::TcpForwarder;
