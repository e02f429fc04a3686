//! Client-side SOCKS5 proxy chaining.
//!
//! A [`Connector`](proxy::Connector) holds a leveled proxy network; each
//! connection attempt it spawns reaches a destination by connecting to a
//! first-level proxy and negotiating one SOCKS5 CONNECT per level over the
//! same socket, backtracking through alternative proxies on failure.

pub mod common;
pub mod net;
pub mod proxy;
pub mod test_server;
