//! Boundary between the controller and the proxy implementation it drives.

use std::io;
use std::net::SocketAddr;

/// Builds proxy instances for a validated listen address.
///
/// The controller only ever talks to this trait, so the interception engine
/// can be swapped without touching lifecycle or snapshot handling.
pub trait ProxyEngine {
    type Instance: ProxyInstance;

    /// Prepare an instance for `addr`. Must not start listening yet.
    fn configure(&self, addr: SocketAddr) -> io::Result<Self::Instance>;
}

/// A configured proxy that can be started once and closed.
#[allow(async_fn_in_trait)]
pub trait ProxyInstance: Send {
    /// Bind the listener and start serving. Returns once the socket is bound.
    async fn start(&mut self) -> io::Result<()>;

    /// Stop serving and release the listener. Safe to call repeatedly.
    async fn close(&mut self);

    /// Address actually bound while running.
    fn local_addr(&self) -> Option<SocketAddr>;
}
