//! Transport seam.
//!
//! Concrete transports (TCP, WebSocket, file tailing) are external
//! collaborators; the core only needs an async byte pipe and a way to
//! (re-)establish one. `mw-test-utils` provides in-memory and loopback-TCP
//! implementations for the test suites.

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

/// An established byte pipe to one peer.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxTransport = Box<dyn Transport>;

/// Establishes (and on reconnect, re-establishes) a transport.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Pin<Box<dyn Future<Output = io::Result<BoxTransport>> + Send + '_>>;
}

/// Connector wrapping an async closure.
pub struct FnConnector<F>(pub F);

impl<F, Fut> Connector for FnConnector<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<BoxTransport>> + Send + 'static,
{
    fn connect(&self) -> Pin<Box<dyn Future<Output = io::Result<BoxTransport>> + Send + '_>> {
        Box::pin((self.0)())
    }
}

/// Connector for an already-accepted connection (server side): yields the
/// transport exactly once, then reports end-of-service so the channel does
/// not reconnect.
pub struct OnceConnector {
    transport: std::sync::Mutex<Option<BoxTransport>>,
}

impl OnceConnector {
    pub fn new(transport: BoxTransport) -> Self {
        OnceConnector {
            transport: std::sync::Mutex::new(Some(transport)),
        }
    }
}

impl Connector for OnceConnector {
    fn connect(&self) -> Pin<Box<dyn Future<Output = io::Result<BoxTransport>> + Send + '_>> {
        let taken = self.transport.lock().expect("connector poisoned").take();
        Box::pin(async move {
            taken.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "accepted connection already used")
            })
        })
    }
}
