//! I/O model selection.
//!
//! A process runs exactly one I/O model. [`driver_for`] picks the
//! [`SessionDriver`] once from [`IoModel`]; everything above it starts
//! connections through the trait and never asks which model is active.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, IoModel};
use crate::connection::Connection;
use crate::error::{GnutellaError, Result};
use crate::nio::ReactorHandle;

/// Starts connections under one I/O model.
pub trait SessionDriver: Send + Sync {
    /// Begin connecting (outgoing) and handshaking. Returns once the work
    /// is handed off; the outcome arrives as connection events.
    fn start(&self, conn: Arc<Connection>) -> Result<()>;

    /// Model implemented by this driver.
    fn model(&self) -> IoModel;
}

/// Thread-per-connection driver.
#[derive(Debug, Clone)]
pub struct ThreadDriver {
    connect_timeout: Duration,
}

impl ThreadDriver {
    /// Driver connecting with `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl SessionDriver for ThreadDriver {
    fn start(&self, conn: Arc<Connection>) -> Result<()> {
        let timeout = self.connect_timeout;
        std::thread::Builder::new()
            .name(format!("gnutella-init-{}", conn.id()))
            .spawn(move || {
                // Failures are reported through the close event.
                let _ = conn.initialize(timeout);
            })?;
        Ok(())
    }

    fn model(&self) -> IoModel {
        IoModel::Blocking
    }
}

impl SessionDriver for ReactorHandle {
    fn start(&self, conn: Arc<Connection>) -> Result<()> {
        self.register(conn)
    }

    fn model(&self) -> IoModel {
        IoModel::Nio
    }
}

/// Driver for the configured model. The readiness model needs the handle of
/// a running [`crate::nio::Reactor`].
pub fn driver_for(config: &Config, reactor: Option<ReactorHandle>) -> Result<Arc<dyn SessionDriver>> {
    match config.io.model {
        IoModel::Blocking => Ok(Arc::new(ThreadDriver::new(config.network.connect_timeout()))),
        IoModel::Nio => reactor
            .map(|handle| Arc::new(handle) as Arc<dyn SessionDriver>)
            .ok_or_else(|| GnutellaError::Config("nio model requires a running reactor".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nio::Reactor;

    #[test]
    fn test_blocking_is_default() {
        let driver = driver_for(&Config::default(), None).unwrap();
        assert_eq!(driver.model(), IoModel::Blocking);
    }

    #[test]
    fn test_nio_needs_reactor() {
        let mut config = Config::default();
        config.io.model = IoModel::Nio;
        assert!(matches!(driver_for(&config, None), Err(GnutellaError::Config(_))));

        let (_reactor, handle) = Reactor::new();
        let driver = driver_for(&config, Some(handle)).unwrap();
        assert_eq!(driver.model(), IoModel::Nio);
    }
}
