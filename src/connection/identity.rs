//! What this node believes its own public address to be.
//!
//! Peers tell us how they see us through the `Remote-IP` handshake header.
//! Connections report that to a shared [`NetworkIdentity`]; they never keep
//! the belief themselves.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Shared self-address belief.
pub trait NetworkIdentity: Send + Sync {
    /// Current belief, if any.
    fn address(&self) -> Option<IpAddr>;

    /// Replace the belief.
    fn set_address(&self, addr: IpAddr);

    /// Called after a forced update changed the belief.
    fn address_changed(&self);

    /// Record the address a peer reported, whether or not it was adopted.
    fn set_external_address(&self, addr: IpAddr);
}

/// In-memory [`NetworkIdentity`].
#[derive(Debug, Default)]
pub struct SharedIdentity {
    address: RwLock<Option<IpAddr>>,
    external: RwLock<Option<IpAddr>>,
    changes: AtomicU64,
}

impl SharedIdentity {
    /// Identity with no belief yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity starting from `addr`.
    pub fn with_address(addr: IpAddr) -> Self {
        Self {
            address: RwLock::new(Some(addr)),
            ..Self::default()
        }
    }

    /// Last address a peer reported.
    pub fn external_address(&self) -> Option<IpAddr> {
        *self.external.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of forced address changes.
    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }
}

impl NetworkIdentity for SharedIdentity {
    fn address(&self) -> Option<IpAddr> {
        *self.address.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_address(&self, addr: IpAddr) {
        *self.address.write().unwrap_or_else(PoisonError::into_inner) = Some(addr);
    }

    fn address_changed(&self) {
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    fn set_external_address(&self, addr: IpAddr) {
        *self.external.write().unwrap_or_else(PoisonError::into_inner) = Some(addr);
    }
}

/// Whether `addr` can be a real host address at all.
pub fn is_valid_address(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let first = v4.octets()[0];
            !v4.is_unspecified() && !v4.is_broadcast() && first != 0 && first != 255
        },
        IpAddr::V6(v6) => !v6.is_unspecified() && !v6.is_multicast(),
    }
}

/// Whether `addr` is only reachable on a local network.
pub fn is_private_address(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        },
    }
}

/// Apply a peer-reported `Remote-IP` value to `identity`.
///
/// Returns the parsed address when it was usable.
pub fn learn_remote_ip(identity: &dyn NetworkIdentity, value: &str, force_ip: bool) -> Option<IpAddr> {
    let Ok(reported) = value.trim().parse::<IpAddr>() else {
        tracing::debug!(value, "Ignoring unparsable Remote-IP");
        return None;
    };
    if !is_valid_address(&reported) || is_private_address(&reported) {
        tracing::debug!(%reported, "Ignoring non-public Remote-IP");
        return None;
    }

    let current = identity.address();
    if force_ip {
        if current != Some(reported) {
            tracing::info!(?current, %reported, "Adopting peer-reported address");
            identity.set_address(reported);
            identity.address_changed();
        }
    } else if !current.is_some_and(|c| is_valid_address(&c)) {
        tracing::debug!(%reported, "Learned address from peer");
        identity.set_address(reported);
    }
    identity.set_external_address(reported);
    Some(reported)
}
