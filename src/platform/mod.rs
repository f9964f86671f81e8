//! Platform adapters (§6, §10.5): the route installer, NAT installer, and
//! default-gateway probe the spec treats as opaque collaborators. The
//! reference implementation shells out to `ip`/`iptables`, grounded in the
//! teacher's `server.rs` (`setup_nat`, `cleanup_nat`, `get_default_interface`)
//! and `network.rs`/`namespace.rs`'s own use of Linux networking commands.
//! Non-Linux targets get a stub that fails fast with a named configuration
//! error rather than a silent no-op (§9 Open Question decision).

#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(target_os = "linux"))]
mod unsupported;

#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;
#[cfg(not(target_os = "linux"))]
pub use unsupported::UnsupportedPlatform;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform command failed: {0}")]
    CommandFailed(String),
    #[error("this platform is not supported: {0}")]
    Unsupported(String),
    #[error("could not determine the default route")]
    NoDefaultRoute,
}

/// Installs and removes overlay routes on the host routing table.
/// Reference-counted per (cidr, gateway) pair so a second install is a no-op
/// but keeps the route alive until every installer has released it (§6).
#[async_trait]
pub trait RouteInstaller: Send + Sync {
    async fn set_route(&self, cidr: Ipv4Net, gateway_iface: &str) -> Result<(), PlatformError>;
    async fn remove_route(&self, cidr: Ipv4Net, gateway_iface: &str) -> Result<(), PlatformError>;
}

/// Idempotently installs MSS-clamping, MASQUERADE, and DoH-blocking rules
/// for the given tunnel interface so forwarded traffic (`-f`) actually
/// reaches the internet and well-known DoH endpoints can't bypass fake-IP
/// capture (§6).
#[async_trait]
pub trait NatInstaller: Send + Sync {
    async fn setup_nat(&self, tunnel_name: &str) -> Result<(), PlatformError>;
    async fn cleanup_nat(&self, tunnel_name: &str) -> Result<(), PlatformError>;
}

/// Reports the host's current default route: the gateway IP and the
/// interface it departs through.
#[async_trait]
pub trait DefaultGatewayProbe: Send + Sync {
    async fn default_gateway(&self) -> Result<(std::net::Ipv4Addr, String), PlatformError>;
}

/// The three platform collaborators bundled together, the way `main.rs`
/// constructs and hands them to the rest of the `System` (§9, §10.7).
pub struct Platform {
    pub routes: Box<dyn RouteInstaller>,
    pub nat: Box<dyn NatInstaller>,
    pub gateway: Box<dyn DefaultGatewayProbe>,
}

impl Platform {
    #[cfg(target_os = "linux")]
    pub fn reference() -> Self {
        let linux = LinuxPlatform::new();
        Self {
            routes: Box::new(linux.clone()),
            nat: Box::new(linux.clone()),
            gateway: Box::new(linux),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn reference() -> Self {
        let stub = UnsupportedPlatform::new(std::env::consts::OS);
        Self {
            routes: Box::new(stub.clone()),
            nat: Box::new(stub.clone()),
            gateway: Box::new(stub),
        }
    }
}
