//! Stub platform adapter for non-Linux targets. Fails fast with a named
//! configuration error rather than silently skipping route/NAT setup (§9
//! Open Question decision): a node that can't install routes should refuse
//! to start routing, not run half-configured.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use super::{DefaultGatewayProbe, NatInstaller, PlatformError, RouteInstaller};

#[derive(Clone)]
pub struct UnsupportedPlatform {
    os: String,
}

impl UnsupportedPlatform {
    pub fn new(os: impl Into<String>) -> Self {
        Self { os: os.into() }
    }

    fn error(&self) -> PlatformError {
        PlatformError::Unsupported(self.os.clone())
    }
}

#[async_trait]
impl RouteInstaller for UnsupportedPlatform {
    async fn set_route(&self, _cidr: Ipv4Net, _gateway_iface: &str) -> Result<(), PlatformError> {
        Err(self.error())
    }

    async fn remove_route(&self, _cidr: Ipv4Net, _gateway_iface: &str) -> Result<(), PlatformError> {
        Err(self.error())
    }
}

#[async_trait]
impl NatInstaller for UnsupportedPlatform {
    async fn setup_nat(&self, _tunnel_name: &str) -> Result<(), PlatformError> {
        Err(self.error())
    }

    async fn cleanup_nat(&self, _tunnel_name: &str) -> Result<(), PlatformError> {
        Err(self.error())
    }
}

#[async_trait]
impl DefaultGatewayProbe for UnsupportedPlatform {
    async fn default_gateway(&self) -> Result<(Ipv4Addr, String), PlatformError> {
        Err(self.error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_operation_fails_with_the_os_name() {
        let platform = UnsupportedPlatform::new("windows");
        let err = platform.default_gateway().await.unwrap_err();
        assert!(matches!(err, PlatformError::Unsupported(os) if os == "windows"));
    }
}
