//! The Linux platform adapter: shells out to `ip`/`iptables` exactly the way
//! the teacher's `server.rs` does (`ip route replace`, `iptables -t nat`,
//! parsing `ip route show default`), generalized from one hardcoded tunnel
//! name/subnet to the `(cidr, gateway_iface)` pairs the router's platform
//! seam needs (§6).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::Mutex;

use super::{DefaultGatewayProbe, NatInstaller, PlatformError, RouteInstaller};

#[derive(Clone)]
pub struct LinuxPlatform {
    /// Reference counts per (cidr, gateway interface): a second `set_route`
    /// for the same pair is a no-op but bumps the count, and the route is
    /// only actually removed once the count drops to zero (§6).
    route_refs: Arc<Mutex<HashMap<(Ipv4Net, String), u32>>>,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self {
            route_refs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn run(cmd: &str, args: &[&str]) -> Result<Output, PlatformError> {
    std::process::Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| PlatformError::CommandFailed(format!("{cmd}: {e}")))
}

fn require_success(cmd: &str, args: &[&str], output: &Output) -> Result<(), PlatformError> {
    if output.status.success() {
        return Ok(());
    }
    Err(PlatformError::CommandFailed(format!(
        "{cmd} {}: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

#[async_trait]
impl RouteInstaller for LinuxPlatform {
    async fn set_route(&self, cidr: Ipv4Net, gateway_iface: &str) -> Result<(), PlatformError> {
        let key = (cidr, gateway_iface.to_string());
        let is_first = {
            let mut refs = self.route_refs.lock();
            let count = refs.entry(key).or_insert(0);
            *count += 1;
            *count == 1
        };
        if !is_first {
            return Ok(());
        }
        let cidr_str = cidr.to_string();
        let iface = gateway_iface.to_string();
        tokio::task::spawn_blocking(move || {
            let output = run("ip", &["route", "replace", &cidr_str, "dev", &iface])?;
            require_success("ip route replace", &[&cidr_str, "dev", &iface], &output)
        })
        .await
        .map_err(|e| PlatformError::CommandFailed(e.to_string()))?
    }

    async fn remove_route(&self, cidr: Ipv4Net, gateway_iface: &str) -> Result<(), PlatformError> {
        let key = (cidr, gateway_iface.to_string());
        let should_remove = {
            let mut refs = self.route_refs.lock();
            match refs.get_mut(&key) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    refs.remove(&key);
                    true
                }
                None => false,
            }
        };
        if !should_remove {
            return Ok(());
        }
        let cidr_str = cidr.to_string();
        let iface = gateway_iface.to_string();
        tokio::task::spawn_blocking(move || {
            let output = run("ip", &["route", "del", &cidr_str, "dev", &iface])?;
            require_success("ip route del", &[&cidr_str, "dev", &iface], &output)
        })
        .await
        .map_err(|e| PlatformError::CommandFailed(e.to_string()))?
    }
}

/// Ports the fake-IP engine's DNS-over-HTTPS resolvers must never be allowed
/// to reach on their encrypted ports, so capture can't be bypassed (§6).
const DOH_BLOCK_RULES: &[(&str, &str, &str)] = &[
    ("8.8.8.8", "443", "tcp"),
    ("8.8.4.4", "443", "tcp"),
    ("0.0.0.0/0", "53", "tcp"),
    ("0.0.0.0/0", "853", "tcp"),
];

#[async_trait]
impl NatInstaller for LinuxPlatform {
    async fn setup_nat(&self, tunnel_name: &str) -> Result<(), PlatformError> {
        let tunnel_name = tunnel_name.to_string();
        tokio::task::spawn_blocking(move || setup_nat_blocking(&tunnel_name)).await.map_err(
            |e| PlatformError::CommandFailed(e.to_string()),
        )?
    }

    async fn cleanup_nat(&self, tunnel_name: &str) -> Result<(), PlatformError> {
        let tunnel_name = tunnel_name.to_string();
        tokio::task::spawn_blocking(move || cleanup_nat_blocking(&tunnel_name))
            .await
            .map_err(|e| PlatformError::CommandFailed(e.to_string()))?
    }
}

fn setup_nat_blocking(tunnel_name: &str) -> Result<(), PlatformError> {
    let (_, iface) = default_gateway_blocking()?;

    // MASQUERADE all overlay-originated traffic leaving via the real uplink.
    let output = run(
        "iptables",
        &["-t", "nat", "-A", "POSTROUTING", "-o", &iface, "-j", "MASQUERADE"],
    )?;
    require_success("iptables MASQUERADE", &["-t", "nat"], &output)?;

    // Clamp MSS for traffic traversing the tunnel so oversized segments
    // don't silently black-hole behind the encapsulation overhead.
    let output = run(
        "iptables",
        &[
            "-t",
            "mangle",
            "-A",
            "FORWARD",
            "-o",
            tunnel_name,
            "-p",
            "tcp",
            "--tcp-flags",
            "SYN,RST",
            "SYN",
            "-j",
            "TCPMSS",
            "--clamp-mss-to-pmtu",
        ],
    )?;
    require_success("iptables TCPMSS", &["-t", "mangle"], &output)?;

    for (dest, port, proto) in DOH_BLOCK_RULES {
        let output = run(
            "iptables",
            &[
                "-A", "OUTPUT", "-d", dest, "-p", proto, "--dport", port, "-j", "REJECT",
            ],
        )?;
        require_success("iptables DoH block", &["-A", "OUTPUT"], &output)?;
    }

    Ok(())
}

fn cleanup_nat_blocking(tunnel_name: &str) -> Result<(), PlatformError> {
    let iface = default_gateway_blocking()
        .map(|(_, iface)| iface)
        .unwrap_or_else(|_| "eth0".to_string());

    let _ = run(
        "iptables",
        &["-t", "nat", "-D", "POSTROUTING", "-o", &iface, "-j", "MASQUERADE"],
    );
    let _ = run(
        "iptables",
        &[
            "-t",
            "mangle",
            "-D",
            "FORWARD",
            "-o",
            tunnel_name,
            "-p",
            "tcp",
            "--tcp-flags",
            "SYN,RST",
            "SYN",
            "-j",
            "TCPMSS",
            "--clamp-mss-to-pmtu",
        ],
    );
    for (dest, port, proto) in DOH_BLOCK_RULES {
        let _ = run(
            "iptables",
            &["-D", "OUTPUT", "-d", dest, "-p", proto, "--dport", port, "-j", "REJECT"],
        );
    }
    Ok(())
}

/// Parses `ip route show default` once for both the gateway IP and the
/// departing interface; `setup_nat_blocking`/`cleanup_nat_blocking` only
/// need the interface half, routed through the same
/// [`DefaultGatewayProbe`] logic rather than a second parser (§6).
fn default_gateway_blocking() -> Result<(Ipv4Addr, String), PlatformError> {
    let output = run("ip", &["route", "show", "default"])?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let words: Vec<&str> = stdout.split_whitespace().collect();
    let gateway = words
        .iter()
        .position(|&w| w == "via")
        .and_then(|i| words.get(i + 1))
        .and_then(|s| s.parse::<Ipv4Addr>().ok())
        .ok_or(PlatformError::NoDefaultRoute)?;
    let iface = words
        .iter()
        .position(|&w| w == "dev")
        .and_then(|i| words.get(i + 1))
        .map(|s| s.to_string())
        .ok_or(PlatformError::NoDefaultRoute)?;
    Ok((gateway, iface))
}

#[async_trait]
impl DefaultGatewayProbe for LinuxPlatform {
    async fn default_gateway(&self) -> Result<(Ipv4Addr, String), PlatformError> {
        tokio::task::spawn_blocking(default_gateway_blocking)
            .await
            .map_err(|e| PlatformError::CommandFailed(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gateway_and_device_from_ip_route_output() {
        let stdout = "default via 192.168.1.1 dev eth0 proto dhcp metric 100\n";
        let words: Vec<&str> = stdout.split_whitespace().collect();
        let gateway = words
            .iter()
            .position(|&w| w == "via")
            .and_then(|i| words.get(i + 1))
            .and_then(|s| s.parse::<Ipv4Addr>().ok())
            .unwrap();
        let iface = words.iter().skip_while(|&&w| w != "dev").nth(1).unwrap();
        assert_eq!(gateway, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(*iface, "eth0");
    }

    #[tokio::test]
    async fn route_refcount_only_removes_at_zero() {
        let platform = LinuxPlatform::new();
        let cidr: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        {
            let mut refs = platform.route_refs.lock();
            refs.insert((cidr, "eth0".to_string()), 2);
        }
        // Simulate one release without touching the real routing table by
        // inspecting the refcount bookkeeping directly.
        let should_remove = {
            let mut refs = platform.route_refs.lock();
            match refs.get_mut(&(cidr, "eth0".to_string())) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                _ => true,
            }
        };
        assert!(!should_remove);
        assert_eq!(
            *platform.route_refs.lock().get(&(cidr, "eth0".to_string())).unwrap(),
            1
        );
    }
}
