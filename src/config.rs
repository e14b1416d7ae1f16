//! Instance configuration
//!
//! The embedder hands construction a keyed tree of scalars and strings.
//! This module validates the tree, applies defaults, derives the
//! virtual network addressing from the `Network` CIDR and extracts the
//! port-forwarding rules.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;

/// A scalar configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigValue {
    String(String),
    Integer(i64),
    Bool(bool),
}

/// One node of the configuration tree: named scalars plus named
/// subtrees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigNode {
    values: BTreeMap<String, ConfigValue>,
    children: BTreeMap<String, ConfigNode>,
}

impl ConfigNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_str(&mut self, key: &str, value: &str) -> &mut Self {
        self.values
            .insert(key.to_string(), ConfigValue::String(value.to_string()));
        self
    }

    pub fn set_int(&mut self, key: &str, value: i64) -> &mut Self {
        self.values
            .insert(key.to_string(), ConfigValue::Integer(value));
        self
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.values.insert(key.to_string(), ConfigValue::Bool(value));
        self
    }

    pub fn add_child(&mut self, name: &str, child: ConfigNode) -> &mut Self {
        self.children.insert(name.to_string(), child);
        self
    }

    pub fn child(&self, name: &str) -> Option<&ConfigNode> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &ConfigNode)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(ConfigValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(ConfigValue::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(ConfigValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Fails when the node carries a value or subtree outside the given
    /// name sets.
    fn ensure_known(&self, values: &[&str], children: &[&str]) -> Result<()> {
        for key in self.values.keys() {
            if !values.contains(&key.as_str()) {
                bail!("unknown configuration value \"{}\"", key);
            }
        }
        for name in self.children.keys() {
            if !children.contains(&name.as_str()) {
                bail!("unknown configuration subtree \"{}\"", name);
            }
        }
        Ok(())
    }
}

const VALID_VALUES: &[&str] = &[
    "PassDomain",
    "TFTPPrefix",
    "BootFile",
    "Network",
    "NextServer",
    "DNSProxy",
    "BindIP",
    "UseHostResolver",
    "SlirpMTU",
    "AliasMode",
    "SockRcv",
    "SockSnd",
    "TcpRcv",
    "TcpSnd",
    "ICMPCacheLimit",
    "SoMaxConnection",
    "LocalhostReachable",
    "HostResolverMappings",
];
const VALID_SUBTREES: &[&str] = &["PortForwarding"];
const VALID_FORWARD_VALUES: &[&str] = &[
    "Name",
    "Protocol",
    "UDP",
    "HostPort",
    "GuestPort",
    "GuestIP",
    "BindIP",
];

/// One port-forwarding rule from the `PortForwarding` subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub name: Option<String>,
    pub udp: bool,
    pub bind_ip: Ipv4Addr,
    pub host_port: u16,
    pub guest_ip: Ipv4Addr,
    pub guest_port: u16,
}

/// Validated instance configuration.
#[derive(Debug, Clone)]
pub struct NatConfig {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub pass_domain: bool,
    pub tftp_prefix: Option<String>,
    pub boot_file: Option<String>,
    pub next_server: Option<String>,
    pub dns_proxy: i64,
    pub bind_ip: Option<Ipv4Addr>,
    pub use_host_resolver: bool,
    pub mtu: usize,
    pub alias_mode: i32,
    pub sock_rcv: Option<i64>,
    pub sock_snd: Option<i64>,
    pub tcp_rcv: Option<i64>,
    pub tcp_snd: Option<i64>,
    pub icmp_cache_limit: i64,
    pub so_max_connection: i64,
    pub localhost_reachable: bool,
    pub host_resolver_mappings: Option<String>,
    pub forwards: Vec<PortForward>,
}

impl NatConfig {
    /// Validates the tree and reads every setting with its default.
    pub fn from_tree(node: &ConfigNode) -> Result<Self> {
        node.ensure_known(VALID_VALUES, VALID_SUBTREES)?;

        let Some(network_str) = node.get_str("Network") else {
            bail!("missing \"Network\"");
        };
        let (network, netmask) = parse_cidr(network_str)?;

        let alias_raw = node.get_int("AliasMode").unwrap_or(0);
        let mut alias_mode = 0;
        alias_mode |= if alias_raw & 0x1 != 0 { 0x1 } else { 0 };
        alias_mode |= if alias_raw & 0x2 != 0 { 0x40 } else { 0 };
        alias_mode |= if alias_raw & 0x4 != 0 { 0x4 } else { 0 };

        let bind_ip = node.get_str("BindIP").and_then(|s| s.parse().ok());

        let forwards = match node.child("PortForwarding") {
            Some(subtree) => parse_forwards(subtree)?,
            None => Vec::new(),
        };

        Ok(Self {
            network,
            netmask,
            pass_domain: node.get_bool("PassDomain").unwrap_or(true),
            tftp_prefix: node.get_str("TFTPPrefix").map(str::to_string),
            boot_file: node.get_str("BootFile").map(str::to_string),
            next_server: node.get_str("NextServer").map(str::to_string),
            dns_proxy: node.get_int("DNSProxy").unwrap_or(0),
            bind_ip,
            use_host_resolver: node.get_bool("UseHostResolver").unwrap_or(false),
            mtu: node.get_int("SlirpMTU").unwrap_or(1500) as usize,
            alias_mode,
            sock_rcv: node.get_int("SockRcv"),
            sock_snd: node.get_int("SockSnd"),
            tcp_rcv: node.get_int("TcpRcv"),
            tcp_snd: node.get_int("TcpSnd"),
            icmp_cache_limit: node.get_int("ICMPCacheLimit").unwrap_or(100),
            so_max_connection: node.get_int("SoMaxConnection").unwrap_or(10),
            localhost_reachable: node.get_bool("LocalhostReachable").unwrap_or(false),
            host_resolver_mappings: node.get_str("HostResolverMappings").map(str::to_string),
            forwards,
        })
    }

    /// Guest address the instance uses for forwarding defaults.
    pub fn guest_ip(&self) -> Ipv4Addr {
        or_host_bits(self.network, 15)
    }

    /// Derives the engine configuration, including the virtual host,
    /// DHCP and name-server addresses and their IPv6 counterparts under
    /// the fixed ULA prefix.
    pub fn engine_config(&self) -> EngineConfig {
        let host = or_host_bits(self.network, 2);
        let dhcp_start = or_host_bits(self.network, 15);
        let nameserver = or_host_bits(self.network, 3);

        // ULA prefix fd17:625c:f037::/64 with a subnet id taken from the
        // middle of the IPv4 address, e.g. :0002: for 10.0.2.x.
        let prefix6 = splice_v4_middle(Ipv6Addr::new(0xfd17, 0x625c, 0xf037, 0, 0, 0, 0, 0), host);
        let host6 = splice_v4_middle(Ipv6Addr::new(0xfd17, 0x625c, 0xf037, 0, 0, 0, 0, 2), host);
        let nameserver6 = splice_v4_middle(
            Ipv6Addr::new(0xfd17, 0x625c, 0xf037, 0, 0, 0, 0, 3),
            nameserver,
        );

        EngineConfig {
            ipv4_enabled: true,
            ipv6_enabled: true,
            restricted: false,
            network: self.network,
            netmask: self.netmask,
            host,
            dhcp_start,
            nameserver,
            prefix6,
            prefix6_len: 64,
            host6,
            nameserver6,
            hostname: "natbridge".to_string(),
            tftp_server_name: self.next_server.clone(),
            tftp_path: self.tftp_prefix.clone(),
            boot_file: self.boot_file.clone(),
            mtu: self.mtu,
            domainname: None,
            dns_search: Vec::new(),
            pass_domain: self.pass_domain,
            dns_proxy: self.dns_proxy,
            bind_ip: self.bind_ip,
            use_host_resolver: self.use_host_resolver,
            alias_mode: self.alias_mode,
            sock_rcv: self.sock_rcv,
            sock_snd: self.sock_snd,
            tcp_rcv: self.tcp_rcv,
            tcp_snd: self.tcp_snd,
            icmp_cache_limit: self.icmp_cache_limit,
            so_max_connection: self.so_max_connection,
            localhost_reachable: self.localhost_reachable,
            host_resolver_mappings: self.host_resolver_mappings.clone(),
        }
    }
}

fn or_host_bits(network: Ipv4Addr, bits: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(network) | bits)
}

/// Overwrites bytes 6 and 7 of an IPv6 address with bytes 1 and 2 of
/// the IPv4 address.
fn splice_v4_middle(addr6: Ipv6Addr, addr4: Ipv4Addr) -> Ipv6Addr {
    let v4 = addr4.octets();
    let mut octets = addr6.octets();
    octets[6] = v4[1];
    octets[7] = v4[2];
    Ipv6Addr::from(octets)
}

/// Parses `A.B.C.D/N` into network address and netmask.
fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, Ipv4Addr)> {
    let parse = || -> Option<(Ipv4Addr, u32)> {
        let (addr, prefix) = cidr.split_once('/')?;
        let addr: Ipv4Addr = addr.trim().parse().ok()?;
        let prefix: u32 = prefix.trim().parse().ok()?;
        (prefix <= 32).then_some((addr, prefix))
    };
    let Some((addr, prefix)) = parse() else {
        bail!("network '{}' describes not a valid IPv4 network", cidr);
    };
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    if u32::from(addr) & !mask != 0 {
        bail!("network '{}' describes not a valid IPv4 network", cidr);
    }
    Ok((addr, Ipv4Addr::from(mask)))
}

fn parse_forwards(subtree: &ConfigNode) -> Result<Vec<PortForward>> {
    let mut forwards = Vec::new();
    for (rule_name, rule) in subtree.children() {
        rule.ensure_known(VALID_FORWARD_VALUES, &[])
            .map_err(|e| e.context("unknown configuration in port forwarding"))?;

        // An explicit protocol name wins over the legacy UDP boolean.
        let udp = match rule.get_str("Protocol") {
            Some(proto) if proto.eq_ignore_ascii_case("TCP") => false,
            Some(proto) if proto.eq_ignore_ascii_case("UDP") => true,
            Some(proto) => bail!("invalid configuration value for \"Protocol\": \"{}\"", proto),
            None => rule.get_bool("UDP").unwrap_or(false),
        };

        let Some(host_port) = rule.get_int("HostPort") else {
            bail!("port forwarding rule \"{}\" misses \"HostPort\"", rule_name);
        };
        let Some(guest_port) = rule.get_int("GuestPort") else {
            bail!("port forwarding rule \"{}\" misses \"GuestPort\"", rule_name);
        };
        let (Ok(host_port), Ok(guest_port)) = (u16::try_from(host_port), u16::try_from(guest_port))
        else {
            bail!("port forwarding rule \"{}\" uses a port out of range", rule_name);
        };

        // Unparseable or missing addresses fall back to the wildcard.
        let bind_ip = rule
            .get_str("BindIP")
            .and_then(|s| s.parse().ok())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let guest_ip = rule
            .get_str("GuestIP")
            .and_then(|s| s.parse().ok())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        forwards.push(PortForward {
            name: rule.get_str("Name").map(str::to_string).or_else(|| Some(rule_name.to_string())),
            udp,
            bind_ip,
            host_port,
            guest_ip,
            guest_port,
        });
    }
    Ok(forwards)
}
