//! NAT engine contract
//!
//! The engine is an embedded single-threaded user-mode TCP/IP stack.
//! It is driven exclusively from the NAT thread (construction and
//! teardown aside) and calls back into the driver through the
//! [`EngineHost`] handle it receives at construction.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;
use std::sync::Arc;

use anyhow::Result;

use crate::poll::PollEvents;
use crate::timer::{TimerHandler, TimerId};

/// Configuration handed to the engine factory.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ipv4_enabled: bool,
    pub ipv6_enabled: bool,
    pub restricted: bool,
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Virtual gateway address, usually network | 2.
    pub host: Ipv4Addr,
    /// First DHCP lease, usually network | 15.
    pub dhcp_start: Ipv4Addr,
    /// Virtual name server, usually network | 3.
    pub nameserver: Ipv4Addr,
    pub prefix6: Ipv6Addr,
    pub prefix6_len: u8,
    pub host6: Ipv6Addr,
    pub nameserver6: Ipv6Addr,
    pub hostname: String,
    pub tftp_server_name: Option<String>,
    pub tftp_path: Option<String>,
    pub boot_file: Option<String>,
    pub mtu: usize,
    pub domainname: Option<String>,
    pub dns_search: Vec<String>,
    pub pass_domain: bool,
    pub dns_proxy: i64,
    pub bind_ip: Option<Ipv4Addr>,
    pub use_host_resolver: bool,
    pub alias_mode: i32,
    pub sock_rcv: Option<i64>,
    pub sock_snd: Option<i64>,
    pub tcp_rcv: Option<i64>,
    pub tcp_snd: Option<i64>,
    pub icmp_cache_limit: i64,
    pub so_max_connection: i64,
    pub localhost_reachable: bool,
    pub host_resolver_mappings: Option<String>,
}

/// DNS settings pushed to a running instance.
///
/// `name_servers` is carried for a later revision; the update path
/// currently forwards only the domain name and the search list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsConfig {
    pub domain_name: String,
    pub search_domains: Vec<String>,
    pub name_servers: Vec<String>,
}

/// Callbacks from the engine into the driver.
///
/// All methods are invoked on the NAT thread from inside engine entry
/// points, except [`EngineHost::notify`] which the engine may use from
/// helpers it schedules itself.
pub trait EngineHost: Send + Sync {
    /// Delivers one Ethernet frame towards the guest.
    ///
    /// Returns the number of bytes accepted, or -1 when the frame was
    /// dropped. The buffer is only valid for the duration of the call.
    fn send_packet_to_guest(&self, frame: &[u8]) -> isize;

    /// Reports a guest protocol violation.
    fn guest_error(&self, msg: &str);

    /// Monotonic clock in nanoseconds.
    fn clock_get_ns(&self) -> i64;

    /// Creates a disarmed timer whose handler fires on the NAT thread.
    fn timer_new(&self, handler: TimerHandler) -> TimerId;

    /// Releases a timer.
    fn timer_free(&self, timer: TimerId);

    /// Arms a timer with an absolute deadline in milliseconds.
    fn timer_mod(&self, timer: TimerId, expires_ms: i64);

    /// Advisory notification that the engine started watching a
    /// descriptor outside its poll fill.
    fn register_poll_fd(&self, _fd: RawFd) {}

    /// Advisory counterpart of [`EngineHost::register_poll_fd`].
    fn unregister_poll_fd(&self, _fd: RawFd) {}

    /// Requests a wakeup of the NAT thread.
    fn notify(&self);
}

/// The single-threaded NAT engine.
///
/// Implementations translate guest frames to host socket operations,
/// run DHCP and answer ARP; none of that is the driver's business. The
/// driver guarantees no two methods run concurrently.
pub trait NatEngine: Send {
    /// Feeds one Ethernet frame from the guest into the engine.
    fn input(&mut self, frame: &[u8]);

    /// Lets the engine register the descriptors it wants polled and
    /// lower the pending poll timeout. `add_fd` returns the index the
    /// engine will later pass to `get_revents`.
    fn pollfds_fill(
        &mut self,
        timeout_ms: &mut u32,
        add_fd: &mut dyn FnMut(RawFd, PollEvents) -> i32,
    );

    /// Dispatches poll results back into the engine. `had_error` is set
    /// when the host poll itself failed.
    fn pollfds_poll(&mut self, had_error: bool, get_revents: &mut dyn FnMut(usize) -> PollEvents);

    /// Installs a host-to-guest port forwarding rule.
    fn add_hostfwd(
        &mut self,
        udp: bool,
        host_addr: Ipv4Addr,
        host_port: u16,
        guest_addr: Ipv4Addr,
        guest_port: u16,
    ) -> Result<()>;

    /// Removes a previously installed forwarding rule.
    fn remove_hostfwd(&mut self, udp: bool, host_addr: Ipv4Addr, host_port: u16) -> Result<()>;

    /// Sets or clears the virtual domain name.
    fn set_domainname(&mut self, domain: Option<&str>);

    /// Replaces the DHCP-announced DNS search list.
    fn set_dns_search(&mut self, domains: &[String]);

    fn connection_info(&mut self) -> String;

    fn neighbor_info(&mut self) -> String;

    fn version_string(&self) -> String;
}

/// Constructor for the engine, invoked once during driver construction
/// with the derived configuration and the driver's callback handle.
pub type EngineFactory =
    Box<dyn FnOnce(EngineConfig, Arc<dyn EngineHost>) -> Result<Box<dyn NatEngine>>>;
