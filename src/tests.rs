//! End-to-end tests driving a full instance against a scripted engine
//! and a scripted device port.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::bail;

use crate::config::ConfigNode;
use crate::device::{DevicePort, RecvWaitError};
use crate::driver::{LinkState, NatDriver};
use crate::engine::{DnsConfig, EngineConfig, EngineFactory, EngineHost, NatEngine};
use crate::error::NatError;
use crate::poll::PollEvents;
use crate::stats;
use crate::GsoDescriptor;

static INSTANCE_COUNTER: AtomicUsize = AtomicUsize::new(1);

fn next_instance() -> usize {
    INSTANCE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return cond();
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Observable state of the scripted engine, shared with the test body.
#[derive(Default)]
struct EngineProbe {
    config: Mutex<Option<EngineConfig>>,
    host: Mutex<Option<Arc<dyn EngineHost>>>,
    inputs: Mutex<Vec<Vec<u8>>>,
    hostfwds: Mutex<Vec<(bool, Ipv4Addr, u16, Ipv4Addr, u16)>>,
    removed_fwds: Mutex<Vec<(bool, Ipv4Addr, u16)>>,
    emit: Mutex<VecDeque<Vec<u8>>>,
    domain: Mutex<Option<Option<String>>>,
    dns_search: Mutex<Vec<String>>,
    refuse_hostfwd: AtomicBool,
    cleaned_up: AtomicBool,
}

impl EngineProbe {
    fn host(&self) -> Arc<dyn EngineHost> {
        self.host.lock().unwrap().clone().expect("engine not constructed")
    }

    fn queue_emit(&self, frame: Vec<u8>) {
        self.emit.lock().unwrap().push_back(frame);
    }

    fn input_count(&self) -> usize {
        self.inputs.lock().unwrap().len()
    }
}

struct MockEngine {
    probe: Arc<EngineProbe>,
}

impl NatEngine for MockEngine {
    fn input(&mut self, frame: &[u8]) {
        self.probe.inputs.lock().unwrap().push(frame.to_vec());
    }

    fn pollfds_fill(
        &mut self,
        _timeout_ms: &mut u32,
        _add_fd: &mut dyn FnMut(RawFd, PollEvents) -> i32,
    ) {
    }

    fn pollfds_poll(
        &mut self,
        _had_error: bool,
        _get_revents: &mut dyn FnMut(usize) -> PollEvents,
    ) {
        // Deliver whatever the test scripted towards the guest.
        let host = self.probe.host();
        while let Some(frame) = self.probe.emit.lock().unwrap().pop_front() {
            host.send_packet_to_guest(&frame);
        }
    }

    fn add_hostfwd(
        &mut self,
        udp: bool,
        host_addr: Ipv4Addr,
        host_port: u16,
        guest_addr: Ipv4Addr,
        guest_port: u16,
    ) -> anyhow::Result<()> {
        if self.probe.refuse_hostfwd.load(Ordering::SeqCst) {
            bail!("address already in use");
        }
        self.probe
            .hostfwds
            .lock()
            .unwrap()
            .push((udp, host_addr, host_port, guest_addr, guest_port));
        Ok(())
    }

    fn remove_hostfwd(
        &mut self,
        udp: bool,
        host_addr: Ipv4Addr,
        host_port: u16,
    ) -> anyhow::Result<()> {
        self.probe
            .removed_fwds
            .lock()
            .unwrap()
            .push((udp, host_addr, host_port));
        Ok(())
    }

    fn set_domainname(&mut self, domain: Option<&str>) {
        *self.probe.domain.lock().unwrap() = Some(domain.map(str::to_string));
    }

    fn set_dns_search(&mut self, domains: &[String]) {
        *self.probe.dns_search.lock().unwrap() = domains.to_vec();
    }

    fn connection_info(&mut self) -> String {
        "0 connections".to_string()
    }

    fn neighbor_info(&mut self) -> String {
        "0 neighbors".to_string()
    }

    fn version_string(&self) -> String {
        "mock 1.0".to_string()
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.probe.cleaned_up.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockDevice {
    received: Mutex<Vec<Vec<u8>>>,
    wait_result: Mutex<Option<RecvWaitError>>,
}

impl MockDevice {
    fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl DevicePort for MockDevice {
    fn wait_receive_available(&self, _timeout: Option<Duration>) -> Result<(), RecvWaitError> {
        match self.wait_result.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn receive(&self, frame: &[u8]) -> anyhow::Result<()> {
        self.received.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

fn base_config() -> ConfigNode {
    let mut node = ConfigNode::new();
    node.set_str("Network", "10.0.2.0/24");
    node
}

fn spawn(node: &ConfigNode) -> (NatDriver, Arc<EngineProbe>, Arc<MockDevice>) {
    let (driver, probe, device) = try_spawn(node).unwrap();
    (driver, probe, device)
}

fn try_spawn(
    node: &ConfigNode,
) -> anyhow::Result<(NatDriver, Arc<EngineProbe>, Arc<MockDevice>)> {
    let probe = Arc::new(EngineProbe::default());
    let device = Arc::new(MockDevice::default());
    let factory: EngineFactory = {
        let probe = Arc::clone(&probe);
        Box::new(move |config, host| {
            *probe.config.lock().unwrap() = Some(config);
            *probe.host.lock().unwrap() = Some(host);
            Ok(Box::new(MockEngine { probe }) as Box<dyn NatEngine>)
        })
    };
    let driver = NatDriver::new(next_instance(), node, device.clone(), factory)?;
    Ok((driver, probe, device))
}

#[test]
fn link_down_refuses_allocation() {
    let (driver, _probe, _device) = spawn(&base_config());
    driver.notify_link_changed(LinkState::Down);
    assert_eq!(driver.link_state(), LinkState::Down);

    let xmit = driver.begin_xmit(false).unwrap();
    assert_eq!(xmit.alloc(1500, None).unwrap_err(), NatError::NetDown);
    drop(xmit);

    // Back up, allocation works again.
    driver.notify_link_changed(LinkState::Up);
    let xmit = driver.begin_xmit(false).unwrap();
    assert!(xmit.alloc(1500, None).is_ok());
}

#[test]
fn small_frame_reaches_engine_unchanged() {
    let (driver, probe, _device) = spawn(&base_config());
    let pattern: Vec<u8> = (0..60u8).collect();

    {
        let xmit = driver.begin_xmit(false).unwrap();
        let mut buf = xmit.alloc(60, None).unwrap();
        assert_eq!(buf.capacity(), 128);
        buf.as_mut_slice()[..60].copy_from_slice(&pattern);
        buf.set_used(60);
        xmit.send(buf).unwrap();
    }

    assert!(wait_until(
        || probe.input_count() == 1,
        Duration::from_secs(5)
    ));
    assert_eq!(probe.inputs.lock().unwrap()[0], pattern);
}

#[test]
fn transmit_lock_is_exclusive() {
    let (driver, _probe, _device) = spawn(&base_config());
    let xmit = driver.begin_xmit(false).unwrap();
    assert_eq!(driver.begin_xmit(false).unwrap_err(), NatError::TryAgain);
    drop(xmit);
    assert!(driver.begin_xmit(false).is_ok());
}

#[test]
fn oversized_frames_never_reach_the_engine() {
    let (driver, probe, _device) = spawn(&base_config());
    let xmit = driver.begin_xmit(false).unwrap();
    assert_eq!(
        xmit.alloc(16 * 1024, None).unwrap_err(),
        NatError::InvalidParameter
    );
    drop(xmit);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(probe.input_count(), 0);
}

#[test]
fn gso_super_frame_is_segmented() {
    let (driver, probe, _device) = spawn(&base_config());
    let gso = GsoDescriptor {
        hdrs_total: 54,
        max_seg: 1400,
    };
    let headers = vec![0x11u8; 54];
    let payload: Vec<u8> = (0..2800usize).map(|i| (i % 251) as u8).collect();

    {
        let xmit = driver.begin_xmit(false).unwrap();
        let mut buf = xmit.alloc(54 + 2800, Some(gso)).unwrap();
        buf.as_mut_slice()[..54].copy_from_slice(&headers);
        buf.as_mut_slice()[54..2854].copy_from_slice(&payload);
        buf.set_used(2854);
        xmit.send(buf).unwrap();
    }

    assert!(wait_until(
        || probe.input_count() == 2,
        Duration::from_secs(5)
    ));
    let inputs = probe.inputs.lock().unwrap();
    assert_eq!(inputs[0].len(), 1454);
    assert_eq!(inputs[1].len(), 1454);
    assert_eq!(&inputs[0][..54], &headers[..]);
    assert_eq!(&inputs[1][..54], &headers[..]);
    assert_eq!(&inputs[0][54..], &payload[..1400]);
    assert_eq!(&inputs[1][54..], &payload[1400..]);
}

#[test]
fn runtime_redirect_reaches_engine_with_exact_arguments() {
    let (driver, probe, _device) = spawn(&base_config());
    driver.redirect_command(false, false, Some("0.0.0.0"), 2222, Some("10.0.2.15"), 22);
    // call_and_wait semantics: the rule is installed once this returns.
    assert_eq!(
        probe.hostfwds.lock().unwrap()[0],
        (
            false,
            Ipv4Addr::UNSPECIFIED,
            2222,
            Ipv4Addr::new(10, 0, 2, 15),
            22
        )
    );

    driver.redirect_command(true, false, Some("0.0.0.0"), 2222, None, 0);
    assert_eq!(
        probe.removed_fwds.lock().unwrap()[0],
        (false, Ipv4Addr::UNSPECIFIED, 2222)
    );
}

#[test]
fn redirect_defaults_to_wildcard_and_guest_address() {
    let (driver, probe, _device) = spawn(&base_config());
    driver.redirect_command(false, true, None, 5353, None, 53);
    assert_eq!(
        probe.hostfwds.lock().unwrap()[0],
        (
            true,
            Ipv4Addr::UNSPECIFIED,
            5353,
            Ipv4Addr::new(10, 0, 2, 15),
            53
        )
    );
}

#[test]
fn configured_forward_rules_installed_at_construction() {
    let mut rule = ConfigNode::new();
    rule.set_str("Protocol", "TCP");
    rule.set_int("HostPort", 8080);
    rule.set_int("GuestPort", 80);
    rule.set_str("GuestIP", "10.0.2.15");
    let mut subtree = ConfigNode::new();
    subtree.add_child("web", rule);
    let mut node = base_config();
    node.add_child("PortForwarding", subtree);

    let (_driver, probe, _device) = spawn(&node);
    assert_eq!(
        probe.hostfwds.lock().unwrap()[0],
        (
            false,
            Ipv4Addr::UNSPECIFIED,
            8080,
            Ipv4Addr::new(10, 0, 2, 15),
            80
        )
    );
}

#[test]
fn refused_forward_rule_aborts_construction() {
    let mut rule = ConfigNode::new();
    rule.set_int("HostPort", 80);
    rule.set_int("GuestPort", 80);
    let mut subtree = ConfigNode::new();
    subtree.add_child("clash", rule);
    let mut node = base_config();
    node.add_child("PortForwarding", subtree);

    let probe = Arc::new(EngineProbe::default());
    probe.refuse_hostfwd.store(true, Ordering::SeqCst);
    let device = Arc::new(MockDevice::default());
    let factory: EngineFactory = {
        let probe = Arc::clone(&probe);
        Box::new(move |_config, host| {
            *probe.host.lock().unwrap() = Some(host);
            Ok(Box::new(MockEngine { probe }) as Box<dyn NatEngine>)
        })
    };
    let err = NatDriver::new(next_instance(), &node, device, factory).unwrap_err();
    assert!(err.to_string().contains("redirection"));
}

#[test]
fn timer_fires_once_within_its_deadline() {
    let (driver, probe, _device) = spawn(&base_config());
    let host = probe.host();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    let id = host.timer_new(Arc::new(move || {
        f.fetch_add(1, Ordering::SeqCst);
    }));
    let now_ms = host.clock_get_ns() / 1_000_000;
    host.timer_mod(id, now_ms + 50);
    // Re-enter the poll loop so the new deadline clamps the timeout.
    host.notify();

    assert!(wait_until(
        || fired.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
    // Without a rearm the handler stays quiet.
    thread::sleep(Duration::from_millis(150));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    host.timer_free(id);
    drop(driver);
}

#[test]
fn concurrent_wakeups_drain_to_zero() {
    let (driver, probe, _device) = spawn(&base_config());
    let host = probe.host();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let host = Arc::clone(&host);
        handles.push(thread::spawn(move || {
            for _ in 0..25 {
                host.notify();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(wait_until(
        || driver.wakeup_bytes_outstanding() == 0,
        Duration::from_secs(5)
    ));
}

#[test]
fn engine_packets_are_delivered_to_the_device() {
    let (driver, probe, device) = spawn(&base_config());
    let frame: Vec<u8> = (0..200usize).map(|i| (i % 256) as u8).collect();

    probe.queue_emit(frame.clone());
    probe.host().notify();

    assert!(wait_until(
        || device.received_count() == 1,
        Duration::from_secs(5)
    ));
    assert_eq!(device.received.lock().unwrap()[0], frame);
    assert!(wait_until(
        || driver.in_flight_packets() == 0,
        Duration::from_secs(5)
    ));
}

#[test]
fn transient_device_errors_are_tolerated() {
    let (driver, probe, device) = spawn(&base_config());
    *device.wait_result.lock().unwrap() = Some(RecvWaitError::Timeout);

    probe.queue_emit(vec![1, 2, 3]);
    probe.host().notify();
    assert!(wait_until(
        || driver.in_flight_packets() == 0,
        Duration::from_secs(5)
    ));
    assert_eq!(device.received_count(), 0);

    // The path stays usable afterwards.
    *device.wait_result.lock().unwrap() = None;
    probe.queue_emit(vec![4, 5, 6]);
    probe.host().notify();
    assert!(wait_until(
        || device.received_count() == 1,
        Duration::from_secs(5)
    ));
}

#[test]
fn dns_update_reaches_engine() {
    let (driver, probe, _device) = spawn(&base_config());
    driver.notify_dns_changed(&DnsConfig {
        domain_name: "lan".to_string(),
        search_domains: vec!["example.org".to_string()],
        name_servers: Vec::new(),
    });
    assert_eq!(
        *probe.domain.lock().unwrap(),
        Some(Some("lan".to_string()))
    );
    assert_eq!(
        *probe.dns_search.lock().unwrap(),
        vec!["example.org".to_string()]
    );

    // An empty domain name clears the engine's domain.
    driver.notify_dns_changed(&DnsConfig::default());
    assert_eq!(*probe.domain.lock().unwrap(), Some(None));
}

#[test]
fn info_renders_engine_strings() {
    let (driver, _probe, _device) = spawn(&base_config());
    driver.set_promiscuous_mode(true);
    let info = driver.info();
    assert!(info.contains("0 connections"));
    assert!(info.contains("0 neighbors"));
    assert!(info.contains("mock 1.0"));
}

#[test]
fn engine_config_carries_derived_addressing() {
    let (_driver, probe, _device) = spawn(&base_config());
    let config = probe.config.lock().unwrap().clone().unwrap();
    assert_eq!(config.host, Ipv4Addr::new(10, 0, 2, 2));
    assert_eq!(config.dhcp_start, Ipv4Addr::new(10, 0, 2, 15));
    assert_eq!(config.nameserver, Ipv4Addr::new(10, 0, 2, 3));
    assert_eq!(config.mtu, 1500);
}

#[test]
fn teardown_cleans_engine_and_registry() {
    let (driver, probe, _device) = spawn(&base_config());
    let instance = driver.instance();
    assert!(stats::lookup(instance).is_some());

    drop(driver);
    assert!(probe.cleaned_up.load(Ordering::SeqCst));
    assert!(stats::lookup(instance).is_none());
}

#[test]
fn send_fails_net_down_when_link_drops_mid_window() {
    let (driver, probe, _device) = spawn(&base_config());

    // Allocate while the link is up, flip it down before submitting.
    let xmit = driver.begin_xmit(false).unwrap();
    let mut buf = xmit.alloc(64, None).unwrap();
    buf.set_used(64);
    drop(xmit);
    driver.notify_link_changed(LinkState::Down);

    let xmit = driver.begin_xmit(false).unwrap();
    // The buffer is consumed by the failing send.
    assert_eq!(xmit.send(buf).unwrap_err(), NatError::NetDown);
    drop(xmit);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(probe.input_count(), 0);
}
