//! NAT transport driver
//!
//! Owns the glue between three independent actors: the guest-facing
//! device port, the single-threaded NAT engine and the host socket
//! layer. The engine runs on a dedicated NAT thread so it never becomes
//! reentrant. When a guest device wants to send, the frame is parked on
//! the engine queue and handled asynchronously by the NAT thread; when
//! the engine wants to deliver a packet to the guest, it parks the
//! packet on the receive queue which a separate receive thread drains
//! into the device port. Both hand-offs poke the wakeup channel so the
//! NAT thread leaves its poll wait promptly.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::*;
use num_traits::FromPrimitive;

use crate::buffer::{carve_segment, FrameBuf, GsoDescriptor, MAX_FRAME_SIZE};
use crate::config::{ConfigNode, NatConfig};
use crate::device::{DevicePort, RecvWaitError};
use crate::engine::{DnsConfig, EngineFactory, EngineHost, NatEngine};
use crate::error::NatError;
use crate::poll::{self, PollSet};
use crate::queue::RequestQueue;
use crate::stats::{self, NatStats};
use crate::timer::{TimerHandler, TimerId, TimerList};
use crate::wakeup::WakeupChannel;

/// Poll timeout when no descriptor and no timer asks for less.
const DEFAULT_TIMEOUT_MS: u32 = 3_600_000;

/// Consecutive poll failures tolerated before one log record is emitted.
const POLL_FAILURE_LOG_THRESHOLD: u32 = 128;

/// Reported link state of the virtual adapter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, strum::Display, serde::Serialize, serde::Deserialize,
)]
#[repr(u32)]
pub enum LinkState {
    Up = 0,
    Down = 1,
    /// Link forced down while the VM resumes, restored separately.
    DownResume = 2,
}

/// Lifecycle of the NAT thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(u32)]
enum ThreadState {
    Initializing = 0,
    Running = 1,
    Terminating = 2,
}

/// State shared between the public handle, both worker threads and the
/// engine callbacks.
struct NatShared {
    instance: usize,
    state: AtomicU32,
    link_state: AtomicU32,
    link_state_want: AtomicU32,
    /// The engine itself. Locked by the NAT thread while running;
    /// other threads only reach in during construction, teardown and
    /// not-running dispatch, which keeps the engine single-threaded.
    engine: Mutex<Option<Box<dyn NatEngine>>>,
    /// Deferred calls executed on the NAT thread.
    engine_queue: RequestQueue<Box<dyn NatEngine>>,
    /// Deferred deliveries executed on the receive thread.
    recv_queue: RequestQueue<()>,
    recv_event_tx: Sender<()>,
    recv_event_rx: Receiver<()>,
    start_rx: Receiver<()>,
    wakeup: WakeupChannel,
    timers: TimerList,
    device: Arc<dyn DevicePort>,
    /// Serializes wait_receive_available and receive on the device port.
    dev_access_lock: Mutex<()>,
    /// Held from begin_xmit to end_xmit.
    xmit_lock: Mutex<()>,
    /// Packets queued towards the guest but not yet delivered.
    in_flight: AtomicU32,
    /// Default guest address for forwarding rules.
    guest_ip: Ipv4Addr,
    stats: Arc<NatStats>,
    epoch: Instant,
}

impl NatShared {
    fn thread_state(&self) -> ThreadState {
        ThreadState::from_u32(self.state.load(Ordering::SeqCst))
            .unwrap_or(ThreadState::Terminating)
    }

    fn set_thread_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::SeqCst);
    }

    fn link_state(&self) -> LinkState {
        LinkState::from_u32(self.link_state.load(Ordering::SeqCst)).unwrap_or(LinkState::Down)
    }

    fn set_link_state(&self, state: LinkState) {
        self.link_state.store(state as u32, Ordering::SeqCst);
    }

    fn link_state_want(&self) -> LinkState {
        LinkState::from_u32(self.link_state_want.load(Ordering::SeqCst))
            .unwrap_or(LinkState::Down)
    }

    fn set_link_state_want(&self, state: LinkState) {
        self.link_state_want.store(state as u32, Ordering::SeqCst);
    }

    fn clock_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    fn now_ms(&self) -> i64 {
        self.clock_ns() / 1_000_000
    }

    fn notify_nat_thread(&self) {
        self.wakeup.notify();
        self.stats.wakeup_notifies.fetch_add(1, Ordering::Relaxed);
    }

    fn signal_recv_event(&self) {
        let _ = self.recv_event_tx.try_send(());
    }
}

/// Callback handle the engine receives at construction.
struct HostHandle {
    shared: Arc<NatShared>,
}

impl EngineHost for HostHandle {
    fn send_packet_to_guest(&self, frame: &[u8]) -> isize {
        let shared = &self.shared;
        // Don't queue new deliveries when the NAT thread is stopping.
        if shared.thread_state() != ThreadState::Running {
            return -1;
        }
        // The engine's buffer is ephemeral; copy before queueing.
        let buf = frame.to_vec();
        let len = frame.len();
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        let worker_shared = Arc::clone(shared);
        if shared
            .recv_queue
            .post(move |_| recv_worker(&worker_shared, buf))
            .is_err()
        {
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            shared.stats.pkts_dropped.fetch_add(1, Ordering::Relaxed);
            return -1;
        }
        shared.signal_recv_event();
        shared.stats.recv_wakeups.fetch_add(1, Ordering::Relaxed);
        shared.notify_nat_thread();
        shared.stats.pkts_to_guest.fetch_add(1, Ordering::Relaxed);
        len as isize
    }

    fn guest_error(&self, msg: &str) {
        error!("NAT#{}: guest error: {}", self.shared.instance, msg);
    }

    fn clock_get_ns(&self) -> i64 {
        self.shared.clock_ns()
    }

    fn timer_new(&self, handler: TimerHandler) -> TimerId {
        self.shared.timers.create(handler)
    }

    fn timer_free(&self, timer: TimerId) {
        self.shared.timers.free(timer)
    }

    fn timer_mod(&self, timer: TimerId, expires_ms: i64) {
        self.shared.timers.modify(timer, expires_ms)
    }

    fn register_poll_fd(&self, fd: std::os::fd::RawFd) {
        trace!("NAT#{}: poll fd {} registered", self.shared.instance, fd);
    }

    fn unregister_poll_fd(&self, fd: std::os::fd::RawFd) {
        trace!("NAT#{}: poll fd {} unregistered", self.shared.instance, fd);
    }

    fn notify(&self) {
        self.shared.notify_nat_thread();
    }
}

/// The NAT network transport driver instance.
pub struct NatDriver {
    shared: Arc<NatShared>,
    nat_thread: Option<JoinHandle<()>>,
    recv_thread: Option<JoinHandle<()>>,
    start_tx: Sender<()>,
}

impl std::fmt::Debug for NatDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatDriver").finish_non_exhaustive()
    }
}

impl NatDriver {
    /// Constructs an instance from a configuration tree, a device port
    /// and an engine factory, installs the configured port-forwarding
    /// rules and starts both worker threads.
    pub fn new(
        instance: usize,
        cfg: &ConfigNode,
        device: Arc<dyn DevicePort>,
        engine_factory: EngineFactory,
    ) -> Result<Self> {
        let nat_cfg = NatConfig::from_tree(cfg)
            .with_context(|| format!("NAT#{}: configuration error", instance))?;
        debug!(
            "NAT#{}: network {} netmask {}",
            instance, nat_cfg.network, nat_cfg.netmask
        );

        let wakeup = WakeupChannel::new()
            .with_context(|| format!("NAT#{}: wakeup channel", instance))?;
        let (recv_event_tx, recv_event_rx) = bounded(1);
        let (start_tx, start_rx) = bounded(1);
        let stats = Arc::new(NatStats::default());

        let shared = Arc::new(NatShared {
            instance,
            state: AtomicU32::new(ThreadState::Initializing as u32),
            link_state: AtomicU32::new(LinkState::Up as u32),
            link_state_want: AtomicU32::new(LinkState::Up as u32),
            engine: Mutex::new(None),
            engine_queue: RequestQueue::new(),
            recv_queue: RequestQueue::new(),
            recv_event_tx,
            recv_event_rx,
            start_rx,
            wakeup,
            timers: TimerList::new(),
            device,
            dev_access_lock: Mutex::new(()),
            xmit_lock: Mutex::new(()),
            in_flight: AtomicU32::new(0),
            guest_ip: nat_cfg.guest_ip(),
            stats: Arc::clone(&stats),
            epoch: Instant::now(),
        });

        let host: Arc<dyn EngineHost> = Arc::new(HostHandle {
            shared: Arc::clone(&shared),
        });
        let engine = engine_factory(nat_cfg.engine_config(), host)
            .with_context(|| format!("NAT#{}: engine construction failed", instance))?;
        *shared.engine.lock().unwrap() = Some(engine);

        // Install the configured redirections before any traffic flows.
        {
            let mut guard = shared.engine.lock().unwrap();
            let engine = guard.as_mut().unwrap();
            for fwd in &nat_cfg.forwards {
                engine
                    .add_hostfwd(
                        fwd.udp,
                        fwd.bind_ip,
                        fwd.host_port,
                        fwd.guest_ip,
                        fwd.guest_port,
                    )
                    .with_context(|| {
                        format!(
                            "NAT#{}: failed to set up redirection of {} to {}. \
                             Probably a conflict with existing services or other rules",
                            instance, fwd.host_port, fwd.guest_port
                        )
                    })?;
            }
        }

        let recv_thread = thread::Builder::new()
            .name(format!("natrx{}", instance))
            .spawn({
                let shared = Arc::clone(&shared);
                move || recv_thread_main(shared)
            })
            .with_context(|| format!("NAT#{}: failed to start receive thread", instance))?;

        let nat_thread = match thread::Builder::new().name(format!("nat{}", instance)).spawn({
            let shared = Arc::clone(&shared);
            move || nat_thread_main(shared)
        }) {
            Ok(handle) => handle,
            Err(e) => {
                shared.set_thread_state(ThreadState::Terminating);
                shared.signal_recv_event();
                let _ = recv_thread.join();
                return Err(anyhow::Error::new(e)
                    .context(format!("NAT#{}: failed to start NAT thread", instance)));
            }
        };

        stats::register(instance, stats);

        let driver = Self {
            shared,
            nat_thread: Some(nat_thread),
            recv_thread: Some(recv_thread),
            start_tx,
        };
        // Supervisor hand-off: the NAT thread idles in INITIALIZING
        // until the state moved to RUNNING.
        driver.shared.set_thread_state(ThreadState::Running);
        let _ = driver.start_tx.send(());
        Ok(driver)
    }

    /// Non-blocking attempt to open a transmit window. The returned
    /// token holds the transmit lock; dropping it ends the window.
    pub fn begin_xmit(&self, _on_worker_thread: bool) -> Result<Transmit<'_>, NatError> {
        match self.shared.xmit_lock.try_lock() {
            Ok(guard) => Ok(Transmit {
                driver: self,
                _lock: guard,
            }),
            Err(_) => Err(NatError::TryAgain),
        }
    }

    /// The engine operates at layer 3; promiscuous mode has no meaning
    /// here and the request is discarded.
    pub fn set_promiscuous_mode(&self, promiscuous: bool) {
        debug!(
            "NAT#{}: promiscuous mode request ({}) ignored",
            self.shared.instance, promiscuous
        );
    }

    /// Applies a link state change.
    ///
    /// Called on the VM's management thread. While the NAT thread is
    /// not running the change is only memorized, otherwise it is
    /// applied on the NAT thread and this call returns after it took
    /// effect.
    pub fn notify_link_changed(&self, state: LinkState) {
        debug!(
            "NAT#{}: link state change to {}",
            self.shared.instance, state
        );
        if self.shared.thread_state() != ThreadState::Running {
            self.shared.set_link_state_want(state);
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.shared.engine_queue.call_and_wait(
            move |_| link_state_worker(&shared, state),
            || self.shared.notify_nat_thread(),
        );
    }

    /// Adds or removes a port-forwarding rule at runtime.
    ///
    /// Unparseable or missing host addresses bind to the wildcard;
    /// unparseable or missing guest addresses target the instance's
    /// guest address.
    pub fn redirect_command(
        &self,
        remove: bool,
        udp: bool,
        host_ip: Option<&str>,
        host_port: u16,
        guest_ip: Option<&str>,
        guest_port: u16,
    ) {
        debug!(
            "NAT#{}: redirect {} udp={} {}:{} -> {}:{}",
            self.shared.instance,
            if remove { "remove" } else { "add" },
            udp,
            host_ip.unwrap_or("*"),
            host_port,
            guest_ip.unwrap_or("*"),
            guest_port
        );
        let host_addr = host_ip
            .and_then(|s| s.parse().ok())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let guest_addr = guest_ip
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.shared.guest_ip);

        if self.shared.thread_state() != ThreadState::Running {
            // Execute directly while nothing else can touch the engine.
            let mut guard = self.shared.engine.lock().unwrap();
            if let Some(engine) = guard.as_mut() {
                apply_redirect(
                    &mut **engine,
                    remove,
                    udp,
                    host_addr,
                    host_port,
                    guest_addr,
                    guest_port,
                );
            }
            return;
        }

        self.shared.engine_queue.call_and_wait(
            move |engine| {
                apply_redirect(
                    &mut **engine,
                    remove,
                    udp,
                    host_addr,
                    host_port,
                    guest_addr,
                    guest_port,
                )
            },
            || self.shared.notify_nat_thread(),
        );
    }

    /// Pushes changed host DNS settings into the engine.
    pub fn notify_dns_changed(&self, dns: &DnsConfig) {
        let dns = dns.clone();
        if self.shared.thread_state() != ThreadState::Running {
            let mut guard = self.shared.engine.lock().unwrap();
            if let Some(engine) = guard.as_mut() {
                apply_dns_update(&mut **engine, &dns);
            }
            return;
        }
        self.shared.engine_queue.call_and_wait(
            move |engine| apply_dns_update(&mut **engine, &dns),
            || self.shared.notify_nat_thread(),
        );
    }

    /// Renders the engine's connection, neighbor and version
    /// information for diagnostics.
    pub fn info(&self) -> String {
        let mut guard = self.shared.engine.lock().unwrap();
        match guard.as_mut() {
            Some(engine) => format!(
                "NAT engine connection info:\n{}\nNAT engine neighbor info:\n{}\nNAT engine version: {}\n",
                engine.connection_info(),
                engine.neighbor_info(),
                engine.version_string()
            ),
            None => "NAT engine not initialized\n".to_string(),
        }
    }

    pub fn instance(&self) -> usize {
        self.shared.instance
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.link_state()
    }

    /// Packets queued towards the guest but not yet delivered.
    pub fn in_flight_packets(&self) -> u32 {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Wakeup bytes written but not yet drained by the NAT thread.
    pub fn wakeup_bytes_outstanding(&self) -> u64 {
        self.shared.wakeup.bytes_outstanding()
    }

    pub fn stats(&self) -> Arc<NatStats> {
        Arc::clone(&self.shared.stats)
    }

    fn stop(&mut self) {
        if self.nat_thread.is_none() && self.recv_thread.is_none() {
            return;
        }
        debug!("NAT#{}: shutting down", self.shared.instance);
        self.shared.set_thread_state(ThreadState::Terminating);
        // Release a thread still parked in INITIALIZING, then break the
        // poll wait. The NAT thread drains its queue before exiting.
        let _ = self.start_tx.try_send(());
        self.shared.notify_nat_thread();
        if let Some(handle) = self.nat_thread.take() {
            let _ = handle.join();
        }
        // Engine teardown before the remaining state unwinds.
        self.shared.engine.lock().unwrap().take();
        self.shared.signal_recv_event();
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }
        stats::deregister(self.shared.instance);
    }
}

impl Drop for NatDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Transmit window held by a guest device thread.
///
/// Allocation, submission and release of a frame buffer are only valid
/// while this token is alive; dropping it releases the transmit lock.
#[derive(Debug)]
pub struct Transmit<'a> {
    driver: &'a NatDriver,
    _lock: MutexGuard<'a, ()>,
}

impl Transmit<'_> {
    /// Allocates a frame buffer of at least `min_size` bytes, with an
    /// optional segmentation descriptor for super-frames.
    pub fn alloc(&self, min_size: usize, gso: Option<GsoDescriptor>) -> Result<FrameBuf, NatError> {
        let shared = &self.driver.shared;
        // Drop the frame early when nobody could process it.
        if shared.thread_state() != ThreadState::Running
            || shared.link_state() != LinkState::Up
        {
            debug!("NAT#{}: allocation refused, net down", shared.instance);
            return Err(NatError::NetDown);
        }
        FrameBuf::alloc(min_size, gso)
    }

    /// Submits a filled buffer towards the engine.
    ///
    /// The buffer is consumed in every outcome; on failure its segment
    /// is released before this returns.
    pub fn send(&self, mut buf: FrameBuf) -> Result<(), NatError> {
        let shared = &self.driver.shared;
        buf.submit();
        if shared.thread_state() != ThreadState::Running
            || shared.link_state() != LinkState::Up
        {
            return Err(NatError::NetDown);
        }
        let worker_shared = Arc::clone(shared);
        shared
            .engine_queue
            .post(move |engine| send_worker(&worker_shared, &mut **engine, buf))
            .map_err(|_| NatError::NoBufferSpace)?;
        shared.notify_nat_thread();
        Ok(())
    }

    /// Releases an unsent buffer.
    pub fn free(&self, buf: FrameBuf) {
        drop(buf);
    }
}

/// Runs one guest frame into the engine on the NAT thread, segmenting
/// super-frames into wire-legal pieces.
fn send_worker(shared: &NatShared, engine: &mut dyn NatEngine, buf: FrameBuf) {
    if shared.link_state() != LinkState::Up {
        // Dropped silently; the segment is released with the buffer.
        return;
    }
    match buf.gso().copied() {
        None => {
            engine.input(buf.frame());
            shared.stats.frames_in.fetch_add(1, Ordering::Relaxed);
        }
        Some(gso) => {
            // Do not attempt to segment frames with bad parameters.
            if !gso.is_valid(buf.used()) {
                debug!(
                    "NAT#{}: refusing to segment frame ({} bytes, {} header bytes)",
                    shared.instance,
                    buf.used(),
                    gso.hdrs_total
                );
                return;
            }
            let frame = buf.frame();
            let segments = gso.segment_count(frame.len());
            for segment in 0..segments {
                let mut scratch = vec![0u8; MAX_FRAME_SIZE];
                let len = carve_segment(frame, &gso, segment, &mut scratch);
                engine.input(&scratch[..len]);
                shared.stats.frames_in.fetch_add(1, Ordering::Relaxed);
                shared.stats.gso_segments.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Delivers one queued packet to the device port on the receive thread.
fn recv_worker(shared: &NatShared, buf: Vec<u8>) {
    {
        let _device = shared.dev_access_lock.lock().unwrap();
        match shared.device.wait_receive_available(None) {
            Ok(()) => {
                if let Err(e) = shared.device.receive(&buf) {
                    debug_assert!(false, "device receive failed: {}", e);
                    error!("NAT#{}: device receive failed: {}", shared.instance, e);
                }
            }
            Err(RecvWaitError::Timeout | RecvWaitError::Interrupted) => {
                shared.stats.pkts_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug_assert!(false, "device wait failed: {}", e);
                error!("NAT#{}: device wait failed: {}", shared.instance, e);
            }
        }
    }
    drop(buf);
    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    shared.notify_nat_thread();
}

fn link_state_worker(shared: &NatShared, state: LinkState) {
    shared.set_link_state(state);
    shared.set_link_state_want(state);
    match state {
        LinkState::Up => info!("NAT#{}: link up", shared.instance),
        LinkState::Down | LinkState::DownResume => info!("NAT#{}: link down", shared.instance),
    }
}

fn apply_redirect(
    engine: &mut dyn NatEngine,
    remove: bool,
    udp: bool,
    host_addr: Ipv4Addr,
    host_port: u16,
    guest_addr: Ipv4Addr,
    guest_port: u16,
) {
    if remove {
        if let Err(e) = engine.remove_hostfwd(udp, host_addr, host_port) {
            warn!(
                "failed to remove redirect {}:{}: {}",
                host_addr, host_port, e
            );
        }
    } else if let Err(e) = engine.add_hostfwd(udp, host_addr, host_port, guest_addr, guest_port) {
        warn!(
            "failed to set up redirect {}:{} -> {}:{}: {}",
            host_addr, host_port, guest_addr, guest_port, e
        );
    }
}

fn apply_dns_update(engine: &mut dyn NatEngine, dns: &DnsConfig) {
    info!("NAT: DNS settings changed, triggering update");
    if dns.domain_name.is_empty() {
        engine.set_domainname(None);
    } else {
        engine.set_domainname(Some(&dns.domain_name));
    }
    engine.set_dns_search(&dns.search_domains);
    // TODO: convert dns.name_servers and hand the first IPv4 and IPv6
    // entries to the engine once it grows a resolver-address setter.
}

/// Body of the receive thread: drain the delivery queue, then sleep on
/// the receive event while nothing is in flight.
fn recv_thread_main(shared: Arc<NatShared>) {
    trace!("NAT#{}: receive thread starting", shared.instance);
    loop {
        shared.recv_queue.process_all(&mut ());
        if shared.thread_state() == ThreadState::Terminating {
            break;
        }
        if shared.in_flight.load(Ordering::SeqCst) == 0 {
            let _ = shared.recv_event_rx.recv();
        }
    }
    trace!("NAT#{}: receive thread stopped", shared.instance);
}

/// Body of the NAT thread: the poll loop driving the engine.
fn nat_thread_main(shared: Arc<NatShared>) {
    trace!("NAT#{}: poll thread starting", shared.instance);

    // Parked until the supervisor moves the instance to RUNNING.
    while shared.thread_state() == ThreadState::Initializing {
        if shared.start_rx.recv().is_err() {
            break;
        }
    }

    if shared.thread_state() == ThreadState::Running {
        // Apply a link change that arrived while the thread was held.
        let want = shared.link_state_want();
        if want != shared.link_state() {
            link_state_worker(&shared, want);
        }
    }

    let mut pollset = PollSet::new(shared.wakeup.reader_fd());
    let mut poll_failures: u32 = 0;

    while shared.thread_state() == ThreadState::Running {
        let mut timeout_ms = DEFAULT_TIMEOUT_MS;
        pollset.reset();
        {
            let mut guard = shared.engine.lock().unwrap();
            if let Some(engine) = guard.as_mut() {
                engine.pollfds_fill(&mut timeout_ms, &mut |fd, events| pollset.add(fd, events));
            }
        }
        shared.timers.clamp_timeout(shared.now_ms(), &mut timeout_ms);

        let mut ready = pollset.wait(timeout_ms);
        if ready < 0 {
            let err = poll::last_poll_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                // A signal is no error; run the round without waiting.
                ready = 0;
            } else {
                poll_failures += 1;
                if poll_failures > POLL_FAILURE_LOG_THRESHOLD {
                    warn!(
                        "NAT#{}: poll failed ({}), suppressed {} repeats",
                        shared.instance, err, poll_failures
                    );
                    poll_failures = 0;
                }
            }
        }

        {
            let mut guard = shared.engine.lock().unwrap();
            if let Some(engine) = guard.as_mut() {
                engine.pollfds_poll(ready < 0, &mut |idx| pollset.revents(idx));
            }
        }

        if pollset.wakeup_ready() {
            // The producers may have poked any number of times since the
            // last round; drain against the counted total.
            shared.wakeup.drain();
        }

        {
            let mut guard = shared.engine.lock().unwrap();
            if let Some(engine) = guard.as_mut() {
                shared.engine_queue.process_all(engine);
            }
        }

        let fired = shared.timers.fire_expired(shared.now_ms());
        if fired > 0 {
            shared
                .stats
                .timers_fired
                .fetch_add(fired as u64, Ordering::Relaxed);
        }
        shared.stats.poll_rounds.fetch_add(1, Ordering::Relaxed);
    }

    // Serve whatever is still parked so no awaitable caller is stranded.
    {
        let mut guard = shared.engine.lock().unwrap();
        if let Some(engine) = guard.as_mut() {
            shared.engine_queue.process_all(engine);
        }
    }
    trace!("NAT#{}: poll thread stopped", shared.instance);
}
