use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use netmux_frame::{DisconnectCause, EventBus, NetEvent, Valve};
use netmux_sched::{Priority, TaskId, TaskSpec, Worker, WorkerBoss, WorkerStatus};
use netmux_transport::{ConnectionKind, Pipeline};
use tracing::{debug, info, warn};

use crate::banlist::BanList;
use crate::config::Config;
use crate::error::{PeerError, Result};
use crate::handshake::{HandshakeHandler, HANDSHAKE_CHANNEL};

const MAX_PASSPHRASE_LEN: usize = 1024;

static INSTANCE_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Worker group names for one server or client instance. Instances get
/// unique names so several can share one boss.
pub(crate) struct Groups {
    pub main: String,
    pub crawl: String,
    pub connections: String,
    pub timeouts: String,
    pub handshake: String,
}

impl Groups {
    pub(crate) fn for_instance(kind: &str) -> Self {
        let seq = INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            main: format!("{kind}{seq}_main"),
            crawl: format!("{kind}{seq}_crawl"),
            connections: format!("{kind}{seq}_connections"),
            timeouts: format!("{kind}{seq}_timeouts"),
            handshake: format!("{kind}{seq}_handshake"),
        }
    }
}

/// A multiplexing server over TCP or UDP.
///
/// Binds a socket, accepts peers through the passphrase handshake,
/// wires a [`Valve`] per peer and keeps everything alive with scheduled
/// pump and liveness tasks. Banned addresses are dropped before any
/// channel work happens.
pub struct Server {
    core: Arc<ServerCore>,
}

struct ServerCore {
    config: Config,
    passphrase: String,
    boss: Arc<WorkerBoss>,
    bus: Arc<dyn EventBus>,
    groups: Groups,
    bans: BanList,
    handshake: HandshakeHandler,
    valves: RwLock<HashMap<SocketAddr, Arc<Valve>>>,
    pump_tasks: Mutex<HashMap<SocketAddr, TaskId>>,
    state: Mutex<ServerState>,
}

#[derive(Default)]
struct ServerState {
    running: bool,
    listener: Option<Arc<TcpListener>>,
    socket: Option<Arc<UdpSocket>>,
    local_addr: Option<SocketAddr>,
    workers: Vec<Arc<Worker>>,
    tasks: Vec<(String, TaskId)>,
}

impl Server {
    pub fn new(
        config: Config,
        passphrase: impl Into<String>,
        boss: Arc<WorkerBoss>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            core: Arc::new(ServerCore {
                handshake: HandshakeHandler::new(HANDSHAKE_CHANNEL, &config),
                config,
                passphrase: passphrase.into(),
                boss,
                bans: BanList::new(Arc::clone(&bus)),
                bus,
                groups: Groups::for_instance("server"),
                valves: RwLock::new(HashMap::new()),
                pump_tasks: Mutex::new(HashMap::new()),
                state: Mutex::new(ServerState::default()),
            }),
        }
    }

    /// Bind and start serving. Returns the bound address.
    pub fn start(&self, bind: SocketAddr) -> Result<SocketAddr> {
        self.core.bind(bind)
    }

    /// Stop accepting, drop every connection and decommission the
    /// owned workers and groups.
    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn is_running(&self) -> bool {
        self.core.lock_state().running
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.lock_state().local_addr
    }

    pub fn valve(&self, addr: &SocketAddr) -> Option<Arc<Valve>> {
        self.core.read_valves().get(addr).cloned()
    }

    pub fn valves(&self) -> Vec<Arc<Valve>> {
        self.core.read_valves().values().cloned().collect()
    }

    /// Last measured round trip for a connected peer.
    pub fn ping_of(&self, addr: &SocketAddr) -> Option<Duration> {
        self.core.handshake.ping_of(addr)
    }

    pub fn ban(&self, addr: SocketAddr) {
        self.core.bans.ban(addr, None);
    }

    /// Ban with automatic pardon after `duration`.
    pub fn ban_for(&self, addr: SocketAddr, duration: Duration) {
        self.core.ban_for(addr, duration);
    }

    pub fn pardon(&self, addr: SocketAddr) {
        self.core.bans.pardon(addr);
    }

    /// Schedule a pardon after `delay`.
    pub fn pardon_after(&self, addr: SocketAddr, delay: Duration) {
        self.core.pardon_after(addr, delay);
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.core.bans.is_banned(addr)
    }

    pub fn boss(&self) -> &Arc<WorkerBoss> {
        &self.core.boss
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.core.stop();
    }
}

impl ServerCore {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_valves(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SocketAddr, Arc<Valve>>> {
        self.valves
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bind(self: &Arc<Self>, bind: SocketAddr) -> Result<SocketAddr> {
        let mut state = self.lock_state();
        if state.running {
            return Err(PeerError::ConnectFailed("server already running".into()));
        }

        let local = match self.config.transport {
            ConnectionKind::Stream => {
                let listener = TcpListener::bind(bind)?;
                listener.set_nonblocking(true)?;
                let local = listener.local_addr()?;
                state.listener = Some(Arc::new(listener));
                local
            }
            ConnectionKind::Datagram => {
                let socket = UdpSocket::bind(bind)?;
                socket.set_nonblocking(true)?;
                let local = socket.local_addr()?;
                state.socket = Some(Arc::new(socket));
                local
            }
        };
        state.local_addr = Some(local);

        self.boss.create_group(&self.groups.main, Priority::High);
        self.boss.create_group(&self.groups.crawl, Priority::High);
        self.boss
            .create_group(&self.groups.connections, Priority::Medium);
        self.boss
            .create_group(&self.groups.timeouts, Priority::Medium);
        self.boss
            .create_group(&self.groups.handshake, Priority::Medium);

        for _ in 0..self.config.pool_size {
            state.workers.push(
                self.boss
                    .create_worker(Priority::Medium, &[self.groups.crawl.as_str()])?,
            );
            state.workers.push(
                self.boss
                    .create_worker(Priority::Medium, &[self.groups.handshake.as_str()])?,
            );
        }
        state.workers.push(
            self.boss
                .create_worker(Priority::Medium, &[self.groups.main.as_str()])?,
        );
        state.workers.push(
            self.boss
                .create_worker(Priority::Medium, &[self.groups.timeouts.as_str()])?,
        );
        state.workers.push(
            self.boss
                .create_worker(Priority::Medium, &[self.groups.connections.as_str()])?,
        );
        for worker in &state.workers {
            worker.change_status(WorkerStatus::Starting)?;
        }

        let core = Arc::clone(self);
        let accept_task = self.boss.submit_task(
            &self.groups.main,
            TaskSpec::new(Priority::High, move |_| match core.config.transport {
                ConnectionKind::Stream => core.accept_tick(),
                ConnectionKind::Datagram => core.datagram_tick(),
            })
            .every(self.config.poll_interval),
        )?;
        state.tasks.push((self.groups.main.clone(), accept_task));

        let core = Arc::clone(self);
        let handshake_task = self.boss.submit_task(
            &self.groups.handshake,
            TaskSpec::new(Priority::High, move |_| core.handshake_tick())
                .every(self.config.handshake_interval),
        )?;
        state
            .tasks
            .push((self.groups.handshake.clone(), handshake_task));

        state.running = true;
        info!(%local, transport = ?self.config.transport, "server started");
        Ok(local)
    }

    /// Poll the listener for new peers (TCP).
    fn accept_tick(self: &Arc<Self>) {
        let Some(listener) = self.lock_state().listener.clone() else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if self.bans.is_banned(&addr) {
                        debug!(remote = %addr, "dropping banned peer");
                        continue;
                    }
                    if self.read_valves().len() >= self.config.backlog {
                        warn!(remote = %addr, "backlog full, refusing connection");
                        continue;
                    }

                    self.bus.publish(NetEvent::PreConnection { remote: addr });
                    debug!(remote = %addr, "connection attempt");

                    // The passphrase wait blocks its worker for up to the
                    // connection timeout; it runs on the dedicated
                    // connections group, away from the pump workers.
                    let core = Arc::clone(self);
                    let mut slot = Some(stream);
                    let submitted = self.boss.submit_task(
                        &self.groups.connections,
                        TaskSpec::new(Priority::Low, move |_| {
                            if let Some(stream) = slot.take() {
                                core.tcp_handshake(stream, addr);
                            }
                        })
                        .repeat(1),
                    );
                    if let Err(err) = submitted {
                        warn!(remote = %addr, %err, "failed to schedule handshake");
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            }
        }
    }

    /// Bounded-time passphrase exchange for one TCP peer.
    fn tcp_handshake(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        match self.read_passphrase(&stream) {
            Ok(passphrase) if passphrase == self.passphrase => {
                match self.register_tcp_valve(stream, addr) {
                    Ok(()) => {
                        info!(remote = %addr, "peer connected");
                        self.bus.publish(NetEvent::PostConnection { remote: addr });
                    }
                    Err(err) => {
                        warn!(remote = %addr, %err, "failed to register valve");
                        self.bus.publish(NetEvent::FailedConnection {
                            remote: addr,
                            cause: err.to_string(),
                        });
                    }
                }
            }
            Ok(_) => {
                warn!(remote = %addr, "wrong passphrase");
                self.bus.publish(NetEvent::FailedConnection {
                    remote: addr,
                    cause: PeerError::AuthFailed("wrong passphrase".into()).to_string(),
                });
            }
            Err(err) => {
                warn!(remote = %addr, %err, "passphrase exchange failed");
                self.bus.publish(NetEvent::FailedConnection {
                    remote: addr,
                    cause: err.to_string(),
                });
            }
        }
    }

    fn read_passphrase(&self, mut stream: &TcpStream) -> Result<String> {
        stream.set_read_timeout(Some(self.config.connection_timeout))?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_PASSPHRASE_LEN {
            return Err(PeerError::AuthFailed(format!(
                "oversized passphrase ({len} bytes)"
            )));
        }

        let mut bytes = vec![0u8; len];
        stream.read_exact(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| PeerError::AuthFailed("invalid utf-8".into()))
    }

    fn register_tcp_valve(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;

        let pipeline = Arc::new(Pipeline::tcp(stream));
        let valve = Arc::new(Valve::new(
            pipeline,
            self.config.buffer_capacity,
            Arc::clone(&self.bus),
        )?);
        self.valves
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(addr, valve);

        let core = Arc::clone(self);
        let task = self.boss.submit_task(
            &self.groups.crawl,
            TaskSpec::new(Priority::Medium, move |_| core.pump(addr))
                .every(self.config.poll_interval),
        )?;
        self.pump_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(addr, task);
        Ok(())
    }

    /// Drain one TCP peer's socket into its valve and push pending
    /// output.
    fn pump(&self, addr: SocketAddr) {
        let Some(valve) = self.read_valves().get(&addr).cloned() else {
            return;
        };

        let mut buf = vec![0u8; self.config.buffer_capacity];
        loop {
            match valve.pipeline().read(&mut buf) {
                Ok(0) => {
                    self.disconnect(addr, DisconnectCause::Closed);
                    return;
                }
                Ok(n) => {
                    if let Err(err) = valve.update_inputs(&buf[..n]) {
                        self.disconnect(addr, DisconnectCause::Io(err.to_string()));
                        return;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.disconnect(addr, DisconnectCause::Io(err.to_string()));
                    return;
                }
            }
        }

        if let Err(err) = valve.update_outputs() {
            self.disconnect(addr, DisconnectCause::Io(err.to_string()));
        }
    }

    /// Receive datagrams, route them by peer address, treat the first
    /// datagram of an unknown peer as its passphrase (UDP).
    fn datagram_tick(self: &Arc<Self>) {
        let Some(socket) = self.lock_state().socket.clone() else {
            return;
        };

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((n, addr)) => {
                    if self.bans.is_banned(&addr) {
                        debug!(remote = %addr, "dropping datagram from banned peer");
                        continue;
                    }

                    let valve = self.read_valves().get(&addr).cloned();
                    match valve {
                        Some(valve) => {
                            if let Err(err) = valve.update_inputs(&buf[..n]) {
                                self.disconnect(addr, DisconnectCause::Io(err.to_string()));
                            }
                        }
                        None => self.datagram_connect(&socket, addr, &buf[..n]),
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%err, "datagram receive failed");
                    break;
                }
            }
        }

        let valves: Vec<(SocketAddr, Arc<Valve>)> = self
            .read_valves()
            .iter()
            .map(|(addr, valve)| (*addr, Arc::clone(valve)))
            .collect();
        for (addr, valve) in valves {
            if let Err(err) = valve.update_outputs() {
                self.disconnect(addr, DisconnectCause::Io(err.to_string()));
            }
        }
    }

    fn datagram_connect(self: &Arc<Self>, socket: &Arc<UdpSocket>, addr: SocketAddr, payload: &[u8]) {
        self.bus.publish(NetEvent::PreConnection { remote: addr });

        if self.read_valves().len() >= self.config.backlog {
            warn!(remote = %addr, "backlog full, refusing connection");
            self.bus.publish(NetEvent::FailedConnection {
                remote: addr,
                cause: "backlog full".into(),
            });
            return;
        }

        // UDP peers send the raw passphrase as their first datagram.
        if payload != self.passphrase.as_bytes() {
            warn!(remote = %addr, "wrong passphrase");
            self.bus.publish(NetEvent::FailedConnection {
                remote: addr,
                cause: PeerError::AuthFailed("wrong passphrase".into()).to_string(),
            });
            return;
        }

        let register = || -> Result<()> {
            let pipeline = Arc::new(Pipeline::udp(socket.try_clone()?, addr));
            let valve = Arc::new(Valve::new(
                pipeline,
                self.config.buffer_capacity,
                Arc::clone(&self.bus),
            )?);
            self.valves
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(addr, valve);
            Ok(())
        };

        match register() {
            Ok(()) => {
                info!(remote = %addr, "peer connected");
                self.bus.publish(NetEvent::PostConnection { remote: addr });
            }
            Err(err) => {
                warn!(remote = %addr, %err, "failed to register valve");
                self.bus.publish(NetEvent::FailedConnection {
                    remote: addr,
                    cause: err.to_string(),
                });
            }
        }
    }

    /// Ping every live valve; disconnect and ban the silent ones.
    fn handshake_tick(self: &Arc<Self>) {
        let valves: Vec<Arc<Valve>> = self.read_valves().values().cloned().collect();
        for (addr, silent_for) in self.handshake.tick(&valves) {
            warn!(remote = %addr, ?silent_for, "peer timed out");
            self.disconnect(addr, DisconnectCause::Timeout { silent_for });
            self.ban_for(addr, self.config.timeout_delay);
        }
    }

    /// Tear one peer down. Publishes exactly one disconnection event.
    fn disconnect(&self, addr: SocketAddr, cause: DisconnectCause) {
        let valve = self
            .valves
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&addr);
        let Some(valve) = valve else {
            return;
        };

        valve.stop();
        if let Some(task) = self
            .pump_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&addr)
        {
            self.boss.decommission_task(&self.groups.crawl, task);
        }
        self.handshake.forget(&addr);

        info!(remote = %addr, ?cause, "peer disconnected");
        self.bus.publish(NetEvent::Disconnection {
            remote: addr,
            cause,
        });
    }

    fn ban_for(self: &Arc<Self>, addr: SocketAddr, duration: Duration) {
        if self.bans.ban(addr, Some(duration)) {
            self.pardon_after(addr, duration);
        }
    }

    fn pardon_after(self: &Arc<Self>, addr: SocketAddr, delay: Duration) {
        let core = Arc::clone(self);
        let scheduled = self.boss.submit_task(
            &self.groups.timeouts,
            TaskSpec::new(Priority::Medium, move |_| {
                core.bans.pardon(addr);
            })
            .every(delay)
            .repeat(1),
        );
        if let Err(err) = scheduled {
            warn!(remote = %addr, %err, "failed to schedule pardon");
        }
    }

    fn stop(&self) {
        let (tasks, workers) = {
            let mut state = self.lock_state();
            if !state.running {
                return;
            }
            state.running = false;
            state.listener = None;
            state.socket = None;
            (
                std::mem::take(&mut state.tasks),
                std::mem::take(&mut state.workers),
            )
        };

        for (group, task) in tasks {
            self.boss.decommission_task(&group, task);
        }

        let peers: Vec<SocketAddr> = self.read_valves().keys().copied().collect();
        for addr in peers {
            self.disconnect(addr, DisconnectCause::Closed);
        }

        for worker in &workers {
            self.boss.decommission_worker(worker);
        }
        for worker in &workers {
            worker.join();
        }

        self.boss.decommission_group(&self.groups.main);
        self.boss.decommission_group(&self.groups.crawl);
        self.boss.decommission_group(&self.groups.connections);
        self.boss.decommission_group(&self.groups.timeouts);
        self.boss.decommission_group(&self.groups.handshake);

        info!("server stopped");
    }
}

/// Write the length-prefixed passphrase a TCP client opens with.
pub(crate) fn write_tcp_passphrase(stream: &mut TcpStream, passphrase: &str) -> Result<()> {
    let mut frame = Vec::with_capacity(4 + passphrase.len());
    frame.extend_from_slice(&(passphrase.len() as u32).to_be_bytes());
    frame.extend_from_slice(passphrase.as_bytes());
    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(())
}
