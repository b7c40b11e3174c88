use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use netmux_frame::{DisconnectCause, EventBus, NetEvent, Valve};
use netmux_sched::{Priority, TaskId, TaskSpec, Worker, WorkerBoss, WorkerStatus};
use netmux_transport::{ConnectionKind, Pipeline};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{PeerError, Result};
use crate::handshake::{HandshakeHandler, HANDSHAKE_CHANNEL};
use crate::server::{write_tcp_passphrase, Groups};

/// A multiplexing client over TCP or UDP.
///
/// Opens the raw connection, sends the passphrase, wires a [`Valve`]
/// and keeps the connection alive with pump and liveness tasks. A peer
/// silent past the timeout delay is disconnected locally.
pub struct Client {
    core: Arc<ClientCore>,
}

struct ClientCore {
    config: Config,
    passphrase: String,
    boss: Arc<WorkerBoss>,
    bus: Arc<dyn EventBus>,
    groups: Groups,
    handshake: HandshakeHandler,
    valve: RwLock<Option<Arc<Valve>>>,
    state: Mutex<ClientState>,
}

#[derive(Default)]
struct ClientState {
    connected: bool,
    workers: Vec<Arc<Worker>>,
    tasks: Vec<(String, TaskId)>,
}

impl Client {
    pub fn new(
        config: Config,
        passphrase: impl Into<String>,
        boss: Arc<WorkerBoss>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            core: Arc::new(ClientCore {
                handshake: HandshakeHandler::new(HANDSHAKE_CHANNEL, &config),
                config,
                passphrase: passphrase.into(),
                boss,
                bus,
                groups: Groups::for_instance("client"),
                valve: RwLock::new(None),
                state: Mutex::new(ClientState::default()),
            }),
        }
    }

    /// Open the connection, send the passphrase and start the pump and
    /// liveness tasks.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.core.connect(addr)
    }

    /// Tear the connection down and decommission the owned workers and
    /// groups. Idempotent.
    pub fn disconnect(&self) {
        self.core.teardown(DisconnectCause::Closed);
    }

    pub fn is_connected(&self) -> bool {
        self.core.lock_state().connected
    }

    /// The valve of the live connection; channels are opened here.
    pub fn valve(&self) -> Option<Arc<Valve>> {
        self.core.read_valve()
    }

    /// Last measured round trip to the server.
    pub fn ping(&self) -> Option<Duration> {
        let valve = self.core.read_valve()?;
        self.core.handshake.ping_of(&valve.remote())
    }

    pub fn boss(&self) -> &Arc<WorkerBoss> {
        &self.core.boss
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.core.teardown(DisconnectCause::Closed);
    }
}

impl ClientCore {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_valve(&self) -> Option<Arc<Valve>> {
        self.valve
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let mut state = self.lock_state();
        if state.connected {
            return Err(PeerError::ConnectFailed("client already connected".into()));
        }

        let pipeline = match self.config.transport {
            ConnectionKind::Stream => {
                let mut stream = TcpStream::connect_timeout(&addr, self.config.connection_timeout)
                    .map_err(|err| PeerError::ConnectFailed(err.to_string()))?;
                write_tcp_passphrase(&mut stream, &self.passphrase)?;
                stream.set_nonblocking(true)?;
                Arc::new(Pipeline::tcp(stream))
            }
            ConnectionKind::Datagram => {
                let bind = SocketAddr::new(
                    match addr {
                        SocketAddr::V4(_) => std::net::Ipv4Addr::UNSPECIFIED.into(),
                        SocketAddr::V6(_) => std::net::Ipv6Addr::UNSPECIFIED.into(),
                    },
                    0,
                );
                let socket = UdpSocket::bind(bind)
                    .map_err(|err| PeerError::ConnectFailed(err.to_string()))?;
                // UDP opens with the raw passphrase bytes.
                socket.send_to(self.passphrase.as_bytes(), addr)?;
                socket.set_nonblocking(true)?;
                Arc::new(Pipeline::udp(socket, addr))
            }
        };

        let valve = Arc::new(Valve::new(
            pipeline,
            self.config.buffer_capacity,
            Arc::clone(&self.bus),
        )?);
        *self
            .valve
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(valve);

        self.boss.create_group(&self.groups.main, Priority::High);
        self.boss
            .create_group(&self.groups.handshake, Priority::Medium);
        for _ in 0..self.config.pool_size {
            state.workers.push(
                self.boss
                    .create_worker(Priority::Medium, &[self.groups.main.as_str()])?,
            );
        }
        state.workers.push(
            self.boss
                .create_worker(Priority::Medium, &[self.groups.handshake.as_str()])?,
        );
        for worker in &state.workers {
            worker.change_status(WorkerStatus::Starting)?;
        }

        let core = Arc::clone(self);
        let pump_task = self.boss.submit_task(
            &self.groups.main,
            TaskSpec::new(Priority::High, move |_| core.pump())
                .every(self.config.poll_interval),
        )?;
        state.tasks.push((self.groups.main.clone(), pump_task));

        let core = Arc::clone(self);
        let handshake_task = self.boss.submit_task(
            &self.groups.handshake,
            TaskSpec::new(Priority::Medium, move |_| core.handshake_tick())
                .every(self.config.handshake_interval),
        )?;
        state
            .tasks
            .push((self.groups.handshake.clone(), handshake_task));

        state.connected = true;
        info!(remote = %addr, transport = ?self.config.transport, "client connected");
        self.bus.publish(NetEvent::PostConnection { remote: addr });
        Ok(())
    }

    /// Drain the socket into the valve and push pending output.
    fn pump(self: &Arc<Self>) {
        let Some(valve) = self.read_valve() else {
            return;
        };

        let mut buf = vec![0u8; self.config.buffer_capacity];
        loop {
            match valve.pipeline().read(&mut buf) {
                Ok(0) => {
                    self.drop_connection(DisconnectCause::Closed);
                    return;
                }
                Ok(n) => {
                    if let Err(err) = valve.update_inputs(&buf[..n]) {
                        self.drop_connection(DisconnectCause::Io(err.to_string()));
                        return;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.drop_connection(DisconnectCause::Io(err.to_string()));
                    return;
                }
            }
        }

        if let Err(err) = valve.update_outputs() {
            self.drop_connection(DisconnectCause::Io(err.to_string()));
        }
    }

    /// Ping the server; disconnect locally when it goes silent.
    fn handshake_tick(self: &Arc<Self>) {
        let Some(valve) = self.read_valve() else {
            return;
        };

        for (addr, silent_for) in self.handshake.tick(std::slice::from_ref(&valve)) {
            warn!(remote = %addr, ?silent_for, "server timed out");
            self.drop_connection(DisconnectCause::Timeout { silent_for });
        }
    }

    /// Close the valve and publish exactly one disconnection event.
    fn drop_connection(&self, cause: DisconnectCause) {
        let valve = self
            .valve
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(valve) = valve else {
            return;
        };

        let remote = valve.remote();
        valve.stop();
        self.handshake.forget(&remote);
        info!(remote = %remote, ?cause, "disconnected");
        self.bus.publish(NetEvent::Disconnection { remote, cause });
    }

    /// Full teardown: connection, tasks, workers, groups.
    fn teardown(&self, cause: DisconnectCause) {
        let (tasks, workers) = {
            let mut state = self.lock_state();
            if !state.connected {
                return;
            }
            state.connected = false;
            (
                std::mem::take(&mut state.tasks),
                std::mem::take(&mut state.workers),
            )
        };

        for (group, task) in tasks {
            self.boss.decommission_task(&group, task);
        }
        self.drop_connection(cause);

        for worker in &workers {
            self.boss.decommission_worker(worker);
        }
        for worker in &workers {
            worker.join();
        }
        self.boss.decommission_group(&self.groups.main);
        self.boss.decommission_group(&self.groups.handshake);
    }
}
