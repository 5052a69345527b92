use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

use netplay::{
    ClientId, INVALID_SLOT, Message, MessageType, ReadyCheckOutcome, ReliabilityContext, Session,
    SyncPingOutcome, encode_tcp_message, encode_udp_datagram,
};

use crate::config::ServerConfig;
use crate::events::{DisconnectReason, ServerEvent};
use crate::{tcp, udp};

/// Everything the dispatch thread knows about one validated client. The
/// writer half belongs to the connection's TCP task; when that task dies the
/// channel closes and the next sweep reaps the client.
pub struct ClientHandle {
    pub udp_addr: SocketAddr,
    pub tcp_writer: mpsc::UnboundedSender<Vec<u8>>,
    pub reliability: ReliabilityContext,
}

/// State the IO tasks and the dispatch thread both touch. The incoming
/// queue, the client table, and the endpoint map share one lock so that an
/// endpoint lookup, its reliability update, and the queue push are atomic
/// with respect to client removal.
#[derive(Default)]
pub struct NetState {
    pub incoming: VecDeque<(ClientId, Message)>,
    pub clients: HashMap<ClientId, ClientHandle>,
    pub endpoints: HashMap<SocketAddr, ClientId>,
}

#[derive(Default)]
pub struct SharedState {
    pub net: Mutex<NetState>,
    pub wake: Condvar,
    pub events: Mutex<Vec<ServerEvent>>,
}

impl SharedState {
    pub fn push_incoming(&self, client_id: ClientId, message: Message) {
        self.net
            .lock()
            .unwrap()
            .incoming
            .push_back((client_id, message));
        self.wake.notify_one();
    }

    pub fn submit_event(&self, event: ServerEvent) {
        self.events.lock().unwrap().push(event);
        self.wake.notify_one();
    }
}

/// The server: owns the session, the IO runtime, and the dispatch loop.
/// Constructed once in `main` and handed to whoever needs it; all
/// cross-thread state lives behind [`SharedState`].
pub struct ServerContext {
    config: ServerConfig,
    shared: Arc<SharedState>,
    running: Arc<AtomicBool>,
    session: Session,
    udp_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    frame_count: Arc<AtomicU64>,
    stop_clock: Arc<AtomicBool>,
    clock_thread: Option<std::thread::JoinHandle<()>>,
    last_sweep: Instant,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    // Dropping the runtime tears down every IO task.
    _runtime: tokio::runtime::Runtime,
}

impl ServerContext {
    pub fn new(bind_addr: &str, config: ServerConfig) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("netplay-io")
            .enable_all()
            .build()?;

        let (listener, udp_socket) = runtime.block_on(async {
            let listener = TcpListener::bind(bind_addr).await?;
            let udp_socket = UdpSocket::bind(bind_addr).await?;
            io::Result::Ok((listener, udp_socket))
        })?;
        let tcp_addr = listener.local_addr()?;
        let udp_addr = udp_socket.local_addr()?;
        let udp_socket = Arc::new(udp_socket);

        let shared = Arc::new(SharedState::default());
        let running = Arc::new(AtomicBool::new(true));
        let (udp_tx, udp_rx) = mpsc::unbounded_channel();

        runtime.spawn(tcp::accept_loop(
            listener,
            Arc::clone(&shared),
            config.scramble_secrets,
            config.congestion,
        ));
        runtime.spawn(udp::receive_loop(
            Arc::clone(&udp_socket),
            Arc::clone(&shared),
        ));
        runtime.spawn(udp::send_loop(udp_socket, udp_rx));
        {
            let shared = Arc::clone(&shared);
            let running = Arc::clone(&running);
            runtime.spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received");
                    running.store(false, Ordering::SeqCst);
                    shared.wake.notify_all();
                }
            });
        }

        let session = Session::new(usize::from(config.session_size));

        Ok(Self {
            shared,
            running,
            session,
            udp_tx,
            frame_count: Arc::new(AtomicU64::new(0)),
            stop_clock: Arc::new(AtomicBool::new(false)),
            clock_thread: None,
            last_sweep: Instant::now(),
            tcp_addr,
            udp_addr,
            _runtime: runtime,
            config,
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Dispatch loop: sweep dead connections, sleep until the IO side has
    /// something for us, then handle events and drain the message queue.
    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.sweep_connections();
            self.wait_for_work();
            self.process_events();
            self.dispatch_incoming();
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_clock.store(true, Ordering::Relaxed);
        if let Some(thread) = self.clock_thread.take() {
            let _ = thread.join();
        }
        info!("server stopped");
    }

    /// Advances every client's reliability clock and reaps clients whose
    /// writer task has exited. Reaping here, not in the IO task, keeps all
    /// session mutation on this thread.
    fn sweep_connections(&mut self) {
        let now = Instant::now();
        let delta = now.duration_since(self.last_sweep).as_secs_f32();
        self.last_sweep = now;

        let dead: Vec<ClientId> = {
            let mut net = self.shared.net.lock().unwrap();
            for handle in net.clients.values_mut() {
                handle.reliability.on_update(delta);
            }
            net.clients
                .iter()
                .filter(|(_, handle)| handle.tcp_writer.is_closed())
                .map(|(id, _)| *id)
                .collect()
        };
        for client_id in dead {
            self.on_client_disconnected(client_id, DisconnectReason::SocketError);
        }
    }

    /// Blocks until a message or event is queued, the stop flag flips, or
    /// the sweep interval passes.
    fn wait_for_work(&self) {
        let mut net = self.shared.net.lock().unwrap();
        while net.incoming.is_empty()
            && self.shared.events.lock().unwrap().is_empty()
            && self.running.load(Ordering::SeqCst)
        {
            let (guard, wait) = self
                .shared
                .wake
                .wait_timeout(net, self.config.sweep_interval)
                .unwrap();
            net = guard;
            if wait.timed_out() {
                break;
            }
        }
    }

    fn process_events(&mut self) {
        let events: Vec<ServerEvent> = std::mem::take(&mut *self.shared.events.lock().unwrap());
        for event in events {
            match event {
                ServerEvent::ClientValidated { client_id, addr } => {
                    self.on_client_validated(client_id, addr);
                }
                ServerEvent::ClientDisconnected { client_id, reason } => {
                    self.on_client_disconnected(client_id, reason);
                }
                ServerEvent::StartSession => self.on_start_session(),
            }
        }
    }

    fn dispatch_incoming(&mut self) {
        let mut handled = 0;
        while handled < self.config.max_messages_per_update {
            let next = self.shared.net.lock().unwrap().incoming.pop_front();
            let Some((client_id, message)) = next else {
                break;
            };
            self.on_message(client_id, message);
            handled += 1;
        }
    }

    fn client_count(&self) -> u32 {
        self.shared.net.lock().unwrap().clients.len() as u32
    }

    fn on_client_validated(&mut self, client_id: ClientId, addr: SocketAddr) {
        info!("[{client_id}]: connection approved for {addr}");

        let count = self.client_count();
        let mut accept = Message::new(MessageType::AcceptConnection);
        accept.push_u32(count);
        self.send_tcp(client_id, accept);

        let mut update = Message::new(MessageType::UpdateUserCount);
        update.push_u32(count);
        self.broadcast_tcp_except(&update, client_id);
    }

    fn on_client_disconnected(&mut self, client_id: ClientId, reason: DisconnectReason) {
        let removed = {
            let mut net = self.shared.net.lock().unwrap();
            net.clients.remove(&client_id).map(|handle| {
                net.endpoints.retain(|_, id| *id != client_id);
                handle
            })
        };
        if removed.is_none() {
            // Both the read task and the sweep can report the same death.
            return;
        }
        info!("[{client_id}]: {}", reason.as_str());

        let mut update = Message::new(MessageType::UpdateUserCount);
        update.push_u32(self.client_count());
        self.broadcast_tcp_except(&update, client_id);

        if self.session.contains_client(client_id) {
            let slot = self.session.remove_client(client_id);
            let mut left = Message::new(MessageType::UserLeftSession);
            left.push_u16(slot);
            for member in self.session.client_ids() {
                self.send_tcp(member, left.clone());
            }
        }
    }

    /// The first session start spawns the frame clock at frame zero; later
    /// starts stamp the session with the clock's current frame.
    fn on_start_session(&mut self) {
        if self.clock_thread.is_none() {
            self.session.set_session_start_frame(0);
            let tick_rate = self.config.tick_rate;
            let frame_count = Arc::clone(&self.frame_count);
            let stop = Arc::clone(&self.stop_clock);
            self.clock_thread = Some(std::thread::spawn(move || {
                session_clock(tick_rate, &frame_count, &stop);
            }));
        } else {
            self.session
                .set_session_start_frame(self.frame_count.load(Ordering::Relaxed));
        }
        info!(
            "session starting at frame {}",
            self.session.session_start_frame()
        );
    }

    fn on_message(&mut self, client_id: ClientId, mut message: Message) {
        match message.message_type {
            MessageType::ServerPing => {
                debug!("[{client_id}]: server ping");
                self.send_tcp(client_id, message);
            }
            MessageType::MessageAll => {
                info!("[{client_id}]: message all");
                let mut relayed = Message::new(MessageType::ServerMessage);
                relayed.push_u32(client_id);
                self.broadcast_tcp_except(&relayed, client_id);
            }
            MessageType::ClientChat => {
                info!("[{client_id}]: chat");
                message.message_type = MessageType::ServerChat;
                message.push_u32(client_id);
                self.broadcast_tcp_except(&message, client_id);
            }
            MessageType::RequestJoinSession => self.handle_join_request(client_id),
            MessageType::RequestUserCount => {
                info!("[{client_id}]: user count request");
                let mut update = Message::new(MessageType::UpdateUserCount);
                update.push_u32(self.client_count());
                self.send_tcp(client_id, update);
            }
            MessageType::LeaveCurrentSession => {
                info!("[{client_id}]: leaving the session");
                let slot = self.session.remove_client(client_id);
                let mut left = Message::new(MessageType::UserLeftSession);
                left.push_u16(slot);
                for member in self.session.client_ids() {
                    self.send_tcp(member, left.clone());
                }
                self.send_tcp(client_id, left);
            }
            MessageType::InitSyncPing => self.handle_sync_ping(client_id),
            MessageType::SessionReadyCheck => self.handle_ready_check(client_id),
            MessageType::EnableReadyCheck => {
                for member in self.session.enable_ready_check() {
                    self.send_tcp(member, Message::new(MessageType::SessionReadyCheck));
                }
            }
            MessageType::SendAllEntityLocation => {
                message.message_type = MessageType::UpdateEntityLocation;
                self.relay_udp_to_session_peers(client_id, &message);
            }
            MessageType::SendAllEntityPhysics => {
                message.message_type = MessageType::UpdateEntityPhysics;
                self.relay_udp_to_session_peers(client_id, &message);
            }
            MessageType::SignalAll => {
                message.message_type = MessageType::ReceiveSignal;
                for member in self.session.client_ids() {
                    if member != client_id {
                        self.send_tcp(member, message.clone());
                    }
                }
            }
            MessageType::KeepAlive => {
                self.send_udp(client_id, &Message::new(MessageType::KeepAlive));
            }
            MessageType::UdpInit => {
                self.send_udp(client_id, &Message::new(MessageType::UdpInit));
            }
            other => {
                error!("[{client_id}]: no server handler for {other:?}");
            }
        }
    }

    /// Join flow: deny when full, otherwise seat the client, tell it its
    /// slot, tell the room about the new seat, and replay every existing
    /// seat to the joiner. A full table kicks off session init.
    fn handle_join_request(&mut self, client_id: ClientId) {
        if self.session.is_full() {
            self.send_tcp(client_id, Message::new(MessageType::DenyJoinSession));
            return;
        }

        let slot = self.session.add_client(client_id);
        if slot == INVALID_SLOT {
            return;
        }

        let mut approve = Message::new(MessageType::ApproveJoinSession);
        approve.push_u16(slot);
        self.send_tcp(client_id, approve);

        let mut seated = Message::new(MessageType::UpdateSessionUserSlot);
        seated.push_u16(slot);
        for member in self.session.client_ids() {
            if member != client_id {
                self.send_tcp(member, seated.clone());
            }
        }

        for (other_slot, member) in self.session.slot_assignments() {
            if member == client_id {
                continue;
            }
            let mut existing = Message::new(MessageType::UpdateSessionUserSlot);
            existing.push_u16(other_slot);
            self.send_tcp(client_id, existing);
        }

        if self.session.is_full() {
            self.init_session();
        }
    }

    fn init_session(&mut self) {
        for member in self.session.init_session() {
            self.send_tcp(member, Message::new(MessageType::CurrentSessionInit));
            self.send_tcp(member, Message::new(MessageType::InitSyncPing));
        }
    }

    fn handle_sync_ping(&mut self, client_id: ClientId) {
        match self.session.receive_sync_ping(client_id) {
            SyncPingOutcome::PingAgain => {
                self.send_tcp(client_id, Message::new(MessageType::InitSyncPing));
            }
            SyncPingOutcome::Start(plan) => {
                for (member, wait) in plan.wait_times {
                    let mut start = Message::new(MessageType::StartSession);
                    start.push_f32(wait);
                    self.send_tcp(member, start);
                }
                self.arm_start_timer(plan.longest_latency);
            }
            SyncPingOutcome::WaitingOnOthers | SyncPingOutcome::Rejected => {}
        }
    }

    fn handle_ready_check(&mut self, client_id: ClientId) {
        match self.session.store_ready_check(client_id) {
            ReadyCheckOutcome::Confirm(waits) => {
                for (member, wait) in waits {
                    let mut confirm = Message::new(MessageType::SessionReadyCheckConfirm);
                    confirm.push_f32(wait);
                    self.send_tcp(member, confirm);
                }
            }
            ReadyCheckOutcome::Pending | ReadyCheckOutcome::Ignored => {}
        }
    }

    /// Busy-waits out the longest one-way latency on its own thread, then
    /// fires the internal start event. By then every client's own start
    /// timer is running, so the frame stamp lines up across the session.
    fn arm_start_timer(&self, wait_seconds: f32) {
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs_f32(wait_seconds);
            while Instant::now() < deadline {
                std::hint::spin_loop();
            }
            shared.submit_event(ServerEvent::StartSession);
        });
    }

    fn send_tcp(&self, client_id: ClientId, message: Message) {
        let net = self.shared.net.lock().unwrap();
        let Some(handle) = net.clients.get(&client_id) else {
            warn!("[{client_id}]: tcp send to unknown client");
            return;
        };
        if handle.tcp_writer.send(encode_tcp_message(&message)).is_err() {
            debug!("[{client_id}]: writer is gone, sweep will reap it");
        }
    }

    fn broadcast_tcp_except(&self, message: &Message, skip: ClientId) {
        let net = self.shared.net.lock().unwrap();
        let frame = encode_tcp_message(message);
        for (id, handle) in &net.clients {
            if *id != skip {
                let _ = handle.tcp_writer.send(frame.clone());
            }
        }
    }

    /// Stamps a fresh reliability segment for the target client and hands
    /// the datagram to the writer task.
    fn send_udp(&self, client_id: ClientId, message: &Message) {
        let (segment, addr) = {
            let mut net = self.shared.net.lock().unwrap();
            let Some(handle) = net.clients.get_mut(&client_id) else {
                warn!("[{client_id}]: udp send to unknown client");
                return;
            };
            (handle.reliability.insert_segment(), handle.udp_addr)
        };

        match encode_udp_datagram(message, segment) {
            Ok(datagram) => {
                if self.udp_tx.send((datagram, addr)).is_err() {
                    error!("udp writer task is gone");
                }
            }
            Err(err) => error!("[{client_id}]: dropping outbound datagram: {err}"),
        }
    }

    fn relay_udp_to_session_peers(&self, sender: ClientId, message: &Message) {
        for member in self.session.client_ids() {
            if member != sender {
                self.send_udp(member, message);
            }
        }
    }
}

/// Fixed-rate frame counter. Busy-waits instead of sleeping because this is
/// the reference clock session starts are stamped against, and sleep jitter
/// at millisecond granularity would leak straight into the start frame.
fn session_clock(tick_rate: u32, frame_count: &AtomicU64, stop: &AtomicBool) {
    let frame_time = Duration::from_nanos(1_000_000_000 / u64::from(tick_rate.max(1)));
    let mut accumulator = Duration::ZERO;
    let mut last_cycle = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        accumulator += now - last_cycle;
        last_cycle = now;

        if accumulator < frame_time {
            std::hint::spin_loop();
            continue;
        }
        accumulator -= frame_time;
        frame_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpStream, UdpSocket};

    use netplay::{
        MAX_UDP_DATAGRAM_SIZE, ScrambleSecrets, TCP_HEADER_SIZE, decode_tcp_header,
        decode_udp_datagram, scramble,
    };

    use super::*;

    fn read_message(stream: &mut TcpStream) -> Message {
        let mut header = [0u8; TCP_HEADER_SIZE];
        stream.read_exact(&mut header).unwrap();
        let frame = decode_tcp_header(&header).unwrap();
        let mut payload = vec![0u8; frame.payload_len as usize];
        stream.read_exact(&mut payload).unwrap();
        Message {
            message_type: frame.message_type().unwrap(),
            payload,
        }
    }

    fn write_message(stream: &mut TcpStream, message: &Message) {
        stream.write_all(&encode_tcp_message(message)).unwrap();
    }

    struct RunningServer {
        tcp_addr: SocketAddr,
        udp_addr: SocketAddr,
        running: Arc<AtomicBool>,
        thread: Option<std::thread::JoinHandle<()>>,
    }

    impl RunningServer {
        fn start(config: ServerConfig) -> Self {
            let mut server = ServerContext::new("127.0.0.1:0", config).unwrap();
            let tcp_addr = server.tcp_addr();
            let udp_addr = server.udp_addr();
            let running = Arc::clone(&server.running);
            let thread = std::thread::spawn(move || server.run());
            Self {
                tcp_addr,
                udp_addr,
                running,
                thread: Some(thread),
            }
        }

        fn connect_validated(&self) -> TcpStream {
            let mut stream = TcpStream::connect(self.tcp_addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();

            let mut challenge = [0u8; 8];
            stream.read_exact(&mut challenge).unwrap();
            let response = scramble(u64::from_le_bytes(challenge), &ScrambleSecrets::default());
            stream.write_all(&response.to_le_bytes()).unwrap();
            stream
        }
    }

    impl Drop for RunningServer {
        fn drop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    #[test]
    fn test_handshake_accepts_scrambled_response() {
        let server = RunningServer::start(ServerConfig::default());
        let mut stream = server.connect_validated();

        let mut accept = read_message(&mut stream);
        assert_eq!(accept.message_type, MessageType::AcceptConnection);
        assert_eq!(accept.pop_u32(), Some(1));
    }

    #[test]
    fn test_handshake_rejects_wrong_response() {
        let server = RunningServer::start(ServerConfig::default());

        let mut stream = TcpStream::connect(server.tcp_addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut challenge = [0u8; 8];
        stream.read_exact(&mut challenge).unwrap();
        stream.write_all(&[0u8; 8]).unwrap();

        // The server hangs up without sending a single frame.
        let mut byte = [0u8; 1];
        assert!(matches!(stream.read(&mut byte), Ok(0) | Err(_)));
    }

    #[test]
    fn test_udp_keep_alive_and_init_echo() {
        let server = RunningServer::start(ServerConfig::default());
        let mut stream = server.connect_validated();
        let accept = read_message(&mut stream);
        assert_eq!(accept.message_type, MessageType::AcceptConnection);

        // The server expects our datagrams from the TCP source endpoint.
        let local_port = stream.local_addr().unwrap().port();
        let udp = UdpSocket::bind(("127.0.0.1", local_port)).unwrap();
        udp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut reliability = ReliabilityContext::default();
        for echo_type in [MessageType::KeepAlive, MessageType::UdpInit] {
            let datagram =
                encode_udp_datagram(&Message::new(echo_type), reliability.insert_segment())
                    .unwrap();
            udp.send_to(&datagram, server.udp_addr).unwrap();

            let mut buf = [0u8; MAX_UDP_DATAGRAM_SIZE];
            let (len, _) = udp.recv_from(&mut buf).unwrap();
            let echoed = decode_udp_datagram(&buf[..len]).unwrap();
            assert!(reliability.process_segment(echoed.segment));
            assert_eq!(echoed.into_message().unwrap().message_type, echo_type);
        }
    }

    #[test]
    fn test_two_clients_session_flow() {
        let server = RunningServer::start(ServerConfig {
            session_size: 2,
            ..Default::default()
        });

        let mut first = server.connect_validated();
        let mut accept = read_message(&mut first);
        assert_eq!(accept.message_type, MessageType::AcceptConnection);
        assert_eq!(accept.pop_u32(), Some(1));

        let mut second = server.connect_validated();
        let mut accept = read_message(&mut second);
        assert_eq!(accept.message_type, MessageType::AcceptConnection);
        assert_eq!(accept.pop_u32(), Some(2));

        let mut count = read_message(&mut first);
        assert_eq!(count.message_type, MessageType::UpdateUserCount);
        assert_eq!(count.pop_u32(), Some(2));

        write_message(&mut first, &Message::new(MessageType::RequestJoinSession));
        let mut approve = read_message(&mut first);
        assert_eq!(approve.message_type, MessageType::ApproveJoinSession);
        assert_eq!(approve.pop_u16(), Some(0));

        write_message(&mut second, &Message::new(MessageType::RequestJoinSession));
        let mut approve = read_message(&mut second);
        assert_eq!(approve.message_type, MessageType::ApproveJoinSession);
        assert_eq!(approve.pop_u16(), Some(1));

        // The joiner learns about the first client's seat, the first client
        // about the joiner's, and the full table starts session init.
        let mut backfill = read_message(&mut second);
        assert_eq!(backfill.message_type, MessageType::UpdateSessionUserSlot);
        assert_eq!(backfill.pop_u16(), Some(0));

        let mut seated = read_message(&mut first);
        assert_eq!(seated.message_type, MessageType::UpdateSessionUserSlot);
        assert_eq!(seated.pop_u16(), Some(1));

        for stream in [&mut first, &mut second] {
            let init = read_message(stream);
            assert_eq!(init.message_type, MessageType::CurrentSessionInit);
        }

        // Ten sync-ping rounds per client; the reply to the last round of
        // the last client triggers the start plan.
        for stream in [&mut first, &mut second] {
            for _ in 0..netplay::MAX_SYNC_PINGS {
                let ping = read_message(stream);
                assert_eq!(ping.message_type, MessageType::InitSyncPing);
                write_message(stream, &Message::new(MessageType::InitSyncPing));
            }
        }

        for stream in [&mut first, &mut second] {
            let mut start = read_message(stream);
            assert_eq!(start.message_type, MessageType::StartSession);
            let wait = start.pop_f32().unwrap();
            assert!(wait >= 0.0);
        }
    }

    #[test]
    fn test_dropped_connection_notifies_session_members() {
        let server = RunningServer::start(ServerConfig {
            session_size: 3,
            ..Default::default()
        });

        let mut first = server.connect_validated();
        let accept = read_message(&mut first);
        assert_eq!(accept.message_type, MessageType::AcceptConnection);

        let mut second = server.connect_validated();
        let accept = read_message(&mut second);
        assert_eq!(accept.message_type, MessageType::AcceptConnection);
        let mut count = read_message(&mut first);
        assert_eq!(count.message_type, MessageType::UpdateUserCount);
        assert_eq!(count.pop_u32(), Some(2));

        write_message(&mut first, &Message::new(MessageType::RequestJoinSession));
        let mut approve = read_message(&mut first);
        assert_eq!(approve.message_type, MessageType::ApproveJoinSession);
        assert_eq!(approve.pop_u16(), Some(0));

        write_message(&mut second, &Message::new(MessageType::RequestJoinSession));
        let mut approve = read_message(&mut second);
        assert_eq!(approve.message_type, MessageType::ApproveJoinSession);
        assert_eq!(approve.pop_u16(), Some(1));
        let mut backfill = read_message(&mut second);
        assert_eq!(backfill.message_type, MessageType::UpdateSessionUserSlot);
        assert_eq!(backfill.pop_u16(), Some(0));
        let mut seated = read_message(&mut first);
        assert_eq!(seated.message_type, MessageType::UpdateSessionUserSlot);
        assert_eq!(seated.pop_u16(), Some(1));

        // Close the first client's socket without a leave message. The
        // dispatch thread must reap the client and free its seat just as if
        // it had left on purpose.
        drop(first);

        let mut count = read_message(&mut second);
        assert_eq!(count.message_type, MessageType::UpdateUserCount);
        assert_eq!(count.pop_u32(), Some(1));
        let mut left = read_message(&mut second);
        assert_eq!(left.message_type, MessageType::UserLeftSession);
        assert_eq!(left.pop_u16(), Some(0));
    }

    // Dispatch-level tests below inject clients straight into the shared
    // table so single handlers can be driven without sockets.

    fn attach_client(
        server: &ServerContext,
        client_id: ClientId,
        port: u16,
    ) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let (tcp_writer, rx) = mpsc::unbounded_channel();
        let mut net = server.shared.net.lock().unwrap();
        net.clients.insert(
            client_id,
            ClientHandle {
                udp_addr: addr,
                tcp_writer,
                reliability: ReliabilityContext::default(),
            },
        );
        net.endpoints.insert(addr, client_id);
        rx
    }

    fn next_message(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Message {
        let frame = rx.try_recv().expect("expected a queued frame");
        let header = decode_tcp_header(&frame[..TCP_HEADER_SIZE]).unwrap();
        assert_eq!(frame.len(), TCP_HEADER_SIZE + header.payload_len as usize);
        Message {
            message_type: header.message_type().unwrap(),
            payload: frame[TCP_HEADER_SIZE..].to_vec(),
        }
    }

    fn assert_no_message(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) {
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_join_denied_when_session_full() {
        let mut server = ServerContext::new(
            "127.0.0.1:0",
            ServerConfig {
                session_size: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let mut first = attach_client(&server, 1, 40001);
        let mut second = attach_client(&server, 2, 40002);
        let mut third = attach_client(&server, 3, 40003);

        server.on_message(1, Message::new(MessageType::RequestJoinSession));
        server.on_message(2, Message::new(MessageType::RequestJoinSession));
        server.on_message(3, Message::new(MessageType::RequestJoinSession));

        let mut approve = next_message(&mut first);
        assert_eq!(approve.message_type, MessageType::ApproveJoinSession);
        assert_eq!(approve.pop_u16(), Some(0));

        let mut approve = next_message(&mut second);
        assert_eq!(approve.message_type, MessageType::ApproveJoinSession);
        assert_eq!(approve.pop_u16(), Some(1));

        let denied = next_message(&mut third);
        assert_eq!(denied.message_type, MessageType::DenyJoinSession);
        assert_no_message(&mut third);
    }

    #[test]
    fn test_chat_relay_appends_sender_id() {
        let mut server = ServerContext::new("127.0.0.1:0", ServerConfig::default()).unwrap();
        let mut sender = attach_client(&server, 1, 40011);
        let mut peer = attach_client(&server, 2, 40012);
        let mut other = attach_client(&server, 3, 40013);

        let mut chat = Message::new(MessageType::ClientChat);
        chat.push_bytes(b"hello");
        server.on_message(1, chat);

        for rx in [&mut peer, &mut other] {
            let mut relayed = next_message(rx);
            assert_eq!(relayed.message_type, MessageType::ServerChat);
            assert_eq!(relayed.pop_u32(), Some(1));
            assert_eq!(relayed.pop_bytes().as_deref(), Some(b"hello".as_slice()));
        }
        assert_no_message(&mut sender);
    }

    #[test]
    fn test_user_count_answers_requester_only() {
        let mut server = ServerContext::new("127.0.0.1:0", ServerConfig::default()).unwrap();
        let mut requester = attach_client(&server, 1, 40021);
        let mut bystander = attach_client(&server, 2, 40022);

        server.on_message(1, Message::new(MessageType::RequestUserCount));

        let mut count = next_message(&mut requester);
        assert_eq!(count.message_type, MessageType::UpdateUserCount);
        assert_eq!(count.pop_u32(), Some(2));
        assert_no_message(&mut bystander);
    }

    #[test]
    fn test_leave_session_notifies_members_and_frees_slot() {
        let mut server = ServerContext::new(
            "127.0.0.1:0",
            ServerConfig {
                session_size: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let mut first = attach_client(&server, 1, 40031);
        let mut second = attach_client(&server, 2, 40032);
        let mut third = attach_client(&server, 3, 40033);

        server.on_message(1, Message::new(MessageType::RequestJoinSession));
        server.on_message(2, Message::new(MessageType::RequestJoinSession));
        while first.try_recv().is_ok() {}
        while second.try_recv().is_ok() {}

        server.on_message(1, Message::new(MessageType::LeaveCurrentSession));

        // The remaining member hears which seat emptied; the leaver gets
        // the same notice as its own confirmation.
        let mut left = next_message(&mut second);
        assert_eq!(left.message_type, MessageType::UserLeftSession);
        assert_eq!(left.pop_u16(), Some(0));
        let mut left = next_message(&mut first);
        assert_eq!(left.message_type, MessageType::UserLeftSession);
        assert_eq!(left.pop_u16(), Some(0));

        server.on_message(3, Message::new(MessageType::RequestJoinSession));
        let mut approve = next_message(&mut third);
        assert_eq!(approve.message_type, MessageType::ApproveJoinSession);
        assert_eq!(approve.pop_u16(), Some(0));
    }

    #[test]
    fn test_unhandled_type_is_ignored() {
        let mut server = ServerContext::new("127.0.0.1:0", ServerConfig::default()).unwrap();
        let mut rx = attach_client(&server, 1, 40041);

        server.on_message(1, Message::new(MessageType::AcceptConnection));
        assert_no_message(&mut rx);
    }

    #[test]
    fn test_session_clock_tolerates_zero_tick_rate() {
        let frame_count = AtomicU64::new(0);
        let stop = AtomicBool::new(true);
        session_clock(0, &frame_count, &stop);
        assert_eq!(frame_count.load(Ordering::Relaxed), 0);
    }
}
