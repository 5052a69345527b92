use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use netplay::{
    ClientId, CongestionConfig, Message, ReliabilityContext, ReliabilityNotifiers,
    ScrambleSecrets, TCP_HEADER_SIZE, decode_tcp_header, scramble,
};

use crate::events::{DisconnectReason, ServerEvent};
use crate::server::{ClientHandle, SharedState};

/// Accepts connections forever. Each socket gets its own handshake task;
/// only validated clients ever appear in the shared client table.
pub async fn accept_loop(
    listener: TcpListener,
    shared: Arc<SharedState>,
    secrets: ScrambleSecrets,
    congestion: CongestionConfig,
) {
    let mut next_client_id: ClientId = 10_000;

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("new connection from {addr}");
                let client_id = next_client_id;
                next_client_id += 1;

                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(err) =
                        serve_connection(stream, addr, client_id, shared, secrets, congestion)
                            .await
                    {
                        debug!("[{client_id}]: connection task ended: {err}");
                    }
                });
            }
            Err(err) => {
                error!("accept failed: {err}");
            }
        }
    }
}

/// Runs one client's whole TCP lifetime: challenge/response, registration,
/// then the framed read loop until the socket dies.
async fn serve_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    client_id: ClientId,
    shared: Arc<SharedState>,
    secrets: ScrambleSecrets,
    congestion: CongestionConfig,
) -> io::Result<()> {
    if !validate_handshake(&mut stream, &secrets).await? {
        warn!("handshake from {addr} failed, dropping the connection");
        return Ok(());
    }

    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();

    let notifiers = ReliabilityNotifiers::new().observe_congestion(move |congested, round_trip| {
        if congested {
            debug!("[{client_id}]: congested at {round_trip:.4}s average round trip");
        } else {
            debug!("[{client_id}]: congestion cleared at {round_trip:.4}s average round trip");
        }
    });

    {
        let mut net = shared.net.lock().unwrap();
        net.clients.insert(
            client_id,
            ClientHandle {
                // Until the first datagram arrives, assume the client's UDP
                // traffic comes from the same endpoint its TCP socket uses.
                udp_addr: addr,
                tcp_writer: writer_tx,
                reliability: ReliabilityContext::new(congestion, notifiers),
            },
        );
        net.endpoints.insert(addr, client_id);
    }
    shared.submit_event(ServerEvent::ClientValidated { client_id, addr });

    let mut writer_task = tokio::spawn(write_loop(write_half, writer_rx, client_id));

    let reason = tokio::select! {
        reason = read_loop(read_half, client_id, &shared) => reason,
        _ = &mut writer_task => DisconnectReason::SocketError,
    };
    shared.submit_event(ServerEvent::ClientDisconnected { client_id, reason });
    Ok(())
}

/// Writes the 8-byte challenge and accepts the connection only if the reply
/// matches the precomputed scrambled value byte for byte.
async fn validate_handshake(
    stream: &mut TcpStream,
    secrets: &ScrambleSecrets,
) -> io::Result<bool> {
    let challenge: u64 = rand::random();
    let expected = scramble(challenge, secrets);

    stream.write_all(&challenge.to_le_bytes()).await?;

    let mut response = [0u8; 8];
    stream.read_exact(&mut response).await?;
    Ok(u64::from_le_bytes(response) == expected)
}

/// Reads length-prefixed messages until the peer hangs up or sends garbage.
/// Unknown-but-well-framed message ids are logged and skipped; a malformed
/// header is unrecoverable because the stream offset is lost.
async fn read_loop(
    mut read_half: OwnedReadHalf,
    client_id: ClientId,
    shared: &SharedState,
) -> DisconnectReason {
    let mut header = [0u8; TCP_HEADER_SIZE];

    loop {
        if let Err(err) = read_half.read_exact(&mut header).await {
            return if err.kind() == io::ErrorKind::UnexpectedEof {
                DisconnectReason::Closed
            } else {
                debug!("[{client_id}]: header read failed: {err}");
                DisconnectReason::SocketError
            };
        }

        let frame = match decode_tcp_header(&header) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("[{client_id}]: malformed header: {err}");
                return DisconnectReason::SocketError;
            }
        };

        let mut payload = vec![0u8; frame.payload_len as usize];
        if let Err(err) = read_half.read_exact(&mut payload).await {
            debug!("[{client_id}]: payload read failed: {err}");
            return DisconnectReason::SocketError;
        }

        let Some(message_type) = frame.message_type() else {
            error!("[{client_id}]: unknown message type {}", frame.raw_type);
            continue;
        };

        shared.push_incoming(
            client_id,
            Message {
                message_type,
                payload,
            },
        );
    }
}

/// Drains the outbound queue into the socket. Exits when the dispatch side
/// drops the sender or the peer stops accepting bytes; either way the closed
/// channel is what the next sweep notices.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    client_id: ClientId,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(err) = write_half.write_all(&frame).await {
            debug!("[{client_id}]: write failed: {err}");
            break;
        }
    }
}
