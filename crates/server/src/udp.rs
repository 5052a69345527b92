use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use netplay::{ClientId, FrameError, MAX_UDP_DATAGRAM_SIZE, decode_udp_datagram};

use crate::server::{NetState, SharedState};

/// Receive loop for the shared datagram socket. The endpoint lookup, the
/// reliability update, and the queue push happen under one lock so a
/// migration cannot race a concurrent lookup.
pub async fn receive_loop(socket: Arc<UdpSocket>, shared: Arc<SharedState>) {
    let mut buf = [0u8; MAX_UDP_DATAGRAM_SIZE];

    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                error!("udp receive failed: {err}");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        // Oversized datagrams arrive truncated and fail the checksum.
        let datagram = match decode_udp_datagram(&buf[..len]) {
            Ok(datagram) => datagram,
            Err(FrameError::ChecksumMismatch { .. }) => {
                trace!("dropping corrupt datagram from {addr}");
                continue;
            }
            Err(err) => {
                debug!("dropping malformed datagram from {addr}: {err}");
                continue;
            }
        };

        let mut net = shared.net.lock().unwrap();
        let Some(client_id) = lookup_client(&mut net, addr) else {
            debug!("datagram from unknown endpoint {addr}");
            continue;
        };
        let Some(handle) = net.clients.get_mut(&client_id) else {
            continue;
        };
        if !handle.reliability.process_segment(datagram.segment) {
            trace!("[{client_id}]: duplicate or out-of-window datagram rejected");
            continue;
        }

        match datagram.into_message() {
            Ok(message) => {
                net.incoming.push_back((client_id, message));
                drop(net);
                shared.wake.notify_one();
            }
            Err(err) => {
                error!("[{client_id}]: {err}");
            }
        }
    }
}

/// Endpoint → client, with address-only migration: a datagram from an
/// unknown endpoint whose IP matches an existing client rebinds that
/// client's entry to the new port. NAT rebinding changes source ports
/// mid-session; trusting the bare IP for the rematch is a known weakness
/// this design accepts.
fn lookup_client(net: &mut NetState, addr: SocketAddr) -> Option<ClientId> {
    if let Some(&client_id) = net.endpoints.get(&addr) {
        return Some(client_id);
    }

    let (old_addr, client_id) = net
        .endpoints
        .iter()
        .find(|(known, _)| known.ip() == addr.ip())
        .map(|(known, id)| (*known, *id))?;

    net.endpoints.remove(&old_addr);
    net.endpoints.insert(addr, client_id);
    if let Some(handle) = net.clients.get_mut(&client_id) {
        handle.udp_addr = addr;
    }
    warn!("[{client_id}]: udp endpoint moved from {old_addr} to {addr}");
    Some(client_id)
}

/// Writer task: everything the dispatch thread wants on the wire arrives
/// through one channel, keeping all socket IO on the runtime.
pub async fn send_loop(
    socket: Arc<UdpSocket>,
    mut datagrams: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
) {
    while let Some((datagram, addr)) = datagrams.recv().await {
        if let Err(err) = socket.send_to(&datagram, addr).await {
            warn!("udp send to {addr} failed: {err}");
        }
    }
}
