use std::net::SocketAddr;

use netplay::ClientId;

/// Work the IO side hands to the dispatch thread. Submitting one wakes the
/// thread the same way an incoming message does.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientValidated {
        client_id: ClientId,
        addr: SocketAddr,
    },
    ClientDisconnected {
        client_id: ClientId,
        reason: DisconnectReason,
    },
    /// Fired by the latency-compensation timer once every session member's
    /// start message is in flight.
    StartSession,
}

#[derive(Debug, Clone, Copy)]
pub enum DisconnectReason {
    Closed,
    SocketError,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Closed => "closed the connection",
            DisconnectReason::SocketError => "dropped after a socket error",
        }
    }
}
