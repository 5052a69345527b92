use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use log::{error, info, warn};

pub type ClientId = u32;

/// Slot sentinel returned when an add/remove cannot be honored.
pub const INVALID_SLOT: u16 = u16::MAX;

/// Latency-measurement rounds played against each client before a session
/// start time is agreed.
pub const MAX_SYNC_PINGS: usize = 10;

#[derive(Debug)]
struct SyncPingState {
    latencies: Vec<f32>,
    filled: bool,
    last_ping_sent: Instant,
}

/// What the server should do with a recorded sync-ping reply.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPingOutcome {
    /// The client's cache is not full yet: ping it again.
    PingAgain,
    /// This cache just filled; other clients are still measuring.
    WaitingOnOthers,
    /// Every cache is full: distribute the start plan.
    Start(SessionStartPlan),
    /// Stray reply (unknown client or cache already full); drop it.
    Rejected,
}

/// Latency-compensated start schedule. Each client delays its start by
/// `longest - own` seconds so that everyone begins together; the server arms
/// its own timer for the longest latency.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStartPlan {
    pub wait_times: Vec<(ClientId, f32)>,
    pub longest_latency: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadyCheckOutcome {
    /// Check not armed, unknown client, or duplicate answer.
    Ignored,
    /// Recorded; waiting for the rest of the session.
    Pending,
    /// Everyone answered: send each client its compensated wait time.
    Confirm(Vec<(ClientId, f32)>),
}

/// Fixed-capacity slot table coordinating one group of clients: join/leave
/// slot assignment, latency measurement during init, ready checks, and the
/// synchronized start frame.
#[derive(Debug)]
pub struct Session {
    max_clients: usize,
    /// Client -> smoothed control-channel latency in seconds.
    connected_clients: BTreeMap<ClientId, f32>,
    session_slots: BTreeMap<u16, ClientId>,
    /// Sorted descending so the lowest free slot is always at the back.
    empty_slots: Vec<u16>,
    slot_max: u16,
    session_start_frame: u64,
    use_ready_check: bool,
    ready_check: BTreeSet<ClientId>,
    init_pings: BTreeMap<ClientId, SyncPingState>,
}

impl Session {
    pub fn new(max_clients: usize) -> Self {
        Self {
            max_clients,
            connected_clients: BTreeMap::new(),
            session_slots: BTreeMap::new(),
            empty_slots: Vec::new(),
            slot_max: 0,
            session_start_frame: 0,
            use_ready_check: false,
            ready_check: BTreeSet::new(),
            init_pings: BTreeMap::new(),
        }
    }

    /// Assigns the lowest free slot, or [`INVALID_SLOT`] when the client is
    /// already a member or the session is full.
    pub fn add_client(&mut self, client_id: ClientId) -> u16 {
        if self.connected_clients.contains_key(&client_id) {
            warn!("client {client_id} is already in the session");
            return INVALID_SLOT;
        }
        if self.connected_clients.len() >= self.max_clients {
            return INVALID_SLOT;
        }

        self.connected_clients.insert(client_id, 0.0);

        if let Some(slot) = self.empty_slots.pop() {
            self.session_slots.insert(slot, client_id);
            return slot;
        }

        let slot = self.slot_max;
        self.session_slots.insert(slot, client_id);
        self.slot_max += 1;
        slot
    }

    /// Frees the client's slot and returns it so remaining members can be
    /// told which seat emptied. [`INVALID_SLOT`] when the client is unknown.
    pub fn remove_client(&mut self, client_id: ClientId) -> u16 {
        if self.connected_clients.remove(&client_id).is_none() {
            error!("attempt to remove client {client_id} that is not in the session");
            return INVALID_SLOT;
        }

        self.init_pings.remove(&client_id);
        self.ready_check.remove(&client_id);

        let slot = self
            .session_slots
            .iter()
            .find(|(_, id)| **id == client_id)
            .map(|(slot, _)| *slot);
        match slot {
            Some(slot) => {
                self.session_slots.remove(&slot);
                self.empty_slots.push(slot);
                self.empty_slots.sort_unstable_by(|a, b| b.cmp(a));
                slot
            }
            None => INVALID_SLOT,
        }
    }

    /// Starts latency measurement against every member. Resets any earlier
    /// init state and returns the members to ping; the caller broadcasts the
    /// session-init notice and the first sync ping to each.
    pub fn init_session(&mut self) -> Vec<ClientId> {
        info!(
            "initializing session with {} clients",
            self.connected_clients.len()
        );

        self.init_pings.clear();
        let now = Instant::now();
        let members: Vec<ClientId> = self.connected_clients.keys().copied().collect();
        for &client_id in &members {
            self.init_pings.insert(
                client_id,
                SyncPingState {
                    latencies: Vec::with_capacity(MAX_SYNC_PINGS),
                    filled: false,
                    last_ping_sent: now,
                },
            );
        }
        members
    }

    /// Records one sync-ping reply: half the echo's round trip is this
    /// client's one-way control-channel latency for the round.
    pub fn receive_sync_ping(&mut self, client_id: ClientId) -> SyncPingOutcome {
        let now = Instant::now();
        let Some(state) = self.init_pings.get_mut(&client_id) else {
            error!("sync ping from client {client_id} with no latency cache");
            return SyncPingOutcome::Rejected;
        };
        if state.filled {
            error!("sync ping from client {client_id} after its cache filled");
            return SyncPingOutcome::Rejected;
        }

        let one_way = now.duration_since(state.last_ping_sent).as_secs_f32() / 2.0;
        state.latencies.push(one_way);

        if state.latencies.len() < MAX_SYNC_PINGS {
            state.last_ping_sent = Instant::now();
            return SyncPingOutcome::PingAgain;
        }
        state.filled = true;

        if self.init_pings.values().all(|state| state.filled) {
            SyncPingOutcome::Start(self.complete_session_init())
        } else {
            SyncPingOutcome::WaitingOnOthers
        }
    }

    fn complete_session_init(&mut self) -> SessionStartPlan {
        let mut longest = 0.0f32;
        for (client_id, state) in &self.init_pings {
            let mean = filtered_mean(&state.latencies);
            if let Some(latency) = self.connected_clients.get_mut(client_id) {
                *latency = mean;
            }
            longest = longest.max(mean);
        }

        info!("connection latencies calculated, longest is {longest:.4}s");

        SessionStartPlan {
            wait_times: self.wait_times(longest),
            longest_latency: longest,
        }
    }

    fn wait_times(&self, longest: f32) -> Vec<(ClientId, f32)> {
        self.connected_clients
            .iter()
            .map(|(id, latency)| (*id, (longest - latency).max(0.0)))
            .collect()
    }

    /// Arms the ready check and returns the members to ask.
    pub fn enable_ready_check(&mut self) -> Vec<ClientId> {
        self.use_ready_check = true;
        self.ready_check.clear();
        self.connected_clients.keys().copied().collect()
    }

    /// Records one ready answer; once every member has answered, the check
    /// disarms and each member gets a latency-compensated confirm.
    pub fn store_ready_check(&mut self, client_id: ClientId) -> ReadyCheckOutcome {
        if !self.use_ready_check
            || self.ready_check.contains(&client_id)
            || !self.connected_clients.contains_key(&client_id)
        {
            return ReadyCheckOutcome::Ignored;
        }

        self.ready_check.insert(client_id);
        if self.ready_check.len() < self.connected_clients.len() {
            return ReadyCheckOutcome::Pending;
        }

        let longest = self
            .connected_clients
            .values()
            .copied()
            .fold(0.0f32, f32::max);
        let waits = self.wait_times(longest);
        self.use_ready_check = false;
        self.ready_check.clear();
        ReadyCheckOutcome::Confirm(waits)
    }

    pub fn set_session_start_frame(&mut self, frame: u64) {
        self.session_start_frame = frame;
    }

    pub fn session_start_frame(&self) -> u64 {
        self.session_start_frame
    }

    pub fn client_count(&self) -> usize {
        self.connected_clients.len()
    }

    pub fn is_full(&self) -> bool {
        self.connected_clients.len() >= self.max_clients
    }

    pub fn contains_client(&self, client_id: ClientId) -> bool {
        self.connected_clients.contains_key(&client_id)
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.connected_clients.keys().copied().collect()
    }

    /// Occupied slots in slot order.
    pub fn slot_assignments(&self) -> Vec<(u16, ClientId)> {
        self.session_slots
            .iter()
            .map(|(slot, id)| (*slot, *id))
            .collect()
    }

    pub fn latency_of(&self, client_id: ClientId) -> Option<f32> {
        self.connected_clients.get(&client_id).copied()
    }
}

/// Mean with outliers beyond one standard deviation removed. Falls back to
/// the raw mean if filtering would discard every sample.
fn filtered_mean(samples: &[f32]) -> f32 {
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    let variance =
        samples.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / samples.len() as f32;
    let std_dev = variance.sqrt();

    let kept: Vec<f32> = samples
        .iter()
        .copied()
        .filter(|s| (s - mean).abs() <= std_dev)
        .collect();
    if kept.is_empty() {
        mean
    } else {
        kept.iter().sum::<f32>() / kept.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_fill_lowest_first() {
        let mut session = Session::new(4);
        assert_eq!(session.add_client(10), 0);
        assert_eq!(session.add_client(20), 1);
        assert_eq!(session.add_client(30), 2);

        assert_eq!(session.remove_client(20), 1);
        assert_eq!(session.remove_client(10), 0);

        // Lowest freed slot is reused first.
        assert_eq!(session.add_client(40), 0);
        assert_eq!(session.add_client(50), 1);
        assert_eq!(session.add_client(60), 3);
    }

    #[test]
    fn test_duplicate_and_over_capacity_adds_rejected() {
        let mut session = Session::new(2);
        assert_eq!(session.add_client(1), 0);
        assert_eq!(session.add_client(1), INVALID_SLOT);
        assert_eq!(session.add_client(2), 1);
        assert_eq!(session.add_client(3), INVALID_SLOT);
        assert!(session.is_full());
    }

    #[test]
    fn test_remove_unknown_client_is_sentinel() {
        let mut session = Session::new(2);
        assert_eq!(session.remove_client(9), INVALID_SLOT);
    }

    #[test]
    fn test_sync_ping_rounds_produce_start_plan() {
        let mut session = Session::new(2);
        session.add_client(10);
        session.add_client(20);

        let members = session.init_session();
        assert_eq!(members, vec![10, 20]);

        for _ in 0..MAX_SYNC_PINGS - 1 {
            assert_eq!(session.receive_sync_ping(10), SyncPingOutcome::PingAgain);
        }
        assert_eq!(
            session.receive_sync_ping(10),
            SyncPingOutcome::WaitingOnOthers
        );
        // A stray extra reply is dropped.
        assert_eq!(session.receive_sync_ping(10), SyncPingOutcome::Rejected);

        for _ in 0..MAX_SYNC_PINGS - 1 {
            assert_eq!(session.receive_sync_ping(20), SyncPingOutcome::PingAgain);
        }
        let SyncPingOutcome::Start(plan) = session.receive_sync_ping(20) else {
            panic!("expected a start plan once every cache is full");
        };
        assert_eq!(plan.wait_times.len(), 2);
        assert!(plan.wait_times.iter().all(|(_, wait)| *wait >= 0.0));
        assert!(plan.longest_latency >= 0.0);
    }

    #[test]
    fn test_sync_ping_from_unknown_client_rejected() {
        let mut session = Session::new(2);
        session.add_client(10);
        session.init_session();
        assert_eq!(session.receive_sync_ping(99), SyncPingOutcome::Rejected);
    }

    #[test]
    fn test_ready_check_flow() {
        let mut session = Session::new(2);
        session.add_client(10);
        session.add_client(20);

        // Not armed yet.
        assert_eq!(session.store_ready_check(10), ReadyCheckOutcome::Ignored);

        assert_eq!(session.enable_ready_check(), vec![10, 20]);
        assert_eq!(session.store_ready_check(10), ReadyCheckOutcome::Pending);
        assert_eq!(session.store_ready_check(10), ReadyCheckOutcome::Ignored);

        let ReadyCheckOutcome::Confirm(waits) = session.store_ready_check(20) else {
            panic!("expected confirmation once everyone answered");
        };
        assert_eq!(waits.len(), 2);

        // The check disarms after confirming.
        assert_eq!(session.store_ready_check(10), ReadyCheckOutcome::Ignored);
    }

    #[test]
    fn test_leaver_drops_out_of_pending_ready_check() {
        let mut session = Session::new(3);
        session.add_client(10);
        session.add_client(20);
        session.enable_ready_check();

        assert_eq!(session.store_ready_check(10), ReadyCheckOutcome::Pending);
        session.remove_client(10);

        // 20 is now the only member, so its answer completes the check.
        assert!(matches!(
            session.store_ready_check(20),
            ReadyCheckOutcome::Confirm(_)
        ));
    }

    #[test]
    fn test_outlier_filtered_mean() {
        // Nine tight samples and one spike: the spike is dropped.
        let mut samples = vec![0.010f32; 9];
        samples.push(1.0);
        let mean = filtered_mean(&samples);
        assert!((mean - 0.010).abs() < 1e-4);

        // Identical samples all sit on the mean and are all kept.
        assert_eq!(filtered_mean(&[0.5; 4]), 0.5);
    }

    #[test]
    fn test_session_start_frame() {
        let mut session = Session::new(2);
        assert_eq!(session.session_start_frame(), 0);
        session.set_session_start_frame(3600);
        assert_eq!(session.session_start_frame(), 3600);
    }
}
