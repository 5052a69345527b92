use std::time::Instant;

use crate::protocol::{ACK_BITFIELD_SIZE, PacketSequence};

const SHIFT_FACTOR: f32 = 0.1;

/// Send timestamps for the in-flight packet window plus the smoothed
/// round-trip average. Slots are indexed `sequence % 32` and remember which
/// sequence wrote them, so a query for a packet that has already left the
/// window returns `None` instead of a newer packet's timestamp.
#[derive(Debug, Default)]
pub struct RoundTripContext {
    average_round_trip: f32,
    send_timepoints: [Option<(PacketSequence, Instant)>; ACK_BITFIELD_SIZE as usize],
}

impl RoundTripContext {
    pub fn add_time_point(&mut self, sequence: PacketSequence) {
        self.send_timepoints[usize::from(sequence % ACK_BITFIELD_SIZE)] =
            Some((sequence, Instant::now()));
    }

    /// Consumes the send timestamp for `sequence`. Each timestamp is read at
    /// most once: either when its ack arrives or when it leaves the window
    /// unacknowledged.
    pub fn take_time_point(&mut self, sequence: PacketSequence) -> Option<Instant> {
        let slot = &mut self.send_timepoints[usize::from(sequence % ACK_BITFIELD_SIZE)];
        match slot {
            Some((written, _)) if *written == sequence => slot.take().map(|(_, at)| at),
            _ => None,
        }
    }

    pub fn update_average_round_trip(&mut self, round_trip: f32) {
        self.average_round_trip =
            (1.0 - SHIFT_FACTOR) * self.average_round_trip + SHIFT_FACTOR * round_trip;
    }

    pub fn average_round_trip(&self) -> f32 {
        self.average_round_trip
    }
}
