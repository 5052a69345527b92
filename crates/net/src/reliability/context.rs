use std::time::Instant;

use crate::protocol::{
    ACK_BITFIELD_SIZE, AckBitField, PacketSequence, ReliabilitySegment, sequence_greater_than,
};

use super::congestion::{CongestionConfig, CongestionContext};
use super::notify::ReliabilityNotifiers;
use super::round_trip::RoundTripContext;

const FINAL_ACK_BIT: u16 = ACK_BITFIELD_SIZE - 1;

/// One packet newly confirmed by the remote end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AckSample {
    pub sequence: PacketSequence,
    pub round_trip: f32,
}

/// Per-connection reliability state: the local send window, the mirror of
/// the remote side's receive window, and the RTT/congestion trackers fed by
/// both. One context per UDP peer; the session layer owns it.
///
/// The local ack field starts all ones so that history which never existed
/// can never be reported as newly acknowledged; the remote field starts with
/// only bit 0 clear so the very first packet (sequence 0) is accepted as new
/// rather than rejected as a duplicate of the initial remote sequence.
pub struct ReliabilityContext {
    local_sequence: PacketSequence,
    remote_sequence: PacketSequence,
    local_ack_field: AckBitField,
    remote_ack_field: AckBitField,
    last_packet_received: f32,
    round_trip: RoundTripContext,
    congestion: CongestionContext,
    recent_acks: Vec<AckSample>,
    notifiers: ReliabilityNotifiers,
}

impl Default for ReliabilityContext {
    fn default() -> Self {
        Self::new(CongestionConfig::default(), ReliabilityNotifiers::new())
    }
}

impl ReliabilityContext {
    pub fn new(config: CongestionConfig, notifiers: ReliabilityNotifiers) -> Self {
        Self {
            local_sequence: 0,
            remote_sequence: 0,
            local_ack_field: AckBitField::MAX,
            remote_ack_field: AckBitField::MAX ^ 1,
            last_packet_received: 0.0,
            round_trip: RoundTripContext::default(),
            congestion: CongestionContext::new(config),
            recent_acks: Vec::with_capacity(usize::from(ACK_BITFIELD_SIZE)),
            notifiers,
        }
    }

    pub fn on_update(&mut self, delta_time: f32) {
        self.last_packet_received += delta_time;

        let average = self.round_trip.average_round_trip();
        if let Some(state) = self.congestion.on_update(delta_time, average) {
            self.notifiers.notify_congestion(state, average);
        }
    }

    /// Stamps the next outbound packet: the local sequence, the newest remote
    /// sequence as the ack, and the remote ack bitfield. Advancing the send
    /// window ages every in-flight packet by one slot; a packet whose bit is
    /// about to fall off the far end still unacknowledged is counted as lost,
    /// and the time it spent in the window feeds the round-trip average.
    pub fn insert_segment(&mut self) -> ReliabilitySegment {
        let segment = ReliabilitySegment {
            sequence: self.local_sequence,
            ack: self.remote_sequence,
            ack_bitfield: self.remote_ack_field,
        };

        if self.local_ack_field & (1 << FINAL_ACK_BIT) == 0 {
            let dropped = self.local_sequence.wrapping_sub(ACK_BITFIELD_SIZE);
            if let Some(sent_at) = self.round_trip.take_time_point(dropped) {
                self.process_round_trip(sent_at.elapsed().as_secs_f32());
            }
        }

        self.round_trip.add_time_point(self.local_sequence);
        self.local_sequence = self.local_sequence.wrapping_add(1);
        self.local_ack_field <<= 1;

        self.notifiers.notify_send(segment.sequence);
        segment
    }

    /// Applies one inbound segment. Returns `false` when the sequence is a
    /// duplicate or outside the window; the caller must drop the packet and
    /// not touch its payload. Never panics on adversarial input.
    pub fn process_segment(&mut self, segment: ReliabilitySegment) -> bool {
        if !self.process_received_sequence(segment.sequence) {
            return false;
        }

        self.last_packet_received = 0.0;

        self.process_received_ack(segment.ack, segment.ack_bitfield);
        true
    }

    fn process_received_sequence(&mut self, received: PacketSequence) -> bool {
        if sequence_greater_than(received, self.remote_sequence) {
            let distance = received.wrapping_sub(self.remote_sequence);
            if distance > FINAL_ACK_BIT {
                // Too far ahead to keep any of the history.
                self.remote_ack_field = 0;
                return true;
            }

            self.remote_ack_field <<= distance;
            self.remote_ack_field |= 1;
            self.remote_sequence = received;
        } else {
            let distance = self.remote_sequence.wrapping_sub(received);
            if distance > FINAL_ACK_BIT || self.remote_ack_field & (1 << distance) != 0 {
                return false;
            }

            self.remote_ack_field |= 1 << distance;
        }

        true
    }

    fn process_received_ack(&mut self, ack: PacketSequence, ack_bitfield: AckBitField) -> bool {
        let distance = self.local_sequence.wrapping_sub(ack);

        // An ack at or ahead of the local sequence names a packet that was
        // never sent: corrupt or forged.
        if sequence_greater_than(ack, self.local_sequence)
            || ack == self.local_sequence
            || distance > ACK_BITFIELD_SIZE
        {
            return false;
        }

        // Align the incoming field with local window coordinates, then keep
        // only the bits we have not seen acknowledged before.
        let aligned = ack_bitfield << (distance - 1);
        let newly_acked = !self.local_ack_field & aligned;

        self.recent_acks.clear();
        let now = Instant::now();
        let mut field = newly_acked;
        while field != 0 {
            let index = field.trailing_zeros() as u16;
            let sequence = self.local_sequence.wrapping_sub(1).wrapping_sub(index);

            if let Some(sent_at) = self.round_trip.take_time_point(sequence) {
                let round_trip = now.duration_since(sent_at).as_secs_f32();
                self.process_round_trip(round_trip);
                self.recent_acks.push(AckSample {
                    sequence,
                    round_trip,
                });
                self.notifiers.notify_ack(sequence, round_trip);
            }

            field &= field - 1;
        }

        self.local_ack_field |= aligned;

        newly_acked != 0
    }

    fn process_round_trip(&mut self, round_trip: f32) {
        self.round_trip.update_average_round_trip(round_trip);

        let average = self.round_trip.average_round_trip();
        if let Some(state) = self.congestion.on_round_trip_change(average) {
            self.notifiers.notify_congestion(state, average);
        }
    }

    pub fn local_sequence(&self) -> PacketSequence {
        self.local_sequence
    }

    pub fn remote_sequence(&self) -> PacketSequence {
        self.remote_sequence
    }

    /// Seconds since the last segment that passed sequence validation.
    pub fn last_packet_received(&self) -> f32 {
        self.last_packet_received
    }

    pub fn average_round_trip(&self) -> f32 {
        self.round_trip.average_round_trip()
    }

    pub fn is_congested(&self) -> bool {
        self.congestion.is_congested()
    }

    /// Packets confirmed by the most recent ack-carrying segment.
    pub fn recent_acks(&self) -> &[AckSample] {
        &self.recent_acks
    }
}
