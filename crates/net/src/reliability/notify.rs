use crate::protocol::PacketSequence;

pub type CongestionObserver = Box<dyn FnMut(bool, f32) + Send>;
pub type SendObserver = Box<dyn FnMut(PacketSequence) + Send>;
pub type AckObserver = Box<dyn FnMut(PacketSequence, f32) + Send>;

/// Observer registry for reliability events. The registry is built first and
/// consumed by the context constructor, so registering an observer on a live
/// context is not expressible.
#[derive(Default)]
pub struct ReliabilityNotifiers {
    congestion_observers: Vec<CongestionObserver>,
    send_observers: Vec<SendObserver>,
    ack_observers: Vec<AckObserver>,
}

impl ReliabilityNotifiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer for congestion flag flips: `(is_congested, average rtt)`.
    pub fn observe_congestion(mut self, observer: impl FnMut(bool, f32) + Send + 'static) -> Self {
        self.congestion_observers.push(Box::new(observer));
        self
    }

    /// Observer for every stamped outbound packet.
    pub fn observe_send(mut self, observer: impl FnMut(PacketSequence) + Send + 'static) -> Self {
        self.send_observers.push(Box::new(observer));
        self
    }

    /// Observer for every newly acknowledged packet: `(sequence, rtt)`.
    pub fn observe_ack(
        mut self,
        observer: impl FnMut(PacketSequence, f32) + Send + 'static,
    ) -> Self {
        self.ack_observers.push(Box::new(observer));
        self
    }

    pub(crate) fn notify_congestion(&mut self, is_congested: bool, average_round_trip: f32) {
        for observer in &mut self.congestion_observers {
            observer(is_congested, average_round_trip);
        }
    }

    pub(crate) fn notify_send(&mut self, sequence: PacketSequence) {
        for observer in &mut self.send_observers {
            observer(sequence);
        }
    }

    pub(crate) fn notify_ack(&mut self, sequence: PacketSequence, round_trip: f32) {
        for observer in &mut self.ack_observers {
            observer(sequence, round_trip);
        }
    }
}
