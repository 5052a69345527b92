mod congestion;
mod context;
mod notify;
mod round_trip;

pub use congestion::{CongestionConfig, CongestionContext};
pub use context::{AckSample, ReliabilityContext};
pub use notify::{AckObserver, CongestionObserver, ReliabilityNotifiers, SendObserver};
pub use round_trip::RoundTripContext;
