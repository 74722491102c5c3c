use skyguard_proto::FlightEvent;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Where progress and emergency events go. Delivery is best effort; a
/// sink with nobody listening drops events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: FlightEvent);
}

impl EventSink for broadcast::Sender<FlightEvent> {
    fn publish(&self, event: FlightEvent) {
        if self.send(event).is_err() {
            debug!("event dropped: no subscribers");
        }
    }
}

impl EventSink for mpsc::UnboundedSender<FlightEvent> {
    fn publish(&self, event: FlightEvent) {
        if self.send(event).is_err() {
            debug!("event dropped: receiver closed");
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: FlightEvent) {}
}
