use tokio::sync::mpsc;

use crate::mcp::descriptor::ServerKey;
use crate::mcp::readiness::{ManagerState, ReadinessStatus};

/// Closed set of readiness events pushed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadinessEvent {
    ManagerState(ManagerState),
    ServerStatusChanged {
        key: ServerKey,
        status: ReadinessStatus,
        retry_count: u32,
    },
}

/// Typed fan-out bus with an explicit subscriber list. Subscribers whose
/// receiver has been dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub struct ReadinessEventBus {
    subscribers: Vec<mpsc::UnboundedSender<ReadinessEvent>>,
}

impl ReadinessEventBus {
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ReadinessEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, event: ReadinessEvent) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_all_live_subscribers_and_prunes_dead_ones() {
        let mut bus = ReadinessEventBus::default();
        let mut first = bus.subscribe();
        let second = bus.subscribe();
        drop(second);

        bus.publish(ReadinessEvent::ManagerState(ManagerState::Warming));

        assert_eq!(
            first.try_recv().expect("event"),
            ReadinessEvent::ManagerState(ManagerState::Warming)
        );
        assert_eq!(bus.subscriber_count(), 1);
    }
}
