//! Collapses rapid volume slider movement into a single volume action.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::error;
use tokio::sync::broadcast::Sender;

use crate::protocol::{ControlMessage, Message, UserAction};

/// Forwards only the last submitted value once the slider has been idle
/// for `delay`.
pub struct VolumeDebouncer {
    delay: Duration,
    generation: Arc<AtomicU64>,
    bus_producer: Sender<Message>,
}

impl VolumeDebouncer {
    pub fn new(delay: Duration, bus_producer: Sender<Message>) -> Self {
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
            bus_producer,
        }
    }

    pub fn submit(&self, volume_percent: i32) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let latest = Arc::clone(&self.generation);
        let bus_producer = self.bus_producer.clone();
        let delay = self.delay;
        let spawned = thread::Builder::new()
            .name("volume-debounce".to_string())
            .spawn(move || {
                thread::sleep(delay);
                if latest.load(Ordering::SeqCst) == generation {
                    let _ = bus_producer.send(Message::Control(ControlMessage::Action(
                        UserAction::SetVolume(volume_percent),
                    )));
                }
            });
        if let Err(err) = spawned {
            error!("VolumeDebouncer: failed to spawn timer thread: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::VolumeDebouncer;
    use crate::protocol::{ControlMessage, Message, UserAction};
    use std::time::Duration;
    use tokio::sync::broadcast;

    #[test]
    fn test_only_last_value_is_forwarded() {
        let (bus_producer, mut receiver) = broadcast::channel(16);
        let debouncer = VolumeDebouncer::new(Duration::from_millis(40), bus_producer);

        for volume in [10, 20, 30] {
            debouncer.submit(volume);
        }
        std::thread::sleep(Duration::from_millis(200));

        assert!(matches!(
            receiver.try_recv(),
            Ok(Message::Control(ControlMessage::Action(UserAction::SetVolume(30))))
        ));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_spaced_values_are_all_forwarded() {
        let (bus_producer, mut receiver) = broadcast::channel(16);
        let debouncer = VolumeDebouncer::new(Duration::from_millis(10), bus_producer);

        debouncer.submit(40);
        std::thread::sleep(Duration::from_millis(100));
        debouncer.submit(60);
        std::thread::sleep(Duration::from_millis(100));

        let mut forwarded = Vec::new();
        while let Ok(Message::Control(ControlMessage::Action(UserAction::SetVolume(volume)))) =
            receiver.try_recv()
        {
            forwarded.push(volume);
        }
        assert_eq!(forwarded, vec![40, 60]);
    }
}
