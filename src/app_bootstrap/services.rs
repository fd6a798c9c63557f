use std::{
    any::Any,
    thread::{self, JoinHandle},
};

use log::error;
use tokio::sync::broadcast;

use crate::{
    media_controls_manager::MediaControlsManager, protocol::Message,
    sync_controller::SyncController,
};

pub struct BackgroundServicesConfig {
    pub bus_sender: broadcast::Sender<Message>,
    pub controller: SyncController,
    pub media_controls_enabled: bool,
}

/// Threads that end on `ControlMessage::Quit`.
pub struct BackgroundServices {
    pub controller_thread: Option<JoinHandle<()>>,
    pub media_controls_thread: Option<JoinHandle<()>>,
}

pub(crate) fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

fn spawn_guarded<F>(name: &str, body: F) -> Option<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let label = name.to_string();
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
        if let Err(payload) = run_result {
            error!(
                "{} thread terminated due to panic: {}",
                label,
                panic_payload_to_string(payload.as_ref())
            );
        }
    });
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            error!("Failed to spawn {} thread: {}", name, err);
            None
        }
    }
}

pub fn spawn_background_services(config: BackgroundServicesConfig) -> BackgroundServices {
    let BackgroundServicesConfig {
        bus_sender,
        controller,
        media_controls_enabled,
    } = config;

    let controller_bus_receiver = bus_sender.subscribe();
    let controller_thread = spawn_guarded("SyncController", move || {
        controller.run(controller_bus_receiver);
    });

    let media_controls_thread = if media_controls_enabled {
        let media_controls_bus_receiver = bus_sender.subscribe();
        let media_controls_bus_sender = bus_sender.clone();
        spawn_guarded("MediaControlsManager", move || {
            let mut media_controls_manager =
                MediaControlsManager::new(media_controls_bus_receiver, media_controls_bus_sender);
            media_controls_manager.run();
        })
    } else {
        None
    };

    BackgroundServices {
        controller_thread,
        media_controls_thread,
    }
}

#[cfg(test)]
mod tests {
    use super::{panic_payload_to_string, spawn_guarded};

    #[test]
    fn test_panic_payload_to_string_handles_common_payloads() {
        let static_payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let owned_payload: Box<dyn std::any::Any + Send> = Box::new("owned".to_string());
        let other_payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);

        assert_eq!(panic_payload_to_string(static_payload.as_ref()), "boom");
        assert_eq!(panic_payload_to_string(owned_payload.as_ref()), "owned");
        assert_eq!(
            panic_payload_to_string(other_payload.as_ref()),
            "non-string panic payload"
        );
    }

    #[test]
    fn test_guarded_thread_contains_panics() {
        let handle = spawn_guarded("panicky", || panic!("expected in test")).expect("spawned");
        assert!(handle.join().is_ok());
    }
}
