//! Lifecycle notifications for an embedding application.
//!
//! The controller posts events on a channel; a dedicated dispatcher thread
//! hands them to the registered callback. Delivery never happens on the
//! thread that triggered the event, and never under one of its locks.

use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnhancementEvent {
    Started,
    Stopped,
    Error(String),
}

pub trait EnhancementCallback: Send + Sync {
    fn on_started(&self) {}
    fn on_stopped(&self) {}
    fn on_error(&self, _message: &str) {}
}

/// Owns the dispatcher thread. Dropping it closes the channel and joins the
/// thread after the queued events are delivered.
pub struct EventDispatcher {
    tx: Option<Sender<EnhancementEvent>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EventDispatcher {
    pub fn new(callback: Option<Arc<dyn EnhancementCallback>>) -> Self {
        let (tx, rx) = channel::<EnhancementEvent>();
        let handle = thread::Builder::new()
            .name("vxhear-events".into())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    let Some(cb) = callback.as_ref() else {
                        continue;
                    };
                    match &event {
                        EnhancementEvent::Started => cb.on_started(),
                        EnhancementEvent::Stopped => cb.on_stopped(),
                        EnhancementEvent::Error(msg) => cb.on_error(msg),
                    }
                }
            });
        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                log::error!("event dispatcher thread failed to start: {e}");
                None
            }
        };
        Self {
            tx: Some(tx),
            handle,
        }
    }

    /// Cloneable handle for posting from other threads.
    pub fn sender(&self) -> Option<Sender<EnhancementEvent>> {
        self.tx.clone()
    }

    pub fn post(&self, event: EnhancementEvent) {
        log::debug!("event: {event:?}");
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                log::warn!("event dispatcher is gone; event dropped");
            }
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every callback in order.
    #[derive(Default)]
    pub struct RecordingCallback {
        pub events: Mutex<Vec<EnhancementEvent>>,
    }

    impl RecordingCallback {
        pub fn events(&self) -> Vec<EnhancementEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EnhancementCallback for RecordingCallback {
        fn on_started(&self) {
            self.events.lock().unwrap().push(EnhancementEvent::Started);
        }

        fn on_stopped(&self) {
            self.events.lock().unwrap().push(EnhancementEvent::Stopped);
        }

        fn on_error(&self, message: &str) {
            self.events
                .lock()
                .unwrap()
                .push(EnhancementEvent::Error(message.to_string()));
        }
    }
}
