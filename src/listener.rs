//! Change Listener (Component G): a dedicated thread draining the
//! backend's in-process pub/sub channel and triggering cache reloads as
//! entities change. Grounded on `decapod`'s `mpsc`-based worker shape
//! (`lib.rs`'s `use std::sync::mpsc;`) applied to `app/core/redis.py`'s
//! publish/subscribe contract.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::backend::{Backend, ChangeEvent};
use crate::cache::Caches;

/// Owns the listener thread and a channel used to request shutdown.
pub struct Listener {
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Spawn the listener thread. `backend` and `caches` must outlive the
    /// listener — callers typically wrap both in `Arc` via `BridgeContext`.
    pub fn spawn(backend: Arc<Backend>, caches: Arc<Caches>) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let events = backend.subscribe();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                match events.recv_timeout(Duration::from_millis(200)) {
                    Ok(event) => apply(&backend, &caches, &event),
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Listener { shutdown_tx, handle: Some(handle) }
    }

    pub fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn apply(backend: &Backend, caches: &Caches, event: &ChangeEvent) {
    match event.entity_type.as_str() {
        "service" => caches.reload_services_if_needed(backend),
        "workspace" => caches.reload_workspaces_if_needed(backend),
        _ => {}
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::Service;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn listener_reloads_cache_on_save() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("listener_test.sqlite3");
        let cfg = Config::for_tests(db_path.to_str().unwrap());
        let backend = Arc::new(Backend::new(&cfg));
        let caches = Arc::new(Caches::new());

        let listener = Listener::spawn(backend.clone(), caches.clone());

        let mut svc = Service::new("billing", "reflection");
        backend.save_service(&mut svc, "v1").unwrap();

        // Give the background thread a moment to process the event.
        std::thread::sleep(Duration::from_millis(300));
        assert!(caches.service(&svc.base.id).is_some());

        listener.shutdown();
    }
}
