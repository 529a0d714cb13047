use std::{sync::Arc, thread, time::Duration};

use crossbeam::channel::tick;
use log::{debug, error, info};

use crate::{config::FsyncPolicy, kv::store::LwwStore, utils::CancelToken};

/// Handles to the store's background actors. Dropping without `stop` keeps
/// the threads running until the process exits; `stop` cancels and joins.
pub struct BackgroundHandles {
    cancel: CancelToken,
    handles: Vec<thread::JoinHandle<()>>,
}

impl BackgroundHandles {
    pub fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if handle.join().is_err() {
                error!("background actor panicked during shutdown");
            }
        }
    }
}

/// Spawn the TTL sweeper and, when the fsync policy asks for it, the
/// batching flusher. Both tick on crossbeam channels and exit when the
/// store's cancellation token fires.
pub fn start_background(store: &Arc<LwwStore>) -> BackgroundHandles {
    let cancel = store.cancel_token().clone();
    let mut handles = Vec::new();

    // active expiry: a bounded slice of the TTL index per tick
    {
        let store = Arc::clone(store);
        let cancel = cancel.clone();
        let interval = store.config().ttl_check_interval();
        let max_keys = store.config().max_keys_per_ttl_check;
        handles.push(thread::spawn(move || {
            let ticker = tick(interval);
            info!("ttl sweeper started, interval {:?}", interval);
            while ticker.recv().is_ok() {
                if cancel.is_cancelled() {
                    break;
                }
                match store.sweep_expired(max_keys) {
                    Ok(0) => {}
                    Ok(n) => debug!("sweeper expired {} keys", n),
                    Err(e) => {
                        error!("ttl sweep failed: {}", e);
                        break;
                    }
                }
            }
            info!("ttl sweeper stopped");
        }));
    }

    if store.config().fsync_policy == FsyncPolicy::EverySecond {
        let store = Arc::clone(store);
        let cancel = cancel.clone();
        handles.push(thread::spawn(move || {
            let ticker = tick(Duration::from_secs(1));
            info!("flusher started");
            while ticker.recv().is_ok() {
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = store.flush_now() {
                    // keep retrying: the dirty set is still intact
                    error!("background flush failed: {}", e);
                }
            }
            // one final barrier so a clean shutdown loses nothing
            if let Err(e) = store.flush_now() {
                error!("final flush failed: {}", e);
            }
            info!("flusher stopped");
        }));
    }

    BackgroundHandles { cancel, handles }
}
