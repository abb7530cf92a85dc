use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::info;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::instance::ProxyInstance;

/// Process-wide registry of proxy instances by stable ID. Long operations
/// (start, stop) run without any map entry locked.
#[derive(Default)]
pub struct ProxyManager {
    proxies: DashMap<String, Arc<ProxyInstance>>,
    shutting_down: AtomicBool,
}

impl ProxyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and starts a proxy. Fails with `ProxyExists` when the ID is
    /// taken and `ShuttingDown` once `shutdown` has begun; a busy requested
    /// port falls back to an OS-assigned one inside the instance bind.
    pub async fn create(&self, config: ProxyConfig) -> Result<Arc<ProxyInstance>, ProxyError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ProxyError::ShuttingDown);
        }
        let instance = Arc::new(ProxyInstance::new(config)?);
        let id = instance.id().to_string();
        match self.proxies.entry(id.clone()) {
            Entry::Occupied(_) => return Err(ProxyError::ProxyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(instance.clone());
            }
        }
        if let Err(err) = instance.start().await {
            self.proxies.remove(&id);
            return Err(err);
        }
        // Shutdown may have begun while the bind was in flight; undo.
        if self.shutting_down.load(Ordering::SeqCst) {
            instance.stop().await;
            self.proxies.remove(&id);
            return Err(ProxyError::ShuttingDown);
        }
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> Result<Arc<ProxyInstance>, ProxyError> {
        self.proxies
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProxyError::ProxyNotFound(id.to_string()))
    }

    /// Stops a proxy and removes it, freeing the ID for reuse.
    pub async fn stop(&self, id: &str) -> Result<(), ProxyError> {
        let instance = self.get(id)?;
        instance.stop().await;
        self.proxies.remove(id);
        Ok(())
    }

    /// Stops every instance concurrently and removes them all; the manager
    /// stays usable afterwards. Returns the stopped IDs.
    pub async fn stop_all(&self) -> Vec<String> {
        let snapshot: Vec<Arc<ProxyInstance>> = self
            .proxies
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        join_all(snapshot.iter().map(|instance| instance.stop())).await;

        let mut stopped = Vec::with_capacity(snapshot.len());
        for instance in snapshot {
            self.proxies.remove(instance.id());
            stopped.push(instance.id().to_string());
        }
        stopped
    }

    /// Like `stop_all`, but permanently: `create` rejects from here on.
    pub async fn shutdown(&self) -> Vec<String> {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!("proxy manager shutting down");
        self.stop_all().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Snapshot of current instances.
    pub fn list(&self) -> Vec<Arc<ProxyInstance>> {
        self.proxies
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of instances currently in the `running` state.
    pub fn active_count(&self) -> usize {
        self.proxies
            .iter()
            .filter(|entry| entry.value().is_running())
            .count()
    }
}
