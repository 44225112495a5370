//! `RelaySupervisor` (spec.md §4.3): owns `static_relays`/`master_relays`,
//! schedules worker lifecycle, and serialises every mutation under one
//! lock.

use std::sync::Arc;

use log::warn;
use tokio::sync::Mutex;

use crate::record::{DesiredRelay, RelayRecord};
use crate::reconcile::reconcile;
use crate::worker::{run_relay_worker, WorkerEnv};

struct RelayLists {
    static_relays: Vec<Arc<RelayRecord>>,
    master_relays: Vec<Arc<RelayRecord>>,
}

/// Owns the two relay lists behind a single `relay_lock` (spec.md §5):
/// `static_relays` from configuration, `master_relays` from the streamlist
/// poller. All three public mutators serialise through it.
pub struct RelaySupervisor {
    lists: Mutex<RelayLists>,
    env: Arc<WorkerEnv>,
}

impl RelaySupervisor {
    pub fn new(env: Arc<WorkerEnv>) -> Self {
        RelaySupervisor {
            lists: Mutex::new(RelayLists { static_relays: Vec::new(), master_relays: Vec::new() }),
            env,
        }
    }

    /// Reconcile `static_relays` against `desired`, tear down whatever
    /// fell out, then promote what remains.
    pub async fn apply_static(&self, desired: &[DesiredRelay]) {
        let to_free = {
            let mut lists = self.lists.lock().await;
            let current = std::mem::take(&mut lists.static_relays);
            let outcome = reconcile(current, desired);
            lists.static_relays = outcome.kept;
            outcome.to_free
        };
        self.tear_down(to_free).await;
        let snapshot = self.lists.lock().await.static_relays.clone();
        self.promote(&snapshot).await;
    }

    /// Same as [`apply_static`] for the master-advertised list.
    pub async fn apply_master(&self, desired: &[DesiredRelay]) {
        let to_free = {
            let mut lists = self.lists.lock().await;
            let current = std::mem::take(&mut lists.master_relays);
            let outcome = reconcile(current, desired);
            lists.master_relays = outcome.kept;
            outcome.to_free
        };
        self.tear_down(to_free).await;
        let snapshot = self.lists.lock().await.master_relays.clone();
        self.promote(&snapshot).await;
    }

    /// A point-in-time copy of `static_relays`, for callers (and tests)
    /// that need to inspect current state without holding the lock.
    pub async fn static_relays_snapshot(&self) -> Vec<Arc<RelayRecord>> {
        self.lists.lock().await.static_relays.clone()
    }

    /// A point-in-time copy of `master_relays`.
    pub async fn master_relays_snapshot(&self) -> Vec<Arc<RelayRecord>> {
        self.lists.lock().await.master_relays.clone()
    }

    /// Promote both lists without reconciling — wakes on-demand relays
    /// whose fallback now has listeners, and picks up worker
    /// self-terminations (spec.md §4.3 `rescan`).
    pub async fn rescan(&self) {
        let (statics, masters) = {
            let lists = self.lists.lock().await;
            (lists.static_relays.clone(), lists.master_relays.clone())
        };
        self.promote(&statics).await;
        self.promote(&masters).await;
    }

    /// Tear down every relay in `list`: stop a live worker and join it,
    /// release any reserved source slot, clear stats. Requests a mount
    /// rebuild once if any record had a live worker (spec.md §4.3).
    async fn tear_down(&self, list: Vec<Arc<RelayRecord>>) {
        let mut rebuild_needed = false;

        for record in list {
            let worker = {
                let mut runtime = record.runtime.lock().unwrap();
                runtime.running = false;
                runtime.worker.take()
            };

            if let Some(handle) = worker {
                rebuild_needed = true;
                self.env.source_pipeline.stop(&record.local_mount).await;
                if let Err(err) = handle.await {
                    warn!("relay {}: worker task panicked: {}", record.local_mount, err);
                }
            }

            let slot = record.runtime.lock().unwrap().source_slot.take();
            if let Some(slot) = &slot {
                self.env.mount_registry.release(slot).await;
            }
            self.env.stats.clear_mount(&record.local_mount).await;
        }

        if rebuild_needed {
            self.env.mount_registry.request_rebuild().await;
        }
    }

    /// Apply the promotion rules of spec.md §4.3 to every record in
    /// `list`.
    async fn promote(&self, list: &[Arc<RelayRecord>]) {
        for record in list {
            self.promote_one(record).await;
        }
    }

    async fn promote_one(&self, record: &Arc<RelayRecord>) {
        let mount = record.local_mount.clone();

        // Rule 1: reserve a source slot if this record doesn't have one
        // yet — even for a malformed mount name, per spec.md §4.3 step 1.
        let needs_slot = record.runtime.lock().unwrap().source_slot.is_none();
        if needs_slot {
            match self.env.mount_registry.reserve(&mount).await {
                Ok(slot) => {
                    record.runtime.lock().unwrap().source_slot = Some(slot);
                }
                Err(err) => {
                    warn!("relay {}: mount already taken, leaving inert: {}", mount, err);
                    return;
                }
            }
        }

        // Rule 2: malformed mount is skipped entirely, slot retained.
        if !mount.starts_with('/') {
            warn!("relay {}: local_mount does not start with '/', skipping", mount);
            return;
        }

        // Step 7: a worker that self-terminated since the last promote
        // needs to be joined and the record reset to dormant before the
        // usual rules apply.
        let finished = record.runtime.lock().unwrap().cleanup_requested;
        if finished {
            self.finish_self_terminated_worker(record).await;
        }

        // Rule 3: already running, nothing to do.
        if record.runtime.lock().unwrap().running {
            return;
        }

        // Rule 4: disabled relays stay dormant and lose their stats.
        if !record.enabled() {
            self.env.stats.clear_mount(&mount).await;
            return;
        }

        // Rule 5: on-demand relays only spawn once woken.
        if record.on_demand() {
            if !self.on_demand_wake(record).await {
                return;
            }
        }

        // Rule 6: spawn the worker.
        record.runtime.lock().unwrap().running = true;
        let handle = tokio::spawn(run_relay_worker(record.clone(), self.env.clone()));
        record.runtime.lock().unwrap().worker = Some(handle);
    }

    async fn finish_self_terminated_worker(&self, record: &Arc<RelayRecord>) {
        let mount = record.local_mount.clone();
        let handle = {
            let mut runtime = record.runtime.lock().unwrap();
            runtime.running = false;
            runtime.cleanup_requested = false;
            runtime.worker.take()
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("relay {}: worker task panicked: {}", mount, err);
            }
        }

        if !record.enabled() {
            self.env.stats.clear_mount(&mount).await;
            self.env.mount_registry.request_rebuild().await;
        }
        if record.on_demand() {
            self.env.mount_registry.update_settings(&mount).await;
            self.env.mount_registry.set_listeners(&mount, 0).await;
        }
    }

    /// Returns `true` if the on-demand relay should wake and spawn a
    /// worker now (spec.md §4.3 rule 5).
    async fn on_demand_wake(&self, record: &Arc<RelayRecord>) -> bool {
        let mount = record.local_mount.clone();
        self.env.mount_registry.update_settings(&mount).await;
        self.env.mount_registry.request_rebuild().await;
        self.env.mount_registry.set_listeners(&mount, 0).await;
        self.env.source_pipeline.set_on_demand(&mount, true).await;

        let fallback = self.env.source_pipeline.fallback_info(&mount).await;
        let mut on_demand_req = false;
        if fallback.fallback_override {
            if let Some(fallback_mount) = &fallback.fallback_mount {
                let running = self.env.mount_registry.is_running(fallback_mount).await;
                let listeners = self.env.mount_registry.listener_count(fallback_mount).await;
                if running && listeners > 0 {
                    on_demand_req = true;
                }
            }
        }

        record.runtime.lock().unwrap().on_demand_req = on_demand_req;
        on_demand_req
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::{InMemoryMountRegistry, InMemoryStats, InMemoryYp};
    use crate::collaborators::{BoxedStream, FallbackInfo, SourcePipeline};
    use crate::record::PartitionTag;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn desired(local_mount: &str, upstream_host: &str, upstream_port: u16, on_demand: bool, enabled: bool) -> DesiredRelay {
        DesiredRelay {
            local_mount: local_mount.into(),
            upstream_host: upstream_host.into(),
            upstream_port,
            upstream_mount: local_mount.into(),
            username: None,
            password: None,
            send_icy_metadata: false,
            on_demand,
            enabled,
            partition: PartitionTag::Configured,
        }
    }

    #[derive(Default)]
    struct StubSourcePipeline {
        fallback: std::sync::Mutex<FallbackInfo>,
    }

    #[async_trait::async_trait]
    impl SourcePipeline for StubSourcePipeline {
        async fn complete_source(&self, _mount: &str, _stream: BoxedStream) -> crate::Result<()> {
            Ok(())
        }
        async fn run(&self, _mount: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn fallback_info(&self, _mount: &str) -> FallbackInfo {
            self.fallback.lock().unwrap().clone()
        }
        async fn set_on_demand(&self, _mount: &str, _on_demand: bool) {}
        async fn stop(&self, _mount: &str) {}
    }

    fn test_env(registry: Arc<InMemoryMountRegistry>, stats: Arc<InMemoryStats>) -> Arc<WorkerEnv> {
        Arc::new(WorkerEnv {
            mount_registry: registry,
            source_pipeline: Arc::new(StubSourcePipeline::default()),
            stats,
            yp: Arc::new(InMemoryYp::new()),
            local_hostname: "relay-host".into(),
            master_redirect_port: None,
            server_version: "relay-core/0.1".into(),
            rescan_relays: Arc::new(AtomicBool::new(false)),
        })
    }

    #[tokio::test]
    async fn test_static_add_spawns_worker_and_is_idempotent() {
        let registry = Arc::new(InMemoryMountRegistry::new());
        let env = test_env(registry, Arc::new(InMemoryStats::new()));
        let supervisor = RelaySupervisor::new(env);

        // Unreachable upstream (port 1): the worker will fail fast, which
        // is fine — this test only checks list bookkeeping, not connect
        // success.
        let d = vec![desired("/a", "127.0.0.1", 1, false, true)];
        supervisor.apply_static(&d).await;
        supervisor.apply_static(&d).await; // idempotent re-apply

        let snapshot = supervisor.lists.lock().await.static_relays.clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].local_mount, "/a");
    }

    #[tokio::test]
    async fn test_static_remove_tears_down_and_clears_stats() {
        let registry = Arc::new(InMemoryMountRegistry::new());
        let stats = Arc::new(InMemoryStats::new());
        let env = test_env(registry, stats.clone());
        let supervisor = RelaySupervisor::new(env);

        let d = vec![desired("/a", "127.0.0.1", 1, false, true)];
        supervisor.apply_static(&d).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        supervisor.apply_static(&[]).await;
        let snapshot = supervisor.lists.lock().await.static_relays.clone();
        assert!(snapshot.is_empty());
        assert!(!stats.has_mount("/a"));
    }

    #[derive(Default)]
    struct FallbackAwarePipeline {
        fallback: FallbackInfo,
    }

    #[async_trait::async_trait]
    impl SourcePipeline for FallbackAwarePipeline {
        async fn complete_source(&self, _mount: &str, _stream: BoxedStream) -> crate::Result<()> {
            Ok(())
        }
        async fn run(&self, _mount: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn fallback_info(&self, _mount: &str) -> FallbackInfo {
            self.fallback.clone()
        }
        async fn set_on_demand(&self, _mount: &str, _on_demand: bool) {}
        async fn stop(&self, _mount: &str) {}
    }

    #[tokio::test]
    async fn test_on_demand_relay_wakes_once_fallback_has_listeners() {
        let registry = Arc::new(InMemoryMountRegistry::new());
        let pipeline: Arc<dyn SourcePipeline> = Arc::new(FallbackAwarePipeline {
            fallback: FallbackInfo { fallback_mount: Some("/f".to_string()), fallback_override: true },
        });
        let env = Arc::new(WorkerEnv {
            mount_registry: registry.clone(),
            source_pipeline: pipeline,
            stats: Arc::new(InMemoryStats::new()),
            yp: Arc::new(InMemoryYp::new()),
            local_hostname: "h".into(),
            master_redirect_port: None,
            server_version: "relay-core/0.1".into(),
            rescan_relays: Arc::new(AtomicBool::new(false)),
        });
        let supervisor = RelaySupervisor::new(env);

        let d = vec![desired("/r", "127.0.0.1", 1, true, true)];
        supervisor.apply_static(&d).await;

        {
            let snapshot = supervisor.lists.lock().await.static_relays.clone();
            assert!(!snapshot[0].runtime.lock().unwrap().running);
        }

        // Fallback gains listeners and is marked running; the next rescan
        // should wake the on-demand relay.
        registry.set_listeners("/f", 3).await;
        registry.force_running("/f");

        supervisor.rescan().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = supervisor.lists.lock().await.static_relays.clone();
        assert!(snapshot[0].runtime.lock().unwrap().running);
    }
}
