//! `ControlLoop` and `RelaySystem` (spec.md §4.6, §9): the single
//! long-running tick that drives config reload, master polling, and
//! relay reconciliation, plus the process-wide state spec.md §9's
//! "Global mutable state" note groups together.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::RwLock;

use crate::config::RelayConfig;
use crate::http::HttpFetcher;
use crate::poller;
use crate::record::DesiredRelay;
use crate::slave::SlaveRegistry;
use crate::supervisor::RelaySupervisor;
use crate::worker::WorkerEnv;

/// External control signals, set by other tasks and read by the loop
/// (spec.md §4.6 "External control signals"). `rescan_relays` is the same
/// `Arc<AtomicBool>` handed to every [`WorkerEnv`], so a worker's
/// self-termination signal (spec.md §4.1 step 9, set at worker.rs) reaches
/// the very next tick's light-cycle check instead of waiting for a full
/// cycle.
pub struct ControlFlags {
    rescan_relays: Arc<AtomicBool>,
    update_settings: AtomicBool,
    force_recheck: AtomicBool,
}

impl ControlFlags {
    fn new(rescan_relays: Arc<AtomicBool>) -> Self {
        ControlFlags { rescan_relays, update_settings: AtomicBool::new(false), force_recheck: AtomicBool::new(false) }
    }

    /// `slave_recheck_mounts()`: forces a full cycle on the next tick and
    /// asks for a mount settings refresh.
    pub fn slave_recheck_mounts(&self) {
        self.force_recheck.store(true, Ordering::SeqCst);
        self.update_settings.store(true, Ordering::SeqCst);
    }

    /// `slave_rescan()`: asks for a light cycle on the next tick.
    pub fn slave_rescan(&self) {
        self.rescan_relays.store(true, Ordering::SeqCst);
    }

    /// `slave_rebuild_mounts()`: both a light cycle and a settings refresh.
    pub fn slave_rebuild_mounts(&self) {
        self.update_settings.store(true, Ordering::SeqCst);
        self.rescan_relays.store(true, Ordering::SeqCst);
    }
}

/// The current configuration, swapped wholesale on reload (spec.md §5:
/// "`Config` is swapped atomically under its own lock").
struct LoopState {
    config: RelayConfig,
}

/// The process-wide relay subsystem (spec.md §9 "Global mutable state"):
/// the two relay lists (via `RelaySupervisor`), the slave registry, the
/// worker-signalled rescan flag, and the control-loop tick bookkeeping
/// (`interval`/`max_interval`). Constructed once at startup; the
/// control-loop task owns the tick, other tasks only reach it through
/// `ControlFlags` or the supervisor's own serialised mutators.
pub struct RelaySystem {
    supervisor: Arc<RelaySupervisor>,
    slaves: Arc<SlaveRegistry>,
    fetcher: Arc<dyn HttpFetcher>,
    env: Arc<WorkerEnv>,
    flags: Arc<ControlFlags>,
    state: RwLock<LoopState>,
    interval: AtomicU64,
    max_interval: AtomicU64,
}

impl RelaySystem {
    pub fn new(config: RelayConfig, fetcher: Arc<dyn HttpFetcher>, env: Arc<WorkerEnv>) -> Arc<Self> {
        let max_interval = config.master_update_interval;
        let flags = Arc::new(ControlFlags::new(env.rescan_relays.clone()));
        Arc::new(RelaySystem {
            supervisor: Arc::new(RelaySupervisor::new(env.clone())),
            slaves: Arc::new(SlaveRegistry::new()),
            fetcher,
            env,
            flags,
            state: RwLock::new(LoopState { config }),
            // Equal to `max_interval` so the very first tick's
            // `interval >= max_interval` check is already due, forcing an
            // initial full cycle without needing a signal.
            interval: AtomicU64::new(max_interval),
            max_interval: AtomicU64::new(max_interval),
        })
    }

    pub fn flags(&self) -> Arc<ControlFlags> {
        self.flags.clone()
    }

    pub fn slaves(&self) -> Arc<SlaveRegistry> {
        self.slaves.clone()
    }

    pub fn supervisor(&self) -> Arc<RelaySupervisor> {
        self.supervisor.clone()
    }

    /// Swap in a freshly-parsed configuration (the real reload is out of
    /// scope; this is the entry point the embedder calls with the parsed
    /// result). Forces a full cycle on the next tick.
    pub async fn apply_config(&self, config: RelayConfig) {
        let mut state = self.state.write().await;
        self.max_interval.store(config.master_update_interval, Ordering::SeqCst);
        state.config = config;
        self.flags.slave_recheck_mounts();
    }

    /// Run one `ControlLoop` iteration (spec.md §4.6) outside of [`run`]'s
    /// own ticker — for an embedder driving its own schedule, or a test
    /// that wants deterministic control over when a cycle happens.
    pub async fn tick_once(&self) {
        self.tick().await;
    }

    async fn tick(&self) {
        let forced = self.flags.force_recheck.swap(false, Ordering::SeqCst);
        let due = self.interval.fetch_add(1, Ordering::SeqCst) >= self.max_interval.load(Ordering::SeqCst);

        if forced || due {
            self.full_cycle().await;
        } else if self.flags.rescan_relays.load(Ordering::SeqCst) {
            self.light_cycle().await;
        }

        self.flags.rescan_relays.store(false, Ordering::SeqCst);
        if self.flags.update_settings.swap(false, Ordering::SeqCst) {
            self.env.mount_registry.request_rebuild().await;
        }
    }

    /// Step 2: reload config, reset the tick counter, refresh the
    /// self-as-slave entry, fetch the master streamlist, and reconcile
    /// `static_relays` against the current configuration.
    async fn full_cycle(&self) {
        self.interval.store(0, Ordering::SeqCst);

        let (config, desired_static) = {
            let state = self.state.read().await;
            self.max_interval.store(state.config.master_update_interval, Ordering::SeqCst);
            (state.config.clone(), static_desired(&state.config))
        };

        if let Some((server, port)) = config.master_as_slave_host() {
            self.slaves.add(&server, port).await;
        }

        self.supervisor.apply_static(&desired_static).await;
        self.poll_master().await;
    }

    /// Step 3: promote both lists without reconciliation.
    async fn light_cycle(&self) {
        self.supervisor.rescan().await;
    }

    /// One master streamlist fetch, run detached so a slow master never
    /// blocks the tick (spec.md §4.4 "runs on a detached worker").
    async fn poll_master(&self) {
        let config = self.state.read().await.config.clone();
        if config.master_server.is_none() {
            return;
        }

        let fetcher = self.fetcher.clone();
        let supervisor = self.supervisor.clone();
        let mount_registry = self.env.mount_registry.clone();

        tokio::spawn(async move {
            match poller::poll_once(&config, &fetcher).await {
                Ok(Some(desired)) => {
                    debug!("master poll: {} mount(s)", desired.len());
                    supervisor.apply_master(&desired).await;
                }
                Ok(None) => {
                    // Non-200 or not configured: master_relays unchanged.
                }
                Err(err) => warn!("master poll failed: {err}"),
            }
            let _ = mount_registry; // kept alive for the duration of the fetch
        });
    }

    /// Start the 1-second tick loop. Runs until `shutdown` resolves, then
    /// tears down every relay in both lists.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = &mut shutdown => {
                    info!("relay control loop shutting down");
                    break;
                }
            }
        }
        self.supervisor.apply_static(&[]).await;
        self.supervisor.apply_master(&[]).await;
    }
}

fn static_desired(config: &RelayConfig) -> Vec<DesiredRelay> {
    config
        .relays
        .iter()
        .map(|r| DesiredRelay {
            local_mount: r.local_mount.clone(),
            upstream_host: r.server.clone(),
            upstream_port: r.port,
            upstream_mount: r.mount.clone(),
            username: r.username.clone(),
            password: r.password.clone(),
            send_icy_metadata: r.send_icy_metadata,
            on_demand: r.on_demand,
            enabled: r.enable,
            partition: crate::record::PartitionTag::Configured,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::memory::{InMemoryMountRegistry, InMemoryStats, InMemoryYp};
    use crate::collaborators::{BoxedStream, FallbackInfo, SourcePipeline};
    use crate::config::StaticRelayConfig;
    use crate::http::FetchedResponse;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    #[derive(Default)]
    struct StubSourcePipeline;

    #[async_trait::async_trait]
    impl SourcePipeline for StubSourcePipeline {
        async fn complete_source(&self, _mount: &str, _stream: BoxedStream) -> crate::Result<()> {
            Ok(())
        }
        async fn run(&self, _mount: &str) -> crate::Result<()> {
            Ok(())
        }
        async fn fallback_info(&self, _mount: &str) -> FallbackInfo {
            FallbackInfo::default()
        }
        async fn set_on_demand(&self, _mount: &str, _on_demand: bool) {}
        async fn stop(&self, _mount: &str) {}
    }

    struct EmptyFetcher;

    #[async_trait::async_trait]
    impl HttpFetcher for EmptyFetcher {
        async fn fetch(
            &self,
            _host: &str,
            _port: u16,
            _path: &str,
            _use_tls: bool,
            _auth: Option<(String, String)>,
        ) -> crate::Result<FetchedResponse> {
            Ok(FetchedResponse { status_code: 200, reason: "OK".into(), body: Vec::new() })
        }
    }

    fn test_system(config: RelayConfig) -> (Arc<RelaySystem>, Arc<InMemoryMountRegistry>, Arc<WorkerEnv>) {
        let registry = Arc::new(InMemoryMountRegistry::new());
        let env = Arc::new(WorkerEnv {
            mount_registry: registry.clone(),
            source_pipeline: Arc::new(StubSourcePipeline),
            stats: Arc::new(InMemoryStats::new()),
            yp: Arc::new(InMemoryYp::new()),
            local_hostname: "relay-host".into(),
            master_redirect_port: None,
            server_version: "relay-core/0.1".into(),
            rescan_relays: Arc::new(StdAtomicBool::new(false)),
        });
        (RelaySystem::new(config, Arc::new(EmptyFetcher), env.clone()), registry, env)
    }

    #[tokio::test]
    async fn test_first_tick_runs_a_full_cycle_even_without_signals() {
        let mut config = RelayConfig { master_update_interval: 100, ..Default::default() };
        config.relays.push(StaticRelayConfig {
            server: "127.0.0.1".into(),
            port: 1,
            mount: "/a".into(),
            local_mount: "/a".into(),
            username: None,
            password: None,
            send_icy_metadata: false,
            on_demand: false,
            enable: true,
        });
        let (system, _registry, _env) = test_system(config);

        system.tick().await;

        let snapshot = system.supervisor.static_relays_snapshot().await;
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_slave_rescan_triggers_light_cycle_without_reconcile() {
        let (system, _registry, _env) = test_system(RelayConfig { master_update_interval: 100, ..Default::default() });
        system.tick().await; // consume the forced first cycle

        system.flags().slave_rescan();
        system.tick().await;
        // No panics / no relays spawned from an empty config; this mostly
        // proves the light-cycle path runs without requiring reconcile.
        assert!(system.supervisor.static_relays_snapshot().await.is_empty());
    }

    /// A worker's self-termination signal (`WorkerEnv.rescan_relays`, set at
    /// worker.rs:65) must reach the very same flag `tick()` reads, not a
    /// disconnected copy — otherwise a failed relay is only retried at the
    /// next full cycle instead of the next tick.
    #[tokio::test]
    async fn test_worker_rescan_signal_reaches_the_same_tick_flag() {
        let (system, _registry, env) = test_system(RelayConfig { master_update_interval: 100, ..Default::default() });
        system.tick().await; // consume the forced first cycle

        // Simulate a worker finishing and signalling a rescan, exactly as
        // `run_relay_worker` does on its own `env.rescan_relays`.
        env.rescan_relays.store(true, Ordering::SeqCst);

        system.tick().await;

        // tick() clears the flag after honoring it; if the worker's store
        // had gone to a disconnected `ControlFlags` copy, this would still
        // read true because nothing would have consumed it.
        assert!(!env.rescan_relays.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_slave_rebuild_mounts_requests_settings_update() {
        let (system, registry, _env) = test_system(RelayConfig { master_update_interval: 100, ..Default::default() });
        system.tick().await;

        system.flags().slave_rebuild_mounts();
        system.tick().await;

        assert!(registry.rebuild_count() >= 1);
    }
}
