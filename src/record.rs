use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::task::JoinHandle;

use crate::collaborators::SourceSlotHandle;

/// Which input produced a relay: the static configuration list, or the
/// master's advertised streamlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTag {
    Configured,
    MasterAdvertised,
}

/// Mutable runtime state of a relay. Guarded by a plain mutex — never held
/// across an `.await`, so `std::sync::Mutex` is sufficient and avoids the
/// cost of an async mutex on the hot promote/teardown path.
#[derive(Default)]
pub struct RelayRuntime {
    pub source_slot: Option<SourceSlotHandle>,
    pub worker: Option<JoinHandle<()>>,
    pub running: bool,
    pub cleanup_requested: bool,
    pub on_demand_req: bool,
}

/// A single relay: a local mount whose content is pulled from an upstream.
///
/// `local_mount` is the stable identity. The upstream coordinates
/// (`upstream_host`/`upstream_port`/`upstream_mount`/`send_icy_metadata`)
/// are fixed for the life of the record — a change in any of them produces
/// a *new* record via [`crate::reconcile::reconcile`] rather than mutating
/// this one in place, so that a live worker is always joined before a
/// differently-configured one is spawned. `on_demand` and `enabled` are the
/// two fields the reconciler is allowed to assimilate into a kept record
/// without a restart (see `relay_has_changed`).
pub struct RelayRecord {
    pub local_mount: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub upstream_mount: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub send_icy_metadata: bool,
    pub on_demand: AtomicBool,
    pub enabled: AtomicBool,
    pub partition: PartitionTag,
    pub runtime: Mutex<RelayRuntime>,
}

/// A freshly-built description of a desired relay: what the reconciler
/// compares `current` against. Produced by a config reload or a streamlist
/// poll; carries no runtime resources of its own.
#[derive(Debug, Clone)]
pub struct DesiredRelay {
    pub local_mount: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub upstream_mount: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub send_icy_metadata: bool,
    pub on_demand: bool,
    pub enabled: bool,
    pub partition: PartitionTag,
}

impl RelayRecord {
    pub fn from_desired(desired: &DesiredRelay) -> Self {
        RelayRecord {
            local_mount: desired.local_mount.clone(),
            upstream_host: desired.upstream_host.clone(),
            upstream_port: desired.upstream_port,
            upstream_mount: desired.upstream_mount.clone(),
            username: desired.username.clone(),
            password: desired.password.clone(),
            send_icy_metadata: desired.send_icy_metadata,
            on_demand: AtomicBool::new(desired.on_demand),
            enabled: AtomicBool::new(desired.enabled),
            partition: desired.partition,
            runtime: Mutex::new(RelayRuntime::default()),
        }
    }

    pub fn on_demand(&self) -> bool {
        self.on_demand.load(Ordering::SeqCst)
    }

    pub fn set_on_demand(&self, value: bool) {
        self.on_demand.store(value, Ordering::SeqCst);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, value: bool) {
        self.enabled.store(value, Ordering::SeqCst);
    }

    /// Basic-auth credentials, if both are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        }
    }
}

/// `upstream_mount`, `upstream_host`, `upstream_port`, `send_icy_metadata`
/// differing requires a restart. `on_demand` differing does not — it is
/// assimilated in place. Credentials and `enabled` are deliberately *not*
/// compared here: see the open question in DESIGN.md / spec.md §9.
pub fn relay_has_changed(desired: &DesiredRelay, existing: &RelayRecord) -> bool {
    desired.upstream_mount != existing.upstream_mount
        || desired.upstream_host != existing.upstream_host
        || desired.upstream_port != existing.upstream_port
        || desired.send_icy_metadata != existing.send_icy_metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired() -> DesiredRelay {
        DesiredRelay {
            local_mount: "/a".into(),
            upstream_host: "h".into(),
            upstream_port: 80,
            upstream_mount: "/a".into(),
            username: None,
            password: None,
            send_icy_metadata: true,
            on_demand: false,
            enabled: true,
            partition: PartitionTag::Configured,
        }
    }

    #[test]
    fn test_on_demand_alone_is_not_a_change() {
        let existing = RelayRecord::from_desired(&desired());
        let mut d = desired();
        d.on_demand = true;
        assert!(!relay_has_changed(&d, &existing));
    }

    #[test]
    fn test_upstream_mount_change_is_a_change() {
        let existing = RelayRecord::from_desired(&desired());
        let mut d = desired();
        d.upstream_mount = "/b".into();
        assert!(relay_has_changed(&d, &existing));
    }

    #[test]
    fn test_credential_change_is_not_flagged() {
        let existing = RelayRecord::from_desired(&desired());
        let mut d = desired();
        d.username = Some("u".into());
        d.password = Some("p".into());
        assert!(!relay_has_changed(&d, &existing));
    }
}
