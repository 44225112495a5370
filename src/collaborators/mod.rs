//! Trait boundaries for the subsystems spec.md §1 treats as external
//! collaborators: the audio pipeline, the mount registry, and the stats
//! publisher. The relay control plane only ever talks to these through the
//! traits below; [`memory`] provides a minimal working implementation of
//! each so the reconciliation loop can run (and be tested) without a real
//! media backend.

pub mod memory;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;

/// A connected upstream byte stream, type-erased so `RelayWorker` doesn't
/// need to know whether it's plain TCP or TLS.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

pub type BoxedStream = Box<dyn AsyncReadWrite>;

/// Opaque handle to a slot reserved in the [`MountRegistry`]. Owned
/// exclusively by the `RelayRecord` that reserved it for its whole
/// lifetime (spec.md §3 invariant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSlotHandle {
    pub mount: String,
}

/// What a source's fallback configuration currently looks like.
#[derive(Debug, Clone, Default)]
pub struct FallbackInfo {
    pub fallback_mount: Option<String>,
    pub fallback_override: bool,
}

/// The audio demux/remux pipeline. Out of scope per spec.md §1; this is
/// the trait boundary `RelayWorker` drives.
#[async_trait]
pub trait SourcePipeline: Send + Sync {
    /// Format-detect the connection and wire it up as `mount`'s live
    /// source (spec.md §4.1 step 5).
    async fn complete_source(&self, mount: &str, stream: BoxedStream) -> Result<()>;

    /// Run the source's read loop until the stream ends or [`stop`] is
    /// called (spec.md §4.1 step 7, §5 cancellation).
    async fn run(&self, mount: &str) -> Result<()>;

    /// Signal the source's read loop to stop at its next iteration
    /// (spec.md §5: "writing `source.running=false`"). There is no hard
    /// kill; the caller still awaits the worker task to completion.
    async fn stop(&self, mount: &str);

    /// The fallback currently configured on this source, if it has one.
    async fn fallback_info(&self, mount: &str) -> FallbackInfo;

    /// Propagate the relay's on-demand flag to the wired source
    /// (spec.md §4.3 promotion rule 5).
    async fn set_on_demand(&self, mount: &str, on_demand: bool);
}

/// The mount point table. Out of scope per spec.md §1; this is the trait
/// boundary the supervisor uses to reserve/release source slots and query
/// listener counts for fallback and on-demand decisions.
#[async_trait]
pub trait MountRegistry: Send + Sync {
    /// Reserve `mount` for exclusive use. Errs if already taken.
    async fn reserve(&self, mount: &str) -> Result<SourceSlotHandle>;

    async fn release(&self, slot: &SourceSlotHandle);

    async fn is_running(&self, mount: &str) -> bool;

    async fn listener_count(&self, mount: &str) -> u64;

    async fn set_listeners(&self, mount: &str, count: u64);

    /// Move all listeners from `from` onto `to`, returning how many moved.
    /// Used by the connect-failure fallback path (spec.md §4.1).
    async fn move_listeners(&self, from: &str, to: &str) -> Result<u64>;

    /// Ask the registry to recompute its mount tree after a relay
    /// add/remove (spec.md §4.3 `tear_down`/promotion rule 5).
    async fn request_rebuild(&self);

    /// Refresh a mount's settings from the current configuration
    /// (spec.md §4.3 promotion rule 5 / step 7).
    async fn update_settings(&self, mount: &str);
}

/// The stats publisher. Out of scope per spec.md §1.
#[async_trait]
pub trait Stats: Send + Sync {
    async fn increment_relay_connections(&self);

    async fn set_source_ip(&self, mount: &str, ip: &str);

    /// Clear every stat for `mount` (relay removed or disabled).
    async fn clear_mount(&self, mount: &str);
}

/// The directory-listing ("YP") subsystem a worker deregisters from on
/// exit for non-on-demand relays (spec.md §4.1 step 8). Not named among
/// spec.md §1's collaborator list explicitly, but it is clearly external
/// to the reconciliation core, so it gets the same trait treatment.
#[async_trait]
pub trait Yp: Send + Sync {
    async fn deregister(&self, mount: &str);
}
