mod collaborators;
mod config;
mod control_loop;
mod error;
mod http;
mod logging;
mod poller;
mod reconcile;
mod record;
mod slave;
mod supervisor;
mod worker;

pub use collaborators::memory;
pub use collaborators::{AsyncReadWrite, BoxedStream, FallbackInfo, MountRegistry, SourcePipeline, SourceSlotHandle, Stats, Yp};
pub use config::{RelayConfig, StaticRelayConfig};
pub use control_loop::{ControlFlags, RelaySystem};
pub use error::{Error, Result};
pub use http::{FetchedResponse, HttpFetcher, HttpResponse, TokioHttpFetcher};
pub use logging::init_logging;
pub use poller::{build_desired_relays, feed_chunk, parse_streamlist_body, poll_once, PollerState};
pub use reconcile::{reconcile, ReconcileOutcome};
pub use record::{relay_has_changed, DesiredRelay, PartitionTag, RelayRecord, RelayRuntime};
pub use slave::{redirect_location, SlaveKey, SlaveRegistry};
pub use supervisor::RelaySupervisor;
pub use worker::{run_relay_worker, WorkerEnv};
