pub mod config;
pub mod coordinator;
pub mod copier;
pub mod error;
pub mod gate;
pub mod poll;
pub mod prepull;
pub mod reference;
pub mod server;
pub mod store;

pub use config::{Config, CopyMode, RuntimeSettings};
pub use coordinator::{FetchCoordinator, PullOutcome};
pub use copier::{CommandCopier, ImageCopier};
pub use error::{PullThroughError, Result};
pub use gate::{GateDecision, InboundRequest, RequestGate, SkipReason};
pub use store::{Claim, PullState, PullStateStore};

/// Start the pull-through server with the given configuration and copy primitive
pub async fn start_server<C: ImageCopier>(config: Config, copier: C) -> Result<server::Server<C>> {
    server::start_server(config, copier).await
}
