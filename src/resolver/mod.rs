//! Turning a player page into a playable manifest url.
//!
//! Strategies are tried in order by [`ResolverChain`]: the static packer decoder first since it's
//! one http request, then the browser that watches the player's own network calls.

pub mod browser;
pub mod decoder;
pub mod model;
pub mod static_resolver;
pub mod token;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use mockall::automock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use browser::BrowserStreamResolver;
pub use model::{CatalogRecord, PlayerReference, ResolvedStream};
pub use static_resolver::StaticPageResolver;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionFailure {
    #[error("no stream url observed before the timeout")]
    Timeout,
    #[error("resolution was superseded by a newer request")]
    Superseded,
    #[error("browser failure: {0}")]
    Browser(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("every resolver gave up, last reason: {0}")]
    Exhausted(String),
}

/// what one strategy says about a player page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(ResolvedStream),
    /// not for this strategy, let the next one have a go
    TryNext(String),
    /// stop the chain here
    Fatal(ResolutionFailure),
}

pub type DynResolver = Arc<dyn Resolver + Send + Sync>;

#[automock]
#[async_trait]
pub trait Resolver {
    fn name(&self) -> &'static str;

    async fn resolve(&self, player: &PlayerReference) -> ResolveOutcome;
}

pub struct ResolverChain {
    resolvers: Vec<DynResolver>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<DynResolver>) -> Self {
        Self { resolvers }
    }

    pub async fn resolve(
        &self,
        player: &PlayerReference,
    ) -> Result<ResolvedStream, ResolutionFailure> {
        let mut last_reason = "no resolvers configured".to_string();

        for resolver in &self.resolvers {
            debug!("trying {} for {}", resolver.name(), player.player_url);

            match resolver.resolve(player).await {
                ResolveOutcome::Resolved(stream) => {
                    info!("{} resolved {}", resolver.name(), player.player_url);
                    return Ok(stream);
                }
                ResolveOutcome::TryNext(reason) => {
                    debug!("{} passed: {}", resolver.name(), reason);
                    last_reason = format!("{}: {}", resolver.name(), reason);
                }
                ResolveOutcome::Fatal(failure) => {
                    warn!("{} failed hard: {}", resolver.name(), failure);
                    return Err(failure);
                }
            }
        }

        Err(ResolutionFailure::Exhausted(last_reason))
    }
}

struct InFlight {
    id: u64,
    cancel: CancellationToken,
}

/// one resolution at a time, a new request cancels whatever is still running so a late result for
/// an old channel can never reach the caller
pub struct ResolutionService {
    chain: ResolverChain,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

impl ResolutionService {
    pub fn new(chain: ResolverChain) -> Self {
        Self {
            chain,
            in_flight: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn resolve(
        &self,
        player: &PlayerReference,
    ) -> Result<ResolvedStream, ResolutionFailure> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let previous = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(InFlight {
                id,
                cancel: cancel.clone(),
            });
        if let Some(previous) = previous {
            info!("request {} supersedes request {}", id, previous.id);
            previous.cancel.cancel();
        }

        // dropping the chain future is what tears the strategies down
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResolutionFailure::Superseded),
            result = self.chain.resolve(player) => result,
        };

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if in_flight.as_ref().is_some_and(|f| f.id == id) {
                *in_flight = None;
            }
        }

        // a result that lost the race after finishing still counts as stale
        if cancel.is_cancelled() {
            return Err(ResolutionFailure::Superseded);
        }

        if let Ok(stream) = &result {
            token::log_expiry(&stream.raw_url);
        }

        result
    }

    /// playback stopped, drop whatever is still resolving
    pub fn cancel(&self) {
        if let Some(in_flight) = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            debug!("cancelling request {}", in_flight.id);
            in_flight.cancel.cancel();
        }
    }
}
