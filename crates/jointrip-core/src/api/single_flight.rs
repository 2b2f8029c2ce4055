use std::sync::{Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::auth::{AuthError, TokenPair};

/// Why a refresh episode failed. Cloned to every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RefreshFailure(pub String);

pub(crate) type RefreshOutcome = Result<TokenPair, RefreshFailure>;
pub(crate) type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// What a caller holding a rejected token should do next.
pub(crate) enum Ticket {
    /// The store already holds a different pair; replay with it.
    Current(TokenPair),
    /// Await the refresh started for the rejected token.
    Wait(PendingRefresh),
    /// No pair is stored, nothing to refresh.
    Empty,
}

struct Episode {
    stale: String,
    outcome: PendingRefresh,
}

/// At most one refresh per rejected access token; concurrent callers share its outcome.
#[derive(Default)]
pub(crate) struct RefreshGate {
    inflight: Mutex<Option<Episode>>,
}

impl RefreshGate {
    /// `stale` is the access token the failed request carried, `None` if it was sent bare.
    pub(crate) fn enter<R, F>(
        &self,
        stale: Option<&str>,
        read_current: R,
        start: F,
    ) -> Result<Ticket, AuthError>
    where
        R: FnOnce() -> Result<Option<TokenPair>, AuthError>,
        F: FnOnce(TokenPair) -> BoxFuture<'static, RefreshOutcome>,
    {
        let mut slot = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);

        let current = match read_current()? {
            Some(pair) => pair,
            None => return Ok(Ticket::Empty),
        };
        if stale != Some(current.access_token.as_str()) {
            return Ok(Ticket::Current(current));
        }
        if let Some(episode) = slot.as_ref() {
            if episode.stale == current.access_token {
                return Ok(Ticket::Wait(episode.outcome.clone()));
            }
        }

        let stale = current.access_token.clone();
        let outcome = start(current).shared();
        *slot = Some(Episode {
            stale,
            outcome: outcome.clone(),
        });
        Ok(Ticket::Wait(outcome))
    }

    /// Finish the episode started for `stale`.
    ///
    /// `commit` runs under the gate lock, so no caller can enter or write through
    /// [`RefreshGate::exclusive`] while it compares and updates the store. The episode
    /// is forgotten afterwards and the next 401 on any token starts a new one.
    pub(crate) fn settle<T>(&self, stale: &str, commit: impl FnOnce() -> T) -> T {
        let mut slot = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let settled = commit();
        if slot.as_ref().is_some_and(|episode| episode.stale == stale) {
            *slot = None;
        }
        settled
    }

    /// Run a store mutation that must not interleave with a settling refresh.
    pub(crate) fn exclusive<T>(&self, f: impl FnOnce() -> T) -> T {
        let _slot = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}
