//! Out-of-band interaction correlation.
//!
//! Some probes only succeed when the target calls back to an external
//! listener. The runner registers a token, embeds the listener URL in the
//! request, and after dispatch waits a bounded time for callbacks carrying
//! that token. No callback before the deadline is a non-match.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::cancel::CancelSignal;
use crate::error::ExecError;
use crate::primitives::random_token;
use crate::types::Interaction;

/// Length of generated correlation tokens.
pub const TOKEN_LEN: usize = 20;

/// Capability: register a token, then wait up to a deadline for callbacks.
#[async_trait]
pub trait InteractionClient: Send + Sync {
    /// Starts tracking `token` and returns the URL that embeds it.
    fn register(&self, token: &str) -> Result<String, ExecError>;

    /// Waits until at least one interaction for `token` arrives or `deadline`
    /// elapses, then stops tracking the token. Returns the interactions seen,
    /// possibly none.
    async fn wait_for(
        &self,
        token: &str,
        deadline: Duration,
        cancel: &CancelSignal,
    ) -> Result<Vec<Interaction>, ExecError>;

    /// Stops tracking `token` without waiting. Called on every exit path of a
    /// block that registered one, so it must be idempotent.
    fn release(&self, _token: &str) {}

    /// A fresh token suitable for [`InteractionClient::register`].
    fn new_token(&self) -> String {
        random_token(TOKEN_LEN)
    }
}

/// Thread-safe in-memory registry keyed by token.
///
/// A listener (or a test) feeds callbacks through [`CorrelationRegistry::record`];
/// waiters are woken by push notification.
#[derive(Debug)]
pub struct CorrelationRegistry {
    domain: String,
    pending: Mutex<HashMap<String, Vec<Interaction>>>,
    notify: Notify,
}

impl CorrelationRegistry {
    /// `domain` is the listener's base domain; URLs are `<token>.<domain>`.
    pub fn new(domain: impl Into<String>) -> Self {
        CorrelationRegistry {
            domain: domain.into(),
            pending: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Delivers a callback. Interactions whose unique ID does not start with a
    /// registered token are dropped. Returns whether it was correlated.
    pub fn record(&self, interaction: Interaction) -> bool {
        let correlated = {
            let Ok(mut pending) = self.pending.lock() else {
                return false;
            };
            let key = pending
                .keys()
                .find(|token| interaction.unique_id.starts_with(token.as_str()))
                .cloned();
            match key {
                Some(token) => {
                    if let Some(list) = pending.get_mut(&token) {
                        list.push(interaction);
                    }
                    true
                }
                None => false,
            }
        };
        if correlated {
            self.notify.notify_waiters();
        } else {
            debug!("dropping uncorrelated interaction");
        }
        correlated
    }

    pub fn is_registered(&self, token: &str) -> bool {
        self.pending
            .lock()
            .map(|p| p.contains_key(token))
            .unwrap_or(false)
    }

    fn take(&self, token: &str) -> Result<Vec<Interaction>, ExecError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| ExecError::fatal("correlation registry lock poisoned"))?;
        Ok(pending
            .get_mut(token)
            .map(std::mem::take)
            .unwrap_or_default())
    }

    fn unregister(&self, token: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(token);
        }
    }
}

#[async_trait]
impl InteractionClient for CorrelationRegistry {
    fn register(&self, token: &str) -> Result<String, ExecError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| ExecError::fatal("correlation registry lock poisoned"))?;
        pending.entry(token.to_string()).or_default();
        Ok(format!("{}.{}", token, self.domain))
    }

    fn release(&self, token: &str) {
        self.unregister(token);
    }

    async fn wait_for(
        &self,
        token: &str,
        deadline: Duration,
        cancel: &CancelSignal,
    ) -> Result<Vec<Interaction>, ExecError> {
        let until = tokio::time::Instant::now() + deadline;
        let result = loop {
            // Created before the check so a concurrent `record` cannot slip by.
            let notified = self.notify.notified();
            let seen = self.take(token)?;
            if !seen.is_empty() {
                break Ok(seen);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(until) => break Ok(Vec::new()),
                _ = cancel.cancelled() => break Err(ExecError::Cancelled),
            }
        };
        self.unregister(token);
        result
    }
}
