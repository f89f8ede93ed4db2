//! Reconnection supervisor
//!
//! The supervisor is the only component that opens or closes the transport
//! session. Every state transition and the retry budget sit behind one async
//! mutex, so concurrent callers that observe a lost session queue up behind a
//! single reconnect sequence instead of starting their own.

use crate::config::{BackoffKind, RetrySection};
use crate::error::{ConnectorError, ConnectorResult};
use crate::identity::DeviceIdentity;
use crate::token::CredentialIssuer;
use crate::transport::{Transport, TransportError};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Identifies one established session; bumped on every successful handshake
pub type SessionGeneration = u64;

/// Delay progression between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    #[default]
    Fixed,
    /// Double the delay for every consumed attempt, capped at `max`
    Exponential { max: Duration },
}

/// Retry parameters supplied at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-attempts allowed after the first failed handshake
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
    /// Restore a depleted budget once this long has passed since exhaustion
    pub cooldown: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
            backoff: Backoff::Fixed,
            cooldown: None,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            ..Default::default()
        }
    }

    /// Delay before the re-attempt that consumes budget unit `consumed` (1-based)
    pub fn delay_for(&self, consumed: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max } => {
                let factor = 1u32
                    .checked_shl(consumed.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                self.delay.saturating_mul(factor).min(max)
            }
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        let delay = Duration::from_millis(section.delay_ms);
        let backoff = match section.backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential {
                max: Duration::from_millis(section.max_delay_ms),
            },
        };

        Self {
            max_attempts: section.max_attempts,
            delay,
            backoff,
            cooldown: section.cooldown_secs.map(Duration::from_secs),
        }
    }
}

/// Remaining re-attempts and the base delay between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempts_remaining: u32,
    pub delay: Duration,
}

/// Lifecycle of a connector; exactly one value at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Record of the run that depleted the budget
#[derive(Debug, Clone)]
struct Exhaustion {
    at: Instant,
    attempts: u32,
    last: Arc<TransportError>,
}

/// Everything mutated only under the supervisor lock
#[derive(Debug)]
struct SupervisorInner {
    budget: RetryBudget,
    exhaustion: Option<Exhaustion>,
}

/// Bounded-retry reconnect logic around a [`Transport`]
pub struct Supervisor<T: Transport> {
    identity: DeviceIdentity,
    transport: Arc<T>,
    issuer: Arc<dyn CredentialIssuer>,
    policy: RetryPolicy,
    disconnect_grace: Duration,
    inner: Mutex<SupervisorInner>,
    state_tx: watch::Sender<ConnectorState>,
    attempts_remaining: AtomicU32,
    handshake_attempts: AtomicU32,
    generation: AtomicU64,
}

impl<T: Transport> Supervisor<T> {
    pub fn new(
        identity: DeviceIdentity,
        transport: Arc<T>,
        issuer: Arc<dyn CredentialIssuer>,
        policy: RetryPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectorState::Disconnected);
        let budget = RetryBudget {
            attempts_remaining: policy.max_attempts,
            delay: policy.delay,
        };

        Self {
            identity,
            transport,
            issuer,
            attempts_remaining: AtomicU32::new(policy.max_attempts),
            policy,
            disconnect_grace: Duration::from_millis(250),
            inner: Mutex::new(SupervisorInner {
                budget,
                exhaustion: None,
            }),
            state_tx,
            handshake_attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Grace period used when the supervisor closes a session on its own
    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current state without waiting for an in-flight reconnect
    pub fn state(&self) -> ConnectorState {
        *self.state_tx.borrow()
    }

    /// Watch every state transition
    pub fn subscribe(&self) -> watch::Receiver<ConnectorState> {
        self.state_tx.subscribe()
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining.load(Ordering::SeqCst)
    }

    /// Total handshakes started over the supervisor's lifetime
    pub fn handshake_attempts(&self) -> u32 {
        self.handshake_attempts.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(device = %self.identity.device, from = ?previous, to = ?state, "Connector state changed");
        }
    }

    fn is_live(&self) -> bool {
        self.state() == ConnectorState::Connected && self.transport.is_connected()
    }

    /// Return once a live session exists, reconnecting if needed
    ///
    /// Returns the generation of the session that was found or established.
    pub async fn ensure_connected(&self) -> ConnectorResult<SessionGeneration> {
        if self.is_live() {
            return Ok(self.generation.load(Ordering::SeqCst));
        }

        let mut inner = self.inner.lock().await;

        // Another caller may have reconnected while this one waited
        if self.is_live() {
            return Ok(self.generation.load(Ordering::SeqCst));
        }

        if self.state() == ConnectorState::Connected {
            warn!(device = %self.identity.device, "Transport connection lost");
            self.transport.disconnect(self.disconnect_grace).await;
            self.set_state(ConnectorState::Disconnected);
        }

        if let Some(exhaustion) = inner.exhaustion.clone() {
            match self.policy.cooldown {
                Some(cooldown) if exhaustion.at.elapsed() >= cooldown => {
                    info!(device = %self.identity.device, "Retry cooldown elapsed, restoring budget");
                    self.restore_budget(&mut inner);
                }
                _ => {
                    return Err(ConnectorError::exhausted(
                        exhaustion.attempts,
                        Some(exhaustion.last),
                    ))
                }
            }
        }

        self.connect_with_retry(&mut inner).await
    }

    async fn connect_with_retry(
        &self,
        inner: &mut SupervisorInner,
    ) -> ConnectorResult<SessionGeneration> {
        let mut attempts = 0u32;

        loop {
            self.set_state(ConnectorState::Connecting);

            // No handshake without a valid token
            let credential = match self.issuer.issue(&self.identity) {
                Ok(credential) => credential,
                Err(e) => {
                    error!(device = %self.identity.device, "Credential issuance failed: {}", e);
                    self.set_state(ConnectorState::Failed);
                    return Err(ConnectorError::Issuance(e));
                }
            };

            attempts += 1;
            self.handshake_attempts.fetch_add(1, Ordering::SeqCst);

            let span = crate::mqtt_span!(
                operation = "connect",
                device = %self.identity.device,
                attempt = attempts
            );
            let error = match self.transport.connect(&credential).instrument(span).await {
                Ok(()) => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.set_state(ConnectorState::Connected);
                    info!(
                        device = %self.identity.device,
                        attempts,
                        attempts_remaining = inner.budget.attempts_remaining,
                        "Connected to broker"
                    );
                    return Ok(generation);
                }
                Err(e) => e,
            };

            self.set_state(ConnectorState::Failed);

            if inner.budget.attempts_remaining == 0 {
                error!(
                    device = %self.identity.device,
                    attempts,
                    "Connection failed and retry budget is exhausted: {}",
                    error
                );
                let last = Arc::new(error);
                inner.exhaustion = Some(Exhaustion {
                    at: Instant::now(),
                    attempts,
                    last: last.clone(),
                });
                return Err(ConnectorError::exhausted(attempts, Some(last)));
            }

            inner.budget.attempts_remaining -= 1;
            self.attempts_remaining
                .store(inner.budget.attempts_remaining, Ordering::SeqCst);

            let consumed = self.policy.max_attempts - inner.budget.attempts_remaining;
            let delay = self.policy.delay_for(consumed);
            warn!(
                device = %self.identity.device,
                attempt = attempts,
                attempts_remaining = inner.budget.attempts_remaining,
                delay_ms = delay.as_millis() as u64,
                "Connection attempt failed, retrying: {}",
                error
            );

            tokio::time::sleep(delay).await;
        }
    }

    fn restore_budget(&self, inner: &mut SupervisorInner) {
        inner.budget.attempts_remaining = self.policy.max_attempts;
        inner.exhaustion = None;
        self.attempts_remaining
            .store(self.policy.max_attempts, Ordering::SeqCst);
    }

    /// Restore the full budget after external intervention
    pub async fn reset_budget(&self) {
        let mut inner = self.inner.lock().await;
        self.restore_budget(&mut inner);
        if self.state() == ConnectorState::Failed {
            self.set_state(ConnectorState::Disconnected);
        }
        info!(device = %self.identity.device, "Retry budget reset");
    }

    /// Explicitly close the session
    pub async fn teardown(&self, grace: Duration) {
        let inner = self.inner.lock().await;
        self.transport.disconnect(grace).await;

        // A depleted budget keeps the connector in its terminal state
        if inner.exhaustion.is_none() {
            self.set_state(ConnectorState::Disconnected);
        }
        info!(device = %self.identity.device, "Session torn down");
    }

    /// Close the session identified by `generation` after a fatal local error
    ///
    /// A newer session established by another caller in the meantime is left
    /// untouched.
    pub async fn invalidate(&self, generation: SessionGeneration) {
        let _inner = self.inner.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation
            || self.state() != ConnectorState::Connected
        {
            return;
        }

        warn!(device = %self.identity.device, generation, "Dropping unusable session");
        self.transport.disconnect(self.disconnect_grace).await;
        self.set_state(ConnectorState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingIssuer, MockTransport, StaticIssuer};

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("proj", "region", "reg", "dev-1").unwrap()
    }

    fn refused() -> TransportError {
        TransportError::ConnectionRefused("NotAuthorized".to_string())
    }

    fn supervisor(
        transport: Arc<MockTransport>,
        policy: RetryPolicy,
    ) -> Supervisor<MockTransport> {
        Supervisor::new(identity(), transport, Arc::new(StaticIssuer::new()), policy)
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(5));
        assert_eq!(policy.backoff, Backoff::Fixed);
        assert_eq!(policy.delay_for(1), policy.delay_for(4));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 40,
            delay: Duration::from_millis(100),
            backoff: Backoff::Exponential {
                max: Duration::from_secs(1),
            },
            cooldown: None,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[test]
    fn test_policy_from_retry_section() {
        let section = RetrySection {
            max_attempts: 3,
            delay_ms: 100,
            backoff: BackoffKind::Exponential,
            max_delay_ms: 800,
            cooldown_secs: Some(30),
        };

        let policy = RetryPolicy::from(&section);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_millis(100));
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                max: Duration::from_millis(800)
            }
        );
        assert_eq!(policy.cooldown, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_success_before_exhaustion_ends_connected() {
        let transport = Arc::new(MockTransport::with_connect_results(vec![
            Err(refused()),
            Err(refused()),
            Ok(()),
        ]));
        let supervisor = supervisor(transport.clone(), RetryPolicy::fixed(2, Duration::ZERO));

        supervisor.ensure_connected().await.unwrap();

        assert_eq!(supervisor.state(), ConnectorState::Connected);
        assert_eq!(supervisor.handshake_attempts(), 3);
        assert_eq!(supervisor.attempts_remaining(), 0);
        assert_eq!(transport.connect_calls(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_ends_failed() {
        let transport = Arc::new(MockTransport::with_connect_results(vec![
            Err(refused()),
            Err(refused()),
            Err(refused()),
        ]));
        let supervisor = supervisor(transport.clone(), RetryPolicy::fixed(2, Duration::ZERO));

        let error = supervisor.ensure_connected().await.unwrap_err();

        match error {
            ConnectorError::ExhaustedRetry { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(
                    last.as_deref(),
                    Some(TransportError::ConnectionRefused(_))
                ));
            }
            other => panic!("expected ExhaustedRetry, got {other:?}"),
        }
        assert_eq!(supervisor.state(), ConnectorState::Failed);
        assert_eq!(supervisor.attempts_remaining(), 0);
    }

    #[tokio::test]
    async fn test_terminal_state_makes_no_further_handshake() {
        let transport = Arc::new(MockTransport::with_connect_results(vec![Err(refused())]));
        let supervisor = supervisor(transport.clone(), RetryPolicy::fixed(0, Duration::ZERO));

        assert!(supervisor.ensure_connected().await.unwrap_err().is_terminal());
        assert_eq!(transport.connect_calls(), 1);

        let again = supervisor.ensure_connected().await.unwrap_err();
        assert!(again.is_terminal());
        assert_eq!(transport.connect_calls(), 1);

        // The cause of the exhausting failure is still reported
        match again {
            ConnectorError::ExhaustedRetry { attempts, last } => {
                assert_eq!(attempts, 1);
                assert!(matches!(
                    last.as_deref(),
                    Some(TransportError::ConnectionRefused(code)) if code == "NotAuthorized"
                ));
            }
            other => panic!("expected ExhaustedRetry, got {other:?}"),
        }
        assert_eq!(supervisor.state(), ConnectorState::Failed);
    }

    #[tokio::test]
    async fn test_reset_budget_allows_new_attempts() {
        let transport = Arc::new(MockTransport::with_connect_results(vec![Err(refused())]));
        let supervisor = supervisor(transport.clone(), RetryPolicy::fixed(0, Duration::ZERO));

        assert!(supervisor.ensure_connected().await.is_err());
        supervisor.reset_budget().await;
        assert_eq!(supervisor.state(), ConnectorState::Disconnected);

        supervisor.ensure_connected().await.unwrap();
        assert_eq!(supervisor.state(), ConnectorState::Connected);
        assert_eq!(transport.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_restores_budget() {
        let transport = Arc::new(MockTransport::with_connect_results(vec![Err(refused())]));
        let policy = RetryPolicy {
            cooldown: Some(Duration::from_secs(60)),
            ..RetryPolicy::fixed(0, Duration::ZERO)
        };
        let supervisor = supervisor(transport.clone(), policy);

        assert!(supervisor.ensure_connected().await.is_err());
        assert!(supervisor.ensure_connected().await.unwrap_err().is_terminal());
        assert_eq!(transport.connect_calls(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;

        supervisor.ensure_connected().await.unwrap();
        assert_eq!(transport.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_issuance_failure_aborts_without_handshake() {
        let transport = Arc::new(MockTransport::new());
        let supervisor = Supervisor::new(
            identity(),
            transport.clone(),
            Arc::new(FailingIssuer),
            RetryPolicy::fixed(3, Duration::ZERO),
        );

        let error = supervisor.ensure_connected().await.unwrap_err();

        assert!(matches!(error, ConnectorError::Issuance(_)));
        assert!(!error.is_terminal());
        assert_eq!(transport.connect_calls(), 0);
        assert_eq!(supervisor.attempts_remaining(), 3);
        assert_eq!(supervisor.state(), ConnectorState::Failed);
    }

    #[tokio::test]
    async fn test_fresh_credential_per_attempt() {
        let transport = Arc::new(MockTransport::with_connect_results(vec![
            Err(refused()),
            Ok(()),
        ]));
        let issuer = Arc::new(StaticIssuer::new());
        let supervisor = Supervisor::new(
            identity(),
            transport.clone(),
            issuer.clone(),
            RetryPolicy::fixed(1, Duration::ZERO),
        );

        supervisor.ensure_connected().await.unwrap();

        assert_eq!(issuer.issued(), 2);
        let tokens = transport.tokens_seen().await;
        assert_eq!(tokens.len(), 2);
        assert_ne!(tokens[0], tokens[1]);
    }

    #[tokio::test]
    async fn test_connected_session_needs_no_handshake() {
        let transport = Arc::new(MockTransport::new());
        let supervisor = supervisor(transport.clone(), RetryPolicy::default());

        let first = supervisor.ensure_connected().await.unwrap();
        let second = supervisor.ensure_connected().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_detected_loss_reconnects() {
        let transport = Arc::new(MockTransport::new());
        let supervisor = supervisor(transport.clone(), RetryPolicy::default());

        let first = supervisor.ensure_connected().await.unwrap();
        transport.drop_connection();

        let second = supervisor.ensure_connected().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(transport.connect_calls(), 2);
        assert_eq!(supervisor.state(), ConnectorState::Connected);
    }

    #[tokio::test]
    async fn test_teardown_and_stale_invalidate() {
        let transport = Arc::new(MockTransport::new());
        let supervisor = supervisor(transport.clone(), RetryPolicy::default());

        let stale = supervisor.ensure_connected().await.unwrap();
        supervisor.teardown(Duration::ZERO).await;
        assert_eq!(supervisor.state(), ConnectorState::Disconnected);

        let current = supervisor.ensure_connected().await.unwrap();
        supervisor.invalidate(stale).await;
        assert_eq!(supervisor.state(), ConnectorState::Connected);

        supervisor.invalidate(current).await;
        assert_eq!(supervisor.state(), ConnectorState::Disconnected);
    }

    #[tokio::test]
    async fn test_state_transitions_are_observable() {
        let transport = Arc::new(MockTransport::new());
        let supervisor = supervisor(transport, RetryPolicy::default());
        let mut states = supervisor.subscribe();

        assert_eq!(*states.borrow(), ConnectorState::Disconnected);
        supervisor.ensure_connected().await.unwrap();

        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectorState::Connected);
    }
}
