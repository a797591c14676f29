//! Completion tokens
//!
//! Every user-initiated operation (publish, subscribe, unsubscribe,
//! disconnect) returns a single-shot token the caller can wait on. The
//! protocol logic activity fulfills the token when the terminating ack
//! arrives; completion is idempotent beyond the first call.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::ClientError;

struct FlowState {
    notify: Notify,
    fired: AtomicBool,
    completed: AtomicBool,
    error: Mutex<Option<ClientError>>,
}

impl FlowState {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            fired: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// First call wins; later calls are no-ops.
    fn finish(&self, err: Option<ClientError>) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.error.lock() = err;
        self.completed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// A single-shot completion handle.
///
/// Cloning yields another handle to the same flow. Also used directly for
/// unsubscribe and disconnect flows, which carry no extra payload.
#[derive(Clone)]
pub struct Token {
    state: Arc<FlowState>,
}

impl Token {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(FlowState::new()),
        }
    }

    /// Wait until the flow completes. Returns the flow's outcome.
    pub async fn wait(&self) -> Result<(), ClientError> {
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        loop {
            // Register before checking the flag so a completion between the
            // check and the await cannot be missed.
            notified.as_mut().enable();
            if self.state.completed.load(Ordering::Acquire) {
                return self.result();
            }
            notified.as_mut().await;
            notified.set(self.state.notify.notified());
        }
    }

    /// Wait with a deadline. `None` means the timeout elapsed first.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), ClientError>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Whether the flow has completed (ok or err)
    pub fn is_complete(&self) -> bool {
        self.state.completed.load(Ordering::Acquire)
    }

    /// The flow's error, if it completed with one
    pub fn error(&self) -> Option<ClientError> {
        if !self.is_complete() {
            return None;
        }
        self.state.error.lock().clone()
    }

    fn result(&self) -> Result<(), ClientError> {
        match self.state.error.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Complete the flow successfully. Idempotent.
    pub(crate) fn flow_complete(&self) {
        self.state.finish(None);
    }

    /// Complete the flow with an error. Idempotent.
    pub(crate) fn fail(&self, err: ClientError) {
        self.state.finish(Some(err));
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Token for an unsubscribe flow
pub type UnsubscribeToken = Token;

/// Token for a disconnect flow
pub type DisconnectToken = Token;

/// Token for a publish flow. Carries the message identifier once the
/// outbound writer stamps it (QoS > 0 only).
#[derive(Clone, Debug)]
pub struct PublishToken {
    base: Token,
    message_id: Arc<AtomicU16>,
}

impl PublishToken {
    pub(crate) fn new() -> Self {
        Self {
            base: Token::new(),
            message_id: Arc::new(AtomicU16::new(0)),
        }
    }

    /// Identifier assigned to the PUBLISH, 0 until stamped
    pub fn message_id(&self) -> u16 {
        self.message_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_message_id(&self, id: u16) {
        self.message_id.store(id, Ordering::Release);
    }

    pub fn token(&self) -> &Token {
        &self.base
    }

    pub async fn wait(&self) -> Result<(), ClientError> {
        self.base.wait().await
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), ClientError>> {
        self.base.wait_timeout(timeout).await
    }
}

/// Token for a subscribe flow. Carries the granted QoS per requested
/// filter once the SUBACK arrives.
#[derive(Clone, Debug)]
pub struct SubscribeToken {
    base: Token,
    filters: Arc<Vec<String>>,
    grants: Arc<Mutex<AHashMap<String, u8>>>,
}

impl SubscribeToken {
    pub(crate) fn new(filters: Vec<String>) -> Self {
        Self {
            base: Token::new(),
            filters: Arc::new(filters),
            grants: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    /// The filters this subscribe requested, in request order
    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Granted QoS per filter; 0x80 marks a broker-rejected filter.
    /// Empty until the SUBACK arrives.
    pub fn grants(&self) -> AHashMap<String, u8> {
        self.grants.lock().clone()
    }

    /// Record SUBACK grants against the requested filter order. A count
    /// mismatch is a protocol error.
    pub(crate) fn record_grants(&self, granted: &[u8]) -> Result<(), ClientError> {
        if granted.len() != self.filters.len() {
            return Err(ClientError::Protocol("SUBACK grant count mismatch"));
        }
        let mut grants = self.grants.lock();
        for (filter, &qos) in self.filters.iter().zip(granted) {
            grants.insert(filter.clone(), qos);
        }
        Ok(())
    }

    pub fn token(&self) -> &Token {
        &self.base
    }

    pub async fn wait(&self) -> Result<(), ClientError> {
        self.base.wait().await
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), ClientError>> {
        self.base.wait_timeout(timeout).await
    }
}

/// A flow awaiting a terminating ack, keyed by message identifier in the
/// registry. The match in the logic activity is exhaustive over these.
#[derive(Clone, Debug)]
pub(crate) enum PendingAck {
    Publish(PublishToken),
    Subscribe(SubscribeToken),
    Unsubscribe(UnsubscribeToken),
    Disconnect(DisconnectToken),
}

impl PendingAck {
    pub(crate) fn token(&self) -> &Token {
        match self {
            PendingAck::Publish(t) => t.token(),
            PendingAck::Subscribe(t) => t.token(),
            PendingAck::Unsubscribe(t) => t,
            PendingAck::Disconnect(t) => t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_after_complete() {
        let token = Token::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::task::yield_now().await;
        token.flow_complete();

        assert!(handle.await.unwrap().is_ok());
        assert!(token.is_complete());
        assert!(token.error().is_none());
    }

    #[tokio::test]
    async fn test_complete_before_wait() {
        let token = Token::new();
        token.flow_complete();
        assert!(token.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let token = Token::new();
        token.flow_complete();
        token.fail(ClientError::Stopped);
        token.flow_complete();

        // First completion wins
        assert!(token.wait().await.is_ok());
        assert!(token.error().is_none());
    }

    #[tokio::test]
    async fn test_error_completion() {
        let token = Token::new();
        token.fail(ClientError::NoIdsAvailable);
        assert!(matches!(
            token.wait().await,
            Err(ClientError::NoIdsAvailable)
        ));
        assert!(matches!(token.error(), Some(ClientError::NoIdsAvailable)));
    }

    #[tokio::test]
    async fn test_wait_timeout_elapses() {
        let token = Token::new();
        let result = token.wait_timeout(Duration::from_millis(20)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_grants_recorded_in_order() {
        let token = SubscribeToken::new(vec!["a".into(), "b/+".into(), "c/#".into()]);
        token.record_grants(&[0, 1, 0x80]).unwrap();
        let grants = token.grants();
        assert_eq!(grants["a"], 0);
        assert_eq!(grants["b/+"], 1);
        assert_eq!(grants["c/#"], 0x80);
    }

    #[tokio::test]
    async fn test_subscribe_grant_count_mismatch() {
        let token = SubscribeToken::new(vec!["a".into(), "b".into()]);
        assert!(token.record_grants(&[0]).is_err());
    }

    #[tokio::test]
    async fn test_publish_token_message_id() {
        let token = PublishToken::new();
        assert_eq!(token.message_id(), 0);
        token.set_message_id(17);
        assert_eq!(token.message_id(), 17);
    }
}
