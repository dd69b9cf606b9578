//! Scriptable in-process driver for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ksi_core::SessionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::driver::{ProviderDriver, ProviderError, ProviderReply, ProviderRequest, ProviderUsage};

/// One scripted behaviour for the next [`MockDriver::run`] call.
#[derive(Debug, Clone)]
pub enum MockScript {
    /// Succeed with `text`. With `new_session = true` a fresh session id is
    /// minted even when the request continues an existing session.
    Succeed {
        /// Result text.
        text: String,
        /// Mint a fresh session id instead of echoing the request's.
        new_session: bool,
    },
    /// Fail with a retryable (transient) error.
    FailTransient(String),
    /// Fail with a non-retryable error.
    FailFatal(String),
    /// Never terminate; only cancellation ends the call.
    Hang,
}

/// In-process driver with scripted replies.
///
/// Unscripted calls succeed, echoing the prompt and minting
/// `mock-sess-<n>` ids the way a real provider mints a fresh id per turn.
pub struct MockDriver {
    name: String,
    delay: Duration,
    scripts: Mutex<VecDeque<MockScript>>,
    minted: AtomicU64,
}

impl std::fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDriver")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// A mock named `"mock"` with no artificial delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "mock".to_owned(),
            delay: Duration::ZERO,
            scripts: Mutex::new(VecDeque::new()),
            minted: AtomicU64::new(0),
        }
    }

    /// Sleep this long (cancellation-aware) before each reply.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue a scripted behaviour; scripts are consumed in FIFO order.
    pub fn push_script(&self, script: MockScript) {
        self.scripts
            .lock()
            .expect("mock script lock poisoned")
            .push_back(script);
    }

    /// How many session ids this mock has minted so far.
    #[must_use]
    pub fn minted_sessions(&self) -> u64 {
        self.minted.load(Ordering::SeqCst)
    }

    fn mint(&self) -> SessionId {
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        SessionId::from(format!("mock-sess-{n}"))
    }
}

#[async_trait]
impl ProviderDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        request: ProviderRequest,
        progress: mpsc::Sender<serde_json::Value>,
        cancel: CancellationToken,
    ) -> Result<ProviderReply, ProviderError> {
        let script = self
            .scripts
            .lock()
            .expect("mock script lock poisoned")
            .pop_front();

        if !self.delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                () = tokio::time::sleep(self.delay) => {},
            }
        }

        let _ = progress
            .send(serde_json::json!({"stage": "generating"}))
            .await;

        match script {
            Some(MockScript::FailTransient(message)) => Err(ProviderError::Transient(message)),
            Some(MockScript::FailFatal(message)) => Err(ProviderError::Failed(message)),
            Some(MockScript::Hang) => {
                cancel.cancelled().await;
                Err(ProviderError::Cancelled)
            },
            Some(MockScript::Succeed { text, new_session }) => {
                let session_id = if new_session {
                    self.mint()
                } else {
                    request.session_id.clone().unwrap_or_else(|| self.mint())
                };
                Ok(ProviderReply {
                    session_id,
                    result: serde_json::Value::String(text),
                    usage: ProviderUsage {
                        input_tokens: 1,
                        output_tokens: 1,
                    },
                })
            },
            None => Ok(ProviderReply {
                session_id: self.mint(),
                result: serde_json::json!(format!(
                    "echo: {}",
                    request.prompt.as_str().unwrap_or_default()
                )),
                usage: ProviderUsage {
                    input_tokens: 1,
                    output_tokens: 1,
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(session: Option<&str>) -> ProviderRequest {
        ProviderRequest {
            provider: "mock".into(),
            model: "m".into(),
            prompt: serde_json::json!("hi"),
            session_id: session.map(SessionId::from),
            options: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_default_reply_mints_fresh_sessions() {
        let driver = MockDriver::new();
        let (tx, _rx) = mpsc::channel(8);
        let first = driver
            .run(request(None), tx.clone(), CancellationToken::new())
            .await
            .unwrap();
        let second = driver
            .run(request(None), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(driver.minted_sessions(), 2);
    }

    #[tokio::test]
    async fn test_scripts_run_in_order() {
        let driver = MockDriver::new();
        driver.push_script(MockScript::FailTransient("blip".into()));
        driver.push_script(MockScript::Succeed {
            text: "ok".into(),
            new_session: false,
        });
        let (tx, _rx) = mpsc::channel(8);
        let err = driver
            .run(request(None), tx.clone(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transient(_)));
        let reply = driver
            .run(request(Some("s-1")), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.session_id.as_str(), "s-1");
    }

    #[tokio::test]
    async fn test_hang_honours_cancellation() {
        let driver = MockDriver::new();
        driver.push_script(MockScript::Hang);
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });
        let err = driver
            .run(request(None), tx, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }
}
