//! Retry Subroutine
//!
//! Dispatches one message to a worker with bounded attempts. An unsuccessful
//! reply is retried when the policy lists `failure`; a dispatch error is
//! retried when it lists `exception`. Retries sleep
//! `backoff_factor * 2^attempt` seconds first.

use log::{debug, warn};

use crate::error::StepError;
use crate::registry::{Message, Response, Worker};
use crate::workflow::{RetryPolicy, RetryTrigger};

/// Result of a dispatch including every retry.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Invocations made, including the first
    pub attempts: u32,
    /// Last reply received, if any
    pub response: Option<Response>,
    /// `None` when the last reply was successful
    pub error: Option<StepError>,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Sends `message` to `worker`, retrying per `policy`.
pub async fn dispatch_with_retry(
    worker: &dyn Worker,
    message: &Message,
    policy: &RetryPolicy,
) -> DispatchOutcome {
    let mut attempt: u32 = 0;

    loop {
        let attempts = attempt + 1;

        let (trigger, error, response) = match worker.process_message(message.clone()).await {
            Ok(response) if response.is_success() => {
                debug!(
                    "Worker '{}' succeeded on attempt {}",
                    worker.agent_id(),
                    attempts
                );
                return DispatchOutcome {
                    attempts,
                    response: Some(response),
                    error: None,
                };
            }
            Ok(response) => {
                let reason = response
                    .error_message()
                    .unwrap_or("worker reported failure")
                    .to_string();
                (
                    RetryTrigger::Failure,
                    StepError::StepFailure(reason),
                    Some(response),
                )
            }
            Err(e) => (
                RetryTrigger::Exception,
                StepError::DispatchFailure {
                    agent: worker.agent_id().to_string(),
                    message: e.to_string(),
                },
                None,
            ),
        };

        if !policy.retries_on(trigger) {
            return DispatchOutcome {
                attempts,
                response,
                error: Some(error),
            };
        }

        if attempt >= policy.max_retries {
            return DispatchOutcome {
                attempts,
                response,
                error: Some(StepError::RetriesExhausted {
                    attempts,
                    last_error: error.to_string(),
                }),
            };
        }

        let delay = policy.backoff(attempt);
        warn!(
            "Attempt {} on worker '{}' failed ({}), retrying in {:.2?}",
            attempts,
            worker.agent_id(),
            trigger.as_str(),
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
