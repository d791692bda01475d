//! Retry and timeout policy for outbound RPCs.
//!
//! [`call_with_retries`] wraps a single logical call. Every attempt of that
//! call shares one idempotency key; attempts are retried on transient gRPC
//! status codes with exponential backoff until the retry budget, the absolute
//! deadline, or the caller's context runs out.

use crate::context::CallContext;
use crate::error::{Result, TransportError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Code, Request, Status};
use uuid::Uuid;

/// Retries for account-level RPCs.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// First backoff delay for account-level RPCs.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Backoff cap for account-level RPCs.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1);

pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Status codes that are always retried.
pub const RETRYABLE_CODES: [Code; 5] = [
    Code::DeadlineExceeded,
    Code::Unavailable,
    Code::Cancelled,
    Code::Internal,
    Code::Unknown,
];

const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
const RETRY_ATTEMPT_HEADER: &str = "x-retry-attempt";
const RETRY_DELAY_HEADER: &str = "x-retry-delay";

// ============================================================================
// Options
// ============================================================================

/// Retry behaviour for one logical call.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Maximum number of retries after the first attempt. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single backoff delay.
    pub max_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
    /// Codes retried in addition to [`RETRYABLE_CODES`].
    pub additional_codes: Vec<Code>,
    /// Absolute deadline for the whole call, retries included.
    pub deadline: Option<Instant>,
    /// Timeout applied to each individual attempt.
    pub timeout: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::rpc()
    }
}

impl RetryOptions {
    /// Policy for control-plane RPCs: 3 retries, 100ms doubling up to 1s.
    pub fn rpc() -> Self {
        Self {
            max_retries: Some(DEFAULT_RETRY_ATTEMPTS),
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            additional_codes: Vec::new(),
            deadline: None,
            timeout: None,
        }
    }

    /// Policy for command-router calls: 10 retries, 10ms doubling up to 5s.
    pub fn session() -> Self {
        Self {
            max_retries: Some(10),
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(5),
            ..Self::rpc()
        }
    }

    /// Policy for long-polling exec waits: fixed 1s delay, unbounded retries,
    /// 60s per attempt.
    pub fn exec_wait() -> Self {
        Self {
            max_retries: None,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            multiplier: 1.0,
            timeout: Some(Duration::from_secs(60)),
            ..Self::rpc()
        }
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Also retry on `code`.
    pub fn with_additional_code(mut self, code: Code) -> Self {
        if !self.additional_codes.contains(&code) {
            self.additional_codes.push(code);
        }
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether a failure with `code` may be retried under these options.
    pub fn is_retryable(&self, code: Code) -> bool {
        RETRYABLE_CODES.contains(&code) || self.additional_codes.contains(&code)
    }

    /// Check that the backoff parameters are within sane bounds.
    pub fn validate(&self) -> Result<()> {
        if !(1.0..=10.0).contains(&self.multiplier) {
            return Err(TransportError::InvalidArgument(format!(
                "backoff multiplier must be between 1 and 10, got {}",
                self.multiplier
            )));
        }
        if self.base_delay > Duration::from_secs(60) {
            return Err(TransportError::InvalidArgument(format!(
                "base delay must be at most 60s, got {:?}",
                self.base_delay
            )));
        }
        if self.max_delay < Duration::from_millis(1) || self.max_delay > Duration::from_secs(60) {
            return Err(TransportError::InvalidArgument(format!(
                "max delay must be between 1ms and 60s, got {:?}",
                self.max_delay
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(TransportError::InvalidArgument(
                "max delay must not be smaller than base delay".into(),
            ));
        }
        Ok(())
    }

    /// Delay to use after `delay` has been slept.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// ============================================================================
// Attempt metadata
// ============================================================================

/// Per-attempt information handed to the wrapped call.
#[derive(Debug, Clone)]
pub struct Attempt {
    idempotency_key: String,
    number: u32,
    elapsed: Duration,
    deadline: Option<Instant>,
}

impl Attempt {
    /// Key shared by every attempt of the same logical call.
    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    /// Zero-based attempt number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Time since the first attempt started.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Deadline for this attempt, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Attach retry metadata and the attempt timeout to `request`.
    pub fn apply<T>(&self, request: &mut Request<T>) {
        let metadata = request.metadata_mut();
        insert_ascii(metadata, IDEMPOTENCY_KEY_HEADER, &self.idempotency_key);
        insert_ascii(metadata, RETRY_ATTEMPT_HEADER, &self.number.to_string());
        insert_ascii(
            metadata,
            RETRY_DELAY_HEADER,
            &format!("{:.3}", self.elapsed.as_secs_f64()),
        );

        if let Some(deadline) = self.deadline {
            request.set_timeout(deadline.saturating_duration_since(Instant::now()));
        }
    }

    /// Wrap `message` in a request carrying this attempt's metadata.
    pub fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        self.apply(&mut request);
        request
    }
}

pub(crate) fn insert_ascii(metadata: &mut tonic::metadata::MetadataMap, key: &'static str, value: &str) {
    match value.parse::<MetadataValue<Ascii>>() {
        Ok(value) => {
            metadata.insert(key, value);
        }
        Err(_) => tracing::warn!(header = key, "dropping non-ASCII metadata value"),
    }
}

// ============================================================================
// Retry loop
// ============================================================================

fn min_deadline(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Run `call` until it succeeds or stops being retryable.
///
/// Errors without a gRPC status, and statuses outside the retryable set, are
/// returned immediately. When the retry budget is spent the last error is
/// returned unchanged. If the absolute deadline has passed, or the next
/// backoff would overrun it, the call fails with
/// [`TransportError::DeadlineExceeded`] without issuing another attempt.
pub async fn call_with_retries<T, F, Fut>(
    ctx: &CallContext,
    options: &RetryOptions,
    mut call: F,
) -> Result<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    options.validate()?;

    let idempotency_key = Uuid::new_v4().to_string();
    let key_prefix = idempotency_key[..8].to_string();
    let start = Instant::now();
    let mut delay = options.base_delay;
    let mut retries = 0u32;

    loop {
        ctx.check()?;

        let now = Instant::now();
        if options.deadline.is_some_and(|deadline| now >= deadline) {
            return Err(TransportError::DeadlineExceeded("deadline exceeded".into()));
        }

        let local_deadline = min_deadline(
            options.deadline,
            options.timeout.and_then(|t| now.checked_add(t)),
        );
        let attempt = Attempt {
            idempotency_key: idempotency_key.clone(),
            number: retries,
            elapsed: now - start,
            deadline: min_deadline(local_deadline, ctx.deadline()),
        };

        let fut = call(attempt);
        let result = match local_deadline {
            Some(deadline) => {
                ctx.run(async move {
                    match tokio::time::timeout_at(deadline, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(Status::deadline_exceeded("attempt timed out").into()),
                    }
                })
                .await
            }
            None => ctx.run(fut).await,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let Some(code) = err.status_code() else {
            return Err(err);
        };
        if !options.is_retryable(code) {
            return Err(err);
        }

        if options.max_retries.is_some_and(|max| retries >= max) {
            tracing::debug!(
                idempotency_key = %key_prefix,
                attempt = retries,
                elapsed_ms = start.elapsed().as_millis() as u64,
                code = ?code,
                "Final retry attempt failed"
            );
            return Err(err);
        }

        if options
            .deadline
            .is_some_and(|deadline| Instant::now() + delay > deadline)
        {
            return Err(TransportError::DeadlineExceeded("deadline exceeded".into()));
        }

        tracing::debug!(
            idempotency_key = %key_prefix,
            attempt = retries,
            delay_ms = delay.as_millis() as u64,
            code = ?code,
            error = %err,
            "Retryable failure, backing off"
        );

        ctx.sleep(delay).await?;
        delay = options.next_delay(delay);
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_default_options() {
        let options = RetryOptions::default();
        assert_eq!(options.max_retries, Some(3));
        assert_eq!(options.base_delay, Duration::from_millis(100));
        assert_eq!(options.max_delay, Duration::from_secs(1));
        assert_eq!(options.multiplier, 2.0);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(RetryOptions::session().validate().is_ok());
        assert!(RetryOptions::exec_wait().validate().is_ok());
        assert_eq!(RetryOptions::exec_wait().max_retries, None);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        assert!(RetryOptions::rpc().with_multiplier(0.5).validate().is_err());
        assert!(RetryOptions::rpc().with_multiplier(11.0).validate().is_err());
        assert!(RetryOptions::rpc()
            .with_base_delay(Duration::from_secs(61))
            .validate()
            .is_err());
        assert!(RetryOptions::rpc()
            .with_base_delay(Duration::from_secs(2))
            .validate()
            .is_err());
    }

    #[test]
    fn test_retryable_codes() {
        let options = RetryOptions::rpc();
        for code in RETRYABLE_CODES {
            assert!(options.is_retryable(code));
        }
        assert!(!options.is_retryable(Code::NotFound));
        assert!(options
            .with_additional_code(Code::NotFound)
            .is_retryable(Code::NotFound));
    }

    #[test]
    fn test_next_delay_is_capped() {
        let options = RetryOptions::rpc();
        assert_eq!(options.next_delay(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(options.next_delay(Duration::from_millis(800)), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_attempt_metadata() {
        let attempt = Attempt {
            idempotency_key: "0f7d2b4c-key".into(),
            number: 2,
            elapsed: Duration::from_millis(1500),
            deadline: None,
        };
        let request = attempt.request(());
        let metadata = request.metadata();
        assert_eq!(metadata.get("x-idempotency-key").unwrap().to_str().unwrap(), "0f7d2b4c-key");
        assert_eq!(metadata.get("x-retry-attempt").unwrap().to_str().unwrap(), "2");
        assert_eq!(metadata.get("x-retry-delay").unwrap().to_str().unwrap(), "1.500");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idempotency_key_stable_across_attempts() {
        let keys = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&keys);
        let result: Result<()> = call_with_retries(&CallContext::new(), &RetryOptions::rpc(), |attempt| {
            seen.lock().unwrap().push(attempt.idempotency_key().to_string());
            async { Err(TransportError::from(Status::unavailable("down"))) }
        })
        .await;

        assert!(result.is_err());
        let keys = keys.lock().unwrap();
        assert_eq!(keys.len(), 4);
        assert!(keys.iter().all(|k| k == &keys[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_status_error_not_retried() {
        let mut calls = 0;
        let result: Result<()> = call_with_retries(&CallContext::new(), &RetryOptions::rpc(), |_| {
            calls += 1;
            async { Err(TransportError::Stream("boom".into())) }
        })
        .await;

        assert!(matches!(result, Err(TransportError::Stream(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let mut calls = 0;
        let options = RetryOptions::rpc().with_timeout(Duration::from_millis(50));
        let result = call_with_retries(&CallContext::new(), &options, |_| {
            calls += 1;
            let first = calls == 1;
            async move {
                if first {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, TransportError>(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_attempt_timeout_is_unbounded() {
        let options = RetryOptions::rpc().with_timeout(Duration::MAX);
        let result = call_with_retries(&CallContext::new(), &options, |attempt| async move {
            assert!(attempt.deadline.is_none());
            Ok::<_, TransportError>("ok")
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_overrun_by_backoff() {
        let mut calls = 0;
        let options = RetryOptions::rpc()
            .with_base_delay(Duration::from_millis(500))
            .with_deadline(Some(Instant::now() + Duration::from_millis(100)));
        let result: Result<()> = call_with_retries(&CallContext::new(), &options, |_| {
            calls += 1;
            async { Err(TransportError::from(Status::unavailable("down"))) }
        })
        .await;

        assert!(matches!(result, Err(TransportError::DeadlineExceeded(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_backoff() {
        let ctx = CallContext::new();
        let canceller = ctx.clone();
        let options = RetryOptions::rpc().with_base_delay(Duration::from_secs(1));
        let task = tokio::spawn(async move {
            call_with_retries(&ctx, &options, |_| async {
                Err::<(), _>(TransportError::from(Status::unavailable("down")))
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }
}
