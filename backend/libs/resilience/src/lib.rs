/// Resilience helpers for calls to external collaborators
///
/// - **Retry**: bounded attempts with exponential backoff and jitter
/// - **Backoff**: a reusable delay schedule for long-running consumer loops
/// - **Timeout**: time limits on individual calls
///
/// # Example: publish with retry and a per-attempt timeout
///
/// ```rust,no_run
/// use resilience::{with_retry, with_timeout_result, RetryConfig};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let result = with_retry(RetryConfig::default(), || async {
///         with_timeout_result(Duration::from_secs(2), async {
///             // Your broker call here
///             Ok::<_, String>(())
///         })
///         .await
///     })
///     .await;
///     assert!(result.is_ok());
/// }
/// ```

pub mod retry;
pub mod timeout;

pub use retry::{with_retry, with_retry_if, Backoff, RetryConfig, RetryError};
pub use timeout::{with_timeout, with_timeout_result, TimeoutError};
