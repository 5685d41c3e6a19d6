use crate::error::{GatewayError, ProviderError};
use crate::prompt::{build_prompt, parse_variants};
use crate::provider::GenerationProvider;
use crate::retry::RetryPolicy;
use inbox_core::config::GatewayConfig;
use inbox_core::types::DraftVariant;
use inbox_core::NormalizedInput;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Caller-side bounds on a generation call: an optional deadline and a
/// cancellation token. Either one stops further attempts immediately.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Handle the caller keeps to cancel the call.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the token fires or the deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

/// Parsed provider output.
#[derive(Debug, Clone)]
pub struct GeneratedVariants {
    pub variants: Vec<DraftVariant>,
    /// How many entries of `variants` are synthetic padding.
    pub placeholders: usize,
    pub attempts: u32,
    pub provider: String,
}

pub struct GenerationGateway {
    provider: Arc<dyn GenerationProvider>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl GenerationGateway {
    pub fn new(provider: Arc<dyn GenerationProvider>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            provider,
            policy,
            call_timeout,
        }
    }

    pub fn from_config(provider: Arc<dyn GenerationProvider>, config: &GatewayConfig) -> Self {
        Self::new(
            provider,
            RetryPolicy::from(&config.retry),
            Duration::from_millis(config.call_timeout_ms),
        )
    }

    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Generate variants for `input`, retrying transient failures per policy.
    pub async fn generate(
        &self,
        input: &NormalizedInput,
        ctx: &CallContext,
    ) -> Result<GeneratedVariants, GatewayError> {
        let prompt = build_prompt(input);
        let provider = self.provider.provider_name().to_string();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = ProviderError::Unavailable("no attempt made".to_string());

        for attempt in 0..max_attempts {
            if ctx.is_cancelled() {
                return Err(self.cancelled(attempt));
            }

            metrics::counter!("gateway.attempts", "provider" => provider.clone()).increment(1);
            let started = Instant::now();
            let call = tokio::time::timeout(self.call_timeout, self.provider.generate_raw(&prompt));

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(self.cancelled(attempt + 1)),
                outcome = call => outcome.unwrap_or(Err(ProviderError::Timeout)),
            };
            metrics::histogram!("gateway.call_ms", "provider" => provider.clone())
                .record(started.elapsed().as_secs_f64() * 1000.0);

            match outcome {
                Ok(raw) => {
                    let parsed = parse_variants(&raw, input.options());
                    if parsed.placeholders > 0 {
                        metrics::counter!("gateway.placeholders").increment(parsed.placeholders as u64);
                        warn!(
                            provider = %provider,
                            placeholders = parsed.placeholders,
                            "Provider returned fewer usable lines than requested"
                        );
                    }
                    info!(provider = %provider, attempts = attempt + 1, "Generation succeeded");
                    return Ok(GeneratedVariants {
                        variants: parsed.variants,
                        placeholders: parsed.placeholders,
                        attempts: attempt + 1,
                        provider,
                    });
                }
                Err(e) if !e.is_retryable() => {
                    metrics::counter!("gateway.failures", "cause" => "rejected").increment(1);
                    warn!(provider = %provider, error = %e, "Provider rejected request, not retrying");
                    return Err(GatewayError::Upstream {
                        attempts: attempt + 1,
                        message: e.to_string(),
                    });
                }
                Err(e) => last_error = e,
            }

            if attempt + 1 == max_attempts {
                break;
            }

            let mut delay = self.policy.delay_for_attempt(attempt, &mut rand::thread_rng());
            if let ProviderError::RateLimited {
                retry_after: Some(hint),
            } = &last_error
            {
                delay = delay.max(*hint).min(Duration::from_millis(self.policy.max_delay_ms));
            }
            metrics::counter!("gateway.retries", "provider" => provider.clone()).increment(1);
            warn!(
                provider = %provider,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Generation attempt failed, backing off"
            );

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(self.cancelled(attempt + 1)),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        metrics::counter!("gateway.failures", "cause" => "exhausted").increment(1);
        warn!(provider = %provider, attempts = max_attempts, error = %last_error, "Generation retries exhausted");
        Err(GatewayError::exhausted(last_error, max_attempts))
    }

    fn cancelled(&self, attempts: u32) -> GatewayError {
        metrics::counter!("gateway.failures", "cause" => "cancelled").increment(1);
        info!(attempts = attempts, "Generation cancelled by caller");
        GatewayError::Cancelled { attempts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::Prompt;
    use async_trait::async_trait;
    use inbox_core::content::{GenerationOptions, GenerationRequest};
    use scripted::Script;

    /// Scripted provider: pops one outcome per call.
    mod scripted {
        use super::*;
        use std::collections::VecDeque;
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Mutex;

        pub struct Script {
            outcomes: Mutex<VecDeque<Result<String, ProviderError>>>,
            pub calls: AtomicU32,
            pub stall: Option<Duration>,
        }

        impl Script {
            pub fn new(outcomes: Vec<Result<String, ProviderError>>) -> Self {
                Self {
                    outcomes: Mutex::new(outcomes.into()),
                    calls: AtomicU32::new(0),
                    stall: None,
                }
            }

            pub fn calls(&self) -> u32 {
                self.calls.load(Ordering::SeqCst)
            }
        }

        #[async_trait]
        impl GenerationProvider for Script {
            fn provider_name(&self) -> &str {
                "script"
            }

            async fn generate_raw(&self, _prompt: &Prompt) -> Result<String, ProviderError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(stall) = self.stall {
                    tokio::time::sleep(stall).await;
                }
                let next = self.outcomes.lock().unwrap().pop_front();
                next.unwrap_or_else(|| Err(ProviderError::Unavailable("script exhausted".into())))
            }
        }
    }

    fn input() -> NormalizedInput {
        let request = GenerationRequest {
            email_content: "Members get early access to the autumn sale.".to_string(),
            original_subject: None,
            max_variants: Some(3),
            max_length: None,
        };
        NormalizedInput::new(
            &request,
            GenerationOptions {
                max_variants: 5,
                max_length: 60,
            },
        )
        .unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }

    fn unavailable() -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable("503".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifth_attempt_success_within_backoff_bounds() {
        let script = Arc::new(Script::new(vec![
            unavailable(),
            unavailable(),
            unavailable(),
            unavailable(),
            Ok("1. Early access starts now\n2. Members first\n3. Your autumn preview".into()),
        ]));
        let gateway = GenerationGateway::new(script.clone(), policy(), Duration::from_secs(5));

        let start = Instant::now();
        let generated = gateway.generate(&input(), &CallContext::new()).await.unwrap();
        let waited = start.elapsed();

        assert_eq!(script.calls(), 5);
        assert_eq!(generated.attempts, 5);
        assert_eq!(generated.placeholders, 0);
        assert_eq!(generated.variants[0].text, "Early access starts now");

        // 100 + 200 + 400 + 800 ms, each scaled by a factor in [0.5, 1.0].
        let (lo, hi) = policy().total_wait_bounds();
        assert_eq!(hi, Duration::from_millis(1500));
        assert!(waited >= lo && waited <= hi + Duration::from_millis(5), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_terminal_cause() {
        let rate_limited = || Err(ProviderError::RateLimited { retry_after: None });
        let script = Arc::new(Script::new(vec![
            unavailable(),
            rate_limited(),
            rate_limited(),
        ]));
        let mut policy = policy();
        policy.max_attempts = 3;
        let gateway = GenerationGateway::new(script.clone(), policy, Duration::from_secs(5));

        let err = gateway.generate(&input(), &CallContext::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { attempts: 3 }));
        assert_eq!(script.calls(), 3);

        let script = Arc::new(Script::new(vec![unavailable(), unavailable()]));
        let mut policy = self::policy();
        policy.max_attempts = 2;
        let gateway = GenerationGateway::new(script, policy, Duration::from_secs(5));
        let err = gateway.generate(&input(), &CallContext::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried_then_reported() {
        let mut script = Script::new(vec![]);
        script.stall = Some(Duration::from_secs(60));
        let script = Arc::new(script);
        let mut policy = policy();
        policy.max_attempts = 2;
        let gateway = GenerationGateway::new(script.clone(), policy, Duration::from_millis(500));

        let err = gateway.generate(&input(), &CallContext::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { attempts: 2 }));
        assert_eq!(script.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let script = Arc::new(Script::new(vec![Err(ProviderError::Rejected("401".into()))]));
        let gateway = GenerationGateway::new(script.clone(), policy(), Duration::from_secs(5));

        let err = gateway.generate(&input(), &CallContext::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { attempts: 1, .. }));
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff_stops_retries() {
        let script = Arc::new(Script::new(vec![unavailable(), unavailable(), unavailable()]));
        let mut policy = policy();
        policy.base_delay_ms = 10_000;
        policy.jitter = false;
        let gateway = Arc::new(GenerationGateway::new(script.clone(), policy, Duration::from_secs(5)));

        let ctx = CallContext::new();
        let token = ctx.token();
        let task = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.generate(&input(), &ctx).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err, GatewayError::Cancelled { attempts: 1 }));
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_cancels() {
        let script = Arc::new(Script::new(vec![unavailable(), unavailable()]));
        let mut policy = policy();
        policy.base_delay_ms = 10_000;
        let gateway = GenerationGateway::new(script.clone(), policy, Duration::from_secs(5));

        let ctx = CallContext::with_timeout(Duration::from_secs(2));
        let err = gateway.generate(&input(), &ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled { .. }));
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_extends_backoff() {
        let script = Arc::new(Script::new(vec![
            Err(ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(3)),
            }),
            Ok("1. Back in stock\n2. Members first\n3. Autumn preview".into()),
        ]));
        let gateway = GenerationGateway::new(script, policy(), Duration::from_secs(5));

        let start = Instant::now();
        gateway.generate(&input(), &CallContext::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
