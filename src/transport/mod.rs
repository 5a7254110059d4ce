// Retrying transport: delivers requests over a `Channel`, retrying with backoff.
//
// Two modes: bounded retries for telemetry (fire-and-forget, dropped once the budget is
// spent) and retry-until-successful for Init. Retries sleep on the runtime timer; nothing
// blocks a thread while waiting. Failure logs carry `suppress_forwarding = true` so the
// log forwarding layer does not send them back through this transport.

pub mod backoff;
pub mod protocol;
pub mod tcp;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{CallError, TransportError};
pub use backoff::{Backoff, RetryPolicy};
pub use protocol::{Request, Response};
pub use tcp::TcpChannel;

/// One request/response exchange with the collector.
pub trait Channel: Send + Sync + 'static {
    fn call(&self, request: &Request) -> impl Future<Output = Result<Response, CallError>> + Send;
    /// Releases connection resources. Later calls fail with `CallError::Closed`.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub const DEFAULT_MAX_IN_FLIGHT: usize = 1000;
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub bounded: RetryPolicy,
    pub until_successful: RetryPolicy,
    /// Bounded calls held in memory at once (sending or waiting to retry).
    pub max_in_flight: usize,
    pub drain_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            bounded: RetryPolicy::bounded(),
            until_successful: RetryPolicy::until_successful(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

struct Inner<C> {
    channel: C,
    options: TransportOptions,
    in_flight: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    closed: AtomicBool,
}

pub struct RetryingTransport<C> {
    inner: Arc<Inner<C>>,
    runtime: Handle,
}

impl<C: Channel> RetryingTransport<C> {
    pub fn new(channel: C, runtime: Handle) -> Self {
        Self::with_options(channel, runtime, TransportOptions::default())
    }

    pub fn with_options(channel: C, runtime: Handle, options: TransportOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                in_flight: Arc::new(Semaphore::new(options.max_in_flight)),
                options,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
            runtime,
        }
    }

    pub fn channel(&self) -> &C {
        &self.inner.channel
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Bounded retries spawned on the runtime; returns immediately.
    /// `on_response` runs once, after the first successful delivery.
    pub fn call_with_a_few_retries<F>(&self, request: Request, on_response: F)
    where
        F: FnOnce(Response) + Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        let Ok(permit) = self.inner.in_flight.clone().try_acquire_owned() else {
            debug!(
                suppress_forwarding = true,
                request = request.name(),
                max_in_flight = self.inner.options.max_in_flight,
                "too many payloads awaiting delivery, dropping"
            );
            return;
        };
        let inner = self.inner.clone();
        self.inner.tracker.spawn_on(
            async move {
                let _permit = permit;
                let policy = inner.options.bounded;
                if let Some(response) = inner.send_with_retries(&request, policy).await {
                    on_response(response);
                }
            },
            &self.runtime,
        );
    }

    /// Retries until delivered. `None` only when the transport is closed or the collector
    /// rejects the request outright.
    pub async fn call_until_successful(&self, request: Request) -> Option<Response> {
        if self.is_closed() {
            return None;
        }
        let policy = self.inner.options.until_successful;
        self.inner.send_with_retries(&request, policy).await
    }

    /// Abandons pending retries and drains the retry tasks and then the channel, each
    /// within the drain timeout. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let timeout = self.inner.options.drain_timeout;
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .map_err(|_| TransportError::DrainTimeout {
                resource: "retry tasks",
                timeout_secs: timeout.as_secs(),
            })?;
        tokio::time::timeout(timeout, self.inner.channel.close())
            .await
            .map_err(|_| TransportError::DrainTimeout {
                resource: "collector channel",
                timeout_secs: timeout.as_secs(),
            })?;
        Ok(())
    }
}

impl<C: Channel> Inner<C> {
    async fn send_with_retries(&self, request: &Request, policy: RetryPolicy) -> Option<Response> {
        let started = Instant::now();
        let mut backoff = policy.backoff();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                r = self.channel.call(request) => r,
            };
            let err = match result {
                Ok(response) => {
                    if attempt > 1 {
                        debug!(suppress_forwarding = true, request = request.name(), attempt, "delivered after retry");
                    }
                    return Some(response);
                }
                Err(CallError::Closed) => return None,
                Err(e @ CallError::Rejected(_)) => {
                    warn!(
                        suppress_forwarding = true,
                        request = request.name(),
                        agent_id = %request.agent_id(),
                        error = %e,
                        "collector rejected payload, dropping"
                    );
                    return None;
                }
                Err(e) => e,
            };

            let elapsed = started.elapsed();
            if policy.is_exhausted(elapsed) {
                debug!(
                    suppress_forwarding = true,
                    request = request.name(),
                    attempts = attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "retry budget exhausted, dropping payload"
                );
                return None;
            }
            let delay = backoff.next_delay();
            if attempt == 1 {
                warn!(
                    suppress_forwarding = true,
                    request = request.name(),
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "collector call failed, retrying"
                );
            } else {
                debug!(
                    suppress_forwarding = true,
                    request = request.name(),
                    attempt,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "collector call failed again"
                );
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use crate::agent_rollup::AgentRollupId;
    use crate::models::GaugeValue;

    #[derive(Default)]
    struct ScriptedChannel {
        script: Mutex<VecDeque<Result<Response, CallError>>>,
        calls: AtomicUsize,
        call_times: Mutex<Vec<Instant>>,
        closes: AtomicUsize,
        stall: bool,
    }

    impl ScriptedChannel {
        fn with_script(script: Vec<Result<Response, CallError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            }
        }

        fn offsets_secs(&self, origin: Instant) -> Vec<u64> {
            self.call_times
                .lock()
                .unwrap()
                .iter()
                .map(|t| (*t - origin).as_secs())
                .collect()
        }
    }

    impl Channel for Arc<ScriptedChannel> {
        async fn call(&self, _request: &Request) -> Result<Response, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().unwrap().push(Instant::now());
            if self.stall {
                std::future::pending::<()>().await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(CallError::Unavailable("down".into())))
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gauge_request() -> Request {
        Request::CollectGaugeValues {
            agent_id: AgentRollupId::parse("web-1").unwrap(),
            gauge_values: vec![GaugeValue {
                gauge_name: "heap".into(),
                capture_time: 1,
                value: 1.0,
                weight: 1,
            }],
        }
    }

    fn init_request() -> Request {
        Request::Init {
            agent_id: AgentRollupId::parse("web-1").unwrap(),
            system_info: Default::default(),
            agent_config: Default::default(),
        }
    }

    fn transport(channel: Arc<ScriptedChannel>) -> RetryingTransport<Arc<ScriptedChannel>> {
        RetryingTransport::new(channel, Handle::current())
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_call_gives_up_after_budget_without_error() {
        let channel = Arc::new(ScriptedChannel::default());
        let t = transport(channel.clone());
        let origin = Instant::now();
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        t.call_with_a_few_retries(gauge_request(), move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(channel.offsets_secs(origin), [0, 1, 3, 7, 15, 31, 63]);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(t.inner.in_flight.available_permits(), DEFAULT_MAX_IN_FLIGHT);
    }

    #[tokio::test(start_paused = true)]
    async fn on_response_runs_once_after_retries() {
        let channel = Arc::new(ScriptedChannel::with_script(vec![
            Err(CallError::Unavailable("restarting".into())),
            Err(CallError::Unavailable("restarting".into())),
            Ok(Response::Empty),
        ]));
        let t = transport(channel.clone());
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        t.call_with_a_few_retries(gauge_request(), move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_payload_is_not_retried() {
        let channel = Arc::new(ScriptedChannel::with_script(vec![Err(CallError::Rejected(
            "bad gauge".into(),
        ))]));
        let t = transport(channel.clone());
        t.call_with_a_few_retries(gauge_request(), |_| panic!("must not be delivered"));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn until_successful_outlasts_bounded_budget() {
        let mut script: Vec<_> = (0..12)
            .map(|_| Err(CallError::Unavailable("down".into())))
            .collect();
        script.push(Ok(Response::Init {
            updated_agent_config: None,
        }));
        let channel = Arc::new(ScriptedChannel::with_script(script));
        let t = transport(channel.clone());
        let origin = Instant::now();
        let response = t.call_until_successful(init_request()).await;
        assert_eq!(
            response,
            Some(Response::Init {
                updated_agent_config: None
            })
        );
        let offsets = channel.offsets_secs(origin);
        assert_eq!(offsets.len(), 13);
        // 1, 2, 4, 8 then capped at 15
        assert_eq!(&offsets[..6], &[0, 1, 3, 7, 15, 30]);
        assert!(*offsets.last().unwrap() > 60);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_after_close_are_noops_and_close_is_idempotent() {
        let channel = Arc::new(ScriptedChannel::default());
        let t = transport(channel.clone());
        t.close().await.unwrap();
        t.close().await.unwrap();
        t.call_with_a_few_retries(gauge_request(), |_| {});
        assert_eq!(t.call_until_successful(init_request()).await, None);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_abandons_pending_retries() {
        let channel = Arc::new(ScriptedChannel::default());
        let t = transport(channel.clone());
        t.call_with_a_few_retries(gauge_request(), |_| {});
        tokio::time::sleep(Duration::from_millis(1500)).await;
        t.close().await.unwrap();
        let calls = channel.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(channel.calls.load(Ordering::SeqCst), calls);
        assert_eq!(calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_cap_drops_excess_payloads() {
        let channel = Arc::new(ScriptedChannel {
            stall: true,
            ..ScriptedChannel::default()
        });
        let t = RetryingTransport::with_options(
            channel.clone(),
            Handle::current(),
            TransportOptions {
                max_in_flight: 2,
                ..TransportOptions::default()
            },
        );
        for _ in 0..5 {
            t.call_with_a_few_retries(gauge_request(), |_| {});
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(channel.calls.load(Ordering::SeqCst), 2);
        t.close().await.unwrap();
    }
}
