//! Sampling engine
//!
//! [`MeterEngine`] owns a periodic tokio timer and the last-seen snapshot,
//! and broadcasts a [`UsageEvent`] with the cumulative counters and the diff
//! since the previous tick. Events and read failures travel on a pair of
//! typed broadcast channels; subscribers are independent receivers, so a slow
//! or failed consumer never affects the others or the timer loop.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{MeterError, Result};
use crate::snapshot::{UsageEvent, UsageSnapshot};
use crate::source::{RusageSource, UsageSource};

/// Default sampling period
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default broadcast channel capacity
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Configuration for the sampling engine
#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Sampling period. The name is retained from the reference API for
    /// compatibility; it is the interval between samples, not a request
    /// timeout.
    pub timeout: Duration,
    /// Capacity of the usage and error broadcast channels. A subscriber that
    /// falls further behind than this observes a `Lagged` error instead of
    /// blocking the engine.
    pub channel_capacity: usize,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl MeterConfig {
    fn validate(&self) -> Result<()> {
        validate_interval(self.timeout)?;
        if self.channel_capacity == 0 {
            return Err(MeterError::Config("channel capacity must be positive".into()));
        }
        Ok(())
    }
}

fn validate_interval(interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(MeterError::Config("sampling interval must be a positive duration".into()));
    }
    Ok(())
}

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, timer not yet armed
    Created,
    /// Timer armed, samples being emitted
    Running,
    /// Timer cancelled
    Stopped,
}

struct Lifecycle {
    state: EngineState,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// Periodic resource-usage sampler for the current process
///
/// ```no_run
/// # async fn demo() -> ru_meter::Result<()> {
/// let engine = ru_meter::MeterEngine::new(ru_meter::MeterConfig {
///     timeout: std::time::Duration::from_millis(200),
///     ..Default::default()
/// })?;
/// let mut usage = engine.subscribe();
/// engine.start()?;
/// while let Ok(event) = usage.recv().await {
///     println!("cpu since last tick: {:.3}s", event.diff.cpu_seconds());
/// }
/// engine.stop();
/// # Ok(())
/// # }
/// ```
pub struct MeterEngine {
    config: MeterConfig,
    source: Arc<dyn UsageSource>,
    usage_tx: broadcast::Sender<UsageEvent>,
    error_tx: broadcast::Sender<MeterError>,
    lifecycle: Mutex<Lifecycle>,
}

impl MeterEngine {
    /// Create an engine backed by the platform accounting call
    pub fn new(config: MeterConfig) -> Result<Self> {
        Self::with_source(config, Arc::new(RusageSource))
    }

    /// Create an engine with a custom usage source
    pub fn with_source(config: MeterConfig, source: Arc<dyn UsageSource>) -> Result<Self> {
        config.validate()?;
        let (usage_tx, _) = broadcast::channel(config.channel_capacity);
        let (error_tx, _) = broadcast::channel(config.channel_capacity);

        Ok(Self {
            config,
            source,
            usage_tx,
            error_tx,
            lifecycle: Mutex::new(Lifecycle {
                state: EngineState::Created,
                shutdown: None,
                task: None,
            }),
        })
    }

    /// Subscribe to usage events. Every subscriber receives every event
    /// emitted after the subscription; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<UsageEvent> {
        self.usage_tx.subscribe()
    }

    /// Subscribe to read failures. Sampling continues after a failure; a
    /// persistent platform problem shows up as a steady stream on this
    /// channel instead of usage events.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<MeterError> {
        self.error_tx.subscribe()
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        self.lifecycle.lock().state
    }

    /// Arm the periodic timer at the configured sampling period
    pub fn start(&self) -> Result<()> {
        self.start_with(self.config.timeout)
    }

    /// Arm the periodic timer at the given sampling period.
    ///
    /// Calling this while already running re-arms the engine: the prior timer
    /// is cancelled and replaced. The diff baseline starts over, so the first
    /// event after a (re)start diffs against zero and is only useful to
    /// establish a baseline.
    pub fn start_with(&self, interval: Duration) -> Result<()> {
        validate_interval(interval)?;

        let mut lifecycle = self.lifecycle.lock();
        // Cancel the prior timer before arming its replacement so two loops
        // never overlap on the shared channels.
        if let Some(prior) = lifecycle.shutdown.take() {
            debug!("re-arming sampler, replacing prior timer");
            let _ = prior.send(true);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(sample_loop(
            Arc::clone(&self.source),
            interval,
            self.usage_tx.clone(),
            self.error_tx.clone(),
            shutdown_rx,
        ));
        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.task = Some(task);
        lifecycle.state = EngineState::Running;

        debug!(interval_ms = interval.as_millis() as u64, "sampler started");
        Ok(())
    }

    /// Cancel the timer. Idempotent; safe to call from a subscriber task.
    ///
    /// No further ticks fire after this returns, but a tick already executing
    /// is allowed to complete and its event is still delivered.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(true);
            debug!("sampler stopped");
        }
        // Detach the loop task; it exits at its next await point, so an
        // executing tick completes but no further ticks fire.
        drop(lifecycle.task.take());
        lifecycle.state = EngineState::Stopped;
    }
}

impl Drop for MeterEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Timer loop: single owner of the last-snapshot baseline.
async fn sample_loop(
    source: Arc<dyn UsageSource>,
    interval: Duration,
    usage_tx: broadcast::Sender<UsageEvent>,
    error_tx: broadcast::Sender<MeterError>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // First sample fires one full period after start, matching the reference.
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    // A tick that overruns the period is coalesced, never run concurrently.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last: Option<UsageSnapshot> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,

            _ = ticker.tick() => {
                match source.read() {
                    Ok(current) => {
                        // First tick diffs against zero; consumers treat it
                        // as baseline-only.
                        let baseline = last.unwrap_or_default();
                        let diff = current.diff(&baseline);
                        last = Some(current);

                        let event = UsageEvent {
                            current,
                            diff,
                            timestamp: chrono::Utc::now(),
                        };
                        if usage_tx.send(event).is_err() {
                            debug!("no usage subscribers, sample dropped");
                        }
                    }
                    Err(err) => {
                        // Baseline stays untouched; next tick diffs across
                        // the failed one.
                        warn!(error = %err, "resource usage read failed");
                        let _ = error_tx.send(err);
                    }
                }
            }
        }
    }

    debug!("sampling loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Deterministic source: every read advances all counters by one step.
    struct SteppingSource {
        reads: AtomicU64,
    }

    impl SteppingSource {
        fn new() -> Self {
            Self { reads: AtomicU64::new(0) }
        }

        fn snapshot_for(n: u64) -> UsageSnapshot {
            UsageSnapshot {
                ru_utime: n as f64 * 0.25,
                ru_stime: n as f64 * 0.05,
                ru_maxrss: 10_000 + n as i64,
                ru_minflt: n as i64 * 7,
                ru_nvcsw: n as i64 * 3,
                ru_nivcsw: n as i64,
                ..Default::default()
            }
        }
    }

    impl UsageSource for SteppingSource {
        fn read(&self) -> Result<UsageSnapshot> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Self::snapshot_for(n))
        }
    }

    /// Counters keep advancing, but one designated read fails.
    struct FlakySource {
        reads: AtomicU64,
        fail_on: u64,
    }

    impl UsageSource for FlakySource {
        fn read(&self) -> Result<UsageSnapshot> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on {
                return Err(MeterError::UsageRead("simulated platform failure".into()));
            }
            Ok(SteppingSource::snapshot_for(n))
        }
    }

    fn engine_with(source: Arc<dyn UsageSource>, timeout: Duration) -> MeterEngine {
        MeterEngine::with_source(
            MeterConfig { timeout, ..Default::default() },
            source,
        )
        .unwrap()
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = MeterEngine::new(MeterConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        })
        .err()
        .expect("zero interval must be rejected");
        assert!(matches!(err, MeterError::Config(_)));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = MeterEngine::new(MeterConfig {
            channel_capacity: 0,
            ..Default::default()
        })
        .err()
        .expect("zero capacity must be rejected");
        assert!(matches!(err, MeterError::Config(_)));
    }

    #[tokio::test]
    async fn test_start_with_zero_interval_keeps_engine_out_of_running() {
        let engine = engine_with(Arc::new(SteppingSource::new()), Duration::from_millis(100));
        assert_eq!(engine.state(), EngineState::Created);
        assert!(engine.start_with(Duration::ZERO).is_err());
        assert_eq!(engine.state(), EngineState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_fieldwise_diffs() {
        let engine = engine_with(Arc::new(SteppingSource::new()), Duration::from_millis(100));
        let mut rx = engine.subscribe();
        engine.start().unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();

        // First event diffs against the zero baseline.
        assert_eq!(first.diff, first.current);

        for (prev, next) in [(&first, &second), (&second, &third)] {
            assert!((next.diff.ru_utime - (next.current.ru_utime - prev.current.ru_utime)).abs() < 1e-9);
            assert!((next.diff.ru_stime - (next.current.ru_stime - prev.current.ru_stime)).abs() < 1e-9);
            assert_eq!(next.diff.ru_maxrss, next.current.ru_maxrss - prev.current.ru_maxrss);
            assert_eq!(next.diff.ru_minflt, next.current.ru_minflt - prev.current.ru_minflt);
            assert_eq!(next.diff.ru_nvcsw, next.current.ru_nvcsw - prev.current.ru_nvcsw);
            assert_eq!(next.diff.ru_nivcsw, next.current.ru_nivcsw - prev.current.ru_nivcsw);
        }

        // One source step per tick.
        assert!((second.diff.ru_utime - 0.25).abs() < 1e-9);
        assert_eq!(second.diff.ru_minflt, 7);

        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_halts_emission() {
        let engine = engine_with(Arc::new(SteppingSource::new()), Duration::from_millis(100));
        let mut rx = engine.subscribe();
        engine.start().unwrap();

        rx.recv().await.unwrap();
        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);

        // Drain anything emitted before the stop took effect.
        while rx.try_recv().is_ok() {}

        let quiet = time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(quiet.is_err(), "no events may be emitted after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_leaves_baseline_untouched() {
        let source = Arc::new(FlakySource { reads: AtomicU64::new(0), fail_on: 2 });
        let engine = engine_with(source, Duration::from_millis(100));
        let mut usage_rx = engine.subscribe();
        let mut error_rx = engine.subscribe_errors();
        engine.start().unwrap();

        let first = usage_rx.recv().await.unwrap();

        let err = error_rx.recv().await.unwrap();
        assert!(matches!(err, MeterError::UsageRead(_)));

        // Tick after the failure diffs against the pre-failure snapshot.
        let next = usage_rx.recv().await.unwrap();
        assert!((next.diff.ru_utime - (next.current.ru_utime - first.current.ru_utime)).abs() < 1e-9);
        assert_eq!(next.diff.ru_minflt, next.current.ru_minflt - first.current.ru_minflt);
        // Two source steps elapsed across the failed tick.
        assert_eq!(next.diff.ru_minflt, 14);

        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_rearms_and_resets_baseline() {
        let engine = engine_with(Arc::new(SteppingSource::new()), Duration::from_millis(100));
        let mut rx = engine.subscribe();
        engine.start().unwrap();
        rx.recv().await.unwrap();

        engine.start_with(Duration::from_millis(50)).unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        // Ignore anything the replaced timer had in flight.
        while rx.try_recv().is_ok() {}

        let a = rx.recv().await.unwrap();
        // A restart begins a fresh baseline.
        assert_eq!(a.diff, a.current);

        let b = rx.recv().await.unwrap();
        // Exactly one timer drives the source: one step per tick.
        assert!((b.diff.ru_utime - 0.25).abs() < 1e-9);
        assert_eq!(b.diff.ru_minflt, b.current.ru_minflt - a.current.ru_minflt);

        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_rearm_leaves_single_timer() {
        let engine = engine_with(Arc::new(SteppingSource::new()), Duration::from_millis(100));
        let mut rx = engine.subscribe();
        engine.start().unwrap();

        // Each re-arm must replace the prior timer, never stack another one.
        for _ in 0..5 {
            engine.start_with(Duration::from_millis(100)).unwrap();
        }
        while rx.try_recv().is_ok() {}

        let first = rx.recv().await.unwrap();
        assert_eq!(first.diff, first.current);

        let mut prev = first;
        for _ in 0..3 {
            let next = rx.recv().await.unwrap();
            // One source step per period; a second live timer would advance
            // the counters twice between a loop's consecutive ticks.
            assert_eq!(next.diff.ru_minflt, 7);
            assert_eq!(next.current.ru_minflt - prev.current.ru_minflt, 7);
            prev = next;
        }

        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_from_subscriber_task() {
        let engine = Arc::new(engine_with(
            Arc::new(SteppingSource::new()),
            Duration::from_millis(100),
        ));
        let mut rx = engine.subscribe();
        engine.start().unwrap();

        let handle = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                rx.recv().await.unwrap();
                engine.stop();
            })
        };

        handle.await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_subscriber_sees_every_event() {
        let engine = engine_with(Arc::new(SteppingSource::new()), Duration::from_millis(100));
        let mut rx1 = engine.subscribe();
        let mut rx2 = engine.subscribe();
        engine.start().unwrap();

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.current, e2.current);
        assert_eq!(e1.diff, e2.diff);

        // Dropping one receiver must not disturb the other.
        drop(rx1);
        let next = rx2.recv().await.unwrap();
        assert!(next.current.ru_minflt > e2.current.ru_minflt);

        engine.stop();
    }
}
