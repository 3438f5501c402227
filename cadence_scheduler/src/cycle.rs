//! Paced tick loop around a [`Scheduler`].
//!
//! [`TickLoop`] calls [`Scheduler::run`] once per period, sleeping on absolute
//! deadlines so pacing does not drift:
//!
//! - with the `rt` feature, `clock_nanosleep(TIMER_ABSTIME)` on `CLOCK_MONOTONIC`
//! - otherwise `std::thread::sleep` towards an `Instant` deadline
//!
//! After every tick it records timing in [`CycleStats`], applies the
//! configured overrun and command-error policies and, every
//! `publish_every` ticks, hands a snapshot to the [`TelemetrySink`].
//!
//! ## RT setup
//! [`rt_setup`] locks memory, prefaults the stack, pins the thread to a core
//! and switches it to `SCHED_FIFO`. Without the `rt` feature it does nothing.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use cadence_common::config::{CommandErrorPolicy, OverrunPolicy, SchedulerConfig};
use cadence_common::telemetry::SchedulerMessage;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::error::SchedulerError;
use crate::scheduler::Scheduler;

// ─── Tick Statistics ────────────────────────────────────────────────

/// O(1) per-tick timing statistics.
#[derive(Debug, Clone)]
pub struct CycleStats {
    /// Ticks executed.
    pub tick_count: u64,
    /// Last tick duration [ns].
    pub last_tick_ns: i64,
    /// Minimum tick duration [ns].
    pub min_tick_ns: i64,
    /// Maximum tick duration [ns].
    pub max_tick_ns: i64,
    /// Running sum for the average.
    pub sum_tick_ns: i64,
    /// Ticks longer than the period.
    pub overruns: u64,
    /// Ticks whose `run()` returned an error.
    pub failed_ticks: u64,
    /// Maximum wake-up latency [ns] (actual wake minus deadline).
    pub max_latency_ns: i64,
}

impl CycleStats {
    pub const fn new() -> Self {
        Self {
            tick_count: 0,
            last_tick_ns: 0,
            min_tick_ns: i64::MAX,
            max_tick_ns: 0,
            sum_tick_ns: 0,
            overruns: 0,
            failed_ticks: 0,
            max_latency_ns: 0,
        }
    }

    /// Record one tick. No allocation.
    #[inline]
    pub fn record(&mut self, duration_ns: i64, latency_ns: i64) {
        self.tick_count += 1;
        self.last_tick_ns = duration_ns;
        self.min_tick_ns = self.min_tick_ns.min(duration_ns);
        self.max_tick_ns = self.max_tick_ns.max(duration_ns);
        self.sum_tick_ns += duration_ns;
        self.max_latency_ns = self.max_latency_ns.max(latency_ns);
    }

    /// Average tick duration [ns], 0 before the first tick.
    #[inline]
    pub fn avg_tick_ns(&self) -> i64 {
        if self.tick_count == 0 {
            0
        } else {
            self.sum_tick_ns / self.tick_count as i64
        }
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Errors ─────────────────────────────────────────────────────────

/// Errors that stop the tick loop.
#[derive(Debug, Error)]
pub enum CycleError {
    /// `run()` failed under [`CommandErrorPolicy::Stop`].
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// A tick took longer than its period under [`OverrunPolicy::Abort`].
    #[error("tick overrun: {actual_ns}ns > {budget_ns}ns budget")]
    CycleOverrun { actual_ns: i64, budget_ns: i64 },

    /// An RT system call failed.
    #[error("RT setup error: {0}")]
    RtSetup(String),
}

// ─── RT Setup ───────────────────────────────────────────────────────

#[cfg(feature = "rt")]
fn rt_mlockall() -> Result<(), CycleError> {
    use nix::sys::mman::{MlockallFlags, mlockall};
    mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
        .map_err(|e| CycleError::RtSetup(format!("mlockall failed: {e}")))
}

/// Touch 512 KiB of stack so the loop never page-faults on it.
#[cfg(feature = "rt")]
fn prefault_stack() {
    let mut buf = [0u8; 512 * 1024];
    for byte in buf.iter_mut() {
        // SAFETY: `byte` is a valid, exclusive reference into `buf`.
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), CycleError> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| CycleError::RtSetup(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| CycleError::RtSetup(format!("sched_setaffinity failed: {e}")))
}

#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), CycleError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: `param` outlives the call; pid 0 is the calling thread.
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(CycleError::RtSetup(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

/// Prepare the calling thread for RT ticking.
///
/// Call before entering the loop. A no-op without the `rt` feature.
#[cfg(feature = "rt")]
pub fn rt_setup(cpu: usize, priority: i32) -> Result<(), CycleError> {
    rt_mlockall()?;
    prefault_stack();
    rt_set_affinity(cpu)?;
    rt_set_scheduler(priority)?;
    info!(cpu, priority, "RT setup complete");
    Ok(())
}

#[cfg(not(feature = "rt"))]
pub fn rt_setup(_cpu: usize, _priority: i32) -> Result<(), CycleError> {
    Ok(())
}

// ─── Pacing ─────────────────────────────────────────────────────────

#[cfg(feature = "rt")]
struct Pacer {
    next_wake: nix::sys::time::TimeSpec,
    period_ns: i64,
}

#[cfg(feature = "rt")]
impl Pacer {
    fn start(period_ns: i64) -> Result<Self, CycleError> {
        use nix::time::{ClockId, clock_gettime};
        let next_wake = clock_gettime(ClockId::CLOCK_MONOTONIC)
            .map_err(|e| CycleError::RtSetup(format!("clock_gettime: {e}")))?;
        Ok(Self {
            next_wake,
            period_ns,
        })
    }

    /// Sleep until the next deadline. Returns the wake-up latency [ns].
    fn wait(&mut self) -> Result<i64, CycleError> {
        use nix::time::{ClockId, ClockNanosleepFlags, clock_gettime, clock_nanosleep};
        let clock = ClockId::CLOCK_MONOTONIC;
        self.next_wake = timespec_add_ns(self.next_wake, self.period_ns);
        // EINTR only shortens the sleep; the latency below accounts for it.
        let _ = clock_nanosleep(clock, ClockNanosleepFlags::TIMER_ABSTIME, &self.next_wake);
        let woke = clock_gettime(clock)
            .map_err(|e| CycleError::RtSetup(format!("clock_gettime: {e}")))?;
        Ok(timespec_diff_ns(&woke, &self.next_wake).max(0))
    }
}

#[cfg(feature = "rt")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    let mut secs = ts.tv_sec();
    let mut nanos = ts.tv_nsec() + ns;
    while nanos >= 1_000_000_000 {
        secs += 1;
        nanos -= 1_000_000_000;
    }
    TimeSpec::new(secs, nanos)
}

/// `a - b` in nanoseconds.
#[cfg(feature = "rt")]
fn timespec_diff_ns(a: &nix::sys::time::TimeSpec, b: &nix::sys::time::TimeSpec) -> i64 {
    (a.tv_sec() - b.tv_sec()) * 1_000_000_000 + (a.tv_nsec() - b.tv_nsec())
}

#[cfg(not(feature = "rt"))]
struct Pacer {
    next_wake: Instant,
    period: Duration,
}

#[cfg(not(feature = "rt"))]
impl Pacer {
    fn start(period_ns: i64) -> Result<Self, CycleError> {
        Ok(Self {
            next_wake: Instant::now(),
            period: Duration::from_nanos(period_ns.unsigned_abs()),
        })
    }

    fn wait(&mut self) -> Result<i64, CycleError> {
        self.next_wake += self.period;
        if let Some(remaining) = self.next_wake.checked_duration_since(Instant::now()) {
            std::thread::sleep(remaining);
        }
        let latency = Instant::now().saturating_duration_since(self.next_wake);
        Ok(i64::try_from(latency.as_nanos()).unwrap_or(i64::MAX))
    }
}

// ─── Telemetry ──────────────────────────────────────────────────────

/// Receives scheduler snapshots from the tick loop.
pub trait TelemetrySink {
    fn publish(&mut self, message: &SchedulerMessage) -> std::io::Result<()>;
}

/// Writes one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TelemetrySink for JsonLinesSink<W> {
    fn publish(&mut self, message: &SchedulerMessage) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, message)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

// ─── Tick Loop ──────────────────────────────────────────────────────

/// Fixed-period driver for one scheduler.
pub struct TickLoop {
    scheduler: Scheduler,
    period_ns: i64,
    overrun: OverrunPolicy,
    on_command_error: CommandErrorPolicy,
    rt: Option<(usize, i32)>,
    /// `None` when telemetry is disabled.
    publish_every: Option<u64>,
    sink: Option<Box<dyn TelemetrySink>>,
    stats: CycleStats,
}

impl TickLoop {
    /// The config is expected to be validated already.
    pub fn new(scheduler: Scheduler, config: &SchedulerConfig) -> Self {
        let tick = &config.tick;
        Self {
            scheduler,
            period_ns: i64::try_from(tick.period_us.saturating_mul(1_000)).unwrap_or(i64::MAX),
            overrun: tick.overrun,
            on_command_error: tick.on_command_error,
            rt: tick.rt_cpu.zip(tick.rt_priority),
            publish_every: config
                .telemetry
                .enabled
                .then_some(config.telemetry.publish_every.max(1)),
            sink: None,
            stats: CycleStats::new(),
        }
    }

    pub fn with_sink(mut self, sink: impl TelemetrySink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns.unsigned_abs())
    }

    /// Run [`rt_setup`] when both `rt_cpu` and `rt_priority` are configured.
    pub fn prepare_rt(&self) -> Result<(), CycleError> {
        match self.rt {
            Some((cpu, priority)) => rt_setup(cpu, priority),
            None => Ok(()),
        }
    }

    /// One unpaced tick.
    pub fn tick(&mut self) -> Result<(), CycleError> {
        self.step(0)
    }

    /// `ticks` paced ticks.
    pub fn run_for(&mut self, ticks: u64) -> Result<(), CycleError> {
        let mut pacer = Pacer::start(self.period_ns)?;
        let mut latency_ns = 0;
        for _ in 0..ticks {
            self.step(latency_ns)?;
            latency_ns = pacer.wait()?;
        }
        Ok(())
    }

    /// Paced ticks until `running` is cleared.
    pub fn run_until(&mut self, running: &AtomicBool) -> Result<(), CycleError> {
        info!(
            scheduler = self.scheduler.name(),
            period_us = self.period_ns / 1_000,
            "tick loop started"
        );
        let mut pacer = Pacer::start(self.period_ns)?;
        let mut latency_ns = 0;
        while running.load(Ordering::Acquire) {
            self.step(latency_ns)?;
            latency_ns = pacer.wait()?;
        }
        info!(ticks = self.stats.tick_count, overruns = self.stats.overruns, "tick loop stopped");
        Ok(())
    }

    fn step(&mut self, latency_ns: i64) -> Result<(), CycleError> {
        let started = Instant::now();
        let outcome = self.scheduler.run();
        let duration_ns = i64::try_from(started.elapsed().as_nanos()).unwrap_or(i64::MAX);
        self.stats.record(duration_ns, latency_ns);

        if let Err(failure) = outcome {
            self.stats.failed_ticks += 1;
            match self.on_command_error {
                CommandErrorPolicy::Log => error!(%failure, "tick failed"),
                CommandErrorPolicy::Stop => return Err(failure.into()),
            }
        }

        if duration_ns > self.period_ns {
            self.stats.overruns += 1;
            match self.overrun {
                OverrunPolicy::Warn => warn!(
                    actual_ns = duration_ns,
                    budget_ns = self.period_ns,
                    "tick overrun"
                ),
                OverrunPolicy::Abort => {
                    return Err(CycleError::CycleOverrun {
                        actual_ns: duration_ns,
                        budget_ns: self.period_ns,
                    });
                }
            }
        }

        self.publish();
        Ok(())
    }

    fn publish(&mut self) {
        let (Some(every), Some(sink)) = (self.publish_every, self.sink.as_mut()) else {
            return;
        };
        if self.stats.tick_count % every != 0 {
            return;
        }
        if let Err(error) = sink.publish(&self.scheduler.snapshot()) {
            warn!(%error, "telemetry publish failed");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
