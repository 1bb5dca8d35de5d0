//! Periodic task primitives bound to a flavor.
//!
//! A [`Task`] is created stopped, started with a body closure, and runs that
//! body once per period on its own OS thread until stopped. Realtime flavors
//! switch the thread to `SCHED_FIFO` with the mapped priority and sleep on
//! absolute deadlines; the POSIX flavor sleeps for the remainder of each cycle.

use super::{Flavor, FlavorError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Parameters of a periodic task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Thread name.
    pub name: String,
    /// Cycle period.
    pub period: Duration,
    /// Priority on the flavor's scale.
    pub priority: i32,
    /// CPU to pin the thread to.
    pub cpu: Option<usize>,
    /// Whether the body uses floating point.
    pub uses_fp: bool,
}

/// Information handed to the task body each cycle.
#[derive(Debug, Clone, Copy)]
pub struct TaskCycle {
    /// Cycle counter, starting at 0.
    pub index: u64,
    /// Monotonic start time of this cycle in ns.
    pub start_ns: i64,
    /// Configured period in ns.
    pub period_ns: i64,
}

/// Per-task timing statistics.
#[derive(Debug, Default)]
pub struct TaskStats {
    /// Completed cycles.
    pub cycles: AtomicU64,
    /// Cycles whose body ran longer than the period.
    pub overruns: AtomicU64,
    /// Runtime of the last cycle in ns.
    pub last_runtime_ns: AtomicI64,
    /// Largest runtime observed in ns.
    pub max_runtime_ns: AtomicI64,
}

impl TaskStats {
    fn record(&self, runtime_ns: i64, period_ns: i64) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.last_runtime_ns.store(runtime_ns, Ordering::Relaxed);
        self.max_runtime_ns.fetch_max(runtime_ns, Ordering::Relaxed);
        if runtime_ns > period_ns {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct TaskShared {
    stop: AtomicBool,
    paused: AtomicBool,
    stats: TaskStats,
}

/// A periodic task on its own OS thread.
pub struct Task {
    flavor: Flavor,
    spec: TaskSpec,
    shared: Arc<TaskShared>,
    handle: Option<JoinHandle<()>>,
}

impl Flavor {
    /// Create a stopped task.
    ///
    /// Fails for kernel-build flavors and for a zero period. Priorities
    /// outside the flavor range are clamped.
    pub fn task_new(self, mut spec: TaskSpec) -> Result<Task, FlavorError> {
        if self.is_kernel_build() {
            return Err(FlavorError::KernelBuild {
                flavor: self.name(),
            });
        }
        if spec.period.is_zero() {
            return Err(FlavorError::Task {
                task: spec.name,
                reason: "period must be non-zero".to_string(),
            });
        }
        let clamped = self.prio_clamp(spec.priority);
        if clamped != spec.priority {
            warn!(
                "Task '{}': priority {} outside {} range, using {}",
                spec.name,
                spec.priority,
                self.name(),
                clamped
            );
            spec.priority = clamped;
        }
        Ok(Task {
            flavor: self,
            spec,
            shared: Arc::new(TaskShared::default()),
            handle: None,
        })
    }
}

impl Task {
    /// Task name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Task parameters.
    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// Spawn the thread and start running `body` once per period.
    pub fn start<F>(&mut self, body: F) -> Result<(), FlavorError>
    where
        F: FnMut(&TaskCycle) + Send + 'static,
    {
        if self.handle.is_some() {
            return Err(FlavorError::Task {
                task: self.spec.name.clone(),
                reason: "already started".to_string(),
            });
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        let flavor = self.flavor;
        let spec = self.spec.clone();
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(spec.name.clone())
            .spawn(move || run_periodic(flavor, spec, shared, body))
            .map_err(|source| FlavorError::Spawn {
                task: self.spec.name.clone(),
                source,
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Skip the body on following cycles; the task keeps its period.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Undo [`Task::pause`].
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    /// Whether the thread is spawned and not paused.
    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.shared.paused.load(Ordering::Acquire)
    }

    /// Timing statistics.
    pub fn stats(&self) -> &TaskStats {
        &self.shared.stats
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn stop(&mut self) -> Result<(), FlavorError> {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| FlavorError::Task {
                task: self.spec.name.clone(),
                reason: "task body panicked".to_string(),
            })?;
            debug!("Task '{}' stopped", self.spec.name);
        }
        Ok(())
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{e}");
        }
    }
}

fn run_periodic<F>(flavor: Flavor, spec: TaskSpec, shared: Arc<TaskShared>, mut body: F)
where
    F: FnMut(&TaskCycle),
{
    apply_scheduling(flavor, &spec);

    let period_ns = i64::try_from(spec.period.as_nanos()).unwrap_or(i64::MAX);
    let mut next = flavor.get_time().saturating_add(period_ns);
    let mut index = 0u64;

    while !shared.stop.load(Ordering::Acquire) {
        if !shared.paused.load(Ordering::Acquire) {
            let start_ns = flavor.get_time();
            body(&TaskCycle {
                index,
                start_ns,
                period_ns,
            });
            shared
                .stats
                .record(flavor.get_time() - start_ns, period_ns);
            index += 1;
        }

        wait_until(flavor, next);
        next = next.saturating_add(period_ns);
        let now = flavor.get_time();
        if now > next {
            // Missed at least one deadline, resynchronise instead of bursting.
            next = now.saturating_add(period_ns);
        }
    }
}

fn apply_scheduling(flavor: Flavor, spec: &TaskSpec) {
    if let Some(cpu) = spec.cpu {
        if let Err(e) = pin_to_cpu(cpu) {
            warn!("Task '{}': failed to pin to CPU {}: {}", spec.name, cpu, e);
        }
    }
    if !flavor.is_realtime() {
        return;
    }
    // SAFETY: sched_param is plain data; the only field we rely on is set below.
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = spec.priority;
    // SAFETY: pthread_self() is always a valid handle for the calling thread.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        warn!(
            "Task '{}': SCHED_FIFO priority {} not applied: {}",
            spec.name,
            spec.priority,
            std::io::Error::from_raw_os_error(rc)
        );
    }
}

fn pin_to_cpu(cpu: usize) -> nix::Result<()> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)
}

fn wait_until(flavor: Flavor, deadline_ns: i64) {
    if flavor.is_realtime() {
        // SAFETY: timespec is plain data.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = (deadline_ns / 1_000_000_000) as libc::time_t;
        ts.tv_nsec = (deadline_ns % 1_000_000_000) as _;
        // SAFETY: ts is a valid absolute deadline; remaining time is not requested.
        unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            );
        }
    } else {
        let remaining = deadline_ns - flavor.get_time();
        if remaining > 0 {
            std::thread::sleep(Duration::from_nanos(remaining as u64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn spec(name: &str, period_ms: u64) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            period: Duration::from_millis(period_ms),
            priority: 10,
            cpu: None,
            uses_fp: false,
        }
    }

    #[test]
    fn kernel_flavors_refuse_userland_tasks() {
        assert!(matches!(
            Flavor::RtaiKernel.task_new(spec("t", 1)),
            Err(FlavorError::KernelBuild { .. })
        ));
    }

    #[test]
    fn zero_period_is_rejected() {
        let mut s = spec("t", 1);
        s.period = Duration::ZERO;
        assert!(Flavor::Posix.task_new(s).is_err());
    }

    #[test]
    fn out_of_range_priority_is_clamped() {
        let mut s = spec("t", 1);
        s.priority = 500;
        let task = Flavor::Posix.task_new(s).unwrap();
        assert_eq!(task.spec().priority, Flavor::Posix.prio_highest());
    }

    #[test]
    fn task_runs_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut task = Flavor::Posix.task_new(spec("tick", 2)).unwrap();
        let seen = Arc::clone(&counter);
        task.start(move |_cycle| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        task.stop().unwrap();
        let ran = counter.load(Ordering::SeqCst);
        assert!(ran > 0);
        assert_eq!(task.stats().cycles.load(Ordering::Relaxed) as usize, ran);

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(counter.load(Ordering::SeqCst), ran);
        assert!(task.stop().is_ok());
    }

    #[test]
    fn paused_task_skips_body() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut task = Flavor::Posix.task_new(spec("paused", 1)).unwrap();
        task.pause();
        let seen = Arc::clone(&counter);
        task.start(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!task.is_running());
        task.resume();
        std::thread::sleep(Duration::from_millis(20));
        task.stop().unwrap();
        assert!(counter.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn double_start_is_rejected() {
        let mut task = Flavor::Posix.task_new(spec("twice", 5)).unwrap();
        task.start(|_| {}).unwrap();
        assert!(task.start(|_| {}).is_err());
        task.stop().unwrap();
    }
}
