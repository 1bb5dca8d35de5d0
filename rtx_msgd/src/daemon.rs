//! # Message daemon
//!
//! Owns the session segment for its whole lifetime:
//!
//! 1. [`MsgDaemon::start`] creates the session, which writes the daemon pid
//!    and flips the state to READY.
//! 2. [`MsgDaemon::run`] drains the message ring on an adaptive timer, checks
//!    the overflow counters after every drain and watches the module host.
//! 3. [`MsgDaemon::shutdown`] marks the session EXITED, drains what is left
//!    and unlinks every segment of the instance.

use crate::error::{DaemonError, DaemonResult};
use crate::poll::AdaptivePoll;
use crate::publisher::Publisher;
use crate::sink::LogSink;
use crate::supervise::{HostStatus, HostWatch};
use rtx_common::config::RtxConfig;
use rtx_common::flavor::Flavor;
use rtx_shared_memory::platform::is_process_alive;
use rtx_shared_memory::{LogRecord, SegmentDiscovery, SegmentManager, Session, ShmError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Upper bound of records handled by one drain, so supervision is never starved.
const MAX_DRAIN: usize = 4096;

/// Ring overflow counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    /// Writes rejected because the ring was full.
    pub full: u64,
    /// Writes rejected because the ring lock was busy.
    pub lock_failures: u64,
}

impl Overflow {
    /// Nothing was lost.
    pub fn is_zero(&self) -> bool {
        self.full == 0 && self.lock_failures == 0
    }
}

/// Why [`MsgDaemon::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown future completed.
    Requested,
    /// The module host cleared its pid.
    HostExited(u32),
}

/// The message daemon of one session instance.
pub struct MsgDaemon {
    config: RtxConfig,
    mgr: SegmentManager,
    session: Arc<Session>,
    sink: LogSink,
    publisher: Option<Publisher>,
    poll: AdaptivePoll,
    watch: HostWatch,
    seen: Overflow,
    buf: Vec<u8>,
    undecodable: u64,
}

impl MsgDaemon {
    /// Create the session of `config.session.instance` running `flavor`.
    ///
    /// A configured publish socket needs a tokio runtime.
    pub fn start(config: RtxConfig, flavor: Flavor) -> DaemonResult<Self> {
        let mgr = SegmentManager::from_config(&config.session);
        let session = Arc::new(Session::create(&mgr, &config.session, flavor)?);
        let sink = LogSink::open(config.msgd.log_file.as_deref())?;
        let publisher = match &config.msgd.publish_socket {
            Some(path) => Some(Publisher::bind(path)?),
            None => None,
        };
        let poll = AdaptivePoll::from_config(&config.msgd);
        info!(
            "Message daemon owns session {} (flavor {})",
            config.session.instance, flavor
        );
        Ok(Self {
            config,
            mgr,
            session,
            sink,
            publisher,
            poll,
            watch: HostWatch::new(),
            seen: Overflow::default(),
            buf: Vec::new(),
            undecodable: 0,
        })
    }

    /// The owned session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Records handed to the sink so far.
    pub fn records_written(&self) -> u64 {
        self.sink.written()
    }

    /// Ring entries that were not valid log records.
    pub fn undecodable(&self) -> u64 {
        self.undecodable
    }

    /// The publisher, when a socket is configured.
    pub fn publisher(&self) -> Option<&Publisher> {
        self.publisher.as_ref()
    }

    /// Move every pending record to the sink and publisher.
    pub fn drain_once(&mut self) -> DaemonResult<usize> {
        let mut reader = self.session.message_ring().record_reader()?;
        let mut drained = 0;
        while drained < MAX_DRAIN {
            match reader.read(&mut self.buf) {
                Ok(_) => drained += 1,
                Err(ShmError::Empty) => break,
                Err(e) => return Err(e.into()),
            }
            match LogRecord::decode(&self.buf) {
                Ok(record) => {
                    self.sink.write(&record)?;
                    if let Some(publisher) = &mut self.publisher {
                        publisher.publish(&record)?;
                    }
                }
                Err(e) => {
                    self.undecodable += 1;
                    warn!("Dropping undecodable message ({} bytes): {}", self.buf.len(), e);
                }
            }
        }
        if drained > 0 {
            self.sink.flush()?;
        }
        Ok(drained)
    }

    /// Report ring overflows since the previous check. Returns the deltas.
    pub fn check_overflow(&mut self) -> Overflow {
        let stats = self.session.message_ring().stats();
        let delta = Overflow {
            full: stats.full.saturating_sub(self.seen.full),
            lock_failures: stats.lock_failures.saturating_sub(self.seen.lock_failures),
        };
        if delta.full > 0 {
            warn!("{} messages lost: message ring full", delta.full);
        }
        if delta.lock_failures > 0 {
            warn!("{} messages lost: message ring lock busy", delta.lock_failures);
        }
        self.seen = Overflow {
            full: stats.full,
            lock_failures: stats.lock_failures,
        };
        delta
    }

    /// Check the module host once.
    pub fn supervise(&mut self) -> HostStatus {
        let previous = self.watch.last_pid();
        let status = self.watch.check(&self.session);
        if let HostStatus::Running(pid) = status
            && pid != previous
        {
            info!("Module host (pid {}) attached", pid);
        }
        status
    }

    /// Drain and supervise until `shutdown` completes or the host goes away.
    ///
    /// A host that dies with its pid still published is an error.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> DaemonResult<StopReason> {
        tokio::pin!(shutdown);
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.msgd.supervise_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // One timer across iterations: supervision ticks must not restart the poll wait.
        let poll = tokio::time::sleep(self.poll.current());
        tokio::pin!(poll);

        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(StopReason::Requested),
                _ = ticker.tick() => match self.supervise() {
                    HostStatus::Exited(pid) => {
                        error!("Module host (pid {}) left the session, shutting down", pid);
                        return Ok(StopReason::HostExited(pid));
                    }
                    HostStatus::Died(pid) => {
                        error!("Module host (pid {}) died, shutting down", pid);
                        return Err(DaemonError::HostDied { pid });
                    }
                    HostStatus::Absent | HostStatus::Running(_) => {}
                },
                _ = &mut poll => {
                    let drained = self.drain_once()?;
                    let next = self.poll.after_poll(drained);
                    self.check_overflow();
                    poll.as_mut().reset(Instant::now() + next);
                }
            }
        }
    }

    /// Mark the session EXITED, drain the rest and unlink the instance.
    ///
    /// Returns the number of segments removed.
    pub fn shutdown(mut self) -> DaemonResult<usize> {
        let host = self.session.host_pid();
        if host != 0 && is_process_alive(host) {
            warn!("Module host (pid {}) is still attached", host);
        }
        self.session.mark_exited();

        match self.drain_once() {
            Ok(n) if n > 0 => debug!("Final drain: {} messages", n),
            Ok(_) => {}
            Err(e) => warn!("Final drain failed: {}", e),
        }
        let lost = self.check_overflow();
        if !lost.is_zero() {
            debug!("Overflow at shutdown: {:?}", lost);
        }
        self.publisher = None;

        let removed = SegmentDiscovery::new(&self.mgr).unlink_instance(self.session.instance())?;
        info!(
            "Session {} closed: {} messages logged, {} segments removed",
            self.session.instance(),
            self.sink.written(),
            removed
        );
        Ok(removed)
    }
}
