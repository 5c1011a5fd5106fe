//! Per-study inactivity tracking.
//!
//! Every stored instance debounces its study's deadline; the study is
//! handed to the dispatcher only after a full quiet period with no
//! arrivals. This is the coordination core of the relay:
//!
//! - arrivals and timer fires race per study; the epoch guard on the
//!   pending timer makes exactly one of {reschedule-wins, fire-wins}
//!   observable, never both
//! - a study that keeps trickling instances after its dispatch has been
//!   claimed gets a fresh session (and a second, later archive) instead of
//!   mutating the directory mid-archive or dropping data
//! - dispatch runs inside the timer's own task, so a slow upload never
//!   blocks instance receipt or other studies
//!
//! The index lock is held only for map mutation, never across an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::{DispatchOutcome, StudyDispatcher};
use crate::session::model::{SessionState, StudySession};

pub struct StudyTracker {
    sessions: Mutex<HashMap<String, StudySession>>,
    idle_timeout: Duration,
    dispatcher: Arc<dyn StudyDispatcher>,

    /// Cleared on shutdown; `touch` becomes a no-op and the relay rejects
    /// new instances.
    accepting: AtomicBool,

    /// Dispatches currently executing, for the shutdown drain.
    in_flight: AtomicUsize,
    drained: Notify,
}

impl StudyTracker {
    pub fn new(idle_timeout: Duration, dispatcher: Arc<dyn StudyDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
            dispatcher,
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Number of studies currently open (accumulating or dispatching).
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Records an arrival for `study_uid`, debouncing its idle deadline.
    ///
    /// Call only after the instance has durably hit storage; a failed write
    /// must not extend the study's deadline.
    pub fn touch(self: &Arc<Self>, study_uid: &str) {
        if !self.is_accepting() {
            return;
        }

        let mut sessions = self.sessions.lock();

        let open_new = match sessions.get_mut(study_uid) {
            Some(session) if session.state == SessionState::Accumulating => {
                // Reschedule: invalidate the pending timer before arming the
                // replacement. An already-running fire that lost this race
                // will see a stale epoch and back off.
                session.timer_epoch += 1;
                session.last_arrival = Instant::now();

                if let Some(old) = session.timer.take() {
                    old.abort();
                }

                let handle =
                    self.arm_timer(study_uid.to_string(), session.session_id, session.timer_epoch);
                session.timer = Some(handle);

                debug!(
                    target: "tracker",
                    study_uid,
                    epoch = session.timer_epoch,
                    "study deadline rescheduled"
                );
                false
            }
            Some(session) => {
                // The previous session is mid-dispatch and cannot be
                // resurrected. Open a successor for the trickle-in; it will
                // produce its own archive once it goes quiet.
                info!(
                    target: "tracker",
                    study_uid,
                    closing_session = %session.session_id,
                    "instance arrived during dispatch; opening follow-up session"
                );
                true
            }
            None => true,
        };

        if open_new {
            let mut session = StudySession::new();
            session.timer = Some(self.arm_timer(study_uid.to_string(), session.session_id, 0));

            info!(
                target: "tracker",
                study_uid,
                session_id = %session.session_id,
                idle_timeout_secs = self.idle_timeout.as_secs(),
                "study session opened"
            );

            sessions.insert(study_uid.to_string(), session);
        }
    }

    /// Stops accepting arrivals, drops every pending timer, and waits up to
    /// `grace` for in-flight dispatches to finish.
    ///
    /// Studies whose timers were dropped stay on disk untouched; an
    /// external rescan can pick them up after restart.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);

        let cancelled = {
            let mut sessions = self.sessions.lock();
            let mut cancelled = 0usize;
            sessions.retain(|study_uid, session| {
                if session.state == SessionState::Dispatching {
                    return true;
                }
                if let Some(timer) = session.timer.take() {
                    timer.abort();
                }
                debug!(target: "tracker", study_uid, "pending study timer released");
                cancelled += 1;
                false
            });
            cancelled
        };

        info!(
            target: "tracker",
            cancelled,
            in_flight = self.in_flight.load(Ordering::Acquire),
            "tracker draining"
        );

        let drain = async {
            loop {
                let notified = self.drained.notified();
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                target: "tracker",
                abandoned = self.in_flight.load(Ordering::Acquire),
                "shutdown grace elapsed with dispatches still in flight"
            );
        }
    }

    fn arm_timer(
        self: &Arc<Self>,
        study_uid: String,
        session_id: Uuid,
        epoch: u64,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        // Anchor the deadline to the arrival instant (the same moment
        // `last_arrival` is stamped), not to whenever the spawned task is
        // first polled.
        let deadline = Instant::now() + self.idle_timeout;

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            tracker.on_idle_elapsed(&study_uid, session_id, epoch).await;
        })
    }

    /// Timer-fire path. Claims the session if, and only if, it is still the
    /// exact session/epoch this timer was armed for.
    async fn on_idle_elapsed(self: Arc<Self>, study_uid: &str, session_id: Uuid, epoch: u64) {
        let quiet_for = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(study_uid) {
                Some(s)
                    if s.session_id == session_id
                        && s.timer_epoch == epoch
                        && s.state == SessionState::Accumulating =>
                {
                    s.state = SessionState::Dispatching;
                    s.timer = None;
                    // Counted while the claim is still atomic, so a shutdown
                    // scan can never miss a dispatch it should wait for.
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                    Some(s.last_arrival.elapsed())
                }
                _ => None,
            }
        };

        let Some(quiet_for) = quiet_for else {
            // Lost the race to a reschedule (or the session is already
            // gone). Expected and frequent.
            debug!(target: "tracker", study_uid, epoch, "stale timer fire ignored");
            return;
        };

        info!(
            target: "tracker",
            study_uid,
            session_id = %session_id,
            quiet_secs = quiet_for.as_secs(),
            "study idle deadline reached; dispatching"
        );

        match self.dispatcher.dispatch(study_uid).await {
            Ok(DispatchOutcome::Sent { bytes, digest }) => {
                info!(
                    target: "tracker",
                    study_uid,
                    session_id = %session_id,
                    bytes,
                    digest = %digest,
                    "study dispatched"
                );
            }
            Ok(DispatchOutcome::Skipped) => {
                warn!(
                    target: "tracker",
                    study_uid,
                    session_id = %session_id,
                    "study directory vanished before dispatch; nothing to send"
                );
            }
            Err(e) => {
                // Failure is isolated to this study; data stays on disk for
                // manual recovery.
                error!(
                    target: "tracker",
                    study_uid,
                    session_id = %session_id,
                    error = ?e,
                    "dispatch failed; study left on disk"
                );
            }
        }

        // Close the session, unless a late arrival already replaced it.
        {
            let mut sessions = self.sessions.lock();
            if sessions
                .get(study_uid)
                .is_some_and(|s| s.session_id == session_id)
            {
                sessions.remove(study_uid);
            }
        }

        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DispatchError, TransmitError};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use tokio::task::JoinSet;
    use tokio::time::advance;

    /// Dispatcher that records claim instants and can be slowed down or
    /// made to fail.
    #[derive(Default)]
    struct RecordingDispatcher {
        calls: Mutex<Vec<(String, Instant)>>,
        delay: Option<Duration>,
        fail: bool,
    }

    #[async_trait]
    impl StudyDispatcher for RecordingDispatcher {
        async fn dispatch(&self, study_uid: &str) -> Result<DispatchOutcome, DispatchError> {
            self.calls
                .lock()
                .push((study_uid.to_string(), Instant::now()));

            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }

            if self.fail {
                return Err(DispatchError::Transmit(TransmitError::Rejected {
                    status: StatusCode::UNAUTHORIZED,
                }));
            }

            Ok(DispatchOutcome::Sent {
                bytes: 1,
                digest: "d".into(),
            })
        }
    }

    fn calls(d: &RecordingDispatcher) -> Vec<(String, Instant)> {
        d.calls.lock().clone()
    }

    /// Let spawned timer tasks observe an advanced clock.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_fires_once_after_last_arrival_plus_timeout() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let tracker = StudyTracker::new(Duration::from_secs(15), dispatcher.clone());

        let t0 = Instant::now();

        tracker.touch("S1");
        advance(Duration::from_secs(5)).await;
        tracker.touch("S1");
        advance(Duration::from_secs(5)).await;
        tracker.touch("S1");

        // One second short of the deadline: nothing yet.
        advance(Duration::from_secs(14)).await;
        settle().await;
        assert!(calls(&dispatcher).is_empty());

        // Land exactly on the deadline.
        advance(Duration::from_secs(1)).await;
        settle().await;

        let recorded = calls(&dispatcher);
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "S1");
        assert_eq!(recorded[0].1.duration_since(t0), Duration::from_secs(25));

        // Session closed afterwards.
        assert_eq!(tracker.open_sessions(), 0);

        // Quiet ever after: still exactly one dispatch.
        advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(calls(&dispatcher).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_always_beats_or_loses_cleanly_to_fire() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let tracker = StudyTracker::new(Duration::from_secs(10), dispatcher.clone());

        // Hammer the deadline right at the boundary many times; however the
        // races resolve, a genuinely idle study must dispatch exactly once.
        tracker.touch("S1");
        for _ in 0..50 {
            advance(Duration::from_secs(10)).await;
            tracker.touch("S1");
        }

        advance(Duration::from_secs(11)).await;
        settle().await;

        // At least one dispatch happened (the final quiet period), and
        // every dispatch that did happen was claimed by exactly one timer:
        // the session count must be back to zero with no duplicates for a
        // single quiet stretch.
        let n = calls(&dispatcher).len();
        assert!(n >= 1);
        assert_eq!(tracker.open_sessions(), 0);

        // After the dust settles nothing else fires.
        advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(calls(&dispatcher).len(), n);
    }

    #[tokio::test(start_paused = true)]
    async fn late_arrival_during_dispatch_opens_follow_up_session() {
        let dispatcher = Arc::new(RecordingDispatcher {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let tracker = StudyTracker::new(Duration::from_secs(10), dispatcher.clone());

        tracker.touch("S1");
        advance(Duration::from_secs(11)).await;
        settle().await;

        // First dispatch claimed and now sleeping inside the pipeline.
        assert_eq!(calls(&dispatcher).len(), 1);

        // Trickle-in while dispatching: must not resurrect the closing
        // session, must open a new one.
        tracker.touch("S1");
        assert_eq!(tracker.open_sessions(), 1);

        // New session goes quiet -> second dispatch for the same study.
        advance(Duration::from_secs(11)).await;
        settle().await;
        assert_eq!(calls(&dispatcher).len(), 2);

        // Let both pipeline sleeps finish; both sessions close.
        advance(Duration::from_secs(40)).await;
        settle().await;
        assert_eq!(tracker.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dispatch_never_blocks_other_studies() {
        let dispatcher = Arc::new(RecordingDispatcher {
            delay: Some(Duration::from_secs(300)),
            ..Default::default()
        });
        let tracker = StudyTracker::new(Duration::from_secs(5), dispatcher.clone());

        tracker.touch("SLOW");
        advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(calls(&dispatcher).len(), 1);

        // SLOW is stuck in its upload; FAST must still flow end to end.
        tracker.touch("FAST");
        advance(Duration::from_secs(6)).await;
        settle().await;

        let recorded = calls(&dispatcher);
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].0, "FAST");
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_failure_closes_session_and_stays_isolated() {
        let dispatcher = Arc::new(RecordingDispatcher {
            fail: true,
            ..Default::default()
        });
        let tracker = StudyTracker::new(Duration::from_secs(5), dispatcher.clone());

        tracker.touch("S1");
        tracker.touch("S2");
        advance(Duration::from_secs(6)).await;
        settle().await;

        assert_eq!(calls(&dispatcher).len(), 2);
        assert_eq!(tracker.open_sessions(), 0);

        // A failed study can come back later as a fresh session.
        tracker.touch("S1");
        assert_eq!(tracker.open_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_touches_keep_one_session_per_study() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let tracker = StudyTracker::new(Duration::from_secs(30), dispatcher.clone());

        let mut set = JoinSet::new();
        for i in 0..64 {
            let t = Arc::clone(&tracker);
            set.spawn(async move {
                t.touch(&format!("study-{}", i % 4));
            });
        }
        while let Some(res) = set.join_next().await {
            res.expect("task panicked");
        }

        assert_eq!(tracker.open_sessions(), 4);
        assert!(calls(&dispatcher).is_empty());

        advance(Duration::from_secs(31)).await;
        settle().await;

        // One dispatch per distinct study, regardless of touch count.
        let mut dispatched: Vec<_> = calls(&dispatcher).into_iter().map(|(s, _)| s).collect();
        dispatched.sort();
        assert_eq!(
            dispatched,
            vec!["study-0", "study-1", "study-2", "study-3"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_timers_and_waits_for_in_flight() {
        let dispatcher = Arc::new(RecordingDispatcher {
            delay: Some(Duration::from_secs(3)),
            ..Default::default()
        });
        let tracker = StudyTracker::new(Duration::from_secs(5), dispatcher.clone());

        // One study mid-dispatch, one still accumulating.
        tracker.touch("DISPATCHING");
        advance(Duration::from_secs(6)).await;
        settle().await;
        tracker.touch("PENDING");

        assert_eq!(calls(&dispatcher).len(), 1);

        tracker.shutdown(Duration::from_secs(10)).await;

        // Pending timer was released, the in-flight dispatch completed, and
        // no new work is accepted.
        assert!(!tracker.is_accepting());
        assert_eq!(tracker.open_sessions(), 0);
        assert_eq!(calls(&dispatcher).len(), 1);

        tracker.touch("LATE");
        advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(calls(&dispatcher).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_grace_bounds_the_wait() {
        let dispatcher = Arc::new(RecordingDispatcher {
            delay: Some(Duration::from_secs(600)),
            ..Default::default()
        });
        let tracker = StudyTracker::new(Duration::from_secs(1), dispatcher.clone());

        tracker.touch("STUCK");
        advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(calls(&dispatcher).len(), 1);

        let start = Instant::now();
        tracker.shutdown(Duration::from_secs(5)).await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
