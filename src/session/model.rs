use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle of one open study session.
///
/// `Closed` has no variant here: a closed session is simply removed from
/// the tracker's index, so holding a `StudySession` implies it is live.
/// There is no transition back from `Dispatching`; instances that arrive
/// after the claim go into a brand-new session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Receiving instances; an idle timer is pending.
    Accumulating,
    /// The idle deadline elapsed and the dispatch pipeline owns the study.
    Dispatching,
}

/// In-memory record of one study currently flowing through the relay.
///
/// Invariants (enforced by the tracker, which owns the only reference):
/// - at most one live timer task per session; rescheduling aborts the old
///   task and bumps `timer_epoch` so a stale fire cannot claim the session
/// - `session_id` distinguishes this session from a successor created for
///   the same study UID while this one is still dispatching
pub struct StudySession {
    pub session_id: Uuid,
    pub state: SessionState,

    /// Generation counter for the pending timer. A fire only proceeds when
    /// its captured epoch still matches, which makes cancel-vs-fire a
    /// strict either/or.
    pub timer_epoch: u64,

    /// When the most recent instance for this session hit storage.
    pub last_arrival: Instant,

    /// Handle of the pending idle timer, if any.
    pub timer: Option<JoinHandle<()>>,
}

impl StudySession {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            state: SessionState::Accumulating,
            timer_epoch: 0,
            last_arrival: Instant::now(),
            timer: None,
        }
    }
}

impl Default for StudySession {
    fn default() -> Self {
        Self::new()
    }
}
