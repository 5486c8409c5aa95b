use crate::events::LogSink;
use std::{fmt, sync::Arc};
use tokio::sync::watch;

/// Where the orchestrator is in its sequence
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BootstrapState {
    Idle,
    Preparing,
    Downloading,
    Extracting,
    Starting,
    WaitingForSecondaryProcess,
    Running,
    Error(String),
}

impl BootstrapState {
    /// Whether an orchestration run is doing work in this state
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            BootstrapState::Idle | BootstrapState::Running | BootstrapState::Error(_)
        )
    }

    /// Allowed moves between states
    ///
    /// Returning to `Idle` is not a transition; only stopping does that.
    pub fn can_transition_to(&self, next: &BootstrapState) -> bool {
        use BootstrapState::*;
        match (self, next) {
            (_, Error(_)) => true,
            (Idle, Preparing) | (Idle, Starting) => true,
            (Error(_), Preparing) => true,
            (Preparing, Downloading) | (Preparing, Extracting) | (Preparing, Starting) => true,
            (Downloading, Extracting) => true,
            (Extracting, Preparing) | (Extracting, Starting) => true,
            (Starting, WaitingForSecondaryProcess) => true,
            (WaitingForSecondaryProcess, Running) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BootstrapState::Idle => f.write_str("idle"),
            BootstrapState::Preparing => f.write_str("preparing"),
            BootstrapState::Downloading => f.write_str("downloading"),
            BootstrapState::Extracting => f.write_str("extracting"),
            BootstrapState::Starting => f.write_str("starting"),
            BootstrapState::WaitingForSecondaryProcess => f.write_str("waiting for secondary process"),
            BootstrapState::Running => f.write_str("running"),
            BootstrapState::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// State plus overall progress, as observers see it
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub state: BootstrapState,
    /// Overall fraction in `0.0..=1.0`
    pub progress: f64,
}

impl Status {
    /// The message attached to an `Error` state
    pub fn error(&self) -> Option<&str> {
        match &self.state {
            BootstrapState::Error(message) => Some(message),
            _ => None,
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status {
            state: BootstrapState::Idle,
            progress: 0.0,
        }
    }
}

/// Publishes [Status] to any number of watchers
///
/// Progress only moves forward within a run; [StatusBoard::begin_run] and
/// [StatusBoard::reset] are the only ways back to zero.
#[derive(Clone, Debug)]
pub(crate) struct StatusBoard {
    tx: Arc<watch::Sender<Status>>,
    log: LogSink,
}

impl StatusBoard {
    pub fn new(log: LogSink) -> Self {
        let (tx, _) = watch::channel(Status::default());
        StatusBoard {
            tx: Arc::new(tx),
            log,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Status {
        self.tx.borrow().clone()
    }

    /// Enter the first state of a fresh run, progress back at zero
    pub fn begin_run(&self, state: BootstrapState) -> bool {
        let mut moved = false;
        self.tx.send_if_modified(|status| {
            if status.state.can_transition_to(&state) {
                status.state = state.clone();
                status.progress = 0.0;
                moved = true;
            }
            moved
        });
        if moved {
            self.log.push(format!("State: {}", state));
        } else {
            log::warn!("ignoring run start in state {:?}", self.current().state);
        }
        moved
    }

    /// Move to `next` if the table allows it; staying put is a no-op
    ///
    /// Returns true only when the state actually changed.
    pub fn transition(&self, next: BootstrapState) -> bool {
        let mut moved = false;
        let mut refused = None;
        self.tx.send_if_modified(|status| {
            if status.state == next {
                false
            } else if status.state.can_transition_to(&next) {
                status.state = next.clone();
                moved = true;
                true
            } else {
                refused = Some(status.state.clone());
                false
            }
        });
        if moved {
            self.log.push(format!("State: {}", next));
        }
        if let Some(from) = refused {
            log::warn!("refusing state change {:?} -> {:?}", from, next);
        }
        moved
    }

    /// Raise progress to `fraction`; lower values are ignored
    pub fn advance(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.tx.send_if_modified(|status| {
            if fraction > status.progress {
                status.progress = fraction;
                true
            } else {
                false
            }
        });
    }

    pub fn fail<S: Into<String>>(&self, message: S) {
        self.transition(BootstrapState::Error(message.into()));
    }

    /// Back to `Idle` with no progress, whatever the current state
    pub fn reset(&self) {
        self.tx.send_replace(Status::default());
        self.log.push(format!("State: {}", BootstrapState::Idle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BootstrapState::*;

    #[test]
    fn transition_table() {
        let allowed = [
            (Idle, Preparing),
            (Idle, Starting),
            (Preparing, Downloading),
            (Preparing, Extracting),
            (Preparing, Starting),
            (Downloading, Extracting),
            (Extracting, Preparing),
            (Extracting, Starting),
            (Starting, WaitingForSecondaryProcess),
            (WaitingForSecondaryProcess, Running),
            (Error("x".into()), Preparing),
            (Running, Error("x".into())),
            (Downloading, Error("x".into())),
        ];
        for (from, to) in &allowed {
            assert!(from.can_transition_to(to), "{:?} -> {:?}", from, to);
        }

        let refused = [
            (Idle, Running),
            (Downloading, Preparing),
            (Starting, Extracting),
            (Running, Starting),
            (WaitingForSecondaryProcess, Starting),
            (Error("x".into()), Starting),
            (Running, Idle),
            (Extracting, Downloading),
        ];
        for (from, to) in &refused {
            assert!(!from.can_transition_to(to), "{:?} -> {:?}", from, to);
        }
    }

    #[test]
    fn active_states() {
        assert!(!Idle.is_active());
        assert!(!Running.is_active());
        assert!(!Error("boom".into()).is_active());
        assert!(Preparing.is_active());
        assert!(WaitingForSecondaryProcess.is_active());
    }

    #[test]
    fn board_progress_is_monotonic() {
        let board = StatusBoard::new(LogSink::new(16));
        assert!(board.begin_run(Preparing));
        board.advance(0.4);
        board.advance(0.2);
        assert_eq!(board.current().progress, 0.4);
        board.advance(7.0);
        assert_eq!(board.current().progress, 1.0);
    }

    #[test]
    fn board_refuses_bad_moves() {
        let log = LogSink::new(16);
        let board = StatusBoard::new(log.clone());
        assert!(!board.transition(Running));
        assert_eq!(board.current().state, Idle);
        assert!(board.transition(Starting));
        assert!(!board.transition(Starting));
        board.fail("no route to host");
        assert_eq!(board.current().error(), Some("no route to host"));
        assert!(log.lines().contains(&"State: starting".to_string()));
        board.reset();
        assert_eq!(board.current(), Status::default());
    }
}
