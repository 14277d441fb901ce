//! The writer lifecycle: `NEW -> INITIALIZING -> RUNNING -> STOPPING ->
//! STOPPED`, with `INITIALIZING -> INIT_FAILED` on a fatal setup error.
//! `INIT_FAILED` and `STOPPED` are terminal.

/// A writer's lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Constructed but not yet started.
    New,
    /// Resolving the destination (creating the group/stream/topic if
    /// absent, fetching the initial sequence token).
    Initializing,
    /// Pulling batches from the queue and sending them.
    Running,
    /// A stop was requested; draining in-flight work before terminating.
    Stopping,
    /// Terminated normally.
    Stopped,
    /// Initialization failed fatally; the writer never ran.
    InitFailed,
}

impl WriterState {
    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: WriterState) -> bool {
        use WriterState::*;
        matches!(
            (self, next),
            (New, Initializing) | (Initializing, Running) | (Initializing, InitFailed) | (Running, Stopping) | (Stopping, Stopped)
        )
    }

    /// Whether this phase is terminal: no further transitions are legal.
    pub fn is_terminal(self) -> bool {
        matches!(self, WriterState::Stopped | WriterState::InitFailed)
    }
}
