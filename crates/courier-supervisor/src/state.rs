use std::fmt;

use serde::Serialize;

/// Lifecycle state of a supervisor. Exactly one at a time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    Stopped,
    Starting,
    Listening,
    Restarting,
    CircuitOpen,
    ShuttingDown,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Restarting => "restarting",
            Self::CircuitOpen => "circuit_open",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Whether the supervisor still owns a live loop.
    pub fn is_running(&self) -> bool {
        !matches!(self, Self::Stopped | Self::ShuttingDown)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive [`transition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SupervisorEvent {
    Start,
    StreamOpened,
    StreamFailed,
    CircuitTripped,
    BackoffElapsed,
    Shutdown,
    LoopExited,
}

/// Total transition function. Pairs without a meaning keep the current state.
pub fn transition(state: SupervisorState, event: SupervisorEvent) -> SupervisorState {
    use SupervisorEvent as E;
    use SupervisorState as S;

    match (state, event) {
        (S::Stopped, E::Shutdown) => S::Stopped,
        (_, E::Shutdown) => S::ShuttingDown,
        (_, E::LoopExited) => S::Stopped,

        (S::Stopped, E::Start) => S::Starting,
        (S::Starting, E::StreamOpened) => S::Listening,
        (S::Starting | S::Listening, E::StreamFailed) => S::Restarting,
        (S::Restarting, E::CircuitTripped) => S::CircuitOpen,
        (S::Restarting | S::CircuitOpen, E::BackoffElapsed) => S::Starting,

        (s, _) => s,
    }
}
