use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MonitorState {
    Closed,
    Monitoring,
    Idle,
    Closing,
}

impl MonitorState {
    pub(crate) fn can_transition_to(self, next: MonitorState) -> bool {
        use MonitorState::*;
        match self {
            Closing => matches!(next, Closing | Idle | Closed),
            Closed => matches!(next, Closed | Monitoring),
            Idle => matches!(next, Idle | Monitoring | Closing),
            Monitoring => matches!(next, Monitoring | Idle | Closing),
        }
    }

    /// A check may only be requested while the monitor is waiting for its
    /// next scheduled check.
    pub(crate) fn accepts_check_requests(self) -> bool {
        self == MonitorState::Idle
    }

    pub(crate) fn is_closing_or_closed(self) -> bool {
        matches!(self, MonitorState::Closing | MonitorState::Closed)
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Monitoring => "monitoring",
            Self::Idle => "idle",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}
