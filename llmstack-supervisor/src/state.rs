use serde::Serialize;

/// Lifecycle state of one service as last seen by its supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Not inspected yet
    #[default]
    Unknown,
    NotRunning,
    /// Launched, waiting for the liveness endpoint
    Starting,
    Healthy,
    /// Running but not answering its liveness endpoint
    Unhealthy,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Observed { running: bool, healthy: bool },
    LaunchIssued,
    LaunchFailed,
    BecameReady,
    ReadyTimedOut,
    StopRequested,
    StopCompleted,
    StopFailed,
}

impl ServiceState {
    /// Pure transition function; the supervisor performs the I/O and feeds
    /// the observed outcome back in.
    pub fn on_event(self, event: Event) -> ServiceState {
        match (self, event) {
            (_, Event::Observed { running: false, .. }) => ServiceState::NotRunning,
            (_, Event::Observed {
                running: true,
                healthy: true,
            }) => ServiceState::Healthy,
            (_, Event::Observed {
                running: true,
                healthy: false,
            }) => ServiceState::Unhealthy,
            (_, Event::LaunchIssued) => ServiceState::Starting,
            (ServiceState::Starting, Event::LaunchFailed) => ServiceState::NotRunning,
            (ServiceState::Starting, Event::BecameReady) => ServiceState::Healthy,
            (ServiceState::Starting, Event::ReadyTimedOut) => ServiceState::Unhealthy,
            (_, Event::StopRequested) => ServiceState::Stopping,
            (ServiceState::Stopping, Event::StopCompleted) => ServiceState::Stopped,
            (ServiceState::Stopping, Event::StopFailed) => ServiceState::Unhealthy,
            (state, _) => state,
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceState::Unknown => "unknown",
            ServiceState::NotRunning => "not running",
            ServiceState::Starting => "starting",
            ServiceState::Healthy => "healthy",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_sets_state_from_any_state() {
        for state in [ServiceState::Unknown, ServiceState::Stopped, ServiceState::Starting] {
            assert_eq!(
                state.on_event(Event::Observed {
                    running: true,
                    healthy: true
                }),
                ServiceState::Healthy
            );
            assert_eq!(
                state.on_event(Event::Observed {
                    running: true,
                    healthy: false
                }),
                ServiceState::Unhealthy
            );
            assert_eq!(
                state.on_event(Event::Observed {
                    running: false,
                    healthy: true
                }),
                ServiceState::NotRunning
            );
        }
    }

    #[test]
    fn test_start_path() {
        let state = ServiceState::NotRunning.on_event(Event::LaunchIssued);
        assert_eq!(state, ServiceState::Starting);
        assert_eq!(state.on_event(Event::BecameReady), ServiceState::Healthy);
        assert_eq!(state.on_event(Event::ReadyTimedOut), ServiceState::Unhealthy);
        assert_eq!(state.on_event(Event::LaunchFailed), ServiceState::NotRunning);
    }

    #[test]
    fn test_stop_path() {
        let state = ServiceState::Healthy.on_event(Event::StopRequested);
        assert_eq!(state, ServiceState::Stopping);
        assert_eq!(state.on_event(Event::StopCompleted), ServiceState::Stopped);
        assert_eq!(state.on_event(Event::StopFailed), ServiceState::Unhealthy);
    }

    #[test]
    fn test_out_of_order_events_are_ignored() {
        assert_eq!(
            ServiceState::Healthy.on_event(Event::StopCompleted),
            ServiceState::Healthy
        );
        assert_eq!(
            ServiceState::Stopped.on_event(Event::BecameReady),
            ServiceState::Stopped
        );
    }
}
