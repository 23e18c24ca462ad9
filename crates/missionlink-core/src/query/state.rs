use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPhase {
    /// No key yet, nothing fetched
    Idle,
    Loading,
    Success,
    Error,
}

/// Snapshot of one resource: `{data, loading, error}` plus its phase.
///
/// `data` survives failed and in-progress fetches, so a view can keep
/// showing the last good value next to an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<String>,
    pub phase: QueryPhase,
}

impl<T> QueryState<T> {
    pub fn idle() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            phase: QueryPhase::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase == QueryPhase::Idle
    }

    pub fn is_success(&self) -> bool {
        self.phase == QueryPhase::Success
    }

    pub fn is_error(&self) -> bool {
        self.phase == QueryPhase::Error
    }

    pub(crate) fn start(&mut self) {
        self.loading = true;
        self.error = None;
        self.phase = QueryPhase::Loading;
    }

    pub(crate) fn succeed(&mut self, data: T) {
        self.data = Some(data);
        self.loading = false;
        self.error = None;
        self.phase = QueryPhase::Success;
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.loading = false;
        self.error = Some(message);
        self.phase = QueryPhase::Error;
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_keeps_data() {
        let mut state = QueryState::idle();
        state.start();
        state.succeed(vec![1, 2]);
        state.start();
        assert!(state.loading);
        assert_eq!(state.data, Some(vec![1, 2]));

        state.fail("offline".to_string());
        assert!(!state.loading);
        assert!(state.is_error());
        assert_eq!(state.data, Some(vec![1, 2]));
    }

    #[test]
    fn test_serializes_phase_in_snake_case() {
        let state: QueryState<u32> = QueryState::idle();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["phase"], "idle");
        assert_eq!(json["loading"], false);
        assert!(json["data"].is_null());
    }
}
