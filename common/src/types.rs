#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Override {
    #[default]
    None,
    ForceOn,
    ForceOff,
}

impl Override {
    pub fn form_value(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ForceOn => "on",
            Self::ForceOff => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Idle,
    ActiveFlowOk,
    ActiveLowFlow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlState {
    pub running: bool,
    pub polarity: bool,
    pub flow_ok: bool,
    pub cycle_count: u32,
}

impl ControlState {
    pub fn cell_state(&self) -> CellState {
        match (self.running, self.flow_ok) {
            (false, _) => CellState::Idle,
            (true, true) => CellState::ActiveFlowOk,
            (true, false) => CellState::ActiveLowFlow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLine {
    Running,
    Sleeping,
    Upgrading,
}

impl StatusLine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Sleeping => "Sleeping",
            Self::Upgrading => "Upgrading...",
        }
    }

    pub fn from_state(control: &ControlState, upgrading: bool) -> Self {
        if upgrading {
            Self::Upgrading
        } else if control.running {
            Self::Running
        } else {
            Self::Sleeping
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSample {
    pub raw: u16,
    pub millivolts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_state_from_snapshot() {
        let mut state = ControlState::default();
        assert_eq!(state.cell_state(), CellState::Idle);

        state.running = true;
        assert_eq!(state.cell_state(), CellState::ActiveLowFlow);

        state.flow_ok = true;
        assert_eq!(state.cell_state(), CellState::ActiveFlowOk);
    }

    #[test]
    fn upgrading_wins_over_running() {
        let state = ControlState {
            running: true,
            ..ControlState::default()
        };

        assert_eq!(StatusLine::from_state(&state, false), StatusLine::Running);
        assert_eq!(StatusLine::from_state(&state, true).as_str(), "Upgrading...");
        assert_eq!(
            StatusLine::from_state(&ControlState::default(), false).as_str(),
            "Sleeping"
        );
    }
}
