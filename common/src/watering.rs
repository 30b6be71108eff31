use crate::config::Configuration;

/// Exactly one timestamp drives the machine at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WateringState {
    /// `due_ms` is `None` while no interval is configured.
    Waiting { due_ms: Option<u64> },
    Active { stop_ms: u64, power: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WateringTransition {
    Opened { power: u16 },
    Closed,
}

#[derive(Debug, Clone)]
pub struct WateringMachine {
    state: WateringState,
    open_duration_ms: u64,
}

impl WateringMachine {
    /// Starts waiting; the first cycle is one full interval after `now_ms`.
    pub fn new(open_duration_ms: u64, config: &Configuration, now_ms: u64) -> Self {
        Self {
            state: WateringState::Waiting {
                due_ms: next_due(config, now_ms),
            },
            open_duration_ms,
        }
    }

    pub fn state(&self) -> WateringState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, WateringState::Active { .. })
    }

    pub fn water_duty(&self) -> u16 {
        match self.state {
            WateringState::Active { power, .. } => power,
            WateringState::Waiting { .. } => 0,
        }
    }

    pub fn tick(&mut self, now_ms: u64, config: &Configuration) -> Option<WateringTransition> {
        match self.state {
            WateringState::Waiting { due_ms: None } => {
                // An interval showed up after boot; start counting from here.
                if let Some(due_ms) = next_due(config, now_ms) {
                    self.state = WateringState::Waiting {
                        due_ms: Some(due_ms),
                    };
                }
                None
            }
            WateringState::Waiting {
                due_ms: Some(due_ms),
            } if now_ms >= due_ms => {
                let power = config.water_power;
                self.state = WateringState::Active {
                    stop_ms: now_ms.saturating_add(self.open_duration_ms),
                    power,
                };
                Some(WateringTransition::Opened { power })
            }
            WateringState::Active { stop_ms, .. } if now_ms >= stop_ms => {
                self.state = WateringState::Waiting {
                    due_ms: next_due(config, now_ms),
                };
                Some(WateringTransition::Closed)
            }
            _ => None,
        }
    }
}

fn next_due(config: &Configuration, now_ms: u64) -> Option<u64> {
    config
        .water_interval_s
        .map(|interval_s| now_ms.saturating_add(u64::from(interval_s) * 1_000))
}
