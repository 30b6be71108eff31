pub const SETPOINT_MIN: i32 = 0;
pub const SETPOINT_MAX: i32 = 180;
pub const SETPOINT_STEP: i32 = 1;

/// Serial-driven setpoint for the stand-alone build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualOverride {
    setpoint: i32,
}

impl Default for ManualOverride {
    fn default() -> Self {
        Self {
            setpoint: midpoint(),
        }
    }
}

impl ManualOverride {
    pub fn setpoint(&self) -> u16 {
        self.setpoint as u16
    }

    /// Applies one command byte. Returns the setpoint when the command calls
    /// for a status line.
    pub fn apply(&mut self, command: u8) -> Option<u16> {
        let report = match command {
            b'+' => {
                self.setpoint += SETPOINT_STEP;
                true
            }
            b'-' => {
                self.setpoint -= SETPOINT_STEP;
                true
            }
            b'1' => {
                self.setpoint = SETPOINT_MAX;
                true
            }
            b'0' => {
                self.setpoint = SETPOINT_MIN;
                true
            }
            b'=' => {
                self.setpoint = midpoint();
                true
            }
            b'p' => true,
            _ => false,
        };
        self.setpoint = self.setpoint.clamp(SETPOINT_MIN, SETPOINT_MAX);

        report.then(|| self.setpoint())
    }

    /// Setpoint scaled onto the water duty range.
    pub fn water_duty(&self) -> u16 {
        let span = (SETPOINT_MAX - SETPOINT_MIN) as u32;
        let offset = (self.setpoint - SETPOINT_MIN) as u32;
        (offset * u32::from(u16::MAX) / span) as u16
    }
}

pub fn status_line(setpoint: u16) -> String {
    format!("control:{setpoint}")
}

fn midpoint() -> i32 {
    (SETPOINT_MIN + SETPOINT_MAX) / 2
}
