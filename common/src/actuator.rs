use core::fmt;

use log::{debug, warn};

use crate::{config::Configuration, manual::ManualOverride, watering::WateringMachine};

/// Hardware outputs. A failed write is retried on the next refresh.
pub trait Outputs {
    type Error: fmt::Display;

    fn set_fan(&mut self, duty: u16) -> Result<(), Self::Error>;
    fn set_door(&mut self, angle: u16) -> Result<(), Self::Error>;
    fn set_water(&mut self, duty: u16) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActuatorLevels {
    pub fan: u16,
    pub door: u16,
    pub water: u16,
}

impl ActuatorLevels {
    pub fn resolve(
        config: &Configuration,
        watering: &WateringMachine,
        manual: Option<&ManualOverride>,
        fallback_fan: u16,
    ) -> Self {
        let (fan, door) = if config.master {
            (config.fan_speed, config.door_angle)
        } else {
            (fallback_fan, 0)
        };

        Self {
            fan,
            door,
            water: water_level(watering, manual),
        }
    }
}

/// The stand-alone build has no timer-driven watering; its override owns the
/// water output.
pub fn water_level(watering: &WateringMachine, manual: Option<&ManualOverride>) -> u16 {
    match manual {
        Some(manual) => manual.water_duty(),
        None => watering.water_duty(),
    }
}

pub struct ActuatorController<O> {
    outputs: O,
    fallback_fan: u16,
    fan: Option<u16>,
    door: Option<u16>,
    water: Option<u16>,
}

impl<O: Outputs> ActuatorController<O> {
    pub fn new(outputs: O, fallback_fan: u16) -> Self {
        Self {
            outputs,
            fallback_fan,
            fan: None,
            door: None,
            water: None,
        }
    }

    pub fn refresh(
        &mut self,
        config: &Configuration,
        watering: &WateringMachine,
        manual: Option<&ManualOverride>,
    ) -> ActuatorLevels {
        let levels = ActuatorLevels::resolve(config, watering, manual, self.fallback_fan);

        drive(&mut self.fan, levels.fan, "fan duty", |duty| self.outputs.set_fan(duty));
        drive(&mut self.door, levels.door, "door angle", |angle| {
            self.outputs.set_door(angle)
        });
        self.apply_water(levels.water);

        levels
    }

    pub fn apply_water(&mut self, duty: u16) {
        drive(&mut self.water, duty, "water duty", |duty| self.outputs.set_water(duty));
    }

    pub fn outputs(&self) -> &O {
        &self.outputs
    }
}

/// Writes `level` unless it is already in place. A failed write forgets the
/// cached level so the next call tries again.
fn drive<E: fmt::Display>(
    cached: &mut Option<u16>,
    level: u16,
    output: &str,
    write: impl FnOnce(u16) -> Result<(), E>,
) {
    if *cached == Some(level) {
        return;
    }
    debug!("{output} -> {level}");
    match write(level) {
        Ok(()) => *cached = Some(level),
        Err(err) => {
            warn!("failed to set {output} {level}: {err}");
            *cached = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use core::convert::Infallible;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        writes: Vec<(&'static str, u16)>,
    }

    impl Outputs for Recorder {
        type Error = Infallible;

        fn set_fan(&mut self, duty: u16) -> Result<(), Infallible> {
            self.writes.push(("fan", duty));
            Ok(())
        }

        fn set_door(&mut self, angle: u16) -> Result<(), Infallible> {
            self.writes.push(("door", angle));
            Ok(())
        }

        fn set_water(&mut self, duty: u16) -> Result<(), Infallible> {
            self.writes.push(("water", duty));
            Ok(())
        }
    }

    /// Rejects the first `door_failures` door writes.
    #[derive(Default)]
    struct StickyDoor {
        door_failures: u32,
        doors: Vec<u16>,
    }

    impl Outputs for StickyDoor {
        type Error = &'static str;

        fn set_fan(&mut self, _duty: u16) -> Result<(), Self::Error> {
            Ok(())
        }

        fn set_door(&mut self, angle: u16) -> Result<(), Self::Error> {
            if self.door_failures > 0 {
                self.door_failures -= 1;
                return Err("servo busy");
            }
            self.doors.push(angle);
            Ok(())
        }

        fn set_water(&mut self, _duty: u16) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    fn config(master: bool) -> Configuration {
        Configuration {
            fan_speed: 800,
            door_angle: 120,
            water_interval_s: Some(60),
            water_power: 5_000,
            master,
        }
    }

    #[test]
    fn master_follows_configuration() {
        let watering = WateringMachine::new(1_000, &config(true), 0);

        let levels = ActuatorLevels::resolve(&config(true), &watering, None, 512);

        assert_eq!(
            levels,
            ActuatorLevels {
                fan: 800,
                door: 120,
                water: 0
            }
        );
    }

    #[test]
    fn fallback_closes_door_and_idles_fan() {
        let mut watering = WateringMachine::new(1_000, &config(false), 0);
        watering.tick(60_000, &config(false));

        let levels = ActuatorLevels::resolve(&config(false), &watering, None, 512);

        assert_eq!(
            levels,
            ActuatorLevels {
                fan: 512,
                door: 0,
                water: 5_000
            }
        );
    }

    #[test]
    fn manual_override_owns_water() {
        let watering = WateringMachine::new(1_000, &config(false), 0);
        let mut manual = ManualOverride::default();
        manual.apply(b'1');

        let levels = ActuatorLevels::resolve(&config(false), &watering, Some(&manual), 512);

        assert_eq!(levels.water, u16::MAX);
    }

    #[test]
    fn only_changed_levels_are_written() {
        let watering = WateringMachine::new(1_000, &config(true), 0);
        let mut controller = ActuatorController::new(Recorder::default(), 512);

        controller.refresh(&config(true), &watering, None);
        controller.refresh(&config(true), &watering, None);
        controller.refresh(&config(false), &watering, None);

        assert_eq!(
            controller.outputs().writes,
            vec![
                ("fan", 800),
                ("door", 120),
                ("water", 0),
                ("fan", 512),
                ("door", 0)
            ]
        );
    }

    #[test]
    fn failed_write_is_retried_on_next_refresh() {
        let watering = WateringMachine::new(1_000, &config(true), 0);
        let outputs = StickyDoor {
            door_failures: 1,
            ..StickyDoor::default()
        };
        let mut controller = ActuatorController::new(outputs, 512);

        controller.refresh(&config(true), &watering, None);
        assert!(controller.outputs().doors.is_empty());

        controller.refresh(&config(true), &watering, None);
        controller.refresh(&config(true), &watering, None);
        assert_eq!(controller.outputs().doors, vec![120]);
    }
}
