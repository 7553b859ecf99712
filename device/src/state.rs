//! In-memory state machines for each device category.
//!
//! Actuators mutate on commands; sensors mutate on a timer. Either way the
//! advertised TXT properties are derived from the state, never the reverse.

use std::collections::HashMap;

use rand::Rng;

use discovery::{DeviceCategory, ServiceKind};
use protocol::{ActuatorAction, ErrorBody, ErrorCode};

/// State of a light lamp actuator.
#[derive(Debug, Clone, PartialEq)]
pub struct LightLampState {
    pub is_on: bool,
    pub brightness: u8,
    pub color: String,
}

impl Default for LightLampState {
    fn default() -> Self {
        Self {
            is_on: false,
            brightness: 100,
            color: "warm_white".to_string(),
        }
    }
}

/// State of a sink actuator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkState {
    pub is_on: bool,
}

/// State of a toilet actuator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToiletState {
    pub flushing: bool,
    pub lid_open: bool,
}

/// Readings of a fart detector sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FartDetectorState {
    pub intensity: u8,
    pub alert: bool,
}

/// Readings of a water leak sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaterLeakState {
    pub moisture: u8,
    pub leak: bool,
}

/// One device's state, dispatched on the category tag.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceState {
    LightLamp(LightLampState),
    Sink(SinkState),
    Toilet(ToiletState),
    FartDetector(FartDetectorState),
    WaterLeak(WaterLeakState),
}

impl DeviceState {
    /// Initial state for a category: defaults for actuators, a randomized
    /// first reading for sensors.
    pub fn seeded<R: Rng>(category: DeviceCategory, rng: &mut R) -> Self {
        let mut state = match category {
            DeviceCategory::LightLamp => DeviceState::LightLamp(LightLampState::default()),
            DeviceCategory::Sink => DeviceState::Sink(SinkState::default()),
            DeviceCategory::Toilet => DeviceState::Toilet(ToiletState::default()),
            DeviceCategory::FartDetector => {
                DeviceState::FartDetector(FartDetectorState::default())
            }
            DeviceCategory::WaterLeak => DeviceState::WaterLeak(WaterLeakState::default()),
        };
        state.refresh_reading(rng);
        state
    }

    pub fn category(&self) -> DeviceCategory {
        match self {
            DeviceState::LightLamp(_) => DeviceCategory::LightLamp,
            DeviceState::Sink(_) => DeviceCategory::Sink,
            DeviceState::Toilet(_) => DeviceCategory::Toilet,
            DeviceState::FartDetector(_) => DeviceCategory::FartDetector,
            DeviceState::WaterLeak(_) => DeviceCategory::WaterLeak,
        }
    }

    pub fn kind(&self) -> ServiceKind {
        self.category().kind()
    }

    /// Applies an actuator command atomically and returns a confirmation
    /// message. Commands aimed at another category, or at a sensor, are
    /// rejected without touching the state.
    pub fn apply(&mut self, action: &ActuatorAction) -> Result<String, ErrorBody> {
        match (self, action) {
            (
                DeviceState::LightLamp(state),
                ActuatorAction::LightLamp {
                    turn_on,
                    brightness,
                    color,
                },
            ) => {
                if let Some(brightness) = brightness {
                    if *brightness > 100 {
                        return Err(ErrorBody::new(
                            ErrorCode::ValidationError,
                            format!("brightness {} is out of range 0-100", brightness),
                        ));
                    }
                }
                if let Some(on) = turn_on {
                    state.is_on = *on;
                }
                if let Some(brightness) = brightness {
                    state.brightness = *brightness;
                }
                if let Some(color) = color {
                    state.color = color.clone();
                }
                Ok(format!(
                    "lamp is {} at {}% brightness ({})",
                    if state.is_on { "on" } else { "off" },
                    state.brightness,
                    state.color
                ))
            }
            (DeviceState::Sink(state), ActuatorAction::Sink { turn_on }) => {
                if let Some(on) = turn_on {
                    state.is_on = *on;
                }
                Ok(format!(
                    "sink tap is {}",
                    if state.is_on { "running" } else { "closed" }
                ))
            }
            (DeviceState::Toilet(state), ActuatorAction::Toilet { flush, lid_open }) => {
                if let Some(flush) = flush {
                    state.flushing = *flush;
                }
                if let Some(lid_open) = lid_open {
                    state.lid_open = *lid_open;
                }
                Ok(format!(
                    "toilet is {}, lid {}",
                    if state.flushing { "flushing" } else { "idle" },
                    if state.lid_open { "open" } else { "closed" }
                ))
            }
            (state, action) => Err(ErrorBody::new(
                ErrorCode::InvalidCommand,
                format!(
                    "{} does not accept {} commands",
                    state.category().as_str(),
                    action.category().as_str()
                ),
            )),
        }
    }

    /// Sensors take a fresh randomized reading; actuators are unaffected.
    /// Returns whether the state changed.
    pub fn refresh_reading<R: Rng>(&mut self, rng: &mut R) -> bool {
        match self {
            DeviceState::FartDetector(state) => {
                state.intensity = rng.gen_range(0..=100);
                state.alert = state.intensity > 70;
                true
            }
            DeviceState::WaterLeak(state) => {
                state.moisture = rng.gen_range(0..=100);
                state.leak = state.moisture > 80;
                true
            }
            DeviceState::LightLamp(_) | DeviceState::Sink(_) | DeviceState::Toilet(_) => false,
        }
    }

    /// The advertised TXT properties derived from the current state.
    pub fn properties(&self) -> HashMap<String, String> {
        let mut properties = HashMap::new();
        match self {
            DeviceState::LightLamp(state) => {
                properties.insert("is_on".to_string(), state.is_on.to_string());
                properties.insert("brightness".to_string(), state.brightness.to_string());
                properties.insert("color".to_string(), state.color.clone());
            }
            DeviceState::Sink(state) => {
                properties.insert("is_on".to_string(), state.is_on.to_string());
            }
            DeviceState::Toilet(state) => {
                properties.insert("flushing".to_string(), state.flushing.to_string());
                properties.insert("lid_open".to_string(), state.lid_open.to_string());
            }
            DeviceState::FartDetector(state) => {
                properties.insert("intensity".to_string(), state.intensity.to_string());
                properties.insert("alert".to_string(), state.alert.to_string());
            }
            DeviceState::WaterLeak(state) => {
                properties.insert("moisture".to_string(), state.moisture.to_string());
                properties.insert("leak".to_string(), state.leak.to_string());
            }
        }
        properties
    }
}
