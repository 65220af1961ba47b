use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::PinConfig;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Door,
    Window,
    Opening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Toggle,
    Momentary,
}

/// Behaviour of a zone. Inputs are contacts read with pull-up, outputs are
/// relay lines driven by commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RoleClass {
    Input(InputKind),
    Output(OutputKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Input,
    Output,
}

impl RoleClass {
    /// Selector option order.
    pub const ALL: [RoleClass; 5] = [
        RoleClass::Input(InputKind::Door),
        RoleClass::Input(InputKind::Window),
        RoleClass::Input(InputKind::Opening),
        RoleClass::Output(OutputKind::Toggle),
        RoleClass::Output(OutputKind::Momentary),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleClass::Input(InputKind::Door) => "door",
            RoleClass::Input(InputKind::Window) => "window",
            RoleClass::Input(InputKind::Opening) => "opening",
            RoleClass::Output(OutputKind::Toggle) => "output_toggle",
            RoleClass::Output(OutputKind::Momentary) => "output_tap",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            RoleClass::Input(_) => Category::Input,
            RoleClass::Output(_) => Category::Output,
        }
    }

    pub fn is_output(&self) -> bool {
        self.category() == Category::Output
    }
}

impl Default for RoleClass {
    fn default() -> Self {
        RoleClass::Input(InputKind::Opening)
    }
}

impl fmt::Display for RoleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleClass {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        RoleClass::ALL
            .into_iter()
            .find(|class| class.as_str() == wanted)
            .ok_or_else(|| AppError::InvalidClass(s.trim().to_string()))
    }
}

impl TryFrom<String> for RoleClass {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoleClass> for String {
    fn from(class: RoleClass) -> Self {
        class.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    pub fn from_high(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

/// Live view of a zone. `state` is "open" for inputs and "on" for outputs.
#[derive(Debug, Clone, Serialize)]
pub struct Zone {
    pub key: String,
    pub name: String,
    pub pin: PinConfig,
    pub class: RoleClass,
    pub state: bool,
    /// Bumped on every role change; stale pulse timers compare against it.
    pub generation: u64,
    #[serde(skip)]
    pub pending_pulse: Option<u64>,
}

impl Zone {
    pub fn new(key: String, name: String, pin: PinConfig, class: RoleClass) -> Self {
        Self {
            key,
            name,
            pin,
            class,
            state: false,
            generation: 0,
            pending_pulse: None,
        }
    }
}

pub fn on_off(state: bool) -> &'static str {
    if state { "ON" } else { "OFF" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_class_names_case_insensitively() {
        assert_eq!(
            " Door ".parse::<RoleClass>().unwrap(),
            RoleClass::Input(InputKind::Door)
        );
        assert_eq!(
            "OUTPUT_TAP".parse::<RoleClass>().unwrap(),
            RoleClass::Output(OutputKind::Momentary)
        );
        assert!(matches!(
            "garage".parse::<RoleClass>(),
            Err(AppError::InvalidClass(_))
        ));
    }

    #[test]
    fn class_names_round_trip_through_serde() {
        let json = serde_json::to_string(&RoleClass::Output(OutputKind::Toggle)).unwrap();
        assert_eq!(json, "\"output_toggle\"");
        let back: RoleClass = serde_json::from_str("\"window\"").unwrap();
        assert_eq!(back, RoleClass::Input(InputKind::Window));
        assert!(serde_json::from_str::<RoleClass>("\"siren\"").is_err());
    }

    #[test]
    fn categories_split_inputs_from_outputs() {
        assert!(!RoleClass::default().is_output());
        assert_eq!(
            RoleClass::Output(OutputKind::Momentary).category(),
            Category::Output
        );
    }
}
