//! Engine tunables and the configuration events that change them.

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::{colors::ColorBias, config::EngineConfig, strategies::Strategy, timing::TimingState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Red,
    Green,
    Blue,
}

impl Channel {
    fn slug(&self) -> &'static str {
        match self {
            Channel::Red => "red",
            Channel::Green => "green",
            Channel::Blue => "blue",
        }
    }

    fn of(self, bias: &mut ColorBias) -> &mut u8 {
        match self {
            Channel::Red => &mut bias.r,
            Channel::Green => &mut bias.g,
            Channel::Blue => &mut bias.b,
        }
    }
}

/// A mutation requested by the input layer, applied between frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigEvent {
    IncreasePrimary,
    DecreasePrimary,
    IncreaseColor,
    DecreaseColor,
    IncreaseIterations,
    DecreaseIterations,
    /// Saturating single-channel step.
    Nudge { channel: Channel, up: bool },
    /// Zero-based backend index.
    SelectBackend(usize),
    SelectStrategy(Strategy),
    StartTimingLoop,
    /// Measure only the next invocation.
    TimeOnce,
    ComputeOnce,
    Dump,
}

impl ConfigEvent {
    /// Keyboard binding of the interactive viewer.
    pub fn from_key(key: char) -> Option<Self> {
        let event = match key.to_ascii_lowercase() {
            'u' => ConfigEvent::IncreasePrimary,
            'i' => ConfigEvent::DecreasePrimary,
            'o' => ConfigEvent::IncreaseColor,
            'p' => ConfigEvent::DecreaseColor,
            'z' => ConfigEvent::IncreaseIterations,
            'x' => ConfigEvent::DecreaseIterations,
            'l' => ConfigEvent::Dump,
            'c' => ConfigEvent::StartTimingLoop,
            'v' => ConfigEvent::ComputeOnce,
            d @ '1'..='4' => ConfigEvent::SelectBackend(d as usize - '1' as usize),
            '5' => ConfigEvent::SelectStrategy(Strategy::Packed),
            '6' => ConfigEvent::SelectStrategy(Strategy::Channel),
            '7' => ConfigEvent::SelectStrategy(Strategy::Tiled),
            _ => return None,
        };
        Some(event)
    }
}

impl fmt::Display for ConfigEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigEvent::IncreasePrimary => f.write_str("increase-primary"),
            ConfigEvent::DecreasePrimary => f.write_str("decrease-primary"),
            ConfigEvent::IncreaseColor => f.write_str("increase-color"),
            ConfigEvent::DecreaseColor => f.write_str("decrease-color"),
            ConfigEvent::IncreaseIterations => f.write_str("increase-iterations"),
            ConfigEvent::DecreaseIterations => f.write_str("decrease-iterations"),
            ConfigEvent::Nudge { channel, up } => {
                write!(f, "{}-{}", channel.slug(), if *up { "up" } else { "down" })
            }
            ConfigEvent::SelectBackend(index) => write!(f, "backend-{}", index + 1),
            ConfigEvent::SelectStrategy(strategy) => write!(f, "strategy-{strategy}"),
            ConfigEvent::StartTimingLoop => f.write_str("timing-loop"),
            ConfigEvent::TimeOnce => f.write_str("time-once"),
            ConfigEvent::ComputeOnce => f.write_str("compute"),
            ConfigEvent::Dump => f.write_str("dump"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown event '{0}'")]
pub struct UnknownEvent(pub String);

fn parse_backend(name: &str) -> Option<ConfigEvent> {
    let n = name.strip_prefix("backend-")?.parse::<usize>().ok()?;
    n.checked_sub(1).map(ConfigEvent::SelectBackend)
}

fn parse_nudge(name: &str) -> Option<ConfigEvent> {
    let (channel, direction) = name.split_once('-')?;
    let channel = match channel {
        "red" => Channel::Red,
        "green" => Channel::Green,
        "blue" => Channel::Blue,
        _ => return None,
    };
    let up = match direction {
        "up" => true,
        "down" => false,
        _ => return None,
    };
    Some(ConfigEvent::Nudge { channel, up })
}

/// Single characters fall back to the key bindings.
fn parse_key(name: &str) -> Option<ConfigEvent> {
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(key), None) => ConfigEvent::from_key(key),
        _ => None,
    }
}

impl FromStr for ConfigEvent {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let event = match name.as_str() {
            "increase-primary" => ConfigEvent::IncreasePrimary,
            "decrease-primary" => ConfigEvent::DecreasePrimary,
            "increase-color" => ConfigEvent::IncreaseColor,
            "decrease-color" => ConfigEvent::DecreaseColor,
            "increase-iterations" => ConfigEvent::IncreaseIterations,
            "decrease-iterations" => ConfigEvent::DecreaseIterations,
            "strategy-packed" => ConfigEvent::SelectStrategy(Strategy::Packed),
            "strategy-channel" => ConfigEvent::SelectStrategy(Strategy::Channel),
            "strategy-tiled" => ConfigEvent::SelectStrategy(Strategy::Tiled),
            "timing-loop" => ConfigEvent::StartTimingLoop,
            "time-once" => ConfigEvent::TimeOnce,
            "compute" => ConfigEvent::ComputeOnce,
            "dump" => ConfigEvent::Dump,
            other => parse_backend(other)
                .or_else(|| parse_nudge(other))
                .or_else(|| parse_key(other))
                .ok_or_else(|| UnknownEvent(s.to_string()))?,
        };
        Ok(event)
    }
}

/// Bias and iteration cap as shown by a dump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateSnapshot {
    pub bias: ColorBias,
    pub max_iterations: u32,
}

impl fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "red: {} green: {} blue: {} iterations: {}",
            self.bias.r, self.bias.g, self.bias.b, self.max_iterations
        )
    }
}

/// What applying an event did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// Bias changed, possibly with the iteration cap.
    Recompute,
    Nudged(Channel, u8),
    /// Only the iteration cap changed; no recompute is requested.
    Iterations(u32),
    Dump(StateSnapshot),
    ComputeOnce,
    TimingStarted,
    TimeOnce,
    StrategySelected(Strategy),
    /// The registry owner must act on this one.
    SelectBackend(usize),
}

impl Applied {
    pub fn requests_compute(&self) -> bool {
        matches!(
            self,
            Applied::Recompute | Applied::Nudged(..) | Applied::ComputeOnce | Applied::TimeOnce
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineState {
    pub strategy: Strategy,
    pub max_iterations: u32,
    pub bias: ColorBias,
    pub timing: TimingState,
}

fn step_bias(bias: &mut ColorBias, up: bool) {
    for channel in [Channel::Red, Channel::Green, Channel::Blue] {
        let value = channel.of(bias);
        *value = if up {
            value.wrapping_add(1)
        } else {
            value.wrapping_sub(1)
        };
    }
}

impl EngineState {
    pub fn from_config(config: &EngineConfig) -> Self {
        EngineState {
            strategy: config.strategy,
            max_iterations: config.max_iterations,
            bias: config.bias,
            timing: TimingState::new(config.timing_shots),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            bias: self.bias,
            max_iterations: self.max_iterations,
        }
    }

    /// Applies one event. Strategy preconditions are checked by the caller.
    pub fn apply(&mut self, event: ConfigEvent) -> Applied {
        match event {
            ConfigEvent::IncreasePrimary => {
                self.max_iterations = self.max_iterations.saturating_add(1);
                step_bias(&mut self.bias, true);
                Applied::Recompute
            }
            ConfigEvent::DecreasePrimary => {
                self.max_iterations = self.max_iterations.saturating_sub(1);
                step_bias(&mut self.bias, false);
                Applied::Recompute
            }
            ConfigEvent::IncreaseColor => {
                step_bias(&mut self.bias, true);
                Applied::Recompute
            }
            ConfigEvent::DecreaseColor => {
                step_bias(&mut self.bias, false);
                Applied::Recompute
            }
            ConfigEvent::IncreaseIterations => {
                self.max_iterations = self.max_iterations.saturating_add(1);
                Applied::Iterations(self.max_iterations)
            }
            ConfigEvent::DecreaseIterations => {
                self.max_iterations = self.max_iterations.saturating_sub(1);
                Applied::Iterations(self.max_iterations)
            }
            ConfigEvent::Nudge { channel, up } => {
                let value = channel.of(&mut self.bias);
                *value = if up {
                    value.saturating_add(1)
                } else {
                    value.saturating_sub(1)
                };
                Applied::Nudged(channel, *value)
            }
            ConfigEvent::SelectBackend(index) => Applied::SelectBackend(index),
            ConfigEvent::SelectStrategy(strategy) => {
                self.strategy = strategy;
                Applied::StrategySelected(strategy)
            }
            ConfigEvent::StartTimingLoop => {
                self.timing.start_loop();
                Applied::TimingStarted
            }
            ConfigEvent::TimeOnce => {
                self.timing.single_shot();
                Applied::TimeOnce
            }
            ConfigEvent::ComputeOnce => Applied::ComputeOnce,
            ConfigEvent::Dump => Applied::Dump(self.snapshot()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::TimingMode;

    fn state() -> EngineState {
        EngineState::from_config(&EngineConfig::default())
    }

    #[test]
    fn starts_from_config_defaults() {
        let state = state();
        assert_eq!(state.bias, ColorBias::new(250, 68, 32));
        assert_eq!(state.max_iterations, 0);
        assert_eq!(state.strategy, Strategy::Packed);
        assert_eq!(state.timing.mode, TimingMode::Off);
    }

    #[test]
    fn primary_increase_wraps_bias_past_255() {
        let mut state = state();
        state.bias = ColorBias::new(254, 10, 255);
        assert_eq!(
            state.apply(ConfigEvent::IncreasePrimary),
            Applied::Recompute
        );
        assert_eq!(state.bias.r, 255);
        state.apply(ConfigEvent::IncreasePrimary);
        assert_eq!(state.bias, ColorBias::new(0, 12, 1));
        assert_eq!(state.max_iterations, 2);
    }

    #[test]
    fn primary_decrease_wraps_bias_below_zero() {
        let mut state = state();
        state.bias = ColorBias::new(0, 1, 2);
        state.apply(ConfigEvent::DecreasePrimary);
        assert_eq!(state.bias, ColorBias::new(255, 0, 1));
        assert_eq!(state.max_iterations, 0);
    }

    #[test]
    fn colour_events_leave_iterations_alone() {
        let mut state = state();
        state.max_iterations = 7;
        state.apply(ConfigEvent::IncreaseColor);
        state.apply(ConfigEvent::IncreaseColor);
        state.apply(ConfigEvent::DecreaseColor);
        assert_eq!(state.max_iterations, 7);
        assert_eq!(state.bias, ColorBias::new(251, 69, 33));
    }

    #[test]
    fn iteration_events_only_echo() {
        let mut state = state();
        let applied = state.apply(ConfigEvent::IncreaseIterations);
        assert_eq!(applied, Applied::Iterations(1));
        assert!(!applied.requests_compute());
        state.apply(ConfigEvent::DecreaseIterations);
        assert_eq!(
            state.apply(ConfigEvent::DecreaseIterations),
            Applied::Iterations(0)
        );
        assert_eq!(state.bias, ColorBias::new(250, 68, 32));
    }

    #[test]
    fn nudges_saturate() {
        let mut state = state();
        state.bias = ColorBias::new(255, 0, 128);
        let red_up = ConfigEvent::Nudge {
            channel: Channel::Red,
            up: true,
        };
        let green_down = ConfigEvent::Nudge {
            channel: Channel::Green,
            up: false,
        };
        assert_eq!(state.apply(red_up), Applied::Nudged(Channel::Red, 255));
        assert_eq!(state.apply(green_down), Applied::Nudged(Channel::Green, 0));
        state.apply(ConfigEvent::Nudge {
            channel: Channel::Blue,
            up: false,
        });
        assert_eq!(state.bias, ColorBias::new(255, 0, 127));
    }

    #[test]
    fn timing_loop_resets_the_shot_counter() {
        let mut state = state();
        state.apply(ConfigEvent::StartTimingLoop);
        assert_eq!(state.timing.mode, TimingMode::Loop);
        assert_eq!(state.timing.remaining, 100);
    }

    #[test]
    fn dump_reports_current_values() {
        let mut state = state();
        state.apply(ConfigEvent::IncreasePrimary);
        match state.apply(ConfigEvent::Dump) {
            Applied::Dump(snapshot) => {
                assert_eq!(snapshot.max_iterations, 1);
                assert_eq!(
                    snapshot.to_string(),
                    "red: 251 green: 69 blue: 33 iterations: 1"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn key_bindings() {
        assert_eq!(
            ConfigEvent::from_key('U'),
            Some(ConfigEvent::IncreasePrimary)
        );
        assert_eq!(
            ConfigEvent::from_key('1'),
            Some(ConfigEvent::SelectBackend(0))
        );
        assert_eq!(
            ConfigEvent::from_key('4'),
            Some(ConfigEvent::SelectBackend(3))
        );
        assert_eq!(
            ConfigEvent::from_key('7'),
            Some(ConfigEvent::SelectStrategy(Strategy::Tiled))
        );
        assert_eq!(ConfigEvent::from_key('q'), None);
    }

    #[test]
    fn names_parse_back() {
        let events = [
            ConfigEvent::IncreasePrimary,
            ConfigEvent::DecreaseIterations,
            ConfigEvent::Nudge {
                channel: Channel::Blue,
                up: false,
            },
            ConfigEvent::SelectBackend(2),
            ConfigEvent::SelectStrategy(Strategy::Channel),
            ConfigEvent::StartTimingLoop,
            ConfigEvent::TimeOnce,
            ConfigEvent::ComputeOnce,
            ConfigEvent::Dump,
        ];
        for event in events {
            assert_eq!(event.to_string().parse::<ConfigEvent>(), Ok(event));
        }
        assert_eq!("v".parse::<ConfigEvent>(), Ok(ConfigEvent::ComputeOnce));
        assert!("backend-0".parse::<ConfigEvent>().is_err());
        assert!("warp".parse::<ConfigEvent>().is_err());
    }
}
