//! Declarative line-based treatment protocols.
//!
//! A [`LineBasedProtocol`] is an ordered list of [`ProtocolLine`]s repeated
//! `loop_count` times.  Each line bundles up to three sub-actions that the
//! engine runs concurrently; the line lasts as long as its slowest sub-action.
//!
//! Protocols are plain data and round-trip through JSON:
//!
//! ```
//! use lumos_types::LineBasedProtocol;
//!
//! let protocol = LineBasedProtocol::from_json(r#"{
//!     "name": "spot",
//!     "loop_count": 1,
//!     "lines": [
//!         { "movement": { "target_mm": 5.0, "speed_mm_s": 1.0 },
//!           "laser": { "mode": "set", "power_w": 2.0 },
//!           "dwell": { "duration_s": 3.0 } }
//!     ]
//! }"#).unwrap();
//!
//! assert_eq!(protocol.line_durations()[0].as_secs(), 5);
//! ```

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::LumosError;

/// Move the stage to an absolute position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MovementAction {
    /// Absolute target position in millimetres from home.
    pub target_mm: f64,
    /// Travel speed in millimetres per second.  Must be positive.
    pub speed_mm_s: f64,
}

impl MovementAction {
    /// Travel time from `start_mm` to the target.
    pub fn duration_from(&self, start_mm: f64) -> Duration {
        secs((self.target_mm - start_mm).abs() / self.speed_mm_s)
    }
}

/// Laser output command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LaserAction {
    /// Fixed output power; takes effect immediately.
    Set { power_w: f64 },
    /// Linear ramp from `start_w` to `end_w` over `duration_s`.
    Ramp {
        start_w: f64,
        end_w: f64,
        duration_s: f64,
    },
}

impl LaserAction {
    /// Time the laser sub-action occupies.  Zero for a fixed set-point.
    pub fn duration(&self) -> Duration {
        match self {
            LaserAction::Set { .. } => Duration::ZERO,
            LaserAction::Ramp { duration_s, .. } => secs(*duration_s),
        }
    }

    /// Highest power this action commands.
    pub fn peak_power_w(&self) -> f64 {
        match self {
            LaserAction::Set { power_w } => *power_w,
            LaserAction::Ramp { start_w, end_w, .. } => start_w.max(*end_w),
        }
    }

    fn values(&self) -> Vec<f64> {
        match self {
            LaserAction::Set { power_w } => vec![*power_w],
            LaserAction::Ramp {
                start_w,
                end_w,
                duration_s,
            } => vec![*start_w, *end_w, *duration_s],
        }
    }
}

/// Hold for a fixed time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DwellAction {
    pub duration_s: f64,
}

impl DwellAction {
    pub fn duration(&self) -> Duration {
        secs(self.duration_s)
    }
}

#[derive(Deserialize, JsonSchema)]
struct RawLine {
    #[serde(default)]
    movement: Option<MovementAction>,
    #[serde(default)]
    laser: Option<LaserAction>,
    #[serde(default)]
    dwell: Option<DwellAction>,
}

/// One protocol step: zero-or-one of each sub-action, at least one in total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "RawLine")]
pub struct ProtocolLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    movement: Option<MovementAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    laser: Option<LaserAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dwell: Option<DwellAction>,
}

impl TryFrom<RawLine> for ProtocolLine {
    type Error = LumosError;

    fn try_from(raw: RawLine) -> Result<Self, Self::Error> {
        ProtocolLine::new(raw.movement, raw.laser, raw.dwell)
    }
}

impl ProtocolLine {
    /// Build a line.
    ///
    /// # Errors
    ///
    /// [`LumosError::InvalidProtocol`] when no sub-action is given, when a
    /// value is non-finite, negative, or (for speed) not positive, or when a
    /// timed sub-action (the move counted from home) is too long to represent.
    pub fn new(
        movement: Option<MovementAction>,
        laser: Option<LaserAction>,
        dwell: Option<DwellAction>,
    ) -> Result<Self, LumosError> {
        if movement.is_none() && laser.is_none() && dwell.is_none() {
            return Err(LumosError::InvalidProtocol(
                "a protocol line needs at least one action".to_string(),
            ));
        }
        if let Some(m) = &movement {
            if !m.target_mm.is_finite() {
                return Err(invalid("movement target must be finite"));
            }
            if !(m.speed_mm_s.is_finite() && m.speed_mm_s > 0.0) {
                return Err(invalid("movement speed must be positive"));
            }
        }
        if let Some(l) = &laser
            && l.values().iter().any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(invalid("laser power and ramp duration must be non-negative"));
        }
        if let Some(d) = &dwell
            && !(d.duration_s.is_finite() && d.duration_s >= 0.0)
        {
            return Err(invalid("dwell duration must be non-negative"));
        }
        if let Some(LaserAction::Ramp { duration_s, .. }) = &laser
            && try_secs(*duration_s).is_none()
        {
            return Err(out_of_range("ramp duration", *duration_s));
        }
        if let Some(d) = &dwell
            && try_secs(d.duration_s).is_none()
        {
            return Err(out_of_range("dwell duration", d.duration_s));
        }
        if let Some(m) = &movement {
            let from_home = m.target_mm.abs() / m.speed_mm_s;
            if try_secs(from_home).is_none() {
                return Err(out_of_range("movement time from home", from_home));
            }
        }
        Ok(Self {
            movement,
            laser,
            dwell,
        })
    }

    pub fn movement(&self) -> Option<&MovementAction> {
        self.movement.as_ref()
    }

    pub fn laser(&self) -> Option<&LaserAction> {
        self.laser.as_ref()
    }

    pub fn dwell(&self) -> Option<&DwellAction> {
        self.dwell.as_ref()
    }

    /// Line duration when the stage starts at `start_mm`: the maximum of the
    /// movement, ramp and dwell durations, zero when none is timed.
    pub fn duration_from(&self, start_mm: f64) -> Duration {
        let movement = self
            .movement
            .map(|m| m.duration_from(start_mm))
            .unwrap_or_default();
        let laser = self.laser.map(|l| l.duration()).unwrap_or_default();
        let dwell = self.dwell.map(|d| d.duration()).unwrap_or_default();
        movement.max(laser).max(dwell)
    }

    /// Like [`duration_from`][Self::duration_from], `None` when a sub-action
    /// does not fit in a [`Duration`].
    fn checked_duration_from(&self, start_mm: f64) -> Option<Duration> {
        let mut longest = Duration::ZERO;
        if let Some(m) = &self.movement {
            longest = longest.max(try_secs((m.target_mm - start_mm).abs() / m.speed_mm_s)?);
        }
        if let Some(LaserAction::Ramp { duration_s, .. }) = &self.laser {
            longest = longest.max(try_secs(*duration_s)?);
        }
        if let Some(d) = &self.dwell {
            longest = longest.max(try_secs(d.duration_s)?);
        }
        Some(longest)
    }
}

/// A named, ordered list of lines executed `loop_count` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LineBasedProtocol {
    name: String,
    lines: Vec<ProtocolLine>,
    loop_count: u32,
}

impl LineBasedProtocol {
    /// Build a protocol.
    ///
    /// # Errors
    ///
    /// [`LumosError::InvalidProtocol`] when `lines` is empty, `loop_count`
    /// is zero, or the total run time does not fit in a [`Duration`].
    pub fn new(
        name: impl Into<String>,
        lines: Vec<ProtocolLine>,
        loop_count: u32,
    ) -> Result<Self, LumosError> {
        let protocol = Self {
            name: name.into(),
            lines,
            loop_count,
        };
        protocol.validate()?;
        Ok(protocol)
    }

    /// Parse and validate a protocol from JSON.
    ///
    /// # Errors
    ///
    /// [`LumosError::InvalidProtocol`] on malformed JSON or invalid content.
    pub fn from_json(raw: &str) -> Result<Self, LumosError> {
        let protocol: Self = serde_json::from_str(raw)
            .map_err(|e| LumosError::InvalidProtocol(format!("JSON parse error: {e}")))?;
        protocol.validate()?;
        Ok(protocol)
    }

    /// JSON schema of the protocol file format, for authoring tools.
    pub fn json_schema() -> String {
        let schema = schemars::schema_for!(LineBasedProtocol);
        serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string())
    }

    fn validate(&self) -> Result<(), LumosError> {
        if self.lines.is_empty() {
            return Err(invalid("protocol has no lines"));
        }
        if self.loop_count == 0 {
            return Err(invalid("loop_count must be at least 1"));
        }
        if self.total_duration().is_none() {
            return Err(invalid("protocol run time is out of range"));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lines(&self) -> &[ProtocolLine] {
        &self.lines
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// `true` when any line commands the laser.
    pub fn uses_laser(&self) -> bool {
        self.lines.iter().any(|l| l.laser.is_some())
    }

    /// Highest laser power commanded anywhere in the protocol.
    pub fn peak_power_w(&self) -> f64 {
        self.lines
            .iter()
            .filter_map(|l| l.laser)
            .map(|l| l.peak_power_w())
            .fold(0.0, f64::max)
    }

    /// Per-line durations for one pass starting from home (0 mm), carrying the
    /// stage position from line to line.
    pub fn line_durations(&self) -> Vec<Duration> {
        let mut position = 0.0;
        self.lines
            .iter()
            .map(|line| {
                let d = line.duration_from(position);
                if let Some(m) = line.movement {
                    position = m.target_mm;
                }
                d
            })
            .collect()
    }

    /// Expected wall time of the whole run, all loops included.
    pub fn estimated_duration(&self) -> Duration {
        self.total_duration().unwrap_or(Duration::MAX)
    }

    /// Every pass after the first starts where the previous one ended, so
    /// two passes determine the whole run.
    fn total_duration(&self) -> Option<Duration> {
        let (first, end_mm) = self.pass_from(0.0);
        let rest = match self.loop_count {
            0 | 1 => Duration::ZERO,
            n => self.pass_from(end_mm).0?.checked_mul(n - 1)?,
        };
        first?.checked_add(rest)
    }

    /// Duration of one pass starting at `start_mm`, and where it leaves the
    /// stage.
    fn pass_from(&self, start_mm: f64) -> (Option<Duration>, f64) {
        let mut position = start_mm;
        let mut total = Some(Duration::ZERO);
        for line in &self.lines {
            total = total.and_then(|t| t.checked_add(line.checked_duration_from(position)?));
            if let Some(m) = line.movement {
                position = m.target_mm;
            }
        }
        (total, position)
    }
}

fn invalid(msg: &str) -> LumosError {
    LumosError::InvalidProtocol(msg.to_string())
}

fn out_of_range(what: &str, secs: f64) -> LumosError {
    LumosError::InvalidProtocol(format!("{what} of {secs} s is out of range"))
}

fn try_secs(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

/// Saturates, so an unrepresentable time is never reported as shorter than
/// it is.
fn secs(value: f64) -> Duration {
    try_secs(value).unwrap_or(Duration::MAX)
}
