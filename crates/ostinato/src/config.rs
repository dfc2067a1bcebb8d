use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Machine description for the simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Step timer frequency in Hz.
    #[serde(default = "default_clock_hz")]
    pub clock_hz: f64,

    /// Kinematics family.
    #[serde(default)]
    pub kinematics: Kinematics,

    /// Steps per mm, one entry per drive (X, Y, Z, then extruders).
    pub steps_per_mm: Vec<f64>,

    /// Tower geometry; required for delta kinematics.
    pub delta: Option<DeltaConfig>,

    /// Extruder shaper state.
    #[serde(default)]
    pub extruder: ExtruderConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kinematics {
    #[default]
    Cartesian,
    Delta,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Tower circle radius in mm.
    pub radius: f64,
    /// Diagonal rod length in mm.
    pub diagonal: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExtruderConfig {
    /// Pressure advance constant, in seconds.
    #[serde(default)]
    pub pressure_advance: f64,

    /// Extrusion carried over from previous moves, in commanded-distance
    /// mm.
    #[serde(default)]
    pub pending: f64,
}

impl Default for ExtruderConfig {
    fn default() -> Self {
        Self {
            pressure_advance: 0.0,
            pending: 0.0,
        }
    }
}

fn default_clock_hz() -> f64 {
    1_000_000.0
}

impl MachineConfig {
    /// Load a machine config, auto-detecting TOML or JSON format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content).or_else(|_| Self::from_json(&content)),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse machine config as TOML")
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse machine config as JSON")
    }

    pub fn validate(&self) -> Result<()> {
        if self.clock_hz <= 0.0 {
            anyhow::bail!("clock_hz must be positive");
        }
        if self.steps_per_mm.len() < 3 {
            anyhow::bail!("steps_per_mm needs at least the three axis drives");
        }
        if self.steps_per_mm.iter().any(|&s| s <= 0.0) {
            anyhow::bail!("steps_per_mm entries must be positive");
        }
        match self.kinematics {
            Kinematics::Delta => {
                let delta = self
                    .delta
                    .as_ref()
                    .context("delta kinematics needs a [delta] section")?;
                if delta.diagonal <= delta.radius {
                    anyhow::bail!("delta diagonal must exceed the tower radius");
                }
            }
            Kinematics::Cartesian => {}
        }
        if self.extruder.pressure_advance < 0.0 {
            anyhow::bail!("extruder.pressure_advance cannot be negative");
        }
        Ok(())
    }
}

/// One commanded move for the simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveSpec {
    /// Unit direction of travel (X, Y, Z).
    pub direction: [f64; 3],

    /// Commanded distance in mm.
    pub distance: f64,

    /// Speeds in mm/s and acceleration in mm/s².
    pub start_speed: f64,
    pub cruise_speed: f64,
    pub accel: f64,

    /// Extrusion over the move, in mm of filament drive. Zero for travel
    /// moves.
    #[serde(default)]
    pub extrusion: f64,

    /// Effector position at move start, used by delta kinematics.
    #[serde(default)]
    pub start_x: f64,
    #[serde(default)]
    pub start_y: f64,
}

impl MoveSpec {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read move file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse move file as TOML")
    }

    pub fn validate(&self) -> Result<()> {
        let norm = self.direction.iter().map(|d| d * d).sum::<f64>().sqrt();
        if norm == 0.0 {
            if self.extrusion == 0.0 {
                anyhow::bail!("move has no motion");
            }
        } else if (norm - 1.0).abs() > 1e-6 {
            anyhow::bail!("direction must be a unit vector (|d| = {norm:.6})");
        }
        if self.distance <= 0.0 {
            anyhow::bail!("distance must be positive");
        }
        if self.cruise_speed < self.start_speed {
            anyhow::bail!("cruise_speed must be at least start_speed");
        }
        if self.accel <= 0.0 {
            anyhow::bail!("accel must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_machine() {
        let toml = r#"
clock_hz = 750000.0
kinematics = "delta"
steps_per_mm = [80.0, 80.0, 80.0, 420.0]

[delta]
radius = 125.0
diagonal = 250.0

[extruder]
pressure_advance = 0.04
"#;
        let config = MachineConfig::from_toml(toml).unwrap();
        assert_eq!(config.kinematics, Kinematics::Delta);
        assert_eq!(config.clock_hz, 750_000.0);
        assert_eq!(config.extruder.pressure_advance, 0.04);
        config.validate().unwrap();
    }

    #[test]
    fn parses_json_machine() {
        let json = r#"{
            "steps_per_mm": [80.0, 80.0, 400.0],
            "delta": null
        }"#;
        let config = MachineConfig::from_json(json).unwrap();
        assert_eq!(config.kinematics, Kinematics::Cartesian);
        assert_eq!(config.clock_hz, 1_000_000.0);
        config.validate().unwrap();
    }

    #[test]
    fn delta_without_geometry_is_rejected() {
        let toml = r#"
kinematics = "delta"
steps_per_mm = [80.0, 80.0, 80.0]
"#;
        let config = MachineConfig::from_toml(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn move_spec_checks_the_direction_norm() {
        let mv = MoveSpec {
            direction: [3.0, 4.0, 0.0],
            distance: 10.0,
            start_speed: 5.0,
            cruise_speed: 50.0,
            accel: 1000.0,
            extrusion: 0.0,
            start_x: 0.0,
            start_y: 0.0,
        };
        assert!(mv.validate().is_err());
    }
}
