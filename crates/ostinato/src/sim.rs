//! Whole-move simulation: build a DDA from a machine config and a move
//! spec, run every participating drive to completion, and report the step
//! timelines.

use anyhow::{Context, Result};
use ostinato_core::dda::{Dda, FixedPlatform, FixedShaper, drive_letter};
use ostinato_core::delta::{DeltaGeometry, PrepParams};
use ostinato_core::drive::DmState;
use ostinato_core::pool::DmPool;
use tracing::{debug, warn};

use crate::config::{Kinematics, MachineConfig, MoveSpec};

/// One scheduled pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPulse {
    pub step: u32,
    /// Clocks from move start.
    pub clock: u32,
    /// Direction the pulse is issued with; true is forwards.
    pub forward: bool,
}

/// Everything one drive did during the move.
#[derive(Debug, Clone)]
pub struct DriveReport {
    pub drive: usize,
    pub letter: char,
    pub total_steps: u32,
    pub reverse_start_step: Option<u32>,
    pub net_steps: i32,
    pub pulses: Vec<StepPulse>,
    pub fault: Option<String>,
}

/// The simulated move: per-drive reports plus the shared clock budget.
#[derive(Debug, Clone)]
pub struct MoveReport {
    pub clocks_needed: u32,
    pub drives: Vec<DriveReport>,
}

/// Build the DDA for a move: convert speeds to the clock domain, lay out
/// the trapezoid, and size the clock budget.
pub fn plan_move(machine: &MachineConfig, mv: &MoveSpec) -> Result<Dda> {
    machine.validate()?;
    mv.validate()?;

    let hz = machine.clock_hz;
    let start_v = mv.start_speed / hz;
    let mut cruise_v = mv.cruise_speed / hz;
    let accel = mv.accel / (hz * hz);

    // Clamp the cruise speed if the trapezoid does not fit the distance.
    let ramp_d = |v: f64| (v * v - start_v * start_v) / (2.0 * accel);
    if 2.0 * ramp_d(cruise_v) > mv.distance {
        let reachable = (accel * mv.distance + start_v * start_v).sqrt();
        warn!(
            "cruise speed unreachable over {} mm, clamping to {:.1} mm/s",
            mv.distance,
            reachable * hz
        );
        cruise_v = reachable;
    }

    let accel_t = (cruise_v - start_v) / accel;
    let accel_d = ramp_d(cruise_v);
    let cruise_d = mv.distance - 2.0 * accel_d;
    let cruise_t = if cruise_v > 0.0 { cruise_d / cruise_v } else { 0.0 };
    let decel_t = accel_t;
    let clocks_needed = (accel_t + cruise_t + decel_t).ceil() as u32;

    let mut direction_vector: Vec<f64> = mv.direction.to_vec();
    direction_vector.push(mv.extrusion / mv.distance);
    direction_vector.resize(machine.steps_per_mm.len().max(4), 0.0);

    let mut dda = Dda::new(direction_vector, mv.distance, clocks_needed);
    dda.push_axis_trapezoid(accel_t, cruise_t, decel_t, start_v, cruise_v, accel);
    if mv.extrusion != 0.0 {
        ostinato_core::segment::push_trapezoid(
            &mut dda.extruder_segments,
            accel_t,
            cruise_t,
            decel_t,
            start_v,
            cruise_v,
            accel,
        );
    }
    dda.finish();
    Ok(dda)
}

/// Run every participating drive through the move and collect the step
/// timelines.
pub fn simulate(machine: &MachineConfig, mv: &MoveSpec) -> Result<MoveReport> {
    let dda = plan_move(machine, mv)?;
    let platform = FixedPlatform::new(machine.steps_per_mm.clone());
    let shaper = FixedShaper {
        k: machine.extruder.pressure_advance * machine.clock_hz,
        pending: machine.extruder.pending,
    };

    let mut pool = DmPool::new();
    pool.initial_allocate(machine.steps_per_mm.len());

    let mut drives = Vec::new();
    for drive in 0..machine.steps_per_mm.len() {
        let mut dm = pool.allocate(drive, DmState::Idle);
        let prepared = if drive >= 3 {
            dm.prepare_extruder(&dda, &shaper, &platform)
        } else {
            match machine.kinematics {
                Kinematics::Cartesian => dm.prepare_cartesian_axis(&dda, &platform),
                Kinematics::Delta => {
                    let delta = machine.delta.as_ref().context("missing delta geometry")?;
                    let geometry = DeltaGeometry::from_radius(delta.radius, delta.diagonal);
                    let params = PrepParams::new(mv.start_x, mv.start_y, &dda.direction_vector);
                    dm.prepare_delta_axis(&dda, &params, &geometry, &platform)
                }
            }
        };

        if !prepared {
            debug!("{dm}");
            pool.release(dm);
            continue;
        }

        let reverse_start = (dm.reverse_start_step() <= dm.total_steps())
            .then(|| dm.reverse_start_step());
        let mut pulses = Vec::new();
        loop {
            pulses.push(StepPulse {
                step: dm.next_step(),
                clock: dm.next_step_time(),
                forward: dm.direction(),
            });
            if dm.direction_changed() {
                dm.clear_direction_changed();
            }
            if !dm.calc_next_step_time(&dda) {
                break;
            }
        }
        debug!("{dm}");

        drives.push(DriveReport {
            drive,
            letter: drive_letter(drive),
            total_steps: dm.total_steps(),
            reverse_start_step: reverse_start,
            net_steps: dm.net_steps_taken(),
            pulses,
            fault: dm.state().fault().map(|f| f.to_string()),
        });
        pool.release(dm);
    }

    Ok(MoveReport {
        clocks_needed: dda.clocks_needed,
        drives,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtruderConfig;

    fn cartesian_machine() -> MachineConfig {
        MachineConfig {
            clock_hz: 1_000_000.0,
            kinematics: Kinematics::Cartesian,
            steps_per_mm: vec![80.0, 80.0, 400.0, 420.0],
            delta: None,
            extruder: ExtruderConfig::default(),
        }
    }

    fn straight_move() -> MoveSpec {
        MoveSpec {
            direction: [1.0, 0.0, 0.0],
            distance: 30.0,
            start_speed: 5.0,
            cruise_speed: 60.0,
            accel: 1500.0,
            extrusion: 0.0,
            start_x: 0.0,
            start_y: 0.0,
        }
    }

    #[test]
    fn x_move_steps_only_the_x_drive() {
        let report = simulate(&cartesian_machine(), &straight_move()).unwrap();
        assert_eq!(report.drives.len(), 1);
        let x = &report.drives[0];
        assert_eq!(x.letter, 'X');
        assert_eq!(x.pulses.len(), 30 * 80);
        assert_eq!(x.net_steps, 30 * 80);
        assert!(x.fault.is_none());
        assert!(x.pulses.windows(2).all(|p| p[1].clock >= p[0].clock));
        assert!(x.pulses.last().unwrap().clock <= report.clocks_needed);
    }

    #[test]
    fn unreachable_cruise_speed_is_clamped() {
        let mut mv = straight_move();
        mv.distance = 0.5;
        let report = simulate(&cartesian_machine(), &mv).unwrap();
        assert_eq!(report.drives[0].pulses.len(), 40);
        assert!(report.drives[0].fault.is_none());
    }

    #[test]
    fn extrusion_adds_an_extruder_timeline() {
        let mut mv = straight_move();
        mv.extrusion = 1.5;
        let report = simulate(&cartesian_machine(), &mv).unwrap();
        assert_eq!(report.drives.len(), 2);
        let e = report.drives.iter().find(|d| d.drive == 3).unwrap();
        assert_eq!(e.letter, '0');
        // 1.5 mm at 420 steps/mm, minus the unissued chain-boundary step.
        assert!((628..=630).contains(&e.pulses.len()), "{}", e.pulses.len());
        assert!(e.fault.is_none());
    }
}
