/// End-to-end simulation through config parsing.
use anyhow::Result;
use ostinato::config::{MachineConfig, MoveSpec};
use ostinato::sim;

const CARTESIAN_MACHINE: &str = r#"
clock_hz = 1000000.0
kinematics = "cartesian"
steps_per_mm = [80.0, 80.0, 400.0, 420.0]

[extruder]
pressure_advance = 0.002
"#;

const DELTA_MACHINE: &str = r#"
clock_hz = 1000000.0
kinematics = "delta"
steps_per_mm = [100.0, 100.0, 100.0]

[delta]
radius = 125.0
diagonal = 250.0
"#;

const PRINT_MOVE: &str = r#"
direction = [0.6, 0.8, 0.0]
distance = 25.0
start_speed = 5.0
cruise_speed = 50.0
accel = 1200.0
extrusion = 1.0
"#;

#[test]
fn cartesian_print_move_steps_three_drives() -> Result<()> {
    let machine = MachineConfig::from_toml(CARTESIAN_MACHINE)?;
    let mv = MoveSpec::from_toml(PRINT_MOVE)?;
    let report = sim::simulate(&machine, &mv)?;

    let letters: Vec<char> = report.drives.iter().map(|d| d.letter).collect();
    assert_eq!(letters, vec!['X', 'Y', '0']);

    for drive in &report.drives {
        assert!(drive.fault.is_none(), "drive {} faulted", drive.letter);
        assert!(
            drive.pulses.windows(2).all(|p| p[1].clock >= p[0].clock),
            "drive {} due times not ordered",
            drive.letter
        );
    }

    // 25 mm at 80 steps/mm, scaled by the direction components.
    let x = &report.drives[0];
    let y = &report.drives[1];
    assert_eq!(x.net_steps, (25.0 * 80.0 * 0.6) as i32);
    assert_eq!(y.net_steps, (25.0 * 80.0 * 0.8) as i32);
    Ok(())
}

#[test]
fn delta_travel_move_runs_all_towers() -> Result<()> {
    let machine = MachineConfig::from_toml(DELTA_MACHINE)?;
    let mv = MoveSpec {
        direction: [0.8, 0.0, -0.6],
        distance: 20.0,
        start_speed: 5.0,
        cruise_speed: 40.0,
        accel: 1000.0,
        extrusion: 0.0,
        start_x: 0.0,
        start_y: 0.0,
    };
    let report = sim::simulate(&machine, &mv)?;

    assert_eq!(report.drives.len(), 3);
    for drive in &report.drives {
        assert!(drive.fault.is_none(), "tower {} faulted", drive.letter);
        assert!(!drive.pulses.is_empty());
        assert!(
            drive.pulses.windows(2).all(|p| p[1].clock >= p[0].clock),
            "tower {} due times not ordered",
            drive.letter
        );
        assert!(drive.pulses.last().unwrap().clock <= report.clocks_needed);
    }
    Ok(())
}

#[test]
fn invalid_config_is_rejected_before_simulation() -> Result<()> {
    let machine = MachineConfig::from_toml(
        r#"
kinematics = "delta"
steps_per_mm = [80.0, 80.0, 80.0]
"#,
    )?;
    let mv = MoveSpec::from_toml(PRINT_MOVE)?;
    assert!(sim::simulate(&machine, &mv).is_err());
    Ok(())
}
