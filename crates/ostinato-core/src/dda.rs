//! Move descriptors and the boundaries to the rest of the machine.
//!
//! A [`Dda`] is the read-only description of one planned move: the segment
//! chains for axes and extruders, the unit direction vector, the total
//! distance and the whole-move clock budget. The planner builds it, the
//! per-drive schedulers walk it.

use crate::segment::{self, MoveSegment};

/// Per-move descriptor handed over by the planner.
#[derive(Clone, Debug, Default)]
pub struct Dda {
    pub axis_segments: Vec<MoveSegment>,
    pub extruder_segments: Vec<MoveSegment>,
    /// Unit direction components for X/Y/Z, then the movement fraction of
    /// each extruder drive.
    pub direction_vector: Vec<f64>,
    /// Total commanded distance in mm.
    pub total_distance: f64,
    /// Whole-move time budget in step timer clocks.
    pub clocks_needed: u32,
}

impl Dda {
    pub fn new(direction_vector: Vec<f64>, total_distance: f64, clocks_needed: u32) -> Self {
        Self {
            axis_segments: Vec::new(),
            extruder_segments: Vec::new(),
            direction_vector,
            total_distance,
            clocks_needed,
        }
    }

    /// Append a trapezoidal profile to the axis chain.
    pub fn push_axis_trapezoid(
        &mut self,
        accel_t: f64,
        cruise_t: f64,
        decel_t: f64,
        start_v: f64,
        cruise_v: f64,
        accel: f64,
    ) {
        segment::push_trapezoid(
            &mut self.axis_segments,
            accel_t,
            cruise_t,
            decel_t,
            start_v,
            cruise_v,
            accel,
        );
    }

    pub fn push_axis_segment(&mut self, seg: MoveSegment) {
        self.axis_segments.push(seg);
    }

    pub fn push_extruder_segment(&mut self, seg: MoveSegment) {
        self.extruder_segments.push(seg);
    }

    /// Seal the chains, marking the final segment of each. Call once the
    /// move is fully assembled, before any drive is prepared.
    pub fn finish(&mut self) {
        if let Some(seg) = self.axis_segments.last_mut() {
            seg.mark_last();
        }
        if let Some(seg) = self.extruder_segments.last_mut() {
            seg.mark_last();
        }
    }
}

/// Per-drive machine parameters the scheduler needs from the platform.
pub trait DrivePlatform {
    fn steps_per_mm(&self, drive: usize) -> f64;
}

/// Extruder-side state carried between moves.
pub trait ExtruderShaper {
    /// Pressure-advance constant, in clocks.
    fn k(&self) -> f64;
    /// Extrusion commanded by previous moves but not yet stepped, in mm.
    fn extrusion_pending(&self) -> f64;
}

/// Table-backed platform, enough for hosts and tests.
#[derive(Clone, Debug, Default)]
pub struct FixedPlatform {
    steps_per_mm: Vec<f64>,
}

impl FixedPlatform {
    pub fn new(steps_per_mm: Vec<f64>) -> Self {
        Self { steps_per_mm }
    }
}

impl DrivePlatform for FixedPlatform {
    fn steps_per_mm(&self, drive: usize) -> f64 {
        self.steps_per_mm[drive]
    }
}

/// Value-backed shaper, enough for hosts and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedShaper {
    pub k: f64,
    pub pending: f64,
}

impl ExtruderShaper for FixedShaper {
    fn k(&self) -> f64 {
        self.k
    }

    fn extrusion_pending(&self) -> f64 {
        self.pending
    }
}

/// Display letter for a drive: axes by name, extruders by number.
pub fn drive_letter(drive: usize) -> char {
    match drive {
        0 => 'X',
        1 => 'Y',
        2 => 'Z',
        n => char::from_digit((n - 3) as u32 % 10, 10).unwrap_or('?'),
    }
}
