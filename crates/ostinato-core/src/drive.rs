//! Per-drive step scheduling.
//!
//! A [`DriveMovement`] owns everything one motor needs to turn a planned
//! move into individual step due-times: the cursor into the move's segment
//! chain, the current segment's timing coefficients, the step counters and
//! the adaptive multi-stepping state. The planner seeds it with one of the
//! `prepare_*` entry points; the step interrupt then calls
//! [`DriveMovement::calc_next_step_time`] after every pulse until it
//! returns `false`.
//!
//! The hot path must finish within the worst-case inter-step budget, so the
//! sqrt-heavy recomputation is amortised: when the observed step interval
//! drops below a per-mode threshold, one computation covers a batch of
//! 2/4/8 (Cartesian) or up to 16 (delta) steps at a cached interval.

use std::fmt;

use thiserror::Error;

use crate::dda::{Dda, DrivePlatform, ExtruderShaper, drive_letter};
use crate::delta::{DeltaGeometry, PrepParams};
use crate::segment::MoveSegment;

/// Cartesian step intervals shorter than this (in clocks) switch the
/// scheduler to double/quad/octal stepping.
pub const MIN_CALC_INTERVAL_CARTESIAN: u32 = 600;
/// Delta recomputation is heavier; below this interval batching engages,
/// with one extra tier up to 16 steps.
pub const MIN_CALC_INTERVAL_DELTA: u32 = 1200;

// Large enough that the first step is always computed singly.
const STEP_INTERVAL_SENTINEL: u32 = 999_999;

/// Why a move was aborted by the scheduler.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StepFault {
    #[error("carriage solve went negative at step {step}")]
    NegativeDistance { step: u32 },
    #[error("step {step} due at clock {clock}, past the move budget")]
    LateStep { step: u32, clock: u32 },
    #[error("segment chain exhausted at step {step} of {total}")]
    SegmentsExhausted { step: u32, total: u32 },
}

/// Scheduler state for one drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmState {
    Idle,
    StepError(StepFault),
    /// Cartesian/extruder, accelerating.
    CartAccel,
    /// Cartesian/extruder, constant speed.
    CartLinear,
    /// Cartesian/extruder, decelerating, still moving forwards.
    CartDecelForwards,
    /// Cartesian/extruder, reversed (pressure-advance retraction).
    CartDecelReverse,
    /// Delta carriage moving up.
    DeltaForwards,
    /// Delta carriage moving down.
    DeltaReverse,
}

impl DmState {
    pub fn is_moving(&self) -> bool {
        !matches!(self, DmState::Idle | DmState::StepError(_))
    }

    pub fn fault(&self) -> Option<StepFault> {
        match self {
            DmState::StepError(fault) => Some(*fault),
            _ => None,
        }
    }
}

/// Cartesian/extruder per-move parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct CartParams {
    pressure_advance_k: f64,
    effective_steps_per_mm: f64,
    /// Speed at the end of the current segment; extruder diagnostics only.
    extruder_speed: f64,
    /// Reverse steps taken in completed retraction spans.
    extruder_reverse_steps: u32,
    /// Extrusion carried over from previous moves, kept for diagnostics.
    extrusion_brought_forwards: f64,
}

/// Delta per-move parameters. The first four are fixed for the whole move;
/// `f_hmz0s` tracks the carriage height above its start, in steps.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct DeltaParams {
    f_two_a: f64,
    f_two_b: f64,
    h0_minus_z0: f64,
    f_dsq_minus_asq_minus_bsq_times_ssq: f64,
    f_hmz0s: f64,
    f_minus_aa_plus_bb_times_s: f64,
    steps_per_mm: f64,
    /// Move distance at which the carriage reverses; infinity when it
    /// never does.
    reverse_start_distance: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum MoveParams {
    Cart(CartParams),
    Delta(DeltaParams),
}

/// Per-drive state machine walking one move's segment chain.
#[derive(Clone, Debug)]
pub struct DriveMovement {
    state: DmState,
    drive: usize,
    /// Current rotation direction; true is forwards.
    direction: bool,
    /// Set when a computation flips the direction; the step interrupt
    /// consumes it to update the direction pin.
    direction_changed: bool,
    /// Direction of the move's net motion, before any reverse phase.
    base_direction: bool,
    is_delta: bool,
    is_extruder: bool,

    total_steps: u32,
    /// Index of the step being scheduled; the first step is 1.
    next_step: u32,
    /// First step index belonging to the next segment.
    segment_step_limit: u32,
    /// Step at which the direction flips; `total_steps + 1` means never.
    reverse_start_step: u32,
    /// Due time of the scheduled step, in clocks from move start.
    next_step_time: u32,
    /// Last observed inter-step interval, in clocks.
    step_interval: u32,
    /// Steps left to emit at the cached interval before recomputing.
    steps_till_recalc: u32,

    /// Cursor into the owning DDA's segment chain.
    current_segment: usize,
    /// Accumulated distance at the end of the current segment, in mm.
    distance_so_far: f64,
    /// Accumulated time at the end of the current segment, in clocks.
    time_so_far: f64,
    /// Current segment's timing coefficients: `p_b` scales the step index,
    /// `p_c` is additive, `p_a` sits under the square root.
    p_a: f64,
    p_b: f64,
    p_c: f64,
    effective_mm_per_step: f64,
    mp: MoveParams,
}

impl DriveMovement {
    pub(crate) fn new(drive: usize) -> Self {
        Self {
            state: DmState::Idle,
            drive,
            direction: true,
            direction_changed: false,
            base_direction: true,
            is_delta: false,
            is_extruder: false,
            total_steps: 0,
            next_step: 0,
            segment_step_limit: 0,
            reverse_start_step: 1,
            next_step_time: 0,
            step_interval: 0,
            steps_till_recalc: 0,
            current_segment: 0,
            distance_so_far: 0.0,
            time_so_far: 0.0,
            p_a: 0.0,
            p_b: 0.0,
            p_c: 0.0,
            effective_mm_per_step: 0.0,
            mp: MoveParams::Cart(CartParams::default()),
        }
    }

    pub(crate) fn reset(&mut self, drive: usize, state: DmState) {
        self.drive = drive;
        self.state = state;
    }

    pub fn state(&self) -> DmState {
        self.state
    }

    pub fn drive(&self) -> usize {
        self.drive
    }

    pub fn direction(&self) -> bool {
        self.direction
    }

    pub fn direction_changed(&self) -> bool {
        self.direction_changed
    }

    /// The step interrupt calls this after updating the direction pin.
    pub fn clear_direction_changed(&mut self) {
        self.direction_changed = false;
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    pub fn next_step(&self) -> u32 {
        self.next_step
    }

    pub fn reverse_start_step(&self) -> u32 {
        self.reverse_start_step
    }

    /// Due time of the most recently scheduled step, in clocks from move
    /// start.
    pub fn next_step_time(&self) -> u32 {
        self.next_step_time
    }

    pub fn step_interval(&self) -> u32 {
        self.step_interval
    }

    pub fn steps_till_recalc(&self) -> u32 {
        self.steps_till_recalc
    }

    /// Signed net steps taken so far, for position reporting.
    pub fn net_steps_taken(&self) -> i32 {
        let mut net = if self.next_step <= self.reverse_start_step {
            if self.next_step == 0 {
                0
            } else {
                self.next_step as i32 - 1
            }
        } else {
            self.next_step as i32 - 2 * self.reverse_start_step as i32 + 1
        };
        if self.is_extruder {
            if let MoveParams::Cart(cart) = &self.mp {
                net -= 2 * cart.extruder_reverse_steps as i32;
            }
        }
        if self.direction { net } else { -net }
    }

    /// Seed this drive for a Cartesian axis move. Returns false if the
    /// drive contributes no steps.
    pub fn prepare_cartesian_axis(&mut self, dda: &Dda, platform: &impl DrivePlatform) -> bool {
        let fraction = dda.direction_vector[self.drive];
        if fraction == 0.0 {
            self.state = DmState::Idle;
            return false;
        }
        let effective_steps_per_mm = platform.steps_per_mm(self.drive) * fraction.abs();
        self.distance_so_far = 0.0;
        self.time_so_far = 0.0;
        self.direction = fraction >= 0.0;
        self.base_direction = self.direction;
        self.direction_changed = false;
        self.is_delta = false;
        self.is_extruder = false;
        self.effective_mm_per_step = 1.0 / effective_steps_per_mm;
        self.total_steps = (dda.total_distance * effective_steps_per_mm) as u32;
        self.reverse_start_step = self.total_steps + 1;
        self.current_segment = 0;
        self.mp = MoveParams::Cart(CartParams {
            pressure_advance_k: 0.0,
            effective_steps_per_mm,
            ..CartParams::default()
        });

        if self.total_steps == 0 || !self.advance_segment_cartesian(&dda.axis_segments) {
            self.state = DmState::Idle;
            return false;
        }
        self.begin_step_loop();
        self.calc_next_step_time(dda)
    }

    /// Seed this drive for an extruder move. Pending extrusion from earlier
    /// moves is folded into the starting distance; the shaper's K drives
    /// pressure advance.
    pub fn prepare_extruder(
        &mut self,
        dda: &Dda,
        shaper: &impl ExtruderShaper,
        platform: &impl DrivePlatform,
    ) -> bool {
        let fraction = dda.direction_vector[self.drive];
        if fraction == 0.0 {
            self.state = DmState::Idle;
            return false;
        }
        let effective_steps_per_mm = platform.steps_per_mm(self.drive) * fraction.abs();
        self.distance_so_far = shaper.extrusion_pending();
        self.time_so_far = 0.0;
        self.direction = fraction >= 0.0;
        self.base_direction = self.direction;
        self.direction_changed = false;
        self.is_delta = false;
        self.is_extruder = true;
        self.effective_mm_per_step = 1.0 / effective_steps_per_mm;
        self.total_steps = 0;
        self.reverse_start_step = 1;
        self.current_segment = 0;
        self.mp = MoveParams::Cart(CartParams {
            pressure_advance_k: shaper.k(),
            effective_steps_per_mm,
            extrusion_brought_forwards: shaper.extrusion_pending(),
            ..CartParams::default()
        });

        if !self.advance_segment_cartesian(&dda.extruder_segments) {
            self.state = DmState::Idle;
            return false;
        }
        self.begin_step_loop();
        self.calc_next_step_time(dda)
    }

    /// Seed this drive for a delta tower move: derive the geometry
    /// constants, locate the apex if the carriage reverses mid-move, and
    /// schedule the first step.
    pub fn prepare_delta_axis(
        &mut self,
        dda: &Dda,
        params: &PrepParams,
        geometry: &DeltaGeometry,
        platform: &impl DrivePlatform,
    ) -> bool {
        let steps_per_mm = platform.steps_per_mm(self.drive);
        let tower = geometry.tower(self.drive);
        let dx = dda.direction_vector[0];
        let dy = dda.direction_vector[1];
        let dz = dda.direction_vector[2];
        let a = params.initial_x - tower.x;
        let b = params.initial_y - tower.y;
        let a_a_plus_b_b = a * dx + b * dy;
        let dsq_minus_asq_minus_bsq = tower.diagonal_sq - a * a - b * b;
        if dsq_minus_asq_minus_bsq <= 0.0 {
            // Start point is outside this tower's reach.
            self.state = DmState::Idle;
            return false;
        }
        let h0_minus_z0 = dsq_minus_asq_minus_bsq.sqrt();

        // Net carriage displacement over the whole move fixes the initial
        // direction and the step count.
        let d = dda.total_distance;
        let end_arg =
            dsq_minus_asq_minus_bsq - 2.0 * d * a_a_plus_b_b - params.a2_plus_b2 * d * d;
        let net_end = dz * d + end_arg.max(0.0).sqrt() - h0_minus_z0;
        self.direction = net_end >= 0.0;
        self.base_direction = self.direction;
        self.direction_changed = false;
        self.total_steps = (net_end.abs() * steps_per_mm) as u32;

        self.mp = MoveParams::Delta(DeltaParams {
            f_two_a: 2.0 * a,
            f_two_b: 2.0 * b,
            h0_minus_z0,
            f_dsq_minus_asq_minus_bsq_times_ssq: dsq_minus_asq_minus_bsq
                * steps_per_mm
                * steps_per_mm,
            f_hmz0s: h0_minus_z0 * steps_per_mm,
            f_minus_aa_plus_bb_times_s: -(a_a_plus_b_b * steps_per_mm),
            steps_per_mm,
            reverse_start_distance: f64::INFINITY,
        });

        if params.a2_plus_b2 <= 0.0 {
            // Pure Z: the reversal quadratic would divide by zero.
            self.direction = dz >= 0.0;
            self.base_direction = self.direction;
            self.reverse_start_step = self.total_steps + 1;
        } else {
            // Distance at which the carriage tops out. One quadratic root
            // is the carriage below the bed; this is the other.
            let d_rev = (dz
                * (params.a2_plus_b2 * tower.diagonal_sq - (a * dy - b * dx).powi(2))
                    .max(0.0)
                    .sqrt()
                - a_a_plus_b_b)
                / params.a2_plus_b2;
            if d_rev > 0.0 && d_rev < dda.total_distance {
                let h_rev = dz * d_rev
                    + (dsq_minus_asq_minus_bsq
                        - 2.0 * d_rev * a_a_plus_b_b
                        - params.a2_plus_b2 * d_rev * d_rev)
                        .max(0.0)
                        .sqrt();
                let num_steps_up = ((h_rev - h0_minus_z0) * steps_per_mm) as i64;
                if num_steps_up < 1
                    || (self.direction && (num_steps_up as u32) <= self.total_steps)
                {
                    // Already almost at the peak; not a real reversal.
                    self.reverse_start_step = self.total_steps + 1;
                    self.direction = false;
                    self.base_direction = false;
                } else {
                    self.reverse_start_step = num_steps_up as u32 + 1;
                    if let MoveParams::Delta(dp) = &mut self.mp {
                        dp.reverse_start_distance = d_rev;
                    }
                    if self.direction {
                        // Net up: rise, then fall by less.
                        self.total_steps = 2 * num_steps_up as u32 - self.total_steps;
                    } else {
                        // Net down: rise first, then fall by more.
                        self.direction = true;
                        self.base_direction = true;
                        self.total_steps = 2 * num_steps_up as u32 + self.total_steps;
                    }
                }
            } else {
                // Apex outside the move; direction stays the net one.
                self.reverse_start_step = self.total_steps + 1;
            }
        }

        self.distance_so_far = 0.0;
        self.time_so_far = 0.0;
        self.effective_mm_per_step = 1.0 / steps_per_mm;
        self.is_delta = true;
        self.is_extruder = false;
        self.current_segment = 0;

        if self.total_steps == 0 || !self.advance_segment_delta(dda) {
            self.state = DmState::Idle;
            return false;
        }
        self.begin_step_loop();
        self.calc_next_step_time(dda)
    }

    fn begin_step_loop(&mut self) {
        self.next_step = 0;
        self.next_step_time = 0;
        self.step_interval = STEP_INTERVAL_SENTINEL;
        self.steps_till_recalc = 0;
    }

    /// Compute the due time of the next step. Returns true if a step was
    /// scheduled; false when the drive is done with this move (inspect
    /// [`Self::state`] for a fault).
    pub fn calc_next_step_time(&mut self, dda: &Dda) -> bool {
        self.next_step += 1;
        if self.next_step <= self.total_steps || self.is_extruder {
            if self.steps_till_recalc != 0 {
                // Multi-stepping: replay the cached interval.
                self.steps_till_recalc -= 1;
                self.next_step_time += self.step_interval;
                return true;
            }
            if self.calc_next_step_time_full(dda) {
                return true;
            }
        }
        if !matches!(self.state, DmState::StepError(_)) {
            self.state = DmState::Idle;
        }
        false
    }

    fn calc_next_step_time_full(&mut self, dda: &Dda) -> bool {
        let mut shift_factor = 0u32;
        let mut steps_to_limit = self.segment_step_limit.saturating_sub(self.next_step);
        let next_calc_time: f64;

        match self.state {
            DmState::CartAccel
            | DmState::CartLinear
            | DmState::CartDecelForwards
            | DmState::CartDecelReverse => {
                if steps_to_limit > 1 && self.step_interval < MIN_CALC_INTERVAL_CARTESIAN {
                    shift_factor = if self.step_interval < MIN_CALC_INTERVAL_CARTESIAN / 4
                        && steps_to_limit > 8
                    {
                        3
                    } else if self.step_interval < MIN_CALC_INTERVAL_CARTESIAN / 2
                        && steps_to_limit > 4
                    {
                        2
                    } else if steps_to_limit > 2 {
                        1
                    } else {
                        0
                    };
                }
                self.steps_till_recalc = (1 << shift_factor) - 1;
                let n = (self.next_step + self.steps_till_recalc) as f64;
                next_calc_time = match self.state {
                    DmState::CartLinear => self.p_b * n + self.p_c,
                    DmState::CartAccel | DmState::CartDecelReverse => {
                        self.p_c + (self.p_a + self.p_b * n).max(0.0).sqrt()
                    }
                    // Forward deceleration takes the early root.
                    _ => self.p_c - (self.p_a + self.p_b * n).max(0.0).sqrt(),
                };
            }

            DmState::DeltaForwards | DmState::DeltaReverse => {
                if self.state == DmState::DeltaForwards
                    && self.reverse_start_step <= self.total_steps
                {
                    if self.next_step == self.reverse_start_step {
                        // Apex: this step is the first one downwards.
                        self.direction = false;
                        self.direction_changed = true;
                        self.state = DmState::DeltaReverse;
                        let seg = &dda.axis_segments[self.current_segment];
                        let limit = self.delta_down_limit(seg, dda, self.distance_so_far);
                        self.segment_step_limit = limit;
                        steps_to_limit = limit.saturating_sub(self.next_step);
                    } else {
                        // Never batch across the apex.
                        steps_to_limit =
                            steps_to_limit.min(self.reverse_start_step - self.next_step);
                    }
                }

                if steps_to_limit > 1 && self.step_interval < MIN_CALC_INTERVAL_DELTA {
                    shift_factor = if self.step_interval < MIN_CALC_INTERVAL_DELTA / 8
                        && steps_to_limit > 16
                    {
                        4
                    } else if self.step_interval < MIN_CALC_INTERVAL_DELTA / 4
                        && steps_to_limit > 8
                    {
                        3
                    } else if self.step_interval < MIN_CALC_INTERVAL_DELTA / 2
                        && steps_to_limit > 4
                    {
                        2
                    } else if steps_to_limit > 2 {
                        1
                    } else {
                        0
                    };
                }
                self.steps_till_recalc = (1 << shift_factor) - 1;

                let dz = dda.direction_vector[2];
                let ds = {
                    let MoveParams::Delta(dp) = &mut self.mp else {
                        return false;
                    };
                    let batch = (1u32 << shift_factor) as f64;
                    dp.f_hmz0s += if self.direction { batch } else { -batch };
                    let t1 = dp.f_minus_aa_plus_bb_times_s + dp.f_hmz0s * dz;
                    // Accumulated rounding can push the discriminant just
                    // below zero near the apex.
                    let t2a = dp.f_dsq_minus_asq_minus_bsq_times_ssq - dp.f_hmz0s * dp.f_hmz0s
                        + t1 * t1;
                    let t2 = if t2a > 0.0 { t2a.sqrt() } else { 0.0 };
                    if self.direction { t1 - t2 } else { t1 + t2 }
                };
                if ds < 0.0 {
                    self.state = DmState::StepError(StepFault::NegativeDistance {
                        step: self.next_step,
                    });
                    return false;
                }
                let seg = &dda.axis_segments[self.current_segment];
                next_calc_time = seg.step_time(ds, self.p_a, self.p_b, self.p_c);
            }

            DmState::Idle | DmState::StepError(_) => return false,
        }

        // With high microstepping, rounding can make a step appear due
        // before the previous one when crossing a segment boundary.
        let next_calc = next_calc_time.max(0.0) as u32;
        self.step_interval = if next_calc > self.next_step_time {
            (next_calc - self.next_step_time) >> shift_factor
        } else {
            0
        };
        if cfg!(feature = "even-steps") {
            self.next_step_time = next_calc - self.steps_till_recalc * self.step_interval;
        } else {
            self.next_step_time = next_calc;
        }

        if next_calc > dda.clocks_needed {
            // A very low end speed makes the last step time hypersensitive
            // to rounding; pull it back to the planned finish. On a delta
            // the penultimate step can be affected too.
            if self.next_step + 1 >= self.total_steps {
                self.next_step_time = dda.clocks_needed;
            } else {
                self.state = DmState::StepError(StepFault::LateStep {
                    step: self.next_step,
                    clock: self.next_step_time,
                });
                return false;
            }
        }

        if steps_to_limit == 0 {
            self.current_segment += 1;
            let more = if self.is_delta {
                self.advance_segment_delta(dda)
            } else if self.is_extruder {
                self.advance_segment_cartesian(&dda.extruder_segments)
            } else {
                self.advance_segment_cartesian(&dda.axis_segments)
            };
            if !more {
                if self.is_extruder || self.next_step > self.total_steps {
                    // Ran off the end of the commanded extrusion.
                    return false;
                }
                self.state = DmState::StepError(StepFault::SegmentsExhausted {
                    step: self.next_step,
                    total: self.total_steps,
                });
                return false;
            }
        }
        true
    }

    /// Move the cursor to the next Cartesian/extruder segment in which this
    /// drive still makes step progress, and load its coefficients.
    fn advance_segment_cartesian(&mut self, segments: &[MoveSegment]) -> bool {
        let MoveParams::Cart(cart) = self.mp else {
            return false;
        };
        loop {
            let Some(seg) = segments.get(self.current_segment) else {
                return false;
            };
            let start_distance = self.distance_so_far;
            let start_time = self.time_so_far;
            self.distance_so_far += seg.segment_length();
            self.time_so_far += seg.segment_time();

            let limit = if seg.is_last() && !self.is_extruder {
                self.total_steps + 1
            } else {
                (self.distance_so_far * cart.effective_steps_per_mm) as u32
            };
            if self.next_step < limit {
                self.segment_step_limit = limit;
                self.p_b = seg.calc_b(self.effective_mm_per_step);
                if seg.is_linear() {
                    self.p_c = seg.calc_c(start_distance, start_time, cart.pressure_advance_k);
                    self.state = DmState::CartLinear;
                } else {
                    self.p_a = seg.calc_a(start_distance, cart.pressure_advance_k);
                    self.p_c = seg.calc_c(start_distance, start_time, cart.pressure_advance_k);
                    self.state = if seg.is_accelerating() {
                        DmState::CartAccel
                    } else if seg.is_reverse() {
                        DmState::CartDecelReverse
                    } else {
                        DmState::CartDecelForwards
                    };
                }
                self.note_cart_segment(seg, limit);
                return true;
            }
            self.current_segment += 1;
        }
    }

    // Direction and reversal bookkeeping on segment entry.
    fn note_cart_segment(&mut self, seg: &MoveSegment, limit: u32) {
        if self.is_extruder {
            self.total_steps = limit.saturating_sub(1);
        }
        let seg_direction = self.base_direction ^ seg.is_reverse();
        if seg_direction != self.direction {
            self.direction = seg_direction;
            self.direction_changed = true;
            if seg.is_reverse() {
                // The step just computed is the first one pulsed with the
                // new direction.
                self.reverse_start_step = self.next_step.max(1);
            } else {
                if let MoveParams::Cart(cart) = &mut self.mp {
                    cart.extruder_reverse_steps += self.next_step - self.reverse_start_step;
                }
                self.reverse_start_step = self.total_steps + 1;
            }
        } else if self.direction == self.base_direction {
            self.reverse_start_step = self.total_steps + 1;
        }
        if let MoveParams::Cart(cart) = &mut self.mp {
            cart.extruder_speed = seg.end_speed();
        }
    }

    /// Move the cursor to the next delta segment in which the carriage
    /// still crosses a step boundary, and load its coefficients.
    fn advance_segment_delta(&mut self, dda: &Dda) -> bool {
        loop {
            let Some(seg) = dda.axis_segments.get(self.current_segment) else {
                return false;
            };
            // Coefficients use the values at segment start; the carriage
            // solve below uses the distance at segment end.
            self.p_b = seg.calc_b(self.effective_mm_per_step);
            self.p_c = seg.calc_c(self.distance_so_far, self.time_so_far, 0.0);
            if !seg.is_linear() {
                self.p_a = seg.calc_a(self.distance_so_far, 0.0);
            }
            self.distance_so_far += seg.segment_length();
            let net_steps_at_end = self.delta_net_steps_at(dda, self.distance_so_far);
            self.time_so_far += seg.segment_time();

            if self.direction {
                // A segment reaching past the apex carries the reversal
                // even though its end height may be back below the current
                // step.
                let contains_apex = self.reverse_start_step <= self.total_steps
                    && self.distance_so_far > self.delta_reverse_start_distance();
                if contains_apex || net_steps_at_end > self.next_step as f64 {
                    self.state = DmState::DeltaForwards;
                    self.segment_step_limit = if contains_apex {
                        self.reverse_start_step
                    } else if seg.is_last() {
                        self.total_steps + 1
                    } else {
                        net_steps_at_end as u32 + 1
                    };
                    return true;
                }
            } else {
                let limit = self.delta_down_limit(seg, dda, self.distance_so_far);
                if limit > self.next_step {
                    self.state = DmState::DeltaReverse;
                    self.segment_step_limit = limit;
                    return true;
                }
            }
            self.current_segment += 1;
        }
    }

    fn delta_reverse_start_distance(&self) -> f64 {
        match &self.mp {
            MoveParams::Delta(dp) => dp.reverse_start_distance,
            MoveParams::Cart(_) => f64::INFINITY,
        }
    }

    /// Net carriage height above its start position, in steps, when the
    /// effector has travelled `distance` mm.
    fn delta_net_steps_at(&self, dda: &Dda, distance: f64) -> f64 {
        let MoveParams::Delta(dp) = &self.mp else {
            return 0.0;
        };
        let s_dx = distance * dda.direction_vector[0];
        let s_dy = distance * dda.direction_vector[1];
        let spm = dp.steps_per_mm;
        let arg = dp.f_dsq_minus_asq_minus_bsq_times_ssq
            - spm * spm * (s_dx * (s_dx + dp.f_two_a) + s_dy * (s_dy + dp.f_two_b));
        arg.max(0.0).sqrt() + (distance * dda.direction_vector[2] - dp.h0_minus_z0) * spm
    }

    /// Gross step limit for downward carriage motion ending at the given
    /// effector distance. Net height is converted to the gross step counter
    /// scale: past a reversal the counter has covered the up phase twice.
    fn delta_down_limit(&self, seg: &MoveSegment, dda: &Dda, distance: f64) -> u32 {
        if seg.is_last() {
            return self.total_steps + 1;
        }
        let net_end = self.delta_net_steps_at(dda, distance);
        let offset: i64 = if self.reverse_start_step <= self.total_steps {
            2 * (self.reverse_start_step as i64 - 1)
        } else {
            0
        };
        (offset - net_end as i64).max(0) as u32
    }
}

impl fmt::Display for DriveMovement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = drive_letter(self.drive);
        match self.state {
            DmState::Idle => write!(f, "DM{letter}: not moving"),
            _ => {
                if let DmState::StepError(fault) = self.state {
                    write!(f, "DM{letter} ERR [{fault}]:")?;
                } else {
                    write!(f, "DM{letter}:")?;
                }
                write!(
                    f,
                    " dir={} steps={} next={} rev={} interval={} A={:.3} B={:.3} C={:.3}",
                    if self.direction { 'F' } else { 'B' },
                    self.total_steps,
                    self.next_step,
                    self.reverse_start_step,
                    self.step_interval,
                    self.p_a,
                    self.p_b,
                    self.p_c,
                )?;
                match &self.mp {
                    MoveParams::Cart(cart) if self.is_extruder => write!(
                        f,
                        " pa={:.3} espd={:.6} ebf={:.3}",
                        cart.pressure_advance_k,
                        cart.extruder_speed,
                        cart.extrusion_brought_forwards
                    ),
                    MoveParams::Cart(cart) => write!(f, " pa={:.3}", cart.pressure_advance_k),
                    MoveParams::Delta(dp) => write!(
                        f,
                        " hmz0s={:.2} minusAaPlusBbTimesS={:.2}",
                        dp.f_hmz0s, dp.f_minus_aa_plus_bb_times_s
                    ),
                }
            }
        }
    }
}
