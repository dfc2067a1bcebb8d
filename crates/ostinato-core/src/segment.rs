//! Kinematic move segments.
//!
//! A planned move is a chain of segments, each describing one phase of the
//! velocity profile (acceleration, cruise, deceleration, or a reverse phase
//! for extruder retraction). Every segment carries enough normalized
//! constants to answer "at which clock is the step covering commanded
//! distance d due?" in closed form; the per-drive scheduler combines those
//! constants with its own step scale and running distance/time offsets.
//!
//! Distances are in millimetres of commanded move distance, times in step
//! timer clocks, speeds in mm per clock.

/// Velocity profile class of a segment.
///
/// Linear segments store the reciprocal speed (clocks per mm). Sqrt
/// segments store `b = u/a` (clocks) and `c = 2/a` (clocks² per mm), both
/// signed by the acceleration; a reverse segment measures both along the
/// reverse direction, starting from standstill at the apex.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Shape {
    Linear { inv_speed: f64 },
    Sqrt { b: f64, c: f64, reverse: bool },
}

/// One phase of a planned move.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoveSegment {
    length: f64,
    time: f64,
    shape: Shape,
    last: bool,
}

impl MoveSegment {
    /// Constant-speed segment covering `length` mm in `time` clocks.
    pub fn linear(length: f64, time: f64) -> Self {
        Self {
            length,
            time,
            shape: Shape::Linear {
                inv_speed: time / length,
            },
            last: false,
        }
    }

    /// Accelerating or decelerating segment starting at `start_speed` with
    /// signed acceleration `accel`.
    pub fn ramp(length: f64, start_speed: f64, accel: f64) -> Self {
        let b = start_speed / accel;
        let c = 2.0 / accel;
        let time = if accel > 0.0 {
            (b * b + c * length).sqrt() - b
        } else {
            -b - (b * b + c * length).max(0.0).sqrt()
        };
        Self {
            length,
            time,
            shape: Shape::Sqrt {
                b,
                c,
                reverse: false,
            },
            last: false,
        }
    }

    /// Reverse segment (extruder retraction past the pressure-advance
    /// apex): `length` mm of gross motion away from the apex, starting at
    /// `start_speed` with acceleration `accel`, both measured along the
    /// reverse direction and non-negative.
    pub fn reverse(length: f64, start_speed: f64, accel: f64) -> Self {
        let b = start_speed / accel;
        let c = 2.0 / accel;
        Self {
            length,
            time: (b * b + c * length).sqrt() - b,
            shape: Shape::Sqrt {
                b,
                c,
                reverse: true,
            },
            last: false,
        }
    }

    pub fn segment_length(&self) -> f64 {
        self.length
    }

    pub fn segment_time(&self) -> f64 {
        self.time
    }

    pub fn is_linear(&self) -> bool {
        matches!(self.shape, Shape::Linear { .. })
    }

    pub fn is_accelerating(&self) -> bool {
        matches!(self.shape, Shape::Sqrt { c, reverse: false, .. } if c > 0.0)
    }

    pub fn is_reverse(&self) -> bool {
        matches!(self.shape, Shape::Sqrt { reverse: true, .. })
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    pub(crate) fn mark_last(&mut self) {
        self.last = true;
    }

    /// Speed at the end of the segment, along the direction of motion.
    pub fn end_speed(&self) -> f64 {
        match self.shape {
            Shape::Linear { inv_speed } => 1.0 / inv_speed,
            Shape::Sqrt { b, c, .. } => {
                // v = a * sqrt(b² + c·L), a = 2/c
                (2.0 / c) * (b * b + c * self.length).max(0.0).sqrt() * c.signum()
            }
        }
    }

    /// Coefficient multiplying the step index in the step-time formula.
    pub fn calc_b(&self, eff_mm_per_step: f64) -> f64 {
        match self.shape {
            Shape::Linear { inv_speed } => inv_speed * eff_mm_per_step,
            Shape::Sqrt { c, .. } => c * eff_mm_per_step,
        }
    }

    /// Additive time coefficient: the step-time formula's constant term for
    /// a drive whose accumulated distance and time at segment start are
    /// `start_distance` and `start_time`.
    pub fn calc_c(&self, start_distance: f64, start_time: f64, pressure_advance_k: f64) -> f64 {
        match self.shape {
            Shape::Linear { inv_speed } => start_time - start_distance * inv_speed,
            Shape::Sqrt { b, .. } => start_time - b - pressure_advance_k,
        }
    }

    /// Constant term under the square root, for non-linear segments.
    pub fn calc_a(&self, start_distance: f64, pressure_advance_k: f64) -> f64 {
        match self.shape {
            Shape::Linear { .. } => 0.0,
            Shape::Sqrt { b, c, .. } => {
                let bk = b + pressure_advance_k;
                bk * bk - c * start_distance
            }
        }
    }

    /// Step time at a fractional step index `n`, with coefficients already
    /// built for the owning drive. Used by the delta path, where `n` is the
    /// carriage-derived move distance in step units.
    pub fn step_time(&self, n: f64, p_a: f64, p_b: f64, p_c: f64) -> f64 {
        match self.shape {
            Shape::Linear { .. } => p_b * n + p_c,
            Shape::Sqrt { c, reverse, .. } => {
                let root = (p_a + p_b * n).max(0.0).sqrt();
                if reverse || c > 0.0 {
                    p_c + root
                } else {
                    p_c - root
                }
            }
        }
    }
}

/// Append a trapezoidal accel/cruise/decel profile to a segment chain.
/// Phases with zero duration are omitted. Mirrors the shape planners hand
/// over: phase durations in clocks, speeds in mm/clock, acceleration in
/// mm/clock².
#[allow(clippy::too_many_arguments)]
pub fn push_trapezoid(
    segments: &mut Vec<MoveSegment>,
    accel_t: f64,
    cruise_t: f64,
    decel_t: f64,
    start_v: f64,
    cruise_v: f64,
    accel: f64,
) {
    if accel_t > 0.0 {
        let length = (start_v + 0.5 * accel * accel_t) * accel_t;
        segments.push(MoveSegment::ramp(length, start_v, accel));
    }
    if cruise_t > 0.0 {
        segments.push(MoveSegment::linear(cruise_v * cruise_t, cruise_t));
    }
    if decel_t > 0.0 {
        let length = (cruise_v - 0.5 * accel * decel_t) * decel_t;
        segments.push(MoveSegment::ramp(length, cruise_v, -accel));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn linear_coefficients_recover_step_times() {
        // 1 mm in 1000 clocks, stepped at 0.01 mm per step.
        let seg = MoveSegment::linear(1.0, 1000.0);
        let p_b = seg.calc_b(0.01);
        let p_c = seg.calc_c(0.0, 0.0, 0.0);
        assert_close(p_b, 10.0);
        assert_close(p_c, 0.0);
        assert_close(seg.step_time(25.0, 0.0, p_b, p_c), 250.0);
    }

    #[test]
    fn linear_offsets_shift_the_intercept() {
        let seg = MoveSegment::linear(2.0, 500.0);
        // A drive already 1 mm / 300 clocks into the move.
        let p_c = seg.calc_c(1.0, 300.0, 0.0);
        assert_close(p_c, 300.0 - 250.0);
    }

    #[test]
    fn ramp_time_matches_kinematics() {
        // From rest at 1e-6 mm/clock² over 0.5 mm: t = sqrt(2L/a) = 1000.
        let seg = MoveSegment::ramp(0.5, 0.0, 1e-6);
        assert_close(seg.segment_time(), 1000.0);
        assert!(seg.is_accelerating());

        // Decelerating from 0.0015 mm/clock at -1e-6 over 1 mm.
        let dec = MoveSegment::ramp(1.0, 0.0015, -1e-6);
        assert!(!dec.is_accelerating());
        assert!(!dec.is_reverse());
        assert_close(dec.segment_time(), 1000.0);
    }

    #[test]
    fn accel_coefficients_recover_step_times() {
        // From rest, a = 1e-6; step n covers n·0.01 mm, so t(n) = sqrt(2e4·n).
        let seg = MoveSegment::ramp(1.0, 0.0, 1e-6);
        let p_b = seg.calc_b(0.01);
        let p_a = seg.calc_a(0.0, 0.0);
        let p_c = seg.calc_c(0.0, 0.0, 0.0);
        assert_close(seg.step_time(100.0, p_a, p_b, p_c), (2e4_f64 * 100.0).sqrt());
    }

    #[test]
    fn pressure_advance_brings_steps_forward() {
        let seg = MoveSegment::ramp(1.0, 0.0005, 1e-6);
        let plain = seg.step_time(50.0, seg.calc_a(0.0, 0.0), seg.calc_b(0.01), seg.calc_c(0.0, 0.0, 0.0));
        let advanced =
            seg.step_time(50.0, seg.calc_a(0.0, 40.0), seg.calc_b(0.01), seg.calc_c(0.0, 0.0, 40.0));
        assert!(advanced < plain, "{advanced} >= {plain}");
    }

    #[test]
    fn reverse_segment_times_grow_from_the_apex() {
        let seg = MoveSegment::reverse(0.005, 0.0, 1e-5);
        assert!(seg.is_reverse());
        let p_b = seg.calc_b(0.001);
        let p_a = seg.calc_a(0.02, 0.0);
        let p_c = seg.calc_c(0.02, 20.0, 0.0);
        let t21 = seg.step_time(21.0, p_a, p_b, p_c);
        let t25 = seg.step_time(25.0, p_a, p_b, p_c);
        assert!(t21 > 20.0 && t25 > t21);
        assert_close(t25, 20.0 + seg.segment_time());
    }

    #[test]
    fn pressure_advance_applies_to_reverse_segments() {
        // Retraction past the apex at 0.02 mm / 20 clocks, stepped at
        // 0.001 mm per step, with K = 40 clocks.
        let seg = MoveSegment::reverse(0.005, 0.0, 1e-5);
        let k = 40.0;
        let p_b = seg.calc_b(0.001);
        let p_a = seg.calc_a(0.02, k);
        let p_c = seg.calc_c(0.02, 20.0, k);
        // The K terms cancel at the segment start, so the first retraction
        // instant stays pinned to the segment start time.
        assert_close(seg.step_time(20.0, p_a, p_b, p_c), 20.0);
        // Later steps are biased ahead of their K = 0 times.
        let plain =
            seg.step_time(25.0, seg.calc_a(0.02, 0.0), p_b, seg.calc_c(0.02, 20.0, 0.0));
        let advanced = seg.step_time(25.0, p_a, p_b, p_c);
        assert!(advanced < plain, "{advanced} >= {plain}");
        assert!(advanced > 20.0);
    }

    #[test]
    fn trapezoid_produces_three_phases() {
        let mut segments = Vec::new();
        push_trapezoid(&mut segments, 1000.0, 2666.0, 1000.0, 0.0005, 0.0015, 1e-6);
        assert_eq!(segments.len(), 3);
        assert!(segments[0].is_accelerating());
        assert!(segments[1].is_linear());
        assert!(!segments[2].is_accelerating() && !segments[2].is_linear());
        assert_close(segments[0].segment_length(), 1.0);
        assert_close(segments[2].segment_length(), 1.0);
        assert_close(segments[0].segment_time(), 1000.0);
    }

    #[test]
    fn trapezoid_omits_empty_phases() {
        let mut segments = Vec::new();
        push_trapezoid(&mut segments, 0.0, 1000.0, 0.0, 0.001, 0.001, 0.0);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].is_linear());
    }
}
