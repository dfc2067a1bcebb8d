//! Linear-delta tower geometry.
//!
//! Three vertical towers carry the effector on diagonal rods; a tower
//! carriage's height above the effector Z is `sqrt(diagonal² - dx² - dy²)`
//! for the horizontal offsets `dx`, `dy` between effector and tower. The
//! per-move constants the scheduler derives from this table are fixed at
//! prepare time.

/// One tower: its XY position and the squared length of its diagonal rod.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tower {
    pub x: f64,
    pub y: f64,
    pub diagonal_sq: f64,
}

/// The three-tower table for a linear delta machine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeltaGeometry {
    towers: [Tower; 3],
}

impl DeltaGeometry {
    pub fn new(towers: [Tower; 3]) -> Self {
        Self { towers }
    }

    /// Standard layout: towers on a circle of `radius`, at 90°, 210° and
    /// 330°, all with the same `diagonal` rod length.
    pub fn from_radius(radius: f64, diagonal: f64) -> Self {
        let diagonal_sq = diagonal * diagonal;
        let tower = |deg: f64| {
            let rad = deg.to_radians();
            Tower {
                x: radius * rad.cos(),
                y: radius * rad.sin(),
                diagonal_sq,
            }
        };
        Self {
            towers: [tower(90.0), tower(210.0), tower(330.0)],
        }
    }

    pub fn tower(&self, drive: usize) -> &Tower {
        &self.towers[drive]
    }
}

/// Move-level inputs to delta preparation that the planner already has at
/// hand: the effector XY at move start and the squared XY magnitude of the
/// direction vector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrepParams {
    pub initial_x: f64,
    pub initial_y: f64,
    pub a2_plus_b2: f64,
}

impl PrepParams {
    pub fn new(initial_x: f64, initial_y: f64, direction_vector: &[f64]) -> Self {
        Self {
            initial_x,
            initial_y,
            a2_plus_b2: direction_vector[0] * direction_vector[0]
                + direction_vector[1] * direction_vector[1],
        }
    }
}
