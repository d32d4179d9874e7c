use map_range::MapRange;
use ndarray::{Array2, s};

use crate::Point2D;

use super::sensor_tracker::StagePoint;

/// Linear mapping between stage millimetres (a square of `stage_size`,
/// centred on the origin) and a grid of `divisions` x `divisions` cells
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageMapping {
    pub divisions: usize,
    pub stage_size: f32,
}

impl StageMapping {
    pub fn new(divisions: usize, stage_size: f32) -> Self {
        StageMapping {
            divisions,
            stage_size,
        }
    }

    fn half(&self) -> f32 {
        self.stage_size / 2.
    }

    /// Continuous grid coordinates for a stage position
    pub fn stage_to_grid(&self, p: Point2D) -> Point2D {
        let d = self.divisions as f32;
        let h = self.half();
        (
            p.0.map_range(-h..h, 0. ..d),
            p.1.map_range(-h..h, 0. ..d),
        )
    }

    /// Inverse of `stage_to_grid`
    pub fn grid_to_stage(&self, g: Point2D) -> Point2D {
        let d = self.divisions as f32;
        let h = self.half();
        (
            g.0.map_range(0. ..d, -h..h),
            g.1.map_range(0. ..d, -h..h),
        )
    }

    /// The (column, row) of the cell containing a stage position, if on the grid
    pub fn stage_to_cell(&self, p: Point2D) -> Option<(usize, usize)> {
        let (gx, gy) = self.stage_to_grid(p);
        let (gx, gy) = (gx.floor(), gy.floor());
        let d = self.divisions as f32;
        if gx >= 0. && gy >= 0. && gx < d && gy < d {
            Some((gx as usize, gy as usize))
        } else {
            None
        }
    }

    pub fn cell_center_to_stage(&self, column: usize, row: usize) -> Point2D {
        self.grid_to_stage((column as f32 + 0.5, row as f32 + 0.5))
    }
}

/// Normalised occupancy density over the stage, rebuilt every tick.
/// Indexed `[[row, column]]`, i.e. `[[y, x]]`.
#[derive(Debug, Clone)]
pub struct PresenceGrid {
    densities: Array2<f32>,
    mapping: StageMapping,
}

impl PresenceGrid {
    /// Accumulate `area * scale_factor` for every point into its cell. A cell
    /// that has reached full density (1) takes no further contributions, and
    /// no cell ever exceeds 1.
    pub fn build(point_sets: &[Vec<StagePoint>], mapping: StageMapping, scale_factor: f32) -> Self {
        let mut densities = Array2::<f32>::zeros((mapping.divisions, mapping.divisions));
        for point in point_sets.iter().flatten() {
            if let Some((column, row)) = mapping.stage_to_cell(point.position) {
                let cell = &mut densities[[row, column]];
                if *cell < 1. {
                    *cell = (*cell + point.area * scale_factor).min(1.);
                }
            }
        }
        PresenceGrid { densities, mapping }
    }

    /// Box blur over the (2r+1)² neighbourhood of each cell, clipped at the edges
    pub fn blur(&mut self, radius: usize) {
        if radius == 0 {
            return;
        }
        let (rows, columns) = self.densities.dim();
        let source = &self.densities;
        let blurred = Array2::from_shape_fn((rows, columns), |(row, column)| {
            let r0 = row.saturating_sub(radius);
            let r1 = (row + radius + 1).min(rows);
            let c0 = column.saturating_sub(radius);
            let c1 = (column + radius + 1).min(columns);
            source.slice(s![r0..r1, c0..c1]).mean().unwrap_or(0.)
        });
        self.densities = blurred;
    }

    pub fn divisions(&self) -> usize {
        self.mapping.divisions
    }

    pub fn mapping(&self) -> &StageMapping {
        &self.mapping
    }

    pub fn densities(&self) -> &Array2<f32> {
        &self.densities
    }

    pub fn density_at(&self, column: usize, row: usize) -> f32 {
        self.densities
            .get((row, column))
            .copied()
            .unwrap_or_default()
    }
}
