use std::f32::consts::PI;

use log::debug;
use ndarray::Array2;

use crate::{Point2D, geometry_utils::centroid};

use super::presence_grid::PresenceGrid;

/// A connected region of occupied cells; valid for one tick only
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    /// Sequential within the frame, for display; not an identity
    pub label: usize,
    /// Grid coordinates (cell centres are at +0.5)
    pub centroid: Point2D,
    /// Number of cells
    pub size: usize,
}

impl Blob {
    pub fn radius(&self) -> f32 {
        equivalent_radius(self.size)
    }
}

/// Radius (in cells) of the circle with the same area as `cells`
pub fn equivalent_radius(cells: usize) -> f32 {
    (cells as f32 / PI).sqrt()
}

pub struct BlobExtractor {
    /// Smallest equivalent radius (cells) kept, inclusive
    pub min_radius: f32,
    /// Largest equivalent radius (cells) kept, inclusive
    pub max_radius: f32,
    /// Minimum density for a cell to count as occupied, inclusive
    pub threshold: f32,
}

impl BlobExtractor {
    pub fn new(min_radius: f32, max_radius: f32, threshold: f32) -> Self {
        BlobExtractor {
            min_radius,
            max_radius,
            threshold,
        }
    }

    pub fn extract(&self, grid: &PresenceGrid) -> Vec<Blob> {
        let densities = grid.densities();
        let occupied = densities.mapv(|d| d >= self.threshold);
        let mut visited = Array2::from_elem(occupied.dim(), false);

        let mut blobs = Vec::new();
        let mut rejected = 0;
        for ((row, column), &is_occupied) in occupied.indexed_iter() {
            if !is_occupied || visited[[row, column]] {
                continue;
            }
            let cells = flood_fill(&occupied, &mut visited, (row, column));
            let radius = equivalent_radius(cells.len());
            if radius < self.min_radius || radius > self.max_radius {
                rejected += 1;
                continue;
            }
            let centres: Vec<Point2D> = cells
                .iter()
                .map(|(r, c)| (*c as f32 + 0.5, *r as f32 + 0.5))
                .collect();
            if let Some(centroid) = centroid(&centres) {
                blobs.push(Blob {
                    label: blobs.len(),
                    centroid,
                    size: cells.len(),
                });
            }
        }
        debug!("Found {} blobs, rejected {} by size", blobs.len(), rejected);
        blobs
    }
}

/// All cells 8-connected to `start`, as (row, column)
fn flood_fill(
    occupied: &Array2<bool>,
    visited: &mut Array2<bool>,
    start: (usize, usize),
) -> Vec<(usize, usize)> {
    let (rows, columns) = occupied.dim();
    let mut cells = Vec::new();
    let mut stack = vec![start];
    visited[start] = true;

    while let Some((row, column)) = stack.pop() {
        cells.push((row, column));
        for r in row.saturating_sub(1)..(row + 2).min(rows) {
            for c in column.saturating_sub(1)..(column + 2).min(columns) {
                if occupied[[r, c]] && !visited[[r, c]] {
                    visited[[r, c]] = true;
                    stack.push((r, c));
                }
            }
        }
    }
    cells
}
