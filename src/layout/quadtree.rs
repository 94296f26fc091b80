use std::ops::Range;

use emath::{Vec2, vec2};

use super::forces::repulsion_between;

const LEAF_CAPACITY: usize = 8;
const MAX_DEPTH: usize = 12;

#[derive(Clone, Copy, Debug)]
struct Square {
    min: Vec2,
    side: f32,
}

impl Square {
    fn enclosing(points: &[Vec2]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let (mut low, mut high) = (*first, *first);
        for point in rest {
            low = vec2(low.x.min(point.x), low.y.min(point.y));
            high = vec2(high.x.max(point.x), high.y.max(point.y));
        }
        if !low.is_finite() || !high.is_finite() {
            return None;
        }

        let side = (high.x - low.x).max(high.y - low.y).max(1.0);
        Some(Self {
            min: low - vec2(0.5, 0.5),
            side: side + 1.0,
        })
    }

    fn contains(self, point: Vec2) -> bool {
        let local = point - self.min;
        (0.0..=self.side).contains(&local.x) && (0.0..=self.side).contains(&local.y)
    }

    /// Bit 0 is the right half, bit 1 the lower half.
    fn quadrant_of(self, point: Vec2) -> usize {
        let half = self.side * 0.5;
        let right = point.x >= self.min.x + half;
        let lower = point.y >= self.min.y + half;
        usize::from(right) | (usize::from(lower) << 1)
    }

    fn quadrant(self, quadrant: usize) -> Self {
        let half = self.side * 0.5;
        let dx = if quadrant & 1 == 1 { half } else { 0.0 };
        let dy = if quadrant & 2 == 2 { half } else { 0.0 };
        Self {
            min: self.min + vec2(dx, dy),
            side: half,
        }
    }
}

#[derive(Debug)]
struct Cell {
    square: Square,
    mass: f32,
    centroid: Vec2,
    /// Index of the first of four consecutive child cells.
    children: Option<usize>,
    /// Run of `MassTree::order` holding the bodies inside this cell.
    bodies: Range<usize>,
}

/// Flat Barnes–Hut tree over body positions. Bodies are reordered so that
/// every cell covers one contiguous run of `order`.
pub(super) struct MassTree {
    cells: Vec<Cell>,
    order: Vec<usize>,
}

impl MassTree {
    pub(super) fn build(positions: &[Vec2]) -> Option<Self> {
        let square = Square::enclosing(positions)?;
        let mut tree = Self {
            cells: Vec::with_capacity(positions.len() / 2 + 1),
            order: (0..positions.len()).collect(),
        };
        let root = tree.cell(square, 0..positions.len(), positions);
        tree.cells.push(root);
        tree.subdivide(0, positions, 0);
        Some(tree)
    }

    fn cell(&self, square: Square, bodies: Range<usize>, positions: &[Vec2]) -> Cell {
        let mass = bodies.len() as f32;
        let mut centroid = Vec2::ZERO;
        for &body in &self.order[bodies.clone()] {
            centroid += positions[body];
        }
        if mass > 0.0 {
            centroid /= mass;
        }
        Cell {
            square,
            mass,
            centroid,
            children: None,
            bodies,
        }
    }

    fn subdivide(&mut self, index: usize, positions: &[Vec2], depth: usize) {
        let square = self.cells[index].square;
        let bodies = self.cells[index].bodies.clone();
        // coincident bodies end here instead of splitting forever
        if bodies.len() <= LEAF_CAPACITY || depth >= MAX_DEPTH {
            return;
        }

        self.order[bodies.clone()].sort_by_key(|&body| square.quadrant_of(positions[body]));

        let first_child = self.cells.len();
        let mut start = bodies.start;
        for quadrant in 0..4 {
            let len = self.order[start..bodies.end]
                .iter()
                .take_while(|&&body| square.quadrant_of(positions[body]) == quadrant)
                .count();
            let child = self.cell(square.quadrant(quadrant), start..start + len, positions);
            self.cells.push(child);
            start += len;
        }
        self.cells[index].children = Some(first_child);

        for child in first_child..first_child + 4 {
            self.subdivide(child, positions, depth + 1);
        }
    }

    /// Repulsion on body `index` from all others. Cells that look smaller than
    /// `theta` from the body act as a single mass at their centroid.
    pub(super) fn repulsion_on(
        &self,
        index: usize,
        positions: &[Vec2],
        strength: f32,
        softening: f32,
        theta: f32,
    ) -> Vec2 {
        let point = positions[index];
        let mut force = Vec2::ZERO;
        let mut pending = vec![0];

        while let Some(id) = pending.pop() {
            let cell = &self.cells[id];
            if cell.mass == 0.0 {
                continue;
            }

            match cell.children {
                Some(first) => {
                    let distance = (point - cell.centroid).length();
                    if !cell.square.contains(point) && cell.square.side < theta * distance {
                        force += repulsion_between(point, cell.centroid, strength * cell.mass, softening);
                    } else {
                        pending.extend(first..first + 4);
                    }
                }
                None => {
                    for &other in &self.order[cell.bodies.clone()] {
                        if other != index {
                            force += repulsion_between(point, positions[other], strength, softening);
                        }
                    }
                }
            }
        }
        force
    }
}
