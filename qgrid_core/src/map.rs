use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::Position;

/// Represents errors that can occur within the grid operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error("{position} is out of bounds for grid shape ({rows}, {cols})")]
    OutOfBounds {
        position: Position,
        rows: usize,
        cols: usize,
    },
    #[error("Grid has no cells")]
    Empty,
    #[error("Row {row} has {found} cells, expected {expected}")]
    Ragged {
        row: usize,
        expected: usize,
        found: usize,
    },
}

/// Positions past `i32::MAX` are never in bounds, so saturating keeps them out.
fn coordinate(index: usize) -> i32 {
    i32::try_from(index).unwrap_or(i32::MAX)
}

/// A generic, rectangular 2D grid.
///
/// Stores elements of type `T` in a flat vector using row-major order and is
/// addressed by [`Position`], where `x` is the row and `y` the column.
/// A grid is never resized or edited in place; derived grids are built as new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid<T> {
    rows: usize,
    cols: usize,
    cells: Vec<T>,
}

impl<T> Grid<T> {
    /// Builds a grid from nested rows.
    ///
    /// Fails if there are no cells or if the rows differ in length.
    pub fn from_rows(rows: Vec<Vec<T>>) -> Result<Self, GridError> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        if cols == 0 {
            return Err(GridError::Empty);
        }
        let height = rows.len();
        let mut cells = Vec::with_capacity(height * cols);
        for (row, values) in rows.into_iter().enumerate() {
            if values.len() != cols {
                return Err(GridError::Ragged {
                    row,
                    expected: cols,
                    found: values.len(),
                });
            }
            cells.extend(values);
        }
        Ok(Grid {
            rows: height,
            cols,
            cells,
        })
    }

    /// Creates a new grid with the specified shape, filled by a generator function.
    ///
    /// The generator is called once per cell in row-major order.
    pub fn from_generator<F>(rows: usize, cols: usize, mut f: F) -> Self
    where
        F: FnMut(Position) -> T,
    {
        let mut cells = Vec::with_capacity(rows * cols);
        for x in 0..rows {
            for y in 0..cols {
                cells.push(f(Position::new(coordinate(x), coordinate(y))));
            }
        }
        Grid { rows, cols, cells }
    }

    /// Returns `(rows, cols)`.
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Converts a position to a flat vector index.
    ///
    /// Returns `None` if the position is out of bounds.
    #[inline]
    fn index_of(&self, position: Position) -> Option<usize> {
        let x = usize::try_from(position.x).ok()?;
        let y = usize::try_from(position.y).ok()?;
        (x < self.rows && y < self.cols).then(|| x * self.cols + y)
    }

    /// Converts a flat vector index back to a position.
    #[inline]
    fn position_of(&self, index: usize) -> Position {
        Position::new(coordinate(index / self.cols), coordinate(index % self.cols))
    }

    /// Checks if the position is within `[0, rows) x [0, cols)`.
    #[inline]
    pub fn contains(&self, position: Position) -> bool {
        self.index_of(position).is_some()
    }

    /// Gets a reference to the cell at the given position, `None` if out of bounds.
    pub fn get(&self, position: Position) -> Option<&T> {
        self.index_of(position).map(|index| &self.cells[index])
    }

    fn checked_index(&self, position: Position) -> Result<usize, GridError> {
        self.index_of(position).ok_or(GridError::OutOfBounds {
            position,
            rows: self.rows,
            cols: self.cols,
        })
    }

    /// Returns a new grid with the cells at `a` and `b` exchanged.
    pub fn swapped(&self, a: Position, b: Position) -> Result<Self, GridError>
    where
        T: Clone,
    {
        let a_index = self.checked_index(a)?;
        let b_index = self.checked_index(b)?;
        Ok(Grid::from_generator(self.rows, self.cols, |position| {
            let index = position.x as usize * self.cols + position.y as usize;
            let source = match index {
                i if i == a_index => b_index,
                i if i == b_index => a_index,
                i => i,
            };
            self.cells[source].clone()
        }))
    }

    /// Returns an iterator over the cells of the grid in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.cells.iter()
    }

    /// Returns an iterator that yields `(position, &T)` for each cell.
    pub fn enumerate(&self) -> impl Iterator<Item = (Position, &T)> {
        self.cells
            .iter()
            .enumerate()
            .map(move |(index, cell)| (self.position_of(index), cell))
    }

    /// Returns an iterator over the rows as slices.
    pub fn row_slices(&self) -> impl Iterator<Item = &[T]> {
        self.cells.chunks(self.cols)
    }
}

/// Indexing using Position coordinates for access
impl<T> Index<Position> for Grid<T> {
    type Output = T;

    #[inline]
    fn index(&self, position: Position) -> &Self::Output {
        match self.index_of(position) {
            Some(idx) => &self.cells[idx],
            None => panic!(
                "Grid index {} out of bounds for grid shape ({}, {})",
                position, self.rows, self.cols
            ),
        }
    }
}
