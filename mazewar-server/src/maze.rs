//! The shared maze grid.
//!
//! One mutex serializes every read and write of the cell array, which keeps
//! the occupancy invariant (at most one avatar per cell) trivially intact.
//! All operations are synchronous and short, so the lock is never held
//! across an await point.

use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;

/// Cell value of an unoccupied corridor.
pub const EMPTY: u8 = b' ';

/// Reported for lateral view cells that fall outside the grid.
pub const OUT_OF_BOUNDS: u8 = b'*';

/// Maximum number of corridor rows in a first person view.
pub const VIEW_DEPTH: usize = 6;

/// One view row: left wall, corridor, right wall.
pub type ViewRow = [u8; 3];

/// Index of the left wall cell in a [`ViewRow`].
pub const LEFT_WALL: usize = 0;
/// Index of the corridor cell in a [`ViewRow`].
pub const CORRIDOR: usize = 1;
/// Index of the right wall cell in a [`ViewRow`].
pub const RIGHT_WALL: usize = 2;

/// True for the avatar letters `A..=Z`.
pub fn is_avatar(cell: u8) -> bool {
    cell.is_ascii_uppercase()
}

/// True for an unoccupied corridor cell.
pub fn is_empty(cell: u8) -> bool {
    cell == EMPTY
}

/// A facing in the maze. The discriminants matter: turning left adds one,
/// turning right adds three, reversing adds two, all modulo four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    North = 0,
    West = 1,
    South = 2,
    East = 3,
}

impl Direction {
    fn from_index(index: u8) -> Direction {
        match index % 4 {
            0 => Direction::North,
            1 => Direction::West,
            2 => Direction::South,
            _ => Direction::East,
        }
    }

    pub fn left(self) -> Direction {
        Direction::from_index(self as u8 + 1)
    }

    pub fn right(self) -> Direction {
        Direction::from_index(self as u8 + 3)
    }

    pub fn reverse(self) -> Direction {
        Direction::from_index(self as u8 + 2)
    }

    /// Row and column deltas of one step in this direction.
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::North => (-1, 0),
            Direction::West => (0, -1),
            Direction::South => (1, 0),
            Direction::East => (0, 1),
        }
    }
}

/// Rejected or impossible grid mutations. These are expected domain
/// failures: callers swallow them and the client simply observes that
/// nothing happened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MazeError {
    /// The target cell is out of bounds or not empty.
    #[error("cell is occupied or out of bounds")]
    Occupied,
    /// The adjacent cell is out of bounds or not empty.
    #[error("move is blocked")]
    Blocked,
    /// Random placement found no empty cell within the attempt bound.
    #[error("no free cell found")]
    Full,
}

/// A non-rectangular or empty maze template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("maze template has no rows")]
    Empty,
    #[error("maze template row {row} has {len} columns, expected {expected}")]
    Ragged { row: usize, len: usize, expected: usize },
}

/// The maze. Dimensions are fixed at construction, the cells live behind
/// one mutex.
#[derive(Debug)]
pub struct Maze {
    rows: i32,
    cols: i32,
    cells: Mutex<Vec<u8>>,
}

impl Maze {
    /// Parses a rectangular template. Template bytes other than avatars are
    /// carried through to views verbatim, so walls and decorations may be
    /// any byte.
    pub fn new<S: AsRef<str>>(template: &[S]) -> Result<Maze, TemplateError> {
        let first = template.first().ok_or(TemplateError::Empty)?;
        let cols = first.as_ref().len();
        if cols == 0 {
            return Err(TemplateError::Empty);
        }

        let mut cells = Vec::with_capacity(template.len() * cols);
        for (row, line) in template.iter().enumerate() {
            let line = line.as_ref();
            if line.len() != cols {
                return Err(TemplateError::Ragged {
                    row,
                    len: line.len(),
                    expected: cols,
                });
            }
            cells.extend_from_slice(line.as_bytes());
        }

        Ok(Maze {
            rows: template.len() as i32,
            cols: cols as i32,
            cells: Mutex::new(cells),
        })
    }

    /// Grid dimensions, immutable after construction.
    pub fn dims(&self) -> (i32, i32) {
        (self.rows, self.cols)
    }

    fn in_bounds(&self, row: i32, col: i32) -> bool {
        row >= 0 && row < self.rows && col >= 0 && col < self.cols
    }

    fn index(&self, row: i32, col: i32) -> usize {
        (row * self.cols + col) as usize
    }

    /// The cell value at a position, if it is in bounds.
    pub fn cell(&self, row: i32, col: i32) -> Option<u8> {
        if !self.in_bounds(row, col) {
            return None;
        }
        Some(self.cells.lock()[self.index(row, col)])
    }

    /// Puts `avatar` into an empty in-bounds cell.
    pub fn place(&self, avatar: u8, row: i32, col: i32) -> Result<(), MazeError> {
        let mut cells = self.cells.lock();
        if !self.in_bounds(row, col) || !is_empty(cells[self.index(row, col)]) {
            return Err(MazeError::Occupied);
        }
        cells[self.index(row, col)] = avatar;
        Ok(())
    }

    /// Samples cells uniformly at random until an empty one takes the
    /// avatar. Gives up after 1000 attempts, which the caller may treat as
    /// a soft failure and leave the player unplaced.
    pub fn place_random(&self, avatar: u8) -> Result<(i32, i32), MazeError> {
        const MAX_ATTEMPTS: usize = 1000;

        let mut rng = rand::thread_rng();
        let mut cells = self.cells.lock();
        for _ in 0..MAX_ATTEMPTS {
            let row = rng.gen_range(0..self.rows);
            let col = rng.gen_range(0..self.cols);
            let index = self.index(row, col);
            if is_empty(cells[index]) {
                cells[index] = avatar;
                return Ok((row, col));
            }
        }
        Err(MazeError::Full)
    }

    /// Clears the cell if it still holds `avatar`. A mismatch is a no-op,
    /// which makes the call resilient to races right after a hit.
    pub fn remove(&self, avatar: u8, row: i32, col: i32) {
        if !self.in_bounds(row, col) {
            return;
        }
        let mut cells = self.cells.lock();
        let index = self.index(row, col);
        if cells[index] == avatar {
            cells[index] = EMPTY;
        }
    }

    /// Moves the avatar at `(row, col)` one cell in `dir`, atomically. The
    /// source must hold an avatar and the destination must be an empty
    /// in-bounds cell.
    pub fn step(&self, row: i32, col: i32, dir: Direction) -> Result<(), MazeError> {
        let mut cells = self.cells.lock();
        if !self.in_bounds(row, col) || !is_avatar(cells[self.index(row, col)]) {
            return Err(MazeError::Blocked);
        }

        let (dr, dc) = dir.delta();
        let (new_row, new_col) = (row + dr, col + dc);
        if !self.in_bounds(new_row, new_col) || !is_empty(cells[self.index(new_row, new_col)]) {
            return Err(MazeError::Blocked);
        }

        cells[self.index(new_row, new_col)] = cells[self.index(row, col)];
        cells[self.index(row, col)] = EMPTY;
        Ok(())
    }

    /// Casts the laser ray from one step beyond `(row, col)` along `dir`.
    /// The first non-empty cell decides: an avatar is the target, anything
    /// else absorbs the beam. Leaving the grid is a miss.
    pub fn find_target(&self, row: i32, col: i32, dir: Direction) -> u8 {
        let (dr, dc) = dir.delta();
        let cells = self.cells.lock();

        let (mut row, mut col) = (row, col);
        loop {
            row += dr;
            col += dc;
            if !self.in_bounds(row, col) {
                return EMPTY;
            }
            let found = cells[self.index(row, col)];
            if !is_empty(found) {
                return if is_avatar(found) { found } else { EMPTY };
            }
        }
    }

    /// Computes the first person view from `(row, col)` along `gaze`, at
    /// most `depth` rows deep. The viewer's own cell is row zero. The walk
    /// stops when the corridor leaves the grid; lateral cells outside the
    /// grid are reported as [`OUT_OF_BOUNDS`].
    pub fn get_view(&self, row: i32, col: i32, gaze: Direction, depth: usize) -> Vec<ViewRow> {
        let (dr, dc) = gaze.delta();
        let (lr, lc) = gaze.left().delta();
        let (rr, rc) = gaze.right().delta();

        let cells = self.cells.lock();
        let side = |row: i32, col: i32| -> u8 {
            if self.in_bounds(row, col) {
                cells[self.index(row, col)]
            } else {
                OUT_OF_BOUNDS
            }
        };

        let mut view = Vec::with_capacity(depth);
        for d in 0..depth as i32 {
            let (pos_row, pos_col) = (row + dr * d, col + dc * d);
            if !self.in_bounds(pos_row, pos_col) {
                break;
            }
            view.push([
                side(pos_row + lr, pos_col + lc),
                cells[self.index(pos_row, pos_col)],
                side(pos_row + rr, pos_col + rc),
            ]);
        }
        view
    }

    /// A multi-line snapshot of the grid for debug logging.
    pub fn render(&self) -> String {
        let cells = self.cells.lock();
        let mut out = String::with_capacity((self.rows * (self.cols + 1)) as usize);
        for row in cells.chunks(self.cols as usize) {
            out.push_str(&String::from_utf8_lossy(row));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TEMPLATE;

    fn default_maze() -> Maze {
        Maze::new(&DEFAULT_TEMPLATE).unwrap()
    }

    #[test]
    fn turning_left_four_times_is_identity() {
        for dir in [
            Direction::North,
            Direction::West,
            Direction::South,
            Direction::East,
        ] {
            assert_eq!(dir.left().left().left().left(), dir);
            assert_eq!(dir.reverse().reverse(), dir);
            assert_eq!(dir.left().right(), dir);
        }
    }

    #[test]
    fn ragged_template_is_rejected() {
        let err = Maze::new(&["***", "**"]).unwrap_err();
        assert_eq!(
            err,
            TemplateError::Ragged {
                row: 1,
                len: 2,
                expected: 3
            }
        );
        assert_eq!(Maze::new::<&str>(&[]).unwrap_err(), TemplateError::Empty);
    }

    #[test]
    fn default_template_dimensions() {
        let maze = default_maze();
        assert_eq!(maze.dims(), (8, 30));
    }

    #[test]
    fn place_rejects_occupied_and_out_of_bounds_cells() {
        let maze = default_maze();
        assert_eq!(maze.place(b'A', 4, 12), Ok(()));
        assert_eq!(maze.place(b'B', 4, 12), Err(MazeError::Occupied));
        assert_eq!(maze.place(b'B', 0, 0), Err(MazeError::Occupied)); // wall
        assert_eq!(maze.place(b'B', -1, 0), Err(MazeError::Occupied));
        assert_eq!(maze.place(b'B', 8, 0), Err(MazeError::Occupied));
    }

    #[test]
    fn step_moves_avatar_into_empty_cell() {
        let maze = default_maze();
        maze.place(b'A', 4, 11).unwrap();
        assert_eq!(maze.step(4, 11, Direction::North), Ok(()));
        assert_eq!(maze.cell(3, 11), Some(b'A'));
        assert_eq!(maze.cell(4, 11), Some(EMPTY));
    }

    #[test]
    fn step_into_wall_is_blocked() {
        let maze = default_maze();
        // North of (6, 1) sits a '#' decoration.
        maze.place(b'B', 6, 1).unwrap();
        assert_eq!(maze.step(6, 1, Direction::North), Err(MazeError::Blocked));
        assert_eq!(maze.cell(6, 1), Some(b'B'));
    }

    #[test]
    fn step_from_empty_cell_is_blocked() {
        let maze = default_maze();
        assert_eq!(maze.step(4, 12, Direction::North), Err(MazeError::Blocked));
    }

    #[test]
    fn remove_only_clears_matching_avatar() {
        let maze = default_maze();
        maze.place(b'A', 4, 12).unwrap();
        maze.remove(b'B', 4, 12);
        assert_eq!(maze.cell(4, 12), Some(b'A'));
        maze.remove(b'A', 4, 12);
        assert_eq!(maze.cell(4, 12), Some(EMPTY));
        maze.remove(b'A', -5, 40); // out of bounds is a no-op
    }

    #[test]
    fn laser_finds_avatar_along_clear_row() {
        let maze = default_maze();
        maze.place(b'A', 4, 12).unwrap();
        maze.place(b'B', 4, 20).unwrap();
        assert_eq!(maze.find_target(4, 12, Direction::East), b'B');
    }

    #[test]
    fn laser_is_absorbed_by_walls() {
        let maze = Maze::new(&["     ", " A*B "]).unwrap();
        assert_eq!(maze.find_target(1, 1, Direction::East), EMPTY);
    }

    #[test]
    fn laser_leaving_the_grid_misses() {
        let maze = Maze::new(&["A    "]).unwrap();
        assert_eq!(maze.find_target(0, 0, Direction::East), EMPTY);
        assert_eq!(maze.find_target(0, 0, Direction::North), EMPTY);
    }

    #[test]
    fn view_matches_grid_cells() {
        let maze = default_maze();
        maze.place(b'A', 4, 12).unwrap();
        let view = maze.get_view(4, 12, Direction::North, VIEW_DEPTH);

        assert!(view.len() <= VIEW_DEPTH);
        for (d, row) in view.iter().enumerate() {
            let pos_row = 4 - d as i32;
            assert_eq!(row[CORRIDOR], maze.cell(pos_row, 12).unwrap());
            // Gazing north, left is west and right is east.
            assert_eq!(row[LEFT_WALL], maze.cell(pos_row, 11).unwrap());
            assert_eq!(row[RIGHT_WALL], maze.cell(pos_row, 12 + 1).unwrap());
        }
    }

    #[test]
    fn view_stops_at_the_grid_edge() {
        let maze = default_maze();
        // Gazing north from row 1 there are exactly two corridor rows.
        let view = maze.get_view(1, 1, Direction::North, VIEW_DEPTH);
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn lateral_out_of_bounds_is_starred() {
        let maze = Maze::new(&["   ", "   ", "   "]).unwrap();
        let view = maze.get_view(2, 0, Direction::North, VIEW_DEPTH);
        assert_eq!(view.len(), 3);
        for row in &view {
            // Gazing north from the west edge, the left wall is off grid.
            assert_eq!(row[LEFT_WALL], OUT_OF_BOUNDS);
            assert_eq!(row[CORRIDOR], EMPTY);
        }
    }

    #[test]
    fn own_cell_is_depth_zero() {
        let maze = default_maze();
        maze.place(b'A', 4, 12).unwrap();
        let view = maze.get_view(4, 12, Direction::North, VIEW_DEPTH);
        assert_eq!(view[0][CORRIDOR], b'A');
    }

    #[test]
    fn random_placement_lands_on_an_empty_cell() {
        let maze = default_maze();
        let (row, col) = maze.place_random(b'Z').unwrap();
        assert_eq!(maze.cell(row, col), Some(b'Z'));
    }

    #[test]
    fn random_placement_on_full_grid_reports_full() {
        let maze = Maze::new(&["**", "**"]).unwrap();
        assert_eq!(maze.place_random(b'A'), Err(MazeError::Full));
    }
}
