use std::{fmt, rc::Rc, str::FromStr};

use log::{error, info};
use rand::{Rng, seq::IndexedRandom};
use serde::{Deserialize, Serialize};

use crate::{
    Position,
    agent::{ActionSpace, Dynamics},
    map::{Grid, GridError},
};

/// Represents the static type of a cell on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Cell {
    #[default]
    Empty,
    Start,
    Goal,
    Wall,
    PowerPosition,
    /// Behaves as if standing on the power position.
    GotoPowerPosition,
    /// Behaves as if standing on the start position.
    Restart,
}

impl Cell {
    /// Two-letter map code for this cell.
    pub const fn code(self) -> &'static str {
        match self {
            Cell::Empty => "..",
            Cell::Start => "ST",
            Cell::Goal => "GL",
            Cell::Wall => "WL",
            Cell::PowerPosition => "PP",
            Cell::GotoPowerPosition => "GP",
            Cell::Restart => "RS",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            ".." => Cell::Empty,
            "ST" => Cell::Start,
            "GL" => Cell::Goal,
            "WL" => Cell::Wall,
            "PP" => Cell::PowerPosition,
            "GP" => Cell::GotoPowerPosition,
            "RS" => Cell::Restart,
            _ => return None,
        })
    }
}

/// Represents the moves available on the board.
///
/// Rows grow downward: `Up` decreases the row, `Left` decreases the column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Up,
    Down,
    Left,
    Right,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Up, Action::Down, Action::Left, Action::Right];

    /// Neighbour scan order of [`Environment::legal_actions`].
    const SCAN_ORDER: [Action; 4] = [Action::Down, Action::Up, Action::Right, Action::Left];

    /// Unit `(row, column)` delta of the move.
    pub const fn delta(self) -> (i32, i32) {
        match self {
            Action::Up => (-1, 0),
            Action::Down => (1, 0),
            Action::Left => (0, -1),
            Action::Right => (0, 1),
        }
    }

    /// The position reached by applying this move to `position`, ignoring the board.
    pub const fn apply(self, position: Position) -> Position {
        let (dx, dy) = self.delta();
        position.offset(dx, dy)
    }

    /// Converts a move between two adjacent positions into an Action
    pub fn between(from: Position, to: Position) -> Option<Action> {
        Action::ALL
            .into_iter()
            .find(|action| action.apply(from) == to)
    }
}

impl ActionSpace for Action {
    const ALL: &'static [Self] = &Action::ALL;
}

/// Errors raised while building or querying an [`Environment`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvironmentError {
    #[error("Exactly one {cell:?} cell required, found {count}")]
    TileCount { cell: Cell, count: usize },
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("Unknown map code '{code}' at row {row}, column {col}")]
    UnknownCode { code: String, row: usize, col: usize },
    #[error("{action:?} is not a legal action from {position}")]
    IllegalMove { position: Position, action: Action },
}

/// An immutable board of typed cells.
///
/// Always holds exactly one start, one power position and one goal. Transformations
/// such as [`Environment::swap_cells`] return a new, re-validated environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    cells: Grid<Cell>,
    start: Position,
    power: Position,
    goal: Position,
}

impl Environment {
    /// Builds an environment from rows of cells.
    pub fn new(rows: Vec<Vec<Cell>>) -> Result<Self, EnvironmentError> {
        Self::from_grid(Grid::from_rows(rows)?)
    }

    /// Validates a grid and derives the start, power and goal positions.
    pub fn from_grid(cells: Grid<Cell>) -> Result<Self, EnvironmentError> {
        let start = Self::unique_cell(&cells, Cell::Start)?;
        let power = Self::unique_cell(&cells, Cell::PowerPosition)?;
        let goal = Self::unique_cell(&cells, Cell::Goal)?;
        Ok(Environment {
            cells,
            start,
            power,
            goal,
        })
    }

    fn unique_cell(cells: &Grid<Cell>, kind: Cell) -> Result<Position, EnvironmentError> {
        let found: Vec<Position> = cells
            .enumerate()
            .filter(|(_, cell)| **cell == kind)
            .map(|(position, _)| position)
            .collect();
        match found.as_slice() {
            [position] => Ok(*position),
            _ => Err(EnvironmentError::TileCount {
                cell: kind,
                count: found.len(),
            }),
        }
    }

    /// The 8x8 board the learner is demonstrated on.
    pub fn default_board() -> Result<Self, EnvironmentError> {
        const WALLS: [(i32, i32); 16] = [
            (0, 2),
            (1, 2),
            (2, 2),
            (3, 2),
            (5, 2),
            (5, 1),
            (1, 4),
            (1, 5),
            (3, 4),
            (3, 5),
            (3, 6),
            (4, 4),
            (5, 4),
            (6, 4),
            (6, 6),
            (6, 7),
        ];
        let cells = Grid::from_generator(8, 8, |position| match (position.x, position.y) {
            (7, 0) => Cell::Start,
            (3, 7) => Cell::PowerPosition,
            (1, 6) => Cell::Goal,
            (4, 0) | (4, 6) => Cell::Restart,
            (2, 1) | (1, 3) | (7, 7) => Cell::GotoPowerPosition,
            coords if WALLS.contains(&coords) => Cell::Wall,
            _ => Cell::Empty,
        });
        Self::from_grid(cells)
    }

    /// Returns `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        self.cells.shape()
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn power(&self) -> Position {
        self.power
    }

    pub fn goal(&self) -> Position {
        self.goal
    }

    pub fn cells(&self) -> &Grid<Cell> {
        &self.cells
    }

    /// The cell at `position`, `None` if off the board.
    pub fn cell(&self, position: Position) -> Option<Cell> {
        self.cells.get(position).copied()
    }

    /// Where moves from `position` are computed from, after teleporting.
    pub fn effective_position(&self, position: Position) -> Position {
        match self.cell(position) {
            Some(Cell::GotoPowerPosition) => self.power,
            Some(Cell::Restart) => self.start,
            _ => position,
        }
    }

    /// Returns the actions possible at a position.
    ///
    /// Teleport cells report the actions of their target. Neighbours are scanned
    /// Down, Up, Right, Left; a move is kept if it stays on the board and does not
    /// enter a wall.
    pub fn legal_actions(&self, position: Position) -> Vec<Action> {
        let origin = self.effective_position(position);
        Action::SCAN_ORDER
            .into_iter()
            .filter(|action| {
                matches!(self.cell(action.apply(origin)), Some(cell) if cell != Cell::Wall)
            })
            .collect()
    }

    /// The position reached by taking `action` from `position`, teleports included.
    ///
    /// Fails with [`EnvironmentError::IllegalMove`] unless `action` is one of
    /// [`Environment::legal_actions`] for `position`.
    pub fn next_position(
        &self,
        position: Position,
        action: Action,
    ) -> Result<Position, EnvironmentError> {
        if !self.legal_actions(position).contains(&action) {
            return Err(EnvironmentError::IllegalMove { position, action });
        }
        Ok(action.apply(self.effective_position(position)))
    }

    /// Returns a new environment with the cells at `a` and `b` exchanged.
    pub fn swap_cells(&self, a: Position, b: Position) -> Result<Self, EnvironmentError> {
        Self::from_grid(self.cells.swapped(a, b)?)
    }

    /// Negative manhattan distance from `position` to the goal.
    pub fn distance_reward(&self, position: Position) -> f64 {
        -f64::from(position.manhattan_distance(&self.goal))
    }

    /// Empty cells accepted by `eligible`, in row-major order.
    pub fn goal_candidates<F>(&self, eligible: F) -> Vec<Position>
    where
        F: Fn(Position) -> bool,
    {
        self.cells
            .enumerate()
            .filter(|(position, cell)| **cell == Cell::Empty && eligible(*position))
            .map(|(position, _)| position)
            .collect()
    }

    /// Moves the goal to a random candidate cell.
    ///
    /// Returns `Ok(None)` when no candidate exists.
    pub fn relocate_goal<R, F>(
        &self,
        rng: &mut R,
        eligible: F,
    ) -> Result<Option<Self>, EnvironmentError>
    where
        R: Rng + ?Sized,
        F: Fn(Position) -> bool,
    {
        let candidates = self.goal_candidates(eligible);
        let Some(&target) = candidates.choose(rng) else {
            return Ok(None);
        };
        info!("Relocating goal from {} to {}", self.goal, target);
        self.swap_cells(self.goal, target).map(Some)
    }

    /// The top three rows of the rightmost three columns.
    pub fn corner_region(&self) -> impl Fn(Position) -> bool + 'static {
        let cols = i32::try_from(self.shape().1).unwrap_or(i32::MAX);
        move |position| position.x < 3 && position.y >= cols - 3
    }
}

/// Parses a whitespace-separated map, one row per line and one code per cell.
impl FromStr for Environment {
    type Err = EnvironmentError;

    fn from_str(map: &str) -> Result<Self, Self::Err> {
        let rows = map
            .trim()
            .lines()
            .enumerate()
            .map(|(row, line)| {
                line.split_whitespace()
                    .enumerate()
                    .map(|(col, code)| {
                        Cell::from_code(code).ok_or_else(|| EnvironmentError::UnknownCode {
                            code: code.to_string(),
                            row,
                            col,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Environment::new(rows)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.cells.row_slices() {
            let codes: Vec<&str> = row.iter().map(|cell| cell.code()).collect();
            writeln!(f, "{}", codes.join(" "))?;
        }
        Ok(())
    }
}

/// Binds an environment to an agent: legal actions, checked moves and the distance reward.
#[derive(Debug, Clone)]
pub struct GridDynamics {
    environment: Rc<Environment>,
}

impl GridDynamics {
    pub fn new(environment: Rc<Environment>) -> Self {
        Self { environment }
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }
}

impl Dynamics<Position, Action> for GridDynamics {
    fn possible_actions(&self, state: &Position) -> Vec<Action> {
        self.environment.legal_actions(*state)
    }

    fn next_state(&self, state: &Position, action: Action) -> Position {
        match self.environment.next_position(*state, action) {
            Ok(next) => next,
            Err(err) => {
                // Unreachable through the agent, which only takes possible actions.
                error!("{err}; staying at {state}");
                *state
            }
        }
    }

    fn reward(&self, state: &Position) -> f64 {
        self.environment.distance_reward(*state)
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    const SMALL: &str = "
        ST GL
        PP ..
    ";

    fn small() -> Environment {
        SMALL.parse().unwrap()
    }

    #[test]
    fn derives_special_cells() {
        let env = small();
        assert_eq!(env.shape(), (2, 2));
        assert_eq!(env.start(), Position::new(0, 0));
        assert_eq!(env.goal(), Position::new(0, 1));
        assert_eq!(env.power(), Position::new(1, 0));
    }

    #[test]
    fn requires_exactly_one_of_each_special_cell() {
        let missing_goal = "ST ..\nPP ..".parse::<Environment>();
        assert_eq!(
            missing_goal,
            Err(EnvironmentError::TileCount {
                cell: Cell::Goal,
                count: 0
            })
        );

        let two_starts = Environment::new(vec![
            vec![Cell::Start, Cell::Goal],
            vec![Cell::PowerPosition, Cell::Start],
        ]);
        assert_eq!(
            two_starts,
            Err(EnvironmentError::TileCount {
                cell: Cell::Start,
                count: 2
            })
        );

        let missing_start = ".. GL\nPP ..".parse::<Environment>();
        assert_eq!(
            missing_start,
            Err(EnvironmentError::TileCount {
                cell: Cell::Start,
                count: 0
            })
        );

        let missing_power = "ST GL\n.. WL".parse::<Environment>();
        assert_eq!(
            missing_power,
            Err(EnvironmentError::TileCount {
                cell: Cell::PowerPosition,
                count: 0
            })
        );

        let two_powers = "ST GL PP\nPP WL RS".parse::<Environment>();
        assert!(matches!(
            two_powers,
            Err(EnvironmentError::TileCount {
                cell: Cell::PowerPosition,
                count: 2
            })
        ));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            "ST GL\nPP XX".parse::<Environment>(),
            Err(EnvironmentError::UnknownCode { row: 1, col: 1, .. })
        ));
        assert_eq!(
            "ST GL PP\n.. ..".parse::<Environment>(),
            Err(EnvironmentError::Grid(GridError::Ragged {
                row: 1,
                expected: 3,
                found: 2
            }))
        );
    }

    #[test]
    fn action_space_lists_every_action() {
        let all: &'static [Action] = <Action as ActionSpace>::ALL;
        assert_eq!(all, &Action::ALL);
        assert!(Action::SCAN_ORDER.iter().all(|action| all.contains(action)));
    }

    #[test]
    fn legal_actions_scan_down_up_right_left() {
        let env: Environment = "
            .. .. ..
            .. ST ..
            PP .. GL
        "
        .parse()
        .unwrap();
        assert_eq!(
            env.legal_actions(Position::new(1, 1)),
            vec![Action::Down, Action::Up, Action::Right, Action::Left]
        );
        assert_eq!(
            small().legal_actions(Position::new(0, 0)),
            vec![Action::Down, Action::Right]
        );
    }

    #[test]
    fn legal_actions_skip_walls_and_edges() {
        let env: Environment = "
            ST WL GL
            .. .. WL
            PP .. ..
        "
        .parse()
        .unwrap();
        assert_eq!(env.legal_actions(Position::new(0, 0)), vec![Action::Down]);
        assert_eq!(env.legal_actions(Position::new(0, 2)), Vec::<Action>::new());
        for (position, cell) in env.cells().enumerate() {
            if *cell == Cell::Wall {
                continue;
            }
            for action in env.legal_actions(position) {
                let next = env.next_position(position, action).unwrap();
                assert!(env.cells().contains(next), "{next} in bounds");
                assert_ne!(env.cell(next), Some(Cell::Wall), "{next} not a wall");
            }
        }
    }

    #[test]
    fn teleport_cells_act_like_their_target() {
        let env = Environment::default_board().unwrap();
        for (position, cell) in env.cells().enumerate() {
            let target = match cell {
                Cell::GotoPowerPosition => env.power(),
                Cell::Restart => env.start(),
                _ => continue,
            };
            assert_eq!(env.legal_actions(position), env.legal_actions(target));
            for action in env.legal_actions(position) {
                assert_eq!(
                    env.next_position(position, action),
                    env.next_position(target, action)
                );
            }
        }

        // (7, 7) teleports to the power position at (3, 7).
        assert_eq!(
            env.next_position(Position::new(7, 7), Action::Up),
            Ok(Position::new(2, 7))
        );
    }

    #[test]
    fn next_position_rejects_illegal_moves() {
        let env = small();
        assert_eq!(
            env.next_position(Position::new(0, 0), Action::Up),
            Err(EnvironmentError::IllegalMove {
                position: Position::new(0, 0),
                action: Action::Up
            })
        );
        assert_eq!(
            env.next_position(Position::new(0, 0), Action::Right),
            Ok(Position::new(0, 1))
        );
    }

    #[test]
    fn queries_are_pure() {
        let env = Environment::default_board().unwrap();
        let position = Position::new(2, 1);
        assert_eq!(env.legal_actions(position), env.legal_actions(position));
        assert_eq!(
            env.next_position(position, Action::Down),
            env.next_position(position, Action::Down)
        );
    }

    #[test]
    fn swap_cells_moves_goal_and_revalidates() {
        let env = small();
        let moved = env.swap_cells(env.goal(), Position::new(1, 1)).unwrap();
        assert_eq!(moved.goal(), Position::new(1, 1));
        assert_eq!(moved.cell(Position::new(0, 1)), Some(Cell::Empty));
        assert_eq!(moved.start(), env.start());
        assert_eq!(env.goal(), Position::new(0, 1), "original unmodified");

        assert!(matches!(
            env.swap_cells(env.goal(), Position::new(4, 4)),
            Err(EnvironmentError::Grid(GridError::OutOfBounds { .. }))
        ));
    }

    #[test]
    fn default_board_layout() {
        let env = Environment::default_board().unwrap();
        assert_eq!(env.shape(), (8, 8));
        assert_eq!(env.start(), Position::new(7, 0));
        assert_eq!(env.power(), Position::new(3, 7));
        assert_eq!(env.goal(), Position::new(1, 6));
        assert_eq!(env.cells().iter().filter(|c| **c == Cell::Wall).count(), 16);

        let reparsed: Environment = env.to_string().parse().unwrap();
        assert_eq!(reparsed, env);

        let shipped: Environment = include_str!("../../maps/map01.txt").parse().unwrap();
        assert_eq!(shipped, env, "maps/map01.txt is the default board");
    }

    #[test]
    fn relocate_goal_within_corner() {
        let env = Environment::default_board().unwrap();
        let region = env.corner_region();
        let candidates = env.goal_candidates(&region);
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|p| p.x < 3 && p.y >= 5));

        let mut rng = StdRng::seed_from_u64(7);
        let moved = env.relocate_goal(&mut rng, &region).unwrap().unwrap();
        assert!(candidates.contains(&moved.goal()));
        assert_eq!(moved.cell(env.goal()), Some(Cell::Empty));

        assert_eq!(env.relocate_goal(&mut rng, |_| false), Ok(None));
    }

    #[test]
    fn distance_reward_and_action_between() {
        let env = small();
        assert_eq!(env.distance_reward(Position::new(0, 0)), -1.0);
        assert_eq!(env.distance_reward(Position::new(1, 0)), -2.0);
        assert_eq!(env.distance_reward(env.goal()), 0.0);
        assert_eq!(
            Action::between(Position::new(3, 3), Position::new(2, 3)),
            Some(Action::Up)
        );
        assert_eq!(
            Action::between(Position::new(3, 3), Position::new(3, 5)),
            None
        );
    }

    #[test]
    fn distance_reward_handles_extreme_positions() {
        let env = small();
        let far = Position::new(i32::MIN, i32::MIN);
        assert_eq!(env.distance_reward(far), -f64::from(u32::MAX));
    }

    #[test]
    fn corner_region_on_narrow_board() {
        let env = small();
        let region = env.corner_region();
        assert!(region(Position::new(0, 0)), "fewer than three columns: all eligible");
        assert!(region(Position::new(2, 1)));
        assert!(!region(Position::new(3, 0)), "only the top three rows");
        assert_eq!(env.goal_candidates(&region), vec![Position::new(1, 1)]);
    }

    #[test]
    fn grid_dynamics_stays_put_on_illegal_move() {
        let dynamics = GridDynamics::new(Rc::new(small()));
        let origin = Position::new(0, 0);
        assert_eq!(dynamics.next_state(&origin, Action::Left), origin);
        assert_eq!(dynamics.next_state(&origin, Action::Down), Position::new(1, 0));
        assert_eq!(dynamics.reward(&origin), -1.0);
    }
}
