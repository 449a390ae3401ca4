//! Pure rules for the 3×3 grid: move legality, win/draw detection, and
//! the line-threat counting the server's heuristics are built on.
//!
//! This module is stateless and transport-agnostic — it knows nothing
//! about rooms, series, or serialization beyond deriving serde.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two player marks. X always starts round 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mark {
    X,
    O,
}

impl Mark {
    pub fn opponent(self) -> Mark {
        match self {
            Mark::X => Mark::O,
            Mark::O => Mark::X,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Mark::X => "X",
            Mark::O => "O",
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Terminal result of a board position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardVerdict {
    /// Three in a row; `line` holds the winning cell indices.
    Win { mark: Mark, line: [usize; 3] },
    /// All nine cells filled with no line.
    Draw,
}

/// The 3×3 grid, indexed 0..9 row-major.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Board {
    cells: [Option<Mark>; Board::CELLS],
}

impl Board {
    pub const CELLS: usize = 9;

    /// The eight winning lines: rows, columns, diagonals.
    pub const LINES: [[usize; 3]; 8] = [
        [0, 1, 2],
        [3, 4, 5],
        [6, 7, 8],
        [0, 3, 6],
        [1, 4, 7],
        [2, 5, 8],
        [0, 4, 8],
        [2, 4, 6],
    ];

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cell: usize) -> Option<Mark> {
        self.cells.get(cell).copied().flatten()
    }

    /// Place a mark. Returns false if the cell is out of range or occupied.
    pub fn place(&mut self, cell: usize, mark: Mark) -> bool {
        match self.cells.get_mut(cell) {
            Some(slot @ None) => {
                *slot = Some(mark);
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.cells = [None; Self::CELLS];
    }

    /// Number of marks placed so far.
    pub fn mark_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_full(&self) -> bool {
        self.mark_count() == Self::CELLS
    }

    /// Win/draw detection. `None` while the round is still open.
    pub fn verdict(&self) -> Option<BoardVerdict> {
        for line in Self::LINES {
            if let Some(mark) = self.get(line[0])
                && self.get(line[1]) == Some(mark)
                && self.get(line[2]) == Some(mark)
            {
                return Some(BoardVerdict::Win { mark, line });
            }
        }
        if self.is_full() {
            return Some(BoardVerdict::Draw);
        }
        None
    }

    /// Count open threats for `mark`: lines holding two of its marks and
    /// one empty cell. The heuristic tension/morale scores feed on this.
    pub fn threats_for(&self, mark: Mark) -> usize {
        Self::LINES
            .iter()
            .filter(|line| {
                let own = line.iter().filter(|&&c| self.get(c) == Some(mark)).count();
                let empty = line.iter().filter(|&&c| self.get(c).is_none()).count();
                own == 2 && empty == 1
            })
            .count()
    }
}

impl fmt::Display for Board {
    /// Render the grid as three `.XO`-style rows, used in inference prompts.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..3 {
            for col in 0..3 {
                match self.get(row * 3 + col) {
                    Some(mark) => f.write_str(mark.label())?,
                    None => f.write_str(".")?,
                }
            }
            if row < 2 {
                f.write_str("\n")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_with(x: &[usize], o: &[usize]) -> Board {
        let mut b = Board::new();
        for &c in x {
            assert!(b.place(c, Mark::X));
        }
        for &c in o {
            assert!(b.place(c, Mark::O));
        }
        b
    }

    #[test]
    fn detects_row_column_and_diagonal_wins() {
        let row = board_with(&[0, 1, 2], &[3, 4]);
        assert_eq!(
            row.verdict(),
            Some(BoardVerdict::Win {
                mark: Mark::X,
                line: [0, 1, 2]
            })
        );

        let col = board_with(&[0, 3], &[1, 4, 7]);
        assert_eq!(
            col.verdict(),
            Some(BoardVerdict::Win {
                mark: Mark::O,
                line: [1, 4, 7]
            })
        );

        let diag = board_with(&[0, 4, 8], &[1, 2]);
        assert_eq!(
            diag.verdict(),
            Some(BoardVerdict::Win {
                mark: Mark::X,
                line: [0, 4, 8]
            })
        );
    }

    #[test]
    fn full_board_without_line_is_a_draw() {
        // X: 0 8 7 2 3, O: 4 1 6 5 — no three in a row.
        let b = board_with(&[0, 8, 7, 2, 3], &[4, 1, 6, 5]);
        assert_eq!(b.verdict(), Some(BoardVerdict::Draw));
    }

    #[test]
    fn open_position_has_no_verdict() {
        let b = board_with(&[4], &[0]);
        assert_eq!(b.verdict(), None);
        assert!(!b.is_full());
    }

    #[test]
    fn placement_rejects_occupied_and_out_of_range() {
        let mut b = Board::new();
        assert!(b.place(4, Mark::X));
        assert!(!b.place(4, Mark::O));
        assert!(!b.place(9, Mark::O));
        assert_eq!(b.get(4), Some(Mark::X));
    }

    #[test]
    fn threat_counting() {
        // X on 0 and 1: one open threat on [0,1,2].
        let b = board_with(&[0, 1], &[4]);
        assert_eq!(b.threats_for(Mark::X), 1);
        assert_eq!(b.threats_for(Mark::O), 0);

        // A blocked line is not a threat.
        let blocked = board_with(&[0, 1], &[2]);
        assert_eq!(blocked.threats_for(Mark::X), 0);
    }

    #[test]
    fn display_renders_grid() {
        let b = board_with(&[4], &[0]);
        assert_eq!(b.to_string(), "O..\n.X.\n...");
    }
}
