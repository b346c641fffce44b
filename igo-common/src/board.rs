// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub fn opposite(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    fn short(self) -> char {
        match self {
            Color::White => 'w',
            Color::Black => 'b',
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::White => write!(f, "white"),
            Color::Black => write!(f, "black"),
        }
    }
}

/// Why a stone placement was refused. `NotYourTurn` is raised one level up,
/// by the game object, which is the only holder of the turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IllegalMove {
    OffBoard,
    Occupied,
    Suicide,
    Ko,
    NotYourTurn,
}

impl fmt::Display for IllegalMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IllegalMove::OffBoard => write!(f, "the point is off the board"),
            IllegalMove::Occupied => write!(f, "the point is already occupied"),
            IllegalMove::Suicide => write!(f, "the placement would be suicide"),
            IllegalMove::Ko => write!(f, "the placement repeats a prior position"),
            IllegalMove::NotYourTurn => write!(f, "it is not your turn"),
        }
    }
}

/// A maximal same-colour connected set of stones. Groups are always derived
/// from the grid on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub color: Color,
    pub points: BTreeSet<(usize, usize)>,
    pub liberties: BTreeSet<(usize, usize)>,
}

/// The result of a legal placement: the successor board and the points that
/// were captured from the opponent, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub board: Board,
    pub captured: Vec<(usize, usize)>,
}

// Zobrist keys must agree between independent server processes, so they are
// expanded from a fixed seed rather than drawn from process randomness.
const ZOBRIST_SEED: u64 = 0x8f14_e45f_ceea_167a;

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn zobrist_key(size: usize, color: Color, row: usize, col: usize) -> u128 {
    let color_tag: u64 = match color {
        Color::White => 1,
        Color::Black => 2,
    };
    let tag = ZOBRIST_SEED
        ^ ((size as u64) << 48)
        ^ (color_tag << 40)
        ^ ((row as u64) << 20)
        ^ (col as u64);
    let hi = splitmix64(tag);
    let lo = splitmix64(hi ^ tag);
    ((hi as u128) << 64) | (lo as u128)
}

/// A square grid of points. Equality is by point grid; the positional-superko
/// history compares 128-bit Zobrist hashes of boards instead of boards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    size: usize,
    points: Vec<Option<Color>>,
}

impl Board {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            points: vec![None; size * size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, row: usize, col: usize) -> Option<Color> {
        self.points[row * self.size + col]
    }

    pub(crate) fn set(&mut self, row: usize, col: usize, point: Option<Color>) {
        self.points[row * self.size + col] = point;
    }

    fn in_bounds(&self, row: usize, col: usize) -> bool {
        row < self.size && col < self.size
    }

    /// The up-to-four 4-connected in-bounds neighbours of a point.
    pub fn neighbors(&self, row: usize, col: usize) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(4);
        if row > 0 {
            out.push((row - 1, col));
        }
        if col > 0 {
            out.push((row, col - 1));
        }
        if row + 1 < self.size {
            out.push((row + 1, col));
        }
        if col + 1 < self.size {
            out.push((row, col + 1));
        }
        out
    }

    /// Flood-fill the group containing (row, col), or None for an empty point.
    pub fn group_at(&self, row: usize, col: usize) -> Option<Group> {
        let color = self.get(row, col)?;
        let mut points = BTreeSet::new();
        let mut liberties = BTreeSet::new();
        let mut stack = vec![(row, col)];
        points.insert((row, col));

        while let Some((r, c)) = stack.pop() {
            for (nr, nc) in self.neighbors(r, c) {
                match self.get(nr, nc) {
                    None => {
                        liberties.insert((nr, nc));
                    }
                    Some(other) if other == color => {
                        if points.insert((nr, nc)) {
                            stack.push((nr, nc));
                        }
                    }
                    Some(_) => {}
                }
            }
        }

        Some(Group {
            color,
            points,
            liberties,
        })
    }

    /// The enemy groups that would be left without liberties by provisionally
    /// placing a `color` stone at (row, col).
    pub fn captures_from(&self, color: Color, row: usize, col: usize) -> Vec<Group> {
        if !self.in_bounds(row, col) || self.get(row, col).is_some() {
            return Vec::new();
        }
        let mut provisional = self.clone();
        provisional.set(row, col, Some(color));

        let enemy = color.opposite();
        let mut seen: BTreeSet<(usize, usize)> = BTreeSet::new();
        let mut captures = Vec::new();
        for (nr, nc) in provisional.neighbors(row, col) {
            if provisional.get(nr, nc) != Some(enemy) || seen.contains(&(nr, nc)) {
                continue;
            }
            let group = provisional
                .group_at(nr, nc)
                .expect("neighbour was just checked to hold a stone");
            seen.extend(group.points.iter().copied());
            if group.liberties.is_empty() {
                captures.push(group);
            }
        }
        captures
    }

    /// Attempt a placement. Legality is checked in order: bounds, occupancy,
    /// enemy captures, suicide on the post-capture position, and positional
    /// superko against `history`. Captures resolve before the suicide check,
    /// which is what permits a throw-in that would otherwise be self-capture.
    pub fn place(
        &self,
        color: Color,
        row: usize,
        col: usize,
        history: &[u128],
    ) -> Result<Placement, IllegalMove> {
        if !self.in_bounds(row, col) {
            return Err(IllegalMove::OffBoard);
        }
        if self.get(row, col).is_some() {
            return Err(IllegalMove::Occupied);
        }

        let mut next = self.clone();
        next.set(row, col, Some(color));

        let mut captured = Vec::new();
        for group in self.captures_from(color, row, col) {
            for &(r, c) in &group.points {
                next.set(r, c, None);
                captured.push((r, c));
            }
        }
        captured.sort_unstable();

        let placed = next
            .group_at(row, col)
            .expect("the placed stone is on the board");
        if placed.liberties.is_empty() {
            return Err(IllegalMove::Suicide);
        }

        if history.contains(&next.hash()) {
            return Err(IllegalMove::Ko);
        }

        Ok(Placement {
            board: next,
            captured,
        })
    }

    /// A 128-bit position hash, stable across processes.
    pub fn hash(&self) -> u128 {
        let mut acc = 0u128;
        for row in 0..self.size {
            for col in 0..self.size {
                if let Some(color) = self.get(row, col) {
                    acc ^= zobrist_key(self.size, color, row, col);
                }
            }
        }
        acc
    }

    /// Territory under area counting, with `dead_marks` stones lifted off the
    /// board first. Each maximal empty region bordered by stones of exactly
    /// one colour counts for that colour; mixed or unbordered regions count
    /// for no one.
    pub fn territory(
        &self,
        dead_marks: &BTreeSet<(usize, usize)>,
    ) -> BTreeMap<Color, BTreeSet<(usize, usize)>> {
        let cleared = self.without(dead_marks);
        let mut territory: BTreeMap<Color, BTreeSet<(usize, usize)>> = BTreeMap::new();
        let mut counted: BTreeSet<(usize, usize)> = BTreeSet::new();

        for row in 0..cleared.size {
            for col in 0..cleared.size {
                if cleared.get(row, col).is_some() || counted.contains(&(row, col)) {
                    continue;
                }

                let mut region = BTreeSet::new();
                let mut borders = BTreeSet::new();
                let mut stack = vec![(row, col)];
                region.insert((row, col));
                while let Some((r, c)) = stack.pop() {
                    for (nr, nc) in cleared.neighbors(r, c) {
                        match cleared.get(nr, nc) {
                            None => {
                                if region.insert((nr, nc)) {
                                    stack.push((nr, nc));
                                }
                            }
                            Some(color) => {
                                borders.insert(color);
                            }
                        }
                    }
                }

                counted.extend(region.iter().copied());
                if borders.len() == 1 {
                    let owner = *borders.iter().next().expect("exactly one border colour");
                    territory.entry(owner).or_default().extend(region);
                }
            }
        }

        territory
    }

    /// Area score as (white, black): stones remaining after dead removal plus
    /// territory, plus komi for White. Prisoners play no part here; they only
    /// matter to the territory model used when a game ends by resignation.
    pub fn score(&self, komi: f64, dead_marks: &BTreeSet<(usize, usize)>) -> (f64, f64) {
        let cleared = self.without(dead_marks);
        let territory = cleared.territory(&BTreeSet::new());
        let stones = |color| {
            cleared
                .points
                .iter()
                .filter(|point| **point == Some(color))
                .count() as f64
        };
        let area = |color| {
            territory
                .get(&color)
                .map(|region| region.len() as f64)
                .unwrap_or(0.0)
        };
        (
            stones(Color::White) + area(Color::White) + komi,
            stones(Color::Black) + area(Color::Black),
        )
    }

    fn without(&self, dead_marks: &BTreeSet<(usize, usize)>) -> Board {
        let mut cleared = self.clone();
        for &(row, col) in dead_marks {
            if cleared.in_bounds(row, col) {
                cleared.set(row, col, None);
            }
        }
        cleared
    }

    #[cfg(test)]
    pub(crate) fn from_rows(rows: &[&str]) -> Board {
        let size = rows.len();
        let mut board = Board::new(size);
        for (r, row) in rows.iter().enumerate() {
            assert_eq!(row.len(), size, "board rows must be square");
            for (c, ch) in row.chars().enumerate() {
                let point = match ch {
                    '.' => None,
                    'w' => Some(Color::White),
                    'b' => Some(Color::Black),
                    other => panic!("unknown board character {other:?}"),
                };
                board.set(r, c, point);
            }
        }
        board
    }
}

/// Canonical handicap placements (star points) for Black, in the order the
/// stones go down. Valid for 2..=9 stones on the supported board sizes.
pub fn handicap_points(size: usize, handicap: u32) -> Vec<(usize, usize)> {
    if handicap < 2 {
        return Vec::new();
    }
    let edge = if size == 9 { 2 } else { 3 };
    let far = size - 1 - edge;
    let mid = size / 2;

    let mut points = vec![(edge, far), (far, edge)];
    if handicap >= 3 {
        points.push((far, far));
    }
    if handicap >= 4 {
        points.push((edge, edge));
    }
    if handicap >= 6 {
        points.push((mid, edge));
        points.push((mid, far));
    }
    if handicap >= 8 {
        points.push((edge, mid));
        points.push((far, mid));
    }
    // 5, 7, and 9 stones add the centre point last.
    if handicap % 2 == 1 {
        points.push((mid, mid));
    }
    points.truncate(handicap as usize);
    points
}

#[derive(Serialize, Deserialize)]
struct BoardRepr {
    size: usize,
    rows: Vec<String>,
}

impl Serialize for Board {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rows = (0..self.size)
            .map(|row| {
                (0..self.size)
                    .map(|col| self.get(row, col).map(Color::short).unwrap_or('.'))
                    .collect()
            })
            .collect();
        BoardRepr {
            size: self.size,
            rows,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Board {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = BoardRepr::deserialize(deserializer)?;
        if repr.rows.len() != repr.size {
            return Err(D::Error::custom("board row count does not match size"));
        }
        let mut board = Board::new(repr.size);
        for (row, text) in repr.rows.iter().enumerate() {
            if text.chars().count() != repr.size {
                return Err(D::Error::custom("board row length does not match size"));
            }
            for (col, ch) in text.chars().enumerate() {
                let point = match ch {
                    '.' => None,
                    'w' => Some(Color::White),
                    'b' => Some(Color::Black),
                    other => {
                        return Err(D::Error::custom(format!(
                            "unknown board character {other:?}"
                        )));
                    }
                };
                board.set(row, col, point);
            }
        }
        Ok(board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbors_clip_at_edges() {
        let board = Board::new(9);
        assert_eq!(board.neighbors(0, 0), vec![(1, 0), (0, 1)]);
        assert_eq!(board.neighbors(8, 8), vec![(7, 8), (8, 7)]);
        assert_eq!(board.neighbors(4, 4).len(), 4);
    }

    #[test]
    fn group_collects_connected_stones_and_liberties() {
        let board = Board::from_rows(&[
            ".bb..",
            ".bw..",
            "..w..",
            ".....",
            ".....",
        ]);
        let group = board.group_at(0, 1).expect("stone present");
        assert_eq!(group.color, Color::Black);
        assert_eq!(
            group.points,
            [(0, 1), (0, 2), (1, 1)].into_iter().collect::<BTreeSet<_>>()
        );
        assert_eq!(
            group.liberties,
            [(0, 0), (0, 3), (1, 0), (2, 1)]
                .into_iter()
                .collect::<BTreeSet<_>>()
        );
        assert!(board.group_at(4, 4).is_none());
    }

    #[test]
    fn surrounding_a_stone_captures_it() {
        // B(4,4) is reduced to one liberty and then captured by W(5,4).
        let mut board = Board::new(9);
        board = board.place(Color::Black, 4, 4, &[]).unwrap().board;
        for (r, c) in [(3, 4), (4, 3), (4, 5)] {
            board = board.place(Color::White, r, c, &[]).unwrap().board;
        }
        let placement = board.place(Color::White, 5, 4, &[]).unwrap();
        assert_eq!(placement.captured, vec![(4, 4)]);
        assert_eq!(placement.board.get(4, 4), None);
        assert_eq!(placement.board.get(5, 4), Some(Color::White));
    }

    #[test]
    fn captures_from_reports_doomed_groups_only() {
        let board = Board::from_rows(&[
            ".w...",
            "wbw..",
            ".....",
            ".....",
            ".....",
        ]);
        let captures = board.captures_from(Color::White, 2, 1);
        assert_eq!(captures.len(), 1);
        assert_eq!(
            captures[0].points,
            [(1, 1)].into_iter().collect::<BTreeSet<_>>()
        );
        assert!(board.captures_from(Color::White, 3, 3).is_empty());
    }

    #[test]
    fn suicide_without_capture_is_illegal() {
        // White walls off the corner; Black at (0,0) would have no liberties
        // and captures nothing.
        let board = Board::from_rows(&[
            ".w...",
            "w....",
            ".....",
            ".....",
            ".....",
        ]);
        assert_eq!(
            board.place(Color::Black, 0, 0, &[]),
            Err(IllegalMove::Suicide)
        );
        // The same point is fine for White, which connects out.
        assert!(board.place(Color::White, 0, 0, &[]).is_ok());
    }

    #[test]
    fn capture_exempts_a_move_from_the_suicide_rule() {
        let board = Board::from_rows(&[
            ".bw..",
            "bw.w.",
            ".bw..",
            ".....",
            ".....",
        ]);
        // (1,2) has no liberties of its own, but it captures W(1,1) first.
        let placement = board.place(Color::Black, 1, 2, &[]).unwrap();
        assert_eq!(placement.captured, vec![(1, 1)]);
        assert_eq!(placement.board.get(1, 2), Some(Color::Black));
    }

    #[test]
    fn repeating_a_position_in_history_is_ko() {
        let board = Board::from_rows(&[
            ".....",
            ".bw..",
            "b.bw.",
            ".bw..",
            ".....",
        ]);
        // White takes the ko at (2,1).
        let taken = board.place(Color::White, 2, 1, &[]).unwrap();
        assert_eq!(taken.captured, vec![(2, 2)]);

        let history = vec![board.hash(), taken.board.hash()];
        assert_eq!(
            taken.board.place(Color::Black, 2, 2, &history),
            Err(IllegalMove::Ko)
        );
        // Without the original position in the history the recapture stands.
        assert!(
            taken
                .board
                .place(Color::Black, 2, 2, &[taken.board.hash()])
                .is_ok()
        );
    }

    #[test]
    fn occupied_and_off_board_are_rejected() {
        let board = Board::from_rows(&[
            "b....",
            ".....",
            ".....",
            ".....",
            ".....",
        ]);
        assert_eq!(
            board.place(Color::White, 0, 0, &[]),
            Err(IllegalMove::Occupied)
        );
        assert_eq!(
            board.place(Color::White, 5, 0, &[]),
            Err(IllegalMove::OffBoard)
        );
    }

    #[test]
    fn hash_is_a_function_of_the_grid_alone() {
        let mut grown = Board::new(9);
        grown = grown.place(Color::Black, 2, 3, &[]).unwrap().board;
        grown = grown.place(Color::White, 6, 6, &[]).unwrap().board;

        let mut direct = Board::new(9);
        direct.set(6, 6, Some(Color::White));
        direct.set(2, 3, Some(Color::Black));

        assert_eq!(grown.hash(), direct.hash());
        assert_ne!(grown.hash(), Board::new(9).hash());

        // Same coordinates, different colour or size, different key.
        direct.set(2, 3, Some(Color::White));
        assert_ne!(grown.hash(), direct.hash());
        assert_ne!(Board::new(9).hash(), Board::new(13).hash());
    }

    #[test]
    fn territory_requires_a_single_border_colour() {
        let board = Board::from_rows(&[
            ".w.b.",
            "ww.bb",
            ".w.b.",
            "ww.bb",
            ".w.b.",
        ]);
        let territory = board.territory(&BTreeSet::new());
        assert_eq!(
            territory.get(&Color::White).map(BTreeSet::len),
            Some(3),
            "left column belongs to white"
        );
        assert_eq!(territory.get(&Color::Black).map(BTreeSet::len), Some(3));
        // The centre column touches both colours and belongs to nobody.
        assert!(!territory[&Color::White].contains(&(0, 2)));
        assert!(!territory[&Color::Black].contains(&(0, 2)));
    }

    #[test]
    fn dead_stones_are_lifted_before_counting() {
        let board = Board::from_rows(&[
            ".b...",
            "bwb..",
            ".b...",
            ".....",
            ".....",
        ]);
        let dead: BTreeSet<_> = [(1, 1)].into_iter().collect();
        let territory = board.territory(&dead);
        assert!(territory[&Color::Black].contains(&(1, 1)));
        assert!(!territory.contains_key(&Color::White));
    }

    #[test]
    fn area_score_splits_the_board_plus_komi() {
        // Black holds the top two rows' worth of influence, White the bottom.
        let board = Board::from_rows(&[
            ".....",
            "bbbbb",
            ".....",
            "wwwww",
            ".....",
        ]);
        let (white, black) = board.score(6.5, &BTreeSet::new());
        // 5 stones + 5 points of territory + 6.5 komi against 5 + 5.
        assert_eq!(white, 16.5);
        assert_eq!(black, 10.0);
        // The middle row is neutral, so the identity loses those 5 points.
        assert_eq!(white + black, 25.0 + 6.5 - 5.0);
    }

    #[test]
    fn handicap_points_follow_the_star_points() {
        assert!(handicap_points(19, 0).is_empty());
        assert!(handicap_points(19, 1).is_empty());
        assert_eq!(handicap_points(19, 2), vec![(3, 15), (15, 3)]);
        assert_eq!(
            handicap_points(19, 5),
            vec![(3, 15), (15, 3), (15, 15), (3, 3), (9, 9)]
        );
        assert_eq!(handicap_points(19, 9).len(), 9);
        assert_eq!(handicap_points(9, 4), vec![(2, 6), (6, 2), (6, 6), (2, 2)]);

        for size in [9, 13, 19] {
            for handicap in 2..=9 {
                let points = handicap_points(size, handicap);
                assert_eq!(points.len(), handicap as usize);
                let unique: BTreeSet<_> = points.iter().collect();
                assert_eq!(unique.len(), points.len());
            }
        }
    }

    #[test]
    fn board_serde_round_trips() {
        let board = Board::from_rows(&[
            ".w.b.",
            "ww.bb",
            ".w.b.",
            "ww.bb",
            ".w.b.",
        ]);
        let encoded = serde_json::to_string(&board).unwrap();
        let decoded: Board = serde_json::from_str(&encoded).unwrap();
        assert_eq!(board, decoded);

        let bad = r#"{"size": 3, "rows": ["...", "..."]}"#;
        assert!(serde_json::from_str::<Board>(bad).is_err());
    }
}
