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

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::board::{Board, Color, IllegalMove, handicap_points};
use crate::{BOARD_SIZES, DEFAULT_KOMI, HANDICAP_KOMI, MAX_HANDICAP};

/// Version byte prepended to every persisted game blob so future servers can
/// detect and migrate old serialisations.
pub const BLOB_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Move {
    Play {
        color: Color,
        row: usize,
        col: usize,
    },
    Pass {
        color: Color,
    },
    Resign {
        color: Color,
    },
    MarkDead {
        color: Color,
        row: usize,
        col: usize,
        dead: bool,
    },
    RequestUndo {
        color: Color,
    },
    AcceptUndo {
        color: Color,
    },
    RequestTally {
        color: Color,
    },
    AcceptTally {
        color: Color,
    },
}

impl Move {
    pub fn color(&self) -> Color {
        match *self {
            Move::Play { color, .. }
            | Move::Pass { color }
            | Move::Resign { color }
            | Move::MarkDead { color, .. }
            | Move::RequestUndo { color }
            | Move::AcceptUndo { color }
            | Move::RequestTally { color }
            | Move::AcceptTally { color } => color,
        }
    }

    /// Moves that change the replayable record, as opposed to request
    /// bookkeeping held in `pending_request`.
    fn is_board_action(&self) -> bool {
        matches!(
            self,
            Move::Play { .. } | Move::Pass { .. } | Move::Resign { .. } | Move::MarkDead { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Play,
    Endgame,
    Complete,
    Resigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Undo,
    Tally,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub by: Color,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prisoners {
    pub white: u32,
    pub black: u32,
}

impl Prisoners {
    pub fn get(&self, color: Color) -> u32 {
        match color {
            Color::White => self.white,
            Color::Black => self.black,
        }
    }

    fn add(&mut self, color: Color, count: u32) {
        match color {
            Color::White => self.white += count,
            Color::Black => self.black += count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameResult {
    pub winner: Color,
    pub white_score: f64,
    pub black_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionError {
    Board(IllegalMove),
    WrongPhase { phase: Phase },
    NoStoneToMark,
    NoSuchRequest,
    NotEligible,
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::Board(illegal) => write!(f, "{illegal}"),
            ActionError::WrongPhase { phase } => {
                write!(f, "the game phase ({phase:?}) does not allow this action")
            }
            ActionError::NoStoneToMark => write!(f, "there is no stone at that point to mark"),
            ActionError::NoSuchRequest => {
                write!(f, "there is no matching pending request to respond to")
            }
            ActionError::NotEligible => write!(f, "you may not make this request now"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewGameError {
    InvalidSize,
    InvalidHandicap,
}

impl fmt::Display for NewGameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NewGameError::InvalidSize => write!(f, "board size must be 9, 13 or 19"),
            NewGameError::InvalidHandicap => {
                write!(f, "handicap must be between 0 and {MAX_HANDICAP}")
            }
        }
    }
}

#[derive(Debug)]
pub enum BlobError {
    UnsupportedSchema(u8),
    Decode(serde_json::Error),
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::UnsupportedSchema(version) => {
                write!(f, "unsupported game blob schema version {version}")
            }
            BlobError::Decode(error) => write!(f, "malformed game blob: {error}"),
        }
    }
}

impl std::error::Error for BlobError {}

/// The full rules state of one game. Reconstructed from its persisted blob on
/// every action, mutated, and written back; nothing here outlives a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    board_size: usize,
    komi: f64,
    handicap: u32,
    turn: Color,
    prisoners: Prisoners,
    board: Board,
    // Position hashes, initial position included, for positional superko.
    history: Vec<u128>,
    phase: Phase,
    dead_marks: BTreeSet<(usize, usize)>,
    pending_request: Option<PendingRequest>,
    action_stack: Vec<Move>,
    result: Option<GameResult>,
}

impl Game {
    pub fn new(size: usize, komi: Option<f64>, handicap: u32) -> Result<Game, NewGameError> {
        if !BOARD_SIZES.contains(&size) {
            return Err(NewGameError::InvalidSize);
        }
        if handicap > MAX_HANDICAP {
            return Err(NewGameError::InvalidHandicap);
        }

        let komi = komi.unwrap_or(if handicap > 0 { HANDICAP_KOMI } else { DEFAULT_KOMI });
        let mut board = Board::new(size);
        for (row, col) in handicap_points(size, handicap) {
            board.set(row, col, Some(Color::Black));
        }
        // With handicap stones down, White moves first.
        let turn = if handicap >= 2 {
            Color::White
        } else {
            Color::Black
        };
        let history = vec![board.hash()];

        Ok(Game {
            board_size: size,
            komi,
            handicap,
            turn,
            prisoners: Prisoners::default(),
            board,
            history,
            phase: Phase::Play,
            dead_marks: BTreeSet::new(),
            pending_request: None,
            action_stack: Vec::new(),
            result: None,
        })
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn board_size(&self) -> usize {
        self.board_size
    }

    pub fn komi(&self) -> f64 {
        self.komi
    }

    pub fn handicap(&self) -> u32 {
        self.handicap
    }

    pub fn turn(&self) -> Color {
        self.turn
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn prisoners(&self) -> Prisoners {
        self.prisoners
    }

    pub fn dead_marks(&self) -> &BTreeSet<(usize, usize)> {
        &self.dead_marks
    }

    pub fn pending_request(&self) -> Option<PendingRequest> {
        self.pending_request
    }

    pub fn result(&self) -> Option<GameResult> {
        self.result
    }

    pub fn action_stack(&self) -> &[Move] {
        &self.action_stack
    }

    pub fn last_move(&self) -> Option<(usize, usize)> {
        match self.action_stack.last() {
            Some(Move::Play { row, col, .. }) => Some((*row, *col)),
            _ => None,
        }
    }

    pub fn last_two_were_passes(&self) -> bool {
        matches!(
            self.action_stack.as_slice(),
            [.., Move::Pass { .. }, Move::Pass { .. }]
        )
    }

    /// Attempt an action. On failure the game is unchanged.
    pub fn apply(&mut self, mv: Move) -> Result<(), ActionError> {
        match mv {
            Move::Play { color, row, col } => self.play(color, row, col),
            Move::Pass { color } => self.pass(color),
            Move::Resign { color } => self.resign(color),
            Move::MarkDead {
                color,
                row,
                col,
                dead,
            } => self.mark_dead(color, row, col, dead),
            Move::RequestUndo { color } => self.request_undo(color),
            Move::AcceptUndo { color } => self.accept_undo(color),
            Move::RequestTally { color } => self.request_tally(color),
            Move::AcceptTally { color } => self.accept_tally(color),
        }?;

        if mv.is_board_action() {
            self.action_stack.push(mv);
        }
        Ok(())
    }

    fn play(&mut self, color: Color, row: usize, col: usize) -> Result<(), ActionError> {
        if !matches!(self.phase, Phase::Play | Phase::Endgame) {
            return Err(ActionError::WrongPhase { phase: self.phase });
        }
        if color != self.turn {
            return Err(ActionError::Board(IllegalMove::NotYourTurn));
        }

        let placement = self
            .board
            .place(color, row, col, &self.history)
            .map_err(ActionError::Board)?;

        if self.phase == Phase::Endgame {
            // Resuming play discards the tally in progress; both players must
            // pass again to re-enter the endgame.
            self.phase = Phase::Play;
            self.dead_marks.clear();
        }

        self.prisoners.add(color, placement.captured.len() as u32);
        self.history.push(placement.board.hash());
        self.board = placement.board;
        self.turn = color.opposite();
        self.pending_request = None;
        Ok(())
    }

    fn pass(&mut self, color: Color) -> Result<(), ActionError> {
        if self.phase != Phase::Play {
            return Err(ActionError::WrongPhase { phase: self.phase });
        }
        if color != self.turn {
            return Err(ActionError::Board(IllegalMove::NotYourTurn));
        }

        let second_pass = matches!(self.action_stack.last(), Some(Move::Pass { .. }));
        self.turn = color.opposite();
        self.pending_request = None;
        if second_pass {
            self.phase = Phase::Endgame;
            self.dead_marks.clear();
            // The second pass doubles as a tally proposal over no dead stones;
            // the opponent can accept it outright.
            self.pending_request = Some(PendingRequest {
                kind: RequestKind::Tally,
                by: color,
            });
        }
        Ok(())
    }

    fn resign(&mut self, color: Color) -> Result<(), ActionError> {
        if !matches!(self.phase, Phase::Play | Phase::Endgame) {
            return Err(ActionError::WrongPhase { phase: self.phase });
        }

        // No tally happened, so the score falls back to the territory model,
        // where the prisoner counts carried all game finally pay off.
        let territory = self.board.territory(&self.dead_marks);
        let count = |color: Color| {
            territory
                .get(&color)
                .map(|region| region.len() as f64)
                .unwrap_or(0.0)
        };
        self.result = Some(GameResult {
            winner: color.opposite(),
            white_score: self.komi + self.prisoners.white as f64 + count(Color::White),
            black_score: self.prisoners.black as f64 + count(Color::Black),
        });
        self.phase = Phase::Resigned;
        self.pending_request = None;
        Ok(())
    }

    fn mark_dead(
        &mut self,
        _color: Color,
        row: usize,
        col: usize,
        dead: bool,
    ) -> Result<(), ActionError> {
        if self.phase != Phase::Endgame {
            return Err(ActionError::WrongPhase { phase: self.phase });
        }
        if row >= self.board_size || col >= self.board_size {
            return Err(ActionError::Board(IllegalMove::OffBoard));
        }
        if self.board.get(row, col).is_none() {
            return Err(ActionError::NoStoneToMark);
        }

        if dead {
            self.dead_marks.insert((row, col));
        } else {
            self.dead_marks.remove(&(row, col));
        }
        // Editing the marks voids any standing tally proposal; both players
        // must agree to the marks as they now stand.
        self.pending_request = None;
        Ok(())
    }

    fn request_undo(&mut self, color: Color) -> Result<(), ActionError> {
        if self.phase != Phase::Play {
            return Err(ActionError::WrongPhase { phase: self.phase });
        }
        // Only the player who just moved (i.e. not the player to move) may
        // ask for their move back.
        if color == self.turn || self.action_stack.is_empty() {
            return Err(ActionError::NotEligible);
        }
        self.pending_request = Some(PendingRequest {
            kind: RequestKind::Undo,
            by: color,
        });
        Ok(())
    }

    fn accept_undo(&mut self, color: Color) -> Result<(), ActionError> {
        if self.phase != Phase::Play {
            return Err(ActionError::WrongPhase { phase: self.phase });
        }
        let requester = match self.pending_request {
            Some(PendingRequest {
                kind: RequestKind::Undo,
                by,
            }) if by != color => by,
            _ => return Err(ActionError::NoSuchRequest),
        };

        // Pop the most recent action, and its predecessor if need be, until
        // the requester is to move again. Board, prisoners, and history are
        // all rebuilt by replaying the surviving actions from the start.
        let mut stack = self.action_stack.clone();
        for _ in 0..2 {
            if stack.pop().is_none() {
                return Err(ActionError::NotEligible);
            }
            let replayed = Self::replay(self.board_size, self.komi, self.handicap, &stack)?;
            if replayed.phase == Phase::Play && replayed.turn == requester {
                *self = replayed;
                return Ok(());
            }
        }
        Err(ActionError::NotEligible)
    }

    fn request_tally(&mut self, color: Color) -> Result<(), ActionError> {
        if self.phase != Phase::Endgame {
            return Err(ActionError::WrongPhase { phase: self.phase });
        }
        // A fresh request supersedes whatever proposal was standing and
        // asserts the marks as they are right now.
        self.pending_request = Some(PendingRequest {
            kind: RequestKind::Tally,
            by: color,
        });
        Ok(())
    }

    fn accept_tally(&mut self, color: Color) -> Result<(), ActionError> {
        if self.phase != Phase::Endgame {
            return Err(ActionError::WrongPhase { phase: self.phase });
        }
        match self.pending_request {
            Some(PendingRequest {
                kind: RequestKind::Tally,
                by,
            }) if by != color => {
                let (white_score, black_score) = self.board.score(self.komi, &self.dead_marks);
                let winner = if black_score > white_score {
                    Color::Black
                } else {
                    // Ties are only reachable with an integral komi and go to
                    // the komi side.
                    Color::White
                };
                self.result = Some(GameResult {
                    winner,
                    white_score,
                    black_score,
                });
                self.phase = Phase::Complete;
                self.pending_request = None;
                Ok(())
            }
            _ => Err(ActionError::NoSuchRequest),
        }
    }

    fn replay(
        size: usize,
        komi: f64,
        handicap: u32,
        actions: &[Move],
    ) -> Result<Game, ActionError> {
        let mut game = Game::new(size, Some(komi), handicap).map_err(|_| {
            // The live game was built from these parameters, so this cannot
            // fire outside of memory corruption.
            ActionError::NotEligible
        })?;
        for mv in actions {
            game.apply(*mv)?;
        }
        game.pending_request = None;
        Ok(game)
    }

    /// Serialise for the store: one schema-version byte followed by the
    /// self-describing JSON body.
    pub fn to_blob(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut blob = vec![BLOB_SCHEMA_VERSION];
        blob.extend(serde_json::to_vec(self)?);
        Ok(blob)
    }

    pub fn from_blob(bytes: &[u8]) -> Result<Game, BlobError> {
        match bytes.split_first() {
            Some((&BLOB_SCHEMA_VERSION, body)) => {
                serde_json::from_slice(body).map_err(BlobError::Decode)
            }
            Some((&version, _)) => Err(BlobError::UnsupportedSchema(version)),
            None => Err(BlobError::UnsupportedSchema(0)),
        }
    }
}
