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

pub mod board;
pub mod chat;
pub mod game;
pub mod messages;

pub use board::{Board, Color, Group, IllegalMove};
pub use chat::{ChatMessage, ChatThread};
pub use game::{
    ActionError, Game, GameResult, Move, NewGameError, PendingRequest, Phase, Prisoners,
    RequestKind,
};
pub use messages::{ClientMessage, ErrorKind, GameView, KeySet, ServerMessage};

/// Supported board side lengths.
pub const BOARD_SIZES: [usize; 3] = [9, 13, 19];

/// Length of a player key.
pub const KEY_LEN: usize = 10;

/// Length of an AI attachment secret.
pub const AI_SECRET_LEN: usize = 32;

/// Length of a server process manager id.
pub const MANAGER_ID_LEN: usize = 64;

pub const DEFAULT_KOMI: f64 = 6.5;
pub const HANDICAP_KOMI: f64 = 0.5;
pub const MAX_HANDICAP: u32 = 9;
