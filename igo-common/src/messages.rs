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

use serde::{Deserialize, Serialize};

use crate::board::{Board, Color};
use crate::chat::ChatThread;
use crate::game::{Game, GameResult, Move, PendingRequest, Phase, Prisoners};

/// Everything a client may send. One JSON object per WebSocket frame; the
/// `type` tag selects the variant, and a frame that does not decode is a
/// protocol error, answered but never acted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    NewGame {
        size: usize,
        komi: Option<f64>,
        handicap: Option<u32>,
        your_color: Color,
        vs_ai: Option<bool>,
    },
    JoinGame {
        key: String,
        ai_secret: Option<String>,
    },
    GameAction {
        action: Move,
    },
    Chat {
        message: String,
    },
}

/// The error kinds that are surfaced to clients. Version conflicts and
/// transient store hiccups are resolved server-side and never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ClientProtocol,
    Unauthorized,
    KeyState,
    IllegalMove,
    ServerError,
}

/// The two player keys of a game. AI secrets are deliberately not part of
/// this type so they can never leak through a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    pub white: String,
    pub black: String,
}

impl KeySet {
    pub fn key_for(&self, color: Color) -> &str {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }
}

/// The client-facing projection of a game: the board and public state, minus
/// internals like the hash history and action stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameView {
    pub board: Board,
    pub phase: Phase,
    pub turn: Color,
    pub komi: f64,
    pub handicap: u32,
    pub prisoners: Prisoners,
    pub dead_marks: Vec<(usize, usize)>,
    pub pending_request: Option<PendingRequest>,
    pub result: Option<GameResult>,
    pub last_move: Option<(usize, usize)>,
}

impl From<&Game> for GameView {
    fn from(game: &Game) -> Self {
        GameView {
            board: game.board().clone(),
            phase: game.phase(),
            turn: game.turn(),
            komi: game.komi(),
            handicap: game.handicap(),
            prisoners: game.prisoners(),
            dead_marks: game.dead_marks().iter().copied().collect(),
            pending_request: game.pending_request(),
            result: game.result(),
            last_move: game.last_move(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    NewGameResponse {
        success: bool,
        explanation: String,
        keys: Option<KeySet>,
        your_color: Option<Color>,
    },
    JoinGameResponse {
        success: bool,
        explanation: String,
        keys: Option<KeySet>,
        your_color: Option<Color>,
    },
    /// Clients must discard any `game_status` older than one they have
    /// already seen; `version` is the authority.
    GameStatus {
        version: i32,
        time_played: f64,
        game: GameView,
    },
    Chat {
        thread: ChatThread,
    },
    OpponentConnected {
        connected: bool,
    },
    GameActionResponse {
        success: bool,
        explanation: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_messages_decode_with_optional_fields_missing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "new_game", "size": 9, "your_color": "black"}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::NewGame {
                size: 9,
                komi: None,
                handicap: None,
                your_color: Color::Black,
                vs_ai: None,
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "join_game", "key": "abcDEF1234"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinGame {
                key: "abcDEF1234".to_string(),
                ai_secret: None,
            }
        );
    }

    #[test]
    fn game_actions_nest_a_tagged_move() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "game_action",
                "action": {"kind": "play", "color": "white", "row": 3, "col": 15}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::GameAction {
                action: Move::Play {
                    color: Color::White,
                    row: 3,
                    col: 15,
                },
            }
        );

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "game_action",
                "action": {"kind": "mark_dead", "color": "black",
                           "row": 0, "col": 1, "dead": true}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::GameAction {
                action: Move::MarkDead {
                    color: Color::Black,
                    row: 0,
                    col: 1,
                    dead: true,
                },
            }
        );
    }

    #[test]
    fn malformed_frames_fail_to_decode() {
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "warp"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "join_game"}"#).is_err());
    }

    #[test]
    fn outbound_messages_carry_their_type_tag() {
        let encoded = serde_json::to_value(&ServerMessage::OpponentConnected { connected: true })
            .unwrap();
        assert_eq!(encoded["type"], "opponent_connected");
        assert_eq!(encoded["connected"], true);

        let encoded = serde_json::to_value(&ServerMessage::Error {
            kind: ErrorKind::IllegalMove,
            message: "the point is already occupied".to_string(),
        })
        .unwrap();
        assert_eq!(encoded["type"], "error");
        assert_eq!(encoded["kind"], "illegal_move");
    }

    #[test]
    fn game_status_exposes_version_and_view() {
        let game = Game::new(9, None, 0).unwrap();
        let status = ServerMessage::GameStatus {
            version: 7,
            time_played: 12.5,
            game: GameView::from(&game),
        };
        let encoded = serde_json::to_value(&status).unwrap();
        assert_eq!(encoded["type"], "game_status");
        assert_eq!(encoded["version"], 7);
        assert_eq!(encoded["game"]["turn"], "black");
        assert_eq!(encoded["game"]["board"]["size"], 9);
    }
}
