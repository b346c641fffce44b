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

use crate::board::Color;

/// One chat line. The id is assigned by the database and orders the thread;
/// it is absent only on messages that have not been written yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Option<i64>,
    pub timestamp: f64,
    pub color: Color,
    pub message: String,
}

/// An ordered run of chat messages. `is_complete` distinguishes the full
/// thread sent on (re)join from the incremental tail pushed per NOTIFY.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatThread {
    pub messages: Vec<ChatMessage>,
    pub is_complete: bool,
}

impl ChatThread {
    pub fn complete(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            is_complete: true,
        }
    }

    pub fn partial(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            is_complete: false,
        }
    }

    pub fn last_id(&self) -> Option<i64> {
        self.messages.iter().filter_map(|message| message.id).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: i64, text: &str) -> ChatMessage {
        ChatMessage {
            id: Some(id),
            timestamp: id as f64,
            color: Color::Black,
            message: text.to_string(),
        }
    }

    #[test]
    fn last_id_tracks_the_newest_message() {
        assert_eq!(ChatThread::default().last_id(), None);
        let thread = ChatThread::complete(vec![message(1, "hi"), message(4, "yo")]);
        assert_eq!(thread.last_id(), Some(4));
    }
}
