use crate::cards::{Card, Color};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authoritative, strictly increasing counter shared by feed notifications and
/// action acknowledgments within one room.
pub type TurnSequence = u64;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(RoomId);
string_id!(PlayerId);

/// A player as listed in turn snapshots, room state, and game results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seat {
    pub id: PlayerId,
    #[serde(default, alias = "playerName")]
    pub name: Option<String>,
    #[serde(default)]
    pub card_count: usize,
}

// ============== Event feed ==============

/// Names of the feed events this client understands.
const KNOWN_EVENTS: [&str; 6] = [
    "turn",
    "action",
    "gameStart",
    "gameEnd",
    "countdownStart",
    "countdownCancel",
];

/// A server-pushed notification, framed as `{"event": ..., "data": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Notification {
    Turn(TurnSnapshot),
    Action(ActionNotice),
    GameStart(GameStart),
    GameEnd(GameEnd),
    CountdownStart(Countdown),
    CountdownCancel(CountdownCancel),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
}

impl Notification {
    /// Decode a feed frame. Unknown event names yield `Ok(None)`.
    pub fn parse_frame(raw: &str) -> Result<Option<Self>, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        if !KNOWN_EVENTS.contains(&envelope.event.as_str()) {
            return Ok(None);
        }
        serde_json::from_str(raw).map(Some)
    }

    pub fn to_frame(&self) -> String {
        // Serializing plain data into a string cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn turn_sequence(&self) -> Option<TurnSequence> {
        match self {
            Notification::Turn(turn) => Some(turn.turn_sequence),
            Notification::Action(action) => Some(action.turn_sequence),
            Notification::GameEnd(end) => end.turn_sequence,
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Notification::Turn(_) => "turn",
            Notification::Action(_) => "action",
            Notification::GameStart(_) => "gameStart",
            Notification::GameEnd(_) => "gameEnd",
            Notification::CountdownStart(_) => "countdownStart",
            Notification::CountdownCancel(_) => "countdownCancel",
        }
    }
}

/// Full turn state. `hand` is only present when the turn is addressed to us.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSnapshot {
    pub turn_sequence: TurnSequence,
    pub player_id: PlayerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
    pub top_card: Card,
    pub current_color: Color,
    #[serde(default)]
    pub players: Vec<Seat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand: Option<Vec<Card>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    Play,
    Draw,
    Uno,
    Pass,
    Catchout,
    Penalty,
    Challenge,
}

/// Incremental result of a single action, from the feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionNotice {
    pub turn_sequence: TurnSequence,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub player_id: PlayerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<Card>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_index: Option<usize>,
    /// Actor's hand size after the action, as the server sees it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand_size: Option<usize>,
    #[serde(default)]
    pub result: ActionResult,
}

impl ActionNotice {
    /// The card this action put on the discard pile, if any.
    pub fn played_card(&self) -> Option<Card> {
        self.card.or(self.result.card)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<Card>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cards: Vec<Card>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_color: Option<Color>,
    #[serde(default)]
    pub uno: bool,
    #[serde(default)]
    pub penalty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<PlayerId>,
}

impl ActionResult {
    /// Cards the server revealed as drawn by the actor.
    pub fn drawn_cards(&self) -> Vec<Card> {
        if !self.cards.is_empty() {
            return self.cards.clone();
        }
        self.card.into_iter().collect()
    }

    /// Number of cards drawn, as declared by the server.
    pub fn draw_count(&self) -> usize {
        self.count.unwrap_or_else(|| self.drawn_cards().len().max(1))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStart {
    #[serde(default)]
    pub players: Vec<Seat>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Winner {
    Seat {
        id: PlayerId,
        #[serde(default)]
        name: Option<String>,
    },
    Id(PlayerId),
}

impl Winner {
    pub fn id(&self) -> &PlayerId {
        match self {
            Winner::Seat { id, .. } => id,
            Winner::Id(id) => id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEnd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_sequence: Option<TurnSequence>,
    pub winner: Winner,
    #[serde(default)]
    pub score: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Final standings, best first.
    #[serde(default)]
    pub players: Vec<Seat>,
}

impl GameEnd {
    /// 1-based placement of `player`; falls back to 1 for the winner and 2 otherwise.
    pub fn placement_of(&self, player: &PlayerId) -> u32 {
        if let Some(position) = self.players.iter().position(|seat| &seat.id == player) {
            return position as u32 + 1;
        }
        if self.winner.id() == player {
            1
        } else {
            2
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Countdown {
    #[serde(default)]
    pub seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountdownCancel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Sent by the client after every (re)connect to subscribe to a room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Subscribe {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId, player_id: PlayerId },
}

// ============== Action gateway ==============

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    #[default]
    Waiting,
    Playing,
    Ended,
    #[serde(other)]
    Unknown,
}

/// Full room state, fetched over request/response to resynchronize.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub turn_sequence: TurnSequence,
    #[serde(default)]
    pub status: RoomStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_player_id: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_card: Option<Card>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_color: Option<Color>,
    #[serde(default)]
    pub players: Vec<Seat>,
    #[serde(default)]
    pub hand: Vec<Card>,
}

impl RoomSnapshot {
    pub fn contains_player(&self, player: &PlayerId) -> bool {
        self.players.iter().any(|seat| &seat.id == player)
    }
}

/// Server acknowledgment of a submitted action.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_sequence: Option<TurnSequence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand_size: Option<usize>,
    #[serde(default)]
    pub result: ActionResult,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomListing {
    pub id: RoomId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub is_sandbox: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_id: RoomId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub first_name: String,
    pub last_name: String,
    #[serde(rename = "MAC")]
    pub mac: String,
    pub is_sandbox: bool,
    pub only_players: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub player_id: PlayerId,
}

/// A single action submitted through the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Play { index: usize, color: Option<Color> },
    Draw,
    Pass,
    CallUno,
    Catchout { target: PlayerId },
    Challenge { challenge: bool },
}

impl Command {
    /// Path segment below `/rooms/{room}/`.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Command::Play { .. } => "play",
            Command::Draw => "draw",
            Command::Pass => "pass",
            Command::CallUno => "uno",
            Command::Catchout { .. } => "catchout",
            Command::Challenge { .. } => "challenge",
        }
    }

    /// The kind of action notice this command produces once applied.
    pub fn kind(&self) -> ActionKind {
        match self {
            Command::Play { .. } => ActionKind::Play,
            Command::Draw => ActionKind::Draw,
            Command::Pass => ActionKind::Pass,
            Command::CallUno => ActionKind::Uno,
            Command::Catchout { .. } => ActionKind::Catchout,
            Command::Challenge { .. } => ActionKind::Challenge,
        }
    }

    /// Request body for `player`.
    pub fn body(&self, player: &PlayerId) -> serde_json::Value {
        use serde_json::json;
        match self {
            Command::Play { index, color } => match color {
                Some(color) => json!({"playerId": player, "cardIndex": index, "wildColor": color}),
                None => json!({"playerId": player, "cardIndex": index}),
            },
            Command::Catchout { target } => json!({"challengerId": player, "targetId": target}),
            Command::Challenge { challenge } => {
                json!({"playerId": player, "challenge": challenge})
            }
            Command::Draw | Command::Pass | Command::CallUno => json!({"playerId": player}),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Play {
                index,
                color: Some(color),
            } => write!(f, "play[{index}] as {color}"),
            Command::Play { index, color: None } => write!(f, "play[{index}]"),
            Command::Catchout { target } => write!(f, "catchout {target}"),
            Command::Challenge { challenge } => write!(f, "challenge={challenge}"),
            other => f.write_str(other.endpoint()),
        }
    }
}
