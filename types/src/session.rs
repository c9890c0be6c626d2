use crate::api::{PlayerId, RoomId, TurnSequence};
use crate::cards::{CardKind, Color};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The only state written to durable storage.
///
/// Everything else is rebuilt from the server on resume, so a pointer never
/// references an action the server did not confirm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPointer {
    pub room_id: RoomId,
    pub player_id: PlayerId,
    pub last_ack_seq: TurnSequence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameResult {
    Won,
    Lost,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub cards_played: u32,
    pub cards_drawn: u32,
    pub uno_calls: u32,
    pub penalties: u32,
    pub catchouts_attempted: u32,
    pub catchouts_successful: u32,
}

/// One finished game, handed to the stats collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSummary {
    pub room_id: RoomId,
    pub player_id: PlayerId,
    pub strategy: String,
    pub result: GameResult,
    pub placement: u32,
    pub points: u32,
    pub actions: ActionCounts,
    pub card_kinds: BTreeMap<CardKind, u32>,
    pub chosen_colors: BTreeMap<Color, u32>,
}
