use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::info;
use unobot_types::{
    ActionCounts, ActionKind, ActionNotice, Card, CardKind, Color, GameEnd, GameResult,
    GameSummary, PlayerId, RoomId,
};

/// Receives one record per finished game.
pub trait SummarySink: Send {
    fn emit(&mut self, summary: &GameSummary);
}

/// Logs each summary as a structured event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl SummarySink for TracingSink {
    fn emit(&mut self, summary: &GameSummary) {
        info!(
            room = %summary.room_id,
            strategy = %summary.strategy,
            result = ?summary.result,
            placement = summary.placement,
            points = summary.points,
            played = summary.actions.cards_played,
            drawn = summary.actions.cards_drawn,
            summary = %serde_json::to_string(summary).unwrap_or_default(),
            "game summary"
        );
    }
}

impl SummarySink for mpsc::UnboundedSender<GameSummary> {
    fn emit(&mut self, summary: &GameSummary) {
        let _ = self.send(summary.clone());
    }
}

/// Per-game counters, fed from actions as they are applied to the table.
#[derive(Clone, Debug)]
pub struct Tally {
    room_id: RoomId,
    player_id: PlayerId,
    strategy: String,
    actions: ActionCounts,
    card_kinds: BTreeMap<CardKind, u32>,
    chosen_colors: BTreeMap<Color, u32>,
}

impl Tally {
    pub fn new(room_id: RoomId, player_id: PlayerId, strategy: &str) -> Self {
        Self {
            room_id,
            player_id,
            strategy: strategy.to_string(),
            actions: ActionCounts::default(),
            card_kinds: BTreeMap::new(),
            chosen_colors: BTreeMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.actions = ActionCounts::default();
        self.card_kinds.clear();
        self.chosen_colors.clear();
    }

    pub fn actions(&self) -> &ActionCounts {
        &self.actions
    }

    pub fn record_play(&mut self, card: Card, chosen: Option<Color>) {
        self.actions.cards_played += 1;
        *self.card_kinds.entry(card.kind()).or_default() += 1;
        if let Some(color) = chosen.filter(|_| card.is_wild()) {
            *self.chosen_colors.entry(color).or_default() += 1;
        }
    }

    pub fn record_penalty(&mut self) {
        self.actions.penalties += 1;
    }

    /// Count one of our own actions once it is part of the table.
    pub fn record(&mut self, notice: &ActionNotice) {
        if notice.player_id != self.player_id {
            return;
        }
        if notice.result.penalty {
            self.record_penalty();
        }
        match notice.kind {
            ActionKind::Play => {
                if let Some(card) = notice.played_card() {
                    self.record_play(card, notice.result.chosen_color);
                }
            }
            ActionKind::Draw => {
                self.actions.cards_drawn += notice.result.draw_count() as u32;
            }
            ActionKind::Penalty if !notice.result.penalty => self.record_penalty(),
            ActionKind::Uno => self.actions.uno_calls += 1,
            ActionKind::Catchout => {
                self.actions.catchouts_attempted += 1;
                if notice.result.success == Some(true) {
                    self.actions.catchouts_successful += 1;
                }
            }
            _ => {}
        }
    }

    pub fn finish(&self, end: &GameEnd) -> GameSummary {
        let won = end.winner.id() == &self.player_id;
        GameSummary {
            room_id: self.room_id.clone(),
            player_id: self.player_id.clone(),
            strategy: self.strategy.clone(),
            result: if won { GameResult::Won } else { GameResult::Lost },
            placement: end.placement_of(&self.player_id),
            points: if won { end.score } else { 0 },
            actions: self.actions.clone(),
            card_kinds: self.card_kinds.clone(),
            chosen_colors: self.chosen_colors.clone(),
        }
    }
}
