//! In-memory mirror of the authoritative room state.
//!
//! The table is only ever changed through [TableState::apply] (feed
//! notifications and folded acknowledgments) or rebuilt whole from a
//! [RoomSnapshot]. Every sequenced change must carry the next
//! [TurnSequence]: anything at or below the last applied value is a
//! duplicate, anything further ahead is a gap that marks the table stale.

use std::collections::BTreeSet;
use tracing::{debug, warn};
use unobot_types::{
    api::{ActionKind, ActionNotice, ActionResult, GameEnd, GameStart, RoomStatus, TurnSnapshot},
    Card, Color, Notification, PlayerId, RoomSnapshot, Seat, TurnSequence,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowKind {
    UnoCatchout,
    WildDrawFourChallenge,
}

/// A short-lived opportunity to catch out or challenge `target`.
///
/// Closed by the first action of any other player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChallengeWindow {
    pub kind: WindowKind,
    pub target: PlayerId,
    /// For Wild Draw Four, the next player; learned from the following turn.
    pub challenger: Option<PlayerId>,
    pub opened_at: TurnSequence,
}

/// Local bookkeeping disagrees with what the server declared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Desync {
    HandSize { predicted: usize, confirmed: usize },
    UnknownCard(Card),
    HiddenDraw { declared: usize, revealed: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate {
        last: TurnSequence,
        incoming: TurnSequence,
    },
    Gap {
        last: TurnSequence,
        incoming: TurnSequence,
    },
    Desync(Desync),
    /// Rejected because the table is waiting for a resync.
    Stale,
    /// Rejected because the game already ended.
    Frozen,
    Informational,
    GameStarted {
        fresh: bool,
    },
    GameEnded,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableState {
    me: PlayerId,
    last_applied: Option<TurnSequence>,
    stale: bool,
    finished: bool,
    hand: Vec<Card>,
    discard_top: Option<Card>,
    current_color: Option<Color>,
    turn_holder: Option<PlayerId>,
    seats: Vec<Seat>,
    window: Option<ChallengeWindow>,
    called_uno: BTreeSet<PlayerId>,
    drawn_this_turn: bool,
}

impl TableState {
    /// An empty table; the first sequenced notification becomes the baseline.
    pub fn new(me: PlayerId) -> Self {
        Self {
            me,
            last_applied: None,
            stale: false,
            finished: false,
            hand: Vec::new(),
            discard_top: None,
            current_color: None,
            turn_holder: None,
            seats: Vec::new(),
            window: None,
            called_uno: BTreeSet::new(),
            drawn_this_turn: false,
        }
    }

    /// Rebuild from a full room snapshot, discarding anything held locally.
    ///
    /// A room still waiting for its game yields an empty table, so the coming
    /// `gameStart` is treated as fresh.
    pub fn from_snapshot(me: PlayerId, snapshot: &RoomSnapshot) -> Self {
        let mut table = Self::new(me);
        table.seats = snapshot.players.clone();
        if snapshot.status == RoomStatus::Waiting {
            return table;
        }
        table.last_applied = Some(snapshot.turn_sequence);
        table.finished = snapshot.status == RoomStatus::Ended;
        table.hand = snapshot.hand.clone();
        table.discard_top = snapshot.top_card;
        table.current_color = snapshot
            .current_color
            .or_else(|| snapshot.top_card.and_then(|card| card.color()));
        table.turn_holder = snapshot.current_player_id.clone();
        table
    }

    pub fn me(&self) -> &PlayerId {
        &self.me
    }

    pub fn last_applied(&self) -> Option<TurnSequence> {
        self.last_applied
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// A game has been observed and has not ended.
    pub fn in_game(&self) -> bool {
        self.last_applied.is_some() && !self.finished
    }

    pub fn hand(&self) -> &[Card] {
        &self.hand
    }

    pub fn turn_holder(&self) -> Option<&PlayerId> {
        self.turn_holder.as_ref()
    }

    pub fn is_my_turn(&self) -> bool {
        self.turn_holder.as_ref() == Some(&self.me)
    }

    pub fn window(&self) -> Option<&ChallengeWindow> {
        self.window.as_ref()
    }

    pub fn drawn_this_turn(&self) -> bool {
        self.drawn_this_turn
    }

    pub fn seats(&self) -> &[Seat] {
        &self.seats
    }

    /// Immutable view for decision making; `None` until a discard top and an
    /// active color are known.
    pub fn snapshot(&self) -> Option<TableView> {
        Some(TableView {
            me: self.me.clone(),
            turn_sequence: self.last_applied?,
            hand: self.hand.clone(),
            top_card: self.discard_top?,
            current_color: self.current_color?,
            turn_holder: self.turn_holder.clone(),
            seats: self.seats.clone(),
            window: self.window.clone(),
            drawn_this_turn: self.drawn_this_turn,
            uno_called: self.called_uno.contains(&self.me),
        })
    }

    pub fn apply(&mut self, notification: &Notification) -> ApplyOutcome {
        let seq = match notification {
            Notification::CountdownStart(_) | Notification::CountdownCancel(_) => {
                return ApplyOutcome::Informational
            }
            Notification::GameStart(start) => return self.start_game(start),
            Notification::GameEnd(end) => return self.end_game(end),
            Notification::Turn(turn) => turn.turn_sequence,
            Notification::Action(action) => action.turn_sequence,
        };
        if self.stale {
            return ApplyOutcome::Stale;
        }
        if self.finished {
            return ApplyOutcome::Frozen;
        }
        if let Some(last) = self.last_applied {
            if seq <= last {
                return ApplyOutcome::Duplicate {
                    last,
                    incoming: seq,
                };
            }
            if seq > last.saturating_add(1) {
                self.stale = true;
                return ApplyOutcome::Gap {
                    last,
                    incoming: seq,
                };
            }
        }

        // Work on a copy so a desync leaves the previous state intact.
        let mut next = self.clone();
        let result = match notification {
            Notification::Turn(turn) => {
                next.apply_turn(turn);
                Ok(())
            }
            Notification::Action(action) => next.apply_action(action),
            _ => Ok(()),
        };
        match result {
            Ok(()) => {
                next.last_applied = Some(seq);
                *self = next;
                ApplyOutcome::Applied
            }
            Err(desync) => {
                self.stale = true;
                ApplyOutcome::Desync(desync)
            }
        }
    }

    fn start_game(&mut self, start: &GameStart) -> ApplyOutcome {
        if self.in_game() {
            // Replayed after a reconnect; the game in progress stands.
            return ApplyOutcome::GameStarted { fresh: false };
        }
        *self = Self::new(self.me.clone());
        self.seats = start.players.clone();
        ApplyOutcome::GameStarted { fresh: true }
    }

    fn end_game(&mut self, end: &GameEnd) -> ApplyOutcome {
        if self.finished {
            return ApplyOutcome::Frozen;
        }
        if let (Some(last), Some(seq)) = (self.last_applied, end.turn_sequence) {
            if seq <= last {
                return ApplyOutcome::Duplicate {
                    last,
                    incoming: seq,
                };
            }
        }
        self.finished = true;
        self.stale = false;
        self.window = None;
        self.turn_holder = None;
        if let Some(seq) = end.turn_sequence {
            self.last_applied = Some(self.last_applied.map_or(seq, |last| last.max(seq)));
        }
        if !end.players.is_empty() {
            self.seats = end.players.clone();
        }
        ApplyOutcome::GameEnded
    }

    fn apply_turn(&mut self, turn: &TurnSnapshot) {
        if self.turn_holder.as_ref() != Some(&turn.player_id) {
            self.drawn_this_turn = false;
        }
        self.discard_top = Some(turn.top_card);
        self.current_color = Some(turn.current_color);
        self.turn_holder = Some(turn.player_id.clone());
        if !turn.players.is_empty() {
            self.seats = turn.players.clone();
        }
        if let Some(hand) = &turn.hand {
            self.hand = hand.clone();
            if self.hand.len() != 1 {
                self.called_uno.remove(&self.me);
            }
        }
        if let Some(window) = self.window.as_mut() {
            if window.kind == WindowKind::WildDrawFourChallenge
                && window.challenger.is_none()
                && window.target != turn.player_id
            {
                window.challenger = Some(turn.player_id.clone());
            }
        }
    }

    fn apply_action(&mut self, action: &ActionNotice) -> Result<(), Desync> {
        let actor = &action.player_id;
        if let Some(window) = &self.window {
            if &window.target != actor {
                debug!(kind = ?window.kind, target = %window.target, "challenge window closed");
                self.window = None;
            }
        }

        match action.kind {
            ActionKind::Play => self.apply_play(action, action.turn_sequence)?,
            ActionKind::Draw | ActionKind::Penalty => {
                let is_draw = action.kind == ActionKind::Draw;
                self.apply_draw(actor, &action.result, action.hand_size, is_draw)?;
            }
            ActionKind::Uno => {
                self.called_uno.insert(actor.clone());
                if matches!(&self.window, Some(w) if w.kind == WindowKind::UnoCatchout && &w.target == actor)
                {
                    self.window = None;
                }
            }
            ActionKind::Pass => {
                if self.turn_holder.as_ref() == Some(actor) {
                    self.turn_holder = None;
                }
            }
            ActionKind::Catchout | ActionKind::Challenge => {
                if action.result.count.is_some() {
                    let penalized = action.result.target_id.clone().unwrap_or_else(|| actor.clone());
                    self.apply_draw(&penalized, &action.result, None, false)?;
                }
                if action.kind == ActionKind::Challenge && self.turn_holder.as_ref() == Some(actor) {
                    self.turn_holder = None;
                }
            }
        }
        Ok(())
    }

    fn apply_play(&mut self, action: &ActionNotice, seq: TurnSequence) -> Result<(), Desync> {
        let actor = &action.player_id;
        let card = action.played_card();
        if let Some(card) = card {
            self.discard_top = Some(card);
        }
        self.current_color = action
            .result
            .chosen_color
            .or_else(|| card.and_then(|card| card.color()))
            .or(self.current_color);

        if actor == &self.me {
            let card = card.ok_or(Desync::HandSize {
                predicted: self.hand.len().saturating_sub(1),
                confirmed: action.hand_size.unwrap_or_default(),
            })?;
            let index = locate(&self.hand, &card, action.card_index)
                .ok_or(Desync::UnknownCard(card))?;
            self.hand.remove(index);
            if let Some(confirmed) = action.hand_size {
                if confirmed != self.hand.len() {
                    return Err(Desync::HandSize {
                        predicted: self.hand.len(),
                        confirmed,
                    });
                }
            }
        }

        let remaining = self.adjust_seat(actor, action.hand_size, -1);
        if self.turn_holder.as_ref() == Some(actor) {
            self.turn_holder = None;
        }
        if action.result.uno {
            self.called_uno.insert(actor.clone());
        } else if remaining != Some(1) {
            self.called_uno.remove(actor);
        }

        // One window at a time: a Wild Draw Four down to one card opens only the challenge.
        if card.map(|card| card.kind()) == Some(unobot_types::CardKind::WildDrawFour) {
            self.open_window(ChallengeWindow {
                kind: WindowKind::WildDrawFourChallenge,
                target: actor.clone(),
                challenger: None,
                opened_at: seq,
            });
        } else if actor != &self.me && remaining == Some(1) && !self.called_uno.contains(actor) {
            self.open_window(ChallengeWindow {
                kind: WindowKind::UnoCatchout,
                target: actor.clone(),
                challenger: None,
                opened_at: seq,
            });
        }
        Ok(())
    }

    fn apply_draw(
        &mut self,
        player: &PlayerId,
        result: &ActionResult,
        hand_size: Option<usize>,
        is_draw: bool,
    ) -> Result<(), Desync> {
        let count = result.draw_count();
        if player == &self.me {
            let cards = result.drawn_cards();
            if cards.len() != count {
                return Err(Desync::HiddenDraw {
                    declared: count,
                    revealed: cards.len(),
                });
            }
            self.hand.extend(cards);
            if let Some(confirmed) = hand_size {
                if confirmed != self.hand.len() {
                    return Err(Desync::HandSize {
                        predicted: self.hand.len(),
                        confirmed,
                    });
                }
            }
            if is_draw && self.is_my_turn() {
                self.drawn_this_turn = true;
            }
        }
        self.adjust_seat(player, hand_size, count as isize);
        self.called_uno.remove(player);
        Ok(())
    }

    /// Update a seat's card count and return it.
    fn adjust_seat(
        &mut self,
        player: &PlayerId,
        confirmed: Option<usize>,
        delta: isize,
    ) -> Option<usize> {
        let own_hand = (player == &self.me).then_some(self.hand.len());
        let seat = self.seats.iter_mut().find(|seat| &seat.id == player);
        match seat {
            Some(seat) => {
                seat.card_count = confirmed.or(own_hand).unwrap_or_else(|| {
                    seat.card_count.saturating_add_signed(delta)
                });
                Some(seat.card_count)
            }
            None => confirmed.or(own_hand),
        }
    }

    fn open_window(&mut self, window: ChallengeWindow) {
        debug!(kind = ?window.kind, target = %window.target, seq = window.opened_at, "challenge window opened");
        if let Some(previous) = self.window.replace(window) {
            warn!(kind = ?previous.kind, target = %previous.target, "challenge window replaced before it closed");
        }
    }
}

/// Position of `card` in `hand`, preferring the reported index.
fn locate(hand: &[Card], card: &Card, hint: Option<usize>) -> Option<usize> {
    let same = |held: &Card| {
        held.kind() == card.kind()
            && held.value() == card.value()
            && (held.is_wild() || held.color() == card.color())
    };
    if let Some(index) = hint {
        if hand.get(index).is_some_and(same) {
            return Some(index);
        }
    }
    hand.iter().position(same)
}

/// Read-only copy of the table handed to a strategy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableView {
    pub me: PlayerId,
    pub turn_sequence: TurnSequence,
    pub hand: Vec<Card>,
    pub top_card: Card,
    pub current_color: Color,
    pub turn_holder: Option<PlayerId>,
    pub seats: Vec<Seat>,
    pub window: Option<ChallengeWindow>,
    pub drawn_this_turn: bool,
    pub uno_called: bool,
}

impl TableView {
    pub fn is_my_turn(&self) -> bool {
        self.turn_holder.as_ref() == Some(&self.me)
    }

    /// Indices of cards that match the discard top under the active color.
    pub fn playable(&self) -> Vec<usize> {
        self.hand
            .iter()
            .enumerate()
            .filter(|(_, card)| card.matches(&self.top_card, self.current_color))
            .map(|(index, _)| index)
            .collect()
    }

    /// A Wild Draw Four window names us as the one who may challenge it.
    pub fn challenge_pending(&self) -> bool {
        matches!(
            &self.window,
            Some(ChallengeWindow {
                kind: WindowKind::WildDrawFourChallenge,
                challenger: Some(challenger),
                ..
            }) if challenger == &self.me
        )
    }
}
