//! Folds feed events and action acknowledgments into the table.

use crate::table::{ApplyOutcome, TableState};
use tracing::{debug, trace, warn};
use unobot_client::FeedEvent;
use unobot_types::{
    ActionAck, ActionKind, ActionNotice, Card, Command, GameEnd, Notification,
};

/// What the coordinator needs to know after an event was folded in.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    /// Nothing changed: duplicate, informational, or ignored while stale.
    Quiet,
    /// The table changed; applied actions are passed along for bookkeeping.
    Applied(Option<ActionNotice>),
    /// The table needs a full resync before anything else may happen.
    Stale,
    GameStarted { fresh: bool },
    GameEnded(GameEnd),
    Connected { reconnect: bool },
    Disconnected,
    Exhausted { attempts: u32 },
}

#[derive(Debug, Default)]
pub struct Reconciler {
    duplicates: u64,
    gaps: u64,
}

impl Reconciler {
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    pub fn on_feed(&mut self, table: &mut TableState, event: FeedEvent) -> Signal {
        match event {
            FeedEvent::Connected { reconnect } => Signal::Connected { reconnect },
            FeedEvent::Disconnected { reason } => {
                warn!(%reason, "feed lost, table is stale until resync");
                table.mark_stale();
                Signal::Disconnected
            }
            FeedEvent::Exhausted { attempts } => Signal::Exhausted { attempts },
            FeedEvent::Notification(notification) => self.apply(table, notification),
        }
    }

    pub fn apply(&mut self, table: &mut TableState, notification: Notification) -> Signal {
        let name = notification.name();
        match table.apply(&notification) {
            ApplyOutcome::Applied => {
                trace!(event = name, seq = ?notification.turn_sequence(), "applied");
                match notification {
                    Notification::Action(notice) => Signal::Applied(Some(notice)),
                    _ => Signal::Applied(None),
                }
            }
            ApplyOutcome::Duplicate { last, incoming } => {
                self.duplicates += 1;
                trace!(event = name, last, incoming, "dropped duplicate");
                Signal::Quiet
            }
            ApplyOutcome::Gap { last, incoming } => {
                self.gaps += 1;
                warn!(event = name, last, incoming, "turn sequence gap");
                Signal::Stale
            }
            ApplyOutcome::Desync(desync) => {
                warn!(event = name, ?desync, "local state disagrees with server");
                Signal::Stale
            }
            ApplyOutcome::Stale | ApplyOutcome::Frozen => {
                debug!(event = name, "ignored");
                Signal::Quiet
            }
            ApplyOutcome::Informational => {
                debug!(event = name, "informational");
                Signal::Quiet
            }
            ApplyOutcome::GameStarted { fresh } => Signal::GameStarted { fresh },
            ApplyOutcome::GameEnded => match notification {
                Notification::GameEnd(end) => Signal::GameEnded(end),
                _ => Signal::Quiet,
            },
        }
    }

    /// Fold the acknowledgment of our own `command` into the table.
    ///
    /// `card` is the card the command played, as it sat in our hand.
    pub fn fold_ack(
        &mut self,
        table: &mut TableState,
        command: &Command,
        card: Option<Card>,
        ack: &ActionAck,
    ) -> Signal {
        if ack.result.penalty {
            warn!(
                %command,
                title = ?ack.result.penalty_title,
                description = ?ack.result.penalty_description,
                "action drew a penalty"
            );
            table.mark_stale();
            return Signal::Stale;
        }
        if let (Some(last), Some(seq)) = (table.last_applied(), ack.turn_sequence) {
            if seq > last.saturating_add(1) {
                // Something in between has not reached us yet; the feed copy will.
                debug!(%command, last, seq, "ack ahead of the feed");
                return Signal::Quiet;
            }
        }
        match notice_from_ack(table, command, card, ack) {
            Some(notice) => self.apply(table, Notification::Action(notice)),
            // Without a sequence number the feed copy is the one that counts.
            None => Signal::Quiet,
        }
    }
}

fn notice_from_ack(
    table: &TableState,
    command: &Command,
    card: Option<Card>,
    ack: &ActionAck,
) -> Option<ActionNotice> {
    let turn_sequence = ack.turn_sequence?;
    let kind = command.kind();
    let mut result = ack.result.clone();
    let mut card_index = None;
    match command {
        Command::Play { index, color } => {
            result.chosen_color = result.chosen_color.or(*color);
            card_index = Some(*index);
        }
        Command::Catchout { target } => {
            result.target_id = result.target_id.or_else(|| Some(target.clone()));
        }
        _ => {}
    }
    Some(ActionNotice {
        turn_sequence,
        kind,
        player_id: table.me().clone(),
        card: ack.result.card.filter(|_| kind == ActionKind::Play).or(card),
        card_index,
        hand_size: ack.hand_size,
        result,
    })
}
