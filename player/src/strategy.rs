//! Decision port and the strategies shipped with the bot.
//!
//! To add a strategy, implement [Strategy] and append a [StrategyFactory] to
//! the static list. Names must stay stable: they are selected from
//! configuration and reported in game summaries.

use crate::{legality, table::TableView};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use thiserror::Error;
use unobot_types::{Color, GameSummary, COLORS};

/// A strategy's answer for one turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Play { index: usize, color: Option<Color> },
    Draw,
    Pass,
    Challenge { challenge: bool },
}

/// When the answer is due. Unbounded in practice mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn unbounded() -> Self {
        Self(None)
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|instant| instant.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("strategy failed: {0}")]
    Internal(String),
    #[error("strategy ran out of time")]
    Timeout,
}

/// The contract every strategy implements.
///
/// `decide` runs off the coordinator task and only ever sees a copy of the
/// table. Anything it returns is checked locally before submission; errors,
/// overruns and illegal answers are replaced with a draw (or a pass after a
/// draw).
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn decide(&self, view: &TableView, deadline: Deadline) -> Result<Action, StrategyError>;

    fn on_game_start(&self) {}

    fn on_game_end(&self, _summary: &GameSummary) {}
}

pub struct StrategyFactory {
    pub name: &'static str,
    pub make: fn() -> Arc<dyn Strategy>,
}

static STRATEGIES: &[StrategyFactory] = &[
    StrategyFactory {
        name: BaseStrategy::NAME,
        make: make_base,
    },
    StrategyFactory {
        name: RandomStrategy::NAME,
        make: make_random,
    },
];

pub fn registered() -> &'static [StrategyFactory] {
    STRATEGIES
}

pub fn by_name(name: &str) -> Option<&'static StrategyFactory> {
    registered().iter().find(|factory| factory.name == name)
}

fn make_base() -> Arc<dyn Strategy> {
    Arc::new(BaseStrategy)
}

fn make_random() -> Arc<dyn Strategy> {
    Arc::new(RandomStrategy::new(None))
}

/// Most common color among the colored cards in `view`'s hand, skipping
/// `except`. Ties go to the earlier color in [COLORS].
fn dominant_color(view: &TableView, except: Option<usize>) -> Option<Color> {
    let mut counts: BTreeMap<Color, usize> = BTreeMap::new();
    for (index, card) in view.hand.iter().enumerate() {
        if Some(index) == except {
            continue;
        }
        if let Some(color) = card.color().filter(|_| !card.is_wild()) {
            *counts.entry(color).or_default() += 1;
        }
    }
    COLORS
        .into_iter()
        .filter_map(|color| counts.get(&color).map(|count| (color, *count)))
        .fold(None, |best: Option<(Color, usize)>, (color, count)| match best {
            Some((_, top)) if top >= count => best,
            _ => Some((color, count)),
        })
        .map(|(color, _)| color)
}

/// First legal card, colored cards before wilds; wild color follows the hand.
#[derive(Debug, Default)]
pub struct BaseStrategy;

impl BaseStrategy {
    pub const NAME: &'static str = "base";
}

impl Strategy for BaseStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn decide(&self, view: &TableView, _deadline: Deadline) -> Result<Action, StrategyError> {
        if view.challenge_pending() {
            return Ok(Action::Challenge { challenge: false });
        }
        let mut playable = view.playable();
        playable.sort_by_key(|index| view.hand[*index].is_wild());
        for index in playable {
            let color = view.hand[index].is_wild().then(|| {
                dominant_color(view, Some(index))
                    .unwrap_or_else(|| COLORS[rand::thread_rng().gen_range(0..COLORS.len())])
            });
            let action = Action::Play { index, color };
            if legality::check(view, &action).is_ok() {
                return Ok(action);
            }
        }
        Ok(legality::fallback(view))
    }
}

/// Uniformly random legal action.
pub struct RandomStrategy {
    rng: Mutex<StdRng>,
}

impl RandomStrategy {
    pub const NAME: &'static str = "random";

    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }
}

impl Strategy for RandomStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn decide(&self, view: &TableView, _deadline: Deadline) -> Result<Action, StrategyError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| StrategyError::Internal("rng lock poisoned".to_string()))?;
        let mut options: Vec<Action> = view
            .playable()
            .into_iter()
            .map(|index| Action::Play {
                index,
                color: view.hand[index]
                    .is_wild()
                    .then(|| COLORS[rng.gen_range(0..COLORS.len())]),
            })
            .collect();
        options.push(legality::fallback(view));
        if view.challenge_pending() {
            options.push(Action::Challenge {
                challenge: rng.gen_bool(0.5),
            });
        }
        options.retain(|action| legality::check(view, action).is_ok());
        Ok(options
            .choose(&mut *rng)
            .copied()
            .unwrap_or_else(|| legality::fallback(view)))
    }
}
