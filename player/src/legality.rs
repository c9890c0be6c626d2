use crate::{strategy::Action, table::TableView};
use thiserror::Error;
use unobot_types::{Card, CardKind, Color, Command};

/// Why a proposed action was refused before reaching the server.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IllegalAction {
    #[error("not our turn")]
    NotOurTurn,
    #[error("card index {index} out of range for a hand of {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("{card} does not match {top} with {color} active")]
    NotPlayable { card: Card, top: Card, color: Color },
    #[error("wild draw four while holding a {0} card")]
    WildDrawFourWithMatch(Color),
    #[error("{0} needs a declared color")]
    MissingColor(Card),
    #[error("{0} cannot take a declared color")]
    UnexpectedColor(Card),
    #[error("already drew this turn")]
    AlreadyDrew,
    #[error("pass is only legal right after a draw")]
    PassWithoutDraw,
    #[error("no wild draw four challenge is open for us")]
    NoChallengePending,
}

/// Validate `action` against the local view and turn it into a request.
pub fn check(view: &TableView, action: &Action) -> Result<Command, IllegalAction> {
    if !view.is_my_turn() {
        return Err(IllegalAction::NotOurTurn);
    }
    match *action {
        Action::Play { index, color } => {
            let card = *view.hand.get(index).ok_or(IllegalAction::IndexOutOfRange {
                index,
                len: view.hand.len(),
            })?;
            if !card.matches(&view.top_card, view.current_color) {
                return Err(IllegalAction::NotPlayable {
                    card,
                    top: view.top_card,
                    color: view.current_color,
                });
            }
            if card.kind() == CardKind::WildDrawFour && holds_color(view, view.current_color) {
                return Err(IllegalAction::WildDrawFourWithMatch(view.current_color));
            }
            match (card.is_wild(), color) {
                (true, None) => Err(IllegalAction::MissingColor(card)),
                (false, Some(_)) => Err(IllegalAction::UnexpectedColor(card)),
                _ => Ok(Command::Play { index, color }),
            }
        }
        Action::Draw if view.drawn_this_turn => Err(IllegalAction::AlreadyDrew),
        Action::Draw => Ok(Command::Draw),
        Action::Pass if view.drawn_this_turn => Ok(Command::Pass),
        Action::Pass => Err(IllegalAction::PassWithoutDraw),
        Action::Challenge { challenge } if view.challenge_pending() => {
            Ok(Command::Challenge { challenge })
        }
        Action::Challenge { .. } => Err(IllegalAction::NoChallengePending),
    }
}

/// What the coordinator submits when the strategy fails, overruns or cheats.
pub fn fallback(view: &TableView) -> Action {
    if view.drawn_this_turn {
        Action::Pass
    } else {
        Action::Draw
    }
}

fn holds_color(view: &TableView, color: Color) -> bool {
    view.hand
        .iter()
        .any(|card| !card.is_wild() && card.color() == Some(color))
}

/// Playing the card at `index` requires calling UNO first: either this play
/// leaves one card, or we already hold one card and never called.
pub fn needs_uno_call(view: &TableView, command: &Command) -> bool {
    matches!(command, Command::Play { .. })
        && (view.hand.len() == 2 || (view.hand.len() == 1 && !view.uno_called))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::tests::num;

    fn view(hand: Vec<Card>, color: Color) -> TableView {
        TableView {
            me: "me".into(),
            turn_sequence: 7,
            hand,
            top_card: num(color, 5),
            current_color: color,
            turn_holder: Some("me".into()),
            seats: Vec::new(),
            window: None,
            drawn_this_turn: false,
            uno_called: false,
        }
    }

    #[test]
    fn wild_draw_four_without_matching_color_is_legal() {
        let view = view(
            vec![
                num(Color::Blue, 5),
                Card::action(CardKind::Skip, Color::Green),
                num(Color::Yellow, 2),
                Card::wild(CardKind::WildDrawFour),
            ],
            Color::Red,
        );
        let action = Action::Play {
            index: 3,
            color: Some(Color::Blue),
        };
        assert_eq!(
            check(&view, &action),
            Ok(Command::Play {
                index: 3,
                color: Some(Color::Blue)
            })
        );
    }

    #[test]
    fn wild_draw_four_with_matching_color_is_rejected() {
        let view = view(
            vec![
                num(Color::Red, 5),
                num(Color::Blue, 7),
                Card::wild(CardKind::WildDrawFour),
            ],
            Color::Red,
        );
        let action = Action::Play {
            index: 2,
            color: Some(Color::Blue),
        };
        assert_eq!(
            check(&view, &action),
            Err(IllegalAction::WildDrawFourWithMatch(Color::Red))
        );
        assert_eq!(fallback(&view), Action::Draw);
    }

    #[test]
    fn index_and_match_checks() {
        let view = view(vec![num(Color::Blue, 7)], Color::Red);
        assert_eq!(
            check(&view, &Action::Play { index: 4, color: None }),
            Err(IllegalAction::IndexOutOfRange { index: 4, len: 1 })
        );
        assert!(matches!(
            check(&view, &Action::Play { index: 0, color: None }),
            Err(IllegalAction::NotPlayable { .. })
        ));
        let wild = view_with_wild();
        assert_eq!(
            check(&wild, &Action::Play { index: 0, color: None }),
            Err(IllegalAction::MissingColor(Card::wild(CardKind::Wild)))
        );
    }

    fn view_with_wild() -> TableView {
        view(vec![Card::wild(CardKind::Wild)], Color::Red)
    }

    #[test]
    fn pass_follows_a_draw() {
        let mut view = view(vec![num(Color::Blue, 7)], Color::Red);
        assert_eq!(check(&view, &Action::Pass), Err(IllegalAction::PassWithoutDraw));
        view.drawn_this_turn = true;
        assert_eq!(check(&view, &Action::Pass), Ok(Command::Pass));
        assert_eq!(check(&view, &Action::Draw), Err(IllegalAction::AlreadyDrew));
        assert_eq!(fallback(&view), Action::Pass);
    }

    #[test]
    fn challenge_needs_an_open_window() {
        let view = view(vec![num(Color::Blue, 7)], Color::Red);
        assert_eq!(
            check(&view, &Action::Challenge { challenge: true }),
            Err(IllegalAction::NoChallengePending)
        );
    }

    #[test]
    fn uno_call_boundary() {
        let play = Command::Play {
            index: 0,
            color: None,
        };
        let two = view(vec![num(Color::Red, 5), num(Color::Blue, 7)], Color::Red);
        assert!(needs_uno_call(&two, &play));
        assert!(!needs_uno_call(&two, &Command::Draw));

        let mut one = view(vec![num(Color::Blue, 7)], Color::Red);
        assert!(needs_uno_call(&one, &play));
        one.uno_called = true;
        assert!(!needs_uno_call(&one, &play));

        let three = view(
            vec![num(Color::Red, 5), num(Color::Blue, 7), num(Color::Red, 1)],
            Color::Red,
        );
        assert!(!needs_uno_call(&three, &play));
    }
}
