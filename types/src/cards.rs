use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The four playable colors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Color {
    Red,
    Blue,
    Green,
    Yellow,
}

pub const COLORS: [Color; 4] = [Color::Red, Color::Blue, Color::Green, Color::Yellow];

impl Color {
    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Red => "RED",
            Color::Blue => "BLUE",
            Color::Green => "GREEN",
            Color::Yellow => "YELLOW",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        COLORS
            .into_iter()
            .find(|color| value.eq_ignore_ascii_case(color.as_str()))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardKind {
    Number,
    Skip,
    Reverse,
    DrawTwo,
    Wild,
    WildDrawFour,
}

impl CardKind {
    pub fn is_wild(&self) -> bool {
        matches!(self, CardKind::Wild | CardKind::WildDrawFour)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CardKind::Number => "NUMBER",
            CardKind::Skip => "SKIP",
            CardKind::Reverse => "REVERSE",
            CardKind::DrawTwo => "DRAW_TWO",
            CardKind::Wild => "WILD",
            CardKind::WildDrawFour => "WILD_DRAW_FOUR",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CardError {
    #[error("number card without a value")]
    MissingNumber,
    #[error("card value out of range: {0}")]
    NumberOutOfRange(u64),
    #[error("{0} card without a color")]
    MissingColor(&'static str),
    #[error("unknown color: {0}")]
    UnknownColor(String),
}

/// An immutable card value.
///
/// `color` is `None` only for wild cards that have not had a color declared;
/// `number` is present only for [CardKind::Number].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCard", into = "RawCard")]
pub struct Card {
    kind: CardKind,
    color: Option<Color>,
    number: Option<u8>,
}

impl Card {
    pub fn number(color: Color, number: u8) -> Result<Self, CardError> {
        if number > 9 {
            return Err(CardError::NumberOutOfRange(number as u64));
        }
        Ok(Self {
            kind: CardKind::Number,
            color: Some(color),
            number: Some(number),
        })
    }

    /// Build a colored action card (skip, reverse, draw two).
    ///
    /// Wild kinds passed here keep the color as their declared color.
    pub fn action(kind: CardKind, color: Color) -> Self {
        Self {
            kind,
            color: Some(color),
            number: None,
        }
    }

    pub fn wild(kind: CardKind) -> Self {
        Self {
            kind,
            color: None,
            number: None,
        }
    }

    pub fn kind(&self) -> CardKind {
        self.kind
    }

    pub fn color(&self) -> Option<Color> {
        self.color
    }

    pub fn value(&self) -> Option<u8> {
        self.number
    }

    pub fn is_wild(&self) -> bool {
        self.kind.is_wild()
    }

    /// Whether this card may be played onto `top` while `current_color` is active.
    pub fn matches(&self, top: &Card, current_color: Color) -> bool {
        if self.is_wild() {
            return true;
        }
        if self.color == Some(current_color) {
            return true;
        }
        match (self.kind, top.kind) {
            (CardKind::Number, CardKind::Number) => self.number == top.number,
            (CardKind::Number, _) => false,
            (kind, top_kind) => kind == top_kind,
        }
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.color, self.kind, self.number) {
            (Some(color), CardKind::Number, Some(n)) => write!(f, "{color} {n}"),
            (Some(color), kind, _) => write!(f, "{color} {}", kind.as_str()),
            (None, kind, _) => f.write_str(kind.as_str()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawCard {
    #[serde(rename = "type")]
    kind: CardKind,
    #[serde(default)]
    color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
}

impl TryFrom<RawCard> for Card {
    type Error = CardError;

    fn try_from(raw: RawCard) -> Result<Self, Self::Error> {
        let color = match raw.color.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(value) if value.eq_ignore_ascii_case("BLACK") => None,
            Some(value) => Some(
                Color::parse(value).ok_or_else(|| CardError::UnknownColor(value.to_string()))?,
            ),
        };
        match raw.kind {
            CardKind::Number => {
                let color = color.ok_or(CardError::MissingColor(raw.kind.as_str()))?;
                let value = raw
                    .value
                    .as_ref()
                    .and_then(serde_json::Value::as_u64)
                    .ok_or(CardError::MissingNumber)?;
                if value > 9 {
                    return Err(CardError::NumberOutOfRange(value));
                }
                Card::number(color, value as u8)
            }
            kind if kind.is_wild() => Ok(Self {
                kind,
                color,
                number: None,
            }),
            kind => {
                let color = color.ok_or(CardError::MissingColor(kind.as_str()))?;
                Ok(Card::action(kind, color))
            }
        }
    }
}

impl From<Card> for RawCard {
    fn from(card: Card) -> Self {
        Self {
            kind: card.kind,
            color: Some(
                card.color
                    .map(|color| color.as_str().to_string())
                    .unwrap_or_else(|| "BLACK".to_string()),
            ),
            value: card.number.map(serde_json::Value::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn red(n: u8) -> Card {
        Card::number(Color::Red, n).unwrap()
    }

    #[test]
    fn decodes_server_cards() {
        let card: Card = serde_json::from_str(r#"{"type":"NUMBER","color":"RED","value":5}"#).unwrap();
        assert_eq!(card, red(5));

        let wild: Card = serde_json::from_str(r#"{"type":"WILD","color":"BLACK"}"#).unwrap();
        assert_eq!(wild, Card::wild(CardKind::Wild));
        assert_eq!(wild.color(), None);

        let wild: Card = serde_json::from_str(r#"{"type":"WILD_DRAW_FOUR"}"#).unwrap();
        assert_eq!(wild.kind(), CardKind::WildDrawFour);

        // Wild on the discard pile carries its declared color.
        let declared: Card =
            serde_json::from_str(r#"{"type":"WILD","color":"GREEN"}"#).unwrap();
        assert_eq!(declared.color(), Some(Color::Green));

        // Non-number cards may echo their type as the value.
        let skip: Card =
            serde_json::from_str(r#"{"type":"SKIP","color":"blue","value":"SKIP"}"#).unwrap();
        assert_eq!(skip, Card::action(CardKind::Skip, Color::Blue));
    }

    #[test]
    fn rejects_malformed_cards() {
        assert!(serde_json::from_str::<Card>(r#"{"type":"NUMBER","color":"RED"}"#).is_err());
        assert!(
            serde_json::from_str::<Card>(r#"{"type":"NUMBER","color":"RED","value":12}"#).is_err()
        );
        assert!(serde_json::from_str::<Card>(r#"{"type":"SKIP"}"#).is_err());
        assert!(
            serde_json::from_str::<Card>(r#"{"type":"SKIP","color":"PURPLE"}"#).is_err()
        );
        assert_eq!(Card::number(Color::Red, 10), Err(CardError::NumberOutOfRange(10)));
    }

    #[test]
    fn serializes_like_the_server() {
        let json = serde_json::to_value(red(7)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "NUMBER", "color": "RED", "value": 7}));
        let json = serde_json::to_value(Card::wild(CardKind::Wild)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "WILD", "color": "BLACK"}));
    }

    #[test]
    fn matching_rules() {
        let top = red(5);
        assert!(Card::number(Color::Blue, 5).unwrap().matches(&top, Color::Red));
        assert!(red(1).matches(&top, Color::Red));
        assert!(!Card::number(Color::Blue, 7).unwrap().matches(&top, Color::Red));
        assert!(Card::wild(CardKind::Wild).matches(&top, Color::Red));

        // After a wild, the declared color decides, not the card on top.
        let wild_top = Card::action(CardKind::Wild, Color::Green);
        assert!(Card::number(Color::Green, 2).unwrap().matches(&wild_top, Color::Green));
        assert!(!red(2).matches(&wild_top, Color::Green));

        let skip = Card::action(CardKind::Skip, Color::Yellow);
        assert!(Card::action(CardKind::Skip, Color::Blue).matches(&skip, Color::Yellow));
        assert!(!Card::action(CardKind::Reverse, Color::Blue).matches(&skip, Color::Yellow));
    }

    #[test]
    fn display() {
        assert_eq!(red(5).to_string(), "RED 5");
        assert_eq!(Card::action(CardKind::DrawTwo, Color::Blue).to_string(), "BLUE DRAW_TWO");
        assert_eq!(Card::wild(CardKind::WildDrawFour).to_string(), "WILD_DRAW_FOUR");
    }
}
