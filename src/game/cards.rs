//! Cards and the deck.
//!
//! Four colors, values 0..=7, 32 cards. Two cards carry scoring effects:
//! the red zero (bonus) and the brown zero (penalty).

use std::fmt;

use serde::{Serialize, Deserialize};

use crate::core::rng::DeterministicRng;

/// Highest card value in a color.
pub const MAX_VALUE: u8 = 7;

/// Cards per color.
pub const VALUES_PER_COLOR: usize = MAX_VALUE as usize + 1;

/// Total number of cards in the deck.
pub const DECK_SIZE: usize = Color::ALL.len() * VALUES_PER_COLOR;

/// Card color (suit).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    /// Red, home of the bonus zero.
    Red,
    /// Brown, home of the penalty zero.
    Brown,
    /// Green.
    Green,
    /// Blue.
    Blue,
}

impl Color {
    /// All colors in deck order.
    pub const ALL: [Color; 4] = [Color::Red, Color::Brown, Color::Green, Color::Blue];

    /// Stable numeric index, used for hashing.
    pub fn index(self) -> u8 {
        match self {
            Color::Red => 0,
            Color::Brown => 1,
            Color::Green => 2,
            Color::Blue => 3,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Color::Red => "red",
            Color::Brown => "brown",
            Color::Green => "green",
            Color::Blue => "blue",
        };
        f.write_str(name)
    }
}

/// A single card.
///
/// `Ord` is only for stable sorting (color, then value). Trick resolution
/// never uses it because it ignores the led color and trump.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Card {
    /// Color of the card.
    pub color: Color,
    /// Value, 0..=7.
    pub value: u8,
}

impl Card {
    /// The red zero: its trick is worth a bonus.
    pub const RED_ZERO: Card = Card { color: Color::Red, value: 0 };

    /// The brown zero: its trick carries a penalty.
    pub const BROWN_ZERO: Card = Card { color: Color::Brown, value: 0 };

    /// Create a card, rejecting out-of-range values.
    pub fn new(color: Color, value: u8) -> Option<Self> {
        (value <= MAX_VALUE).then_some(Self { color, value })
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.color, self.value)
    }
}

/// The full, ordered 32-card deck.
pub fn full_deck() -> Vec<Card> {
    Color::ALL
        .iter()
        .flat_map(|&color| (0..=MAX_VALUE).map(move |value| Card { color, value }))
        .collect()
}

/// Shuffle a fresh deck and split it into `hands` equal hands.
///
/// Each hand comes back sorted so clients and fallback selection see a
/// stable order.
pub fn deal(rng: &mut DeterministicRng, hands: usize) -> Vec<Vec<Card>> {
    let mut deck = full_deck();
    rng.shuffle(&mut deck);

    let hand_size = deck.len() / hands.max(1);
    deck.chunks(hand_size)
        .take(hands)
        .map(|chunk| {
            let mut hand = chunk.to_vec();
            hand.sort();
            hand
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_full_deck_is_unique() {
        let deck = full_deck();
        assert_eq!(deck.len(), DECK_SIZE);
        let unique: BTreeSet<Card> = deck.iter().copied().collect();
        assert_eq!(unique.len(), 32);
        assert!(unique.contains(&Card::RED_ZERO));
        assert!(unique.contains(&Card::BROWN_ZERO));
    }

    #[test]
    fn test_card_new_bounds() {
        assert!(Card::new(Color::Blue, 7).is_some());
        assert!(Card::new(Color::Blue, 8).is_none());
    }

    #[test]
    fn test_deal_splits_whole_deck() {
        let mut rng = DeterministicRng::new(99);
        let hands = deal(&mut rng, 4);
        assert_eq!(hands.len(), 4);

        let mut all: Vec<Card> = hands.iter().flatten().copied().collect();
        assert!(hands.iter().all(|h| h.len() == 8));
        all.sort();
        assert_eq!(all, full_deck());
    }

    #[test]
    fn test_deal_is_deterministic() {
        let a = deal(&mut DeterministicRng::new(5), 4);
        let b = deal(&mut DeterministicRng::new(5), 4);
        assert_eq!(a, b);
    }

    #[test]
    fn test_card_serde_shape() {
        let json = serde_json::to_string(&Card::RED_ZERO).unwrap();
        assert_eq!(json, r#"{"color":"red","value":0}"#);
    }
}
