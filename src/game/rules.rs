//! Rules Engine
//!
//! Pure functions over cards, bids and tricks. Nothing here touches match
//! state directly; the state machine feeds these functions and applies
//! their results. Same inputs always give the same outputs.

use serde::{Serialize, Deserialize};

use crate::game::cards::{Card, Color};
use crate::game::state::PlayerName;

/// Lowest numeric bet.
pub const MIN_BET: u8 = 7;

/// Highest numeric bet. Bidding closes as soon as it is placed.
pub const MAX_BET: u8 = 12;

/// Points every trick is worth before card effects.
pub const TRICK_POINTS: i32 = 1;

/// Bonus for the trick holding the red zero.
pub const RED_ZERO_BONUS: i32 = 5;

/// Penalty for the trick holding the brown zero.
pub const BROWN_ZERO_PENALTY: i32 = -3;

// =============================================================================
// BIDDING
// =============================================================================

/// A bid as submitted by a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Bid {
    /// Pass.
    Skip,
    /// Numeric bet.
    Bet {
        /// Points the team commits to take, 7..=12.
        amount: u8,
        /// Play the round without a trump color.
        without_trump: bool,
    },
}

impl Bid {
    /// Numeric amount, `None` for a skip.
    pub fn amount(&self) -> Option<u8> {
        match self {
            Bid::Skip => None,
            Bid::Bet { amount, .. } => Some(*amount),
        }
    }

    /// Whether this is a skip.
    pub fn is_skip(&self) -> bool {
        matches!(self, Bid::Skip)
    }
}

/// A bid recorded against the seat that placed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedBid {
    /// Who bid.
    pub player: PlayerName,
    /// Seat of the bidder.
    pub seat: usize,
    /// What they bid.
    pub bid: Bid,
}

/// The winning bid of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    /// Contract holder.
    pub player: PlayerName,
    /// Seat of the contract holder.
    pub seat: usize,
    /// Points the offensive team must take.
    pub amount: u8,
    /// No trump color this round.
    pub without_trump: bool,
    /// Assigned to the dealer because everyone skipped.
    pub forced: bool,
}

/// Why a bet was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BetRejection {
    /// Bidding already closed for this round.
    #[error("Betting is closed")]
    Closed,

    /// Amount outside the allowed range.
    #[error("Bet {amount} is outside {MIN_BET}..={MAX_BET}")]
    OutOfRange {
        /// Offending amount.
        amount: u8,
    },

    /// Amount does not beat the standing bet.
    #[error("Bet {amount} must be higher than the current bet of {highest}")]
    NotHigher {
        /// Offending amount.
        amount: u8,
        /// Current highest bet.
        highest: u8,
    },
}

/// The highest numeric bid so far, earliest first on equal amounts.
pub fn highest_bid(bids: &[PlacedBid]) -> Option<&PlacedBid> {
    bids.iter()
        .filter(|b| !b.bid.is_skip())
        .fold(None, |best: Option<&PlacedBid>, b| match best {
            Some(current) if current.bid.amount() >= b.bid.amount() => Some(current),
            _ => Some(b),
        })
}

/// Check a proposed bid against the bids already placed this round.
///
/// A skip is always acceptable while the window is open.
pub fn validate_bet(bids: &[PlacedBid], proposed: &Bid, window_open: bool) -> Result<(), BetRejection> {
    if !window_open {
        return Err(BetRejection::Closed);
    }

    let amount = match proposed {
        Bid::Skip => return Ok(()),
        Bid::Bet { amount, .. } => *amount,
    };

    if !(MIN_BET..=MAX_BET).contains(&amount) {
        return Err(BetRejection::OutOfRange { amount });
    }

    if let Some(highest) = highest_bid(bids).and_then(|b| b.bid.amount()) {
        if amount <= highest {
            return Err(BetRejection::NotHigher { amount, highest });
        }
    }

    Ok(())
}

/// Turn the bids of a closed round into a contract.
///
/// If nobody bet, the dealer is forced into the minimum bet with trump.
pub fn resolve_bidding_round(bids: &[PlacedBid], dealer: &PlayerName, dealer_seat: usize) -> Contract {
    match highest_bid(bids) {
        Some(PlacedBid { player, seat, bid: Bid::Bet { amount, without_trump } }) => Contract {
            player: player.clone(),
            seat: *seat,
            amount: *amount,
            without_trump: *without_trump,
            forced: false,
        },
        _ => Contract {
            player: dealer.clone(),
            seat: dealer_seat,
            amount: MIN_BET,
            without_trump: false,
            forced: true,
        },
    }
}

/// Bid played on behalf of a player who ran out of time.
pub fn fallback_bid() -> Bid {
    Bid::Skip
}

// =============================================================================
// TRICKS
// =============================================================================

/// One card played into a trick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrickPlay {
    /// Who played.
    pub player: PlayerName,
    /// Seat of the player.
    pub seat: usize,
    /// Card played.
    pub card: Card,
}

/// Winner and value of a complete trick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrickOutcome {
    /// Player who took the trick.
    pub winner: PlayerName,
    /// Seat that took the trick.
    pub winner_seat: usize,
    /// Points carried by the trick.
    pub points: i32,
}

/// Color of the first card in the trick.
pub fn led_color(trick: &[TrickPlay]) -> Option<Color> {
    trick.first().map(|p| p.card.color)
}

/// Cards from `hand` that may be played into `trick`, sorted.
///
/// The led color must be followed when held. Otherwise any card goes;
/// trumping is never forced, with or without a trump color.
pub fn legal_plays(hand: &[Card], trick: &[TrickPlay]) -> Vec<Card> {
    let mut legal: Vec<Card> = match led_color(trick) {
        Some(led) if hand.iter().any(|c| c.color == led) => {
            hand.iter().copied().filter(|c| c.color == led).collect()
        }
        _ => hand.to_vec(),
    };
    legal.sort();
    legal
}

/// Card played on behalf of a player who ran out of time.
pub fn fallback_card(hand: &[Card], trick: &[TrickPlay]) -> Option<Card> {
    legal_plays(hand, trick).first().copied()
}

/// Trump color for the round once the first card is on the table.
pub fn trump_for(contract: &Contract, first_card: Card) -> Option<Color> {
    if contract.without_trump {
        None
    } else {
        Some(first_card.color)
    }
}

/// Scoring effect of a single card.
pub fn card_points(card: Card) -> i32 {
    if card == Card::RED_ZERO {
        RED_ZERO_BONUS
    } else if card == Card::BROWN_ZERO {
        BROWN_ZERO_PENALTY
    } else {
        0
    }
}

/// Points carried by a set of played cards.
pub fn trick_points(trick: &[TrickPlay]) -> i32 {
    TRICK_POINTS + trick.iter().map(|p| card_points(p.card)).sum::<i32>()
}

/// Index into `trick` of the winning play.
pub fn trick_winner(trick: &[TrickPlay], trump: Option<Color>) -> Option<usize> {
    let led = led_color(trick)?;

    let best_of = |color: Color| {
        trick
            .iter()
            .enumerate()
            .filter(|(_, p)| p.card.color == color)
            .max_by_key(|(_, p)| p.card.value)
            .map(|(i, _)| i)
    };

    trump.and_then(best_of).or_else(|| best_of(led))
}

/// Resolve a complete trick into its winner and point value.
pub fn resolve_trick(trick: &[TrickPlay], trump: Option<Color>) -> Option<TrickOutcome> {
    let index = trick_winner(trick, trump)?;
    let play = &trick[index];
    Some(TrickOutcome {
        winner: play.player.clone(),
        winner_seat: play.seat,
        points: trick_points(trick),
    })
}

// =============================================================================
// SCORING
// =============================================================================

/// Scoring parameters that vary per match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringRules {
    /// Multiplier applied to both teams' deltas for a no-trump contract.
    pub without_trump_multiplier: i32,
}

impl Default for ScoringRules {
    fn default() -> Self {
        Self { without_trump_multiplier: 2 }
    }
}

/// Result of scoring one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundOutcome {
    /// Offensive team reached its bet.
    pub fulfilled: bool,
    /// Points the offensive team took.
    pub offense_points: i32,
    /// Score change for the offensive team.
    pub offense_delta: i32,
    /// Score change for the defensive team.
    pub defense_delta: i32,
}

/// Score a round from the contract and the offensive team's points.
///
/// Fulfilled: offense gains its points, defense loses the same.
/// Failed: offense loses the bet, defense gains it.
pub fn score_round(contract: &Contract, offense_points: i32, rules: &ScoringRules) -> RoundOutcome {
    let multiplier = if contract.without_trump {
        rules.without_trump_multiplier
    } else {
        1
    };

    let fulfilled = offense_points >= contract.amount as i32;
    let offense_delta = if fulfilled {
        offense_points * multiplier
    } else {
        -(contract.amount as i32) * multiplier
    };

    RoundOutcome {
        fulfilled,
        offense_points,
        offense_delta,
        defense_delta: -offense_delta,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn name(s: &str) -> PlayerName {
        PlayerName::from(s)
    }

    fn bet(player: &str, seat: usize, amount: u8) -> PlacedBid {
        PlacedBid {
            player: name(player),
            seat,
            bid: Bid::Bet { amount, without_trump: false },
        }
    }

    fn skip(player: &str, seat: usize) -> PlacedBid {
        PlacedBid { player: name(player), seat, bid: Bid::Skip }
    }

    fn play(seat: usize, color: Color, value: u8) -> TrickPlay {
        TrickPlay {
            player: name(["a", "b", "c", "d"][seat]),
            seat,
            card: Card { color, value },
        }
    }

    #[test]
    fn test_validate_bet_requires_increase() {
        let bids = vec![bet("a", 0, 8), skip("b", 1)];
        let nine = Bid::Bet { amount: 9, without_trump: true };
        let eight = Bid::Bet { amount: 8, without_trump: false };

        assert!(validate_bet(&bids, &nine, true).is_ok());
        assert_eq!(
            validate_bet(&bids, &eight, true),
            Err(BetRejection::NotHigher { amount: 8, highest: 8 })
        );
        assert!(validate_bet(&bids, &Bid::Skip, true).is_ok());
    }

    #[test]
    fn test_validate_bet_range_and_window() {
        let six = Bid::Bet { amount: 6, without_trump: false };
        let thirteen = Bid::Bet { amount: 13, without_trump: false };
        assert_eq!(validate_bet(&[], &six, true), Err(BetRejection::OutOfRange { amount: 6 }));
        assert_eq!(validate_bet(&[], &thirteen, true), Err(BetRejection::OutOfRange { amount: 13 }));
        assert_eq!(validate_bet(&[], &Bid::Skip, false), Err(BetRejection::Closed));
    }

    #[test]
    fn test_resolve_bidding_highest_wins() {
        let bids = vec![bet("a", 0, 8), skip("b", 1), bet("c", 2, 9), skip("d", 3)];
        let contract = resolve_bidding_round(&bids, &name("d"), 3);
        assert_eq!(contract.player, name("c"));
        assert_eq!(contract.amount, 9);
        assert!(!contract.forced);
    }

    #[test]
    fn test_resolve_bidding_all_skip_forces_dealer() {
        let bids = vec![skip("b", 1), skip("c", 2), skip("d", 3), skip("a", 0)];
        let contract = resolve_bidding_round(&bids, &name("a"), 0);
        assert_eq!(contract.player, name("a"));
        assert_eq!(contract.seat, 0);
        assert_eq!(contract.amount, MIN_BET);
        assert!(!contract.without_trump);
        assert!(contract.forced);
    }

    #[test]
    fn test_legal_plays_follow_led_color() {
        let hand = vec![
            Card { color: Color::Blue, value: 3 },
            Card { color: Color::Red, value: 5 },
            Card { color: Color::Red, value: 1 },
        ];
        let trick = vec![play(0, Color::Red, 7)];
        assert_eq!(
            legal_plays(&hand, &trick),
            vec![Card { color: Color::Red, value: 1 }, Card { color: Color::Red, value: 5 }]
        );

        let void = vec![play(0, Color::Green, 2)];
        assert_eq!(legal_plays(&hand, &void).len(), 3);
        assert_eq!(legal_plays(&hand, &[]).len(), 3);
    }

    #[test]
    fn test_fallback_card_is_lowest_legal() {
        let hand = vec![
            Card { color: Color::Blue, value: 3 },
            Card { color: Color::Red, value: 5 },
        ];
        assert_eq!(fallback_card(&hand, &[]), Some(Card { color: Color::Red, value: 5 }));
        assert_eq!(fallback_card(&[], &[]), None);
    }

    #[test]
    fn test_trick_winner_led_color_without_trump() {
        let trick = vec![
            play(0, Color::Green, 3),
            play(1, Color::Blue, 7),
            play(2, Color::Green, 6),
            play(3, Color::Red, 7),
        ];
        assert_eq!(trick_winner(&trick, None), Some(2));
    }

    #[test]
    fn test_trick_winner_trump_beats_led() {
        let trick = vec![
            play(0, Color::Green, 7),
            play(1, Color::Blue, 1),
            play(2, Color::Green, 6),
            play(3, Color::Blue, 0),
        ];
        assert_eq!(trick_winner(&trick, Some(Color::Blue)), Some(1));
        // Trump color absent from the trick: led color decides
        assert_eq!(trick_winner(&trick, Some(Color::Red)), Some(0));
    }

    #[test]
    fn test_trick_points_with_bonus_cards() {
        let plain = vec![play(0, Color::Green, 3), play(1, Color::Green, 4)];
        assert_eq!(trick_points(&plain), 1);

        let bonus = vec![play(0, Color::Red, 4), play(1, Color::Red, 0)];
        assert_eq!(trick_points(&bonus), 6);

        let both = vec![
            play(0, Color::Red, 0),
            play(1, Color::Brown, 0),
            play(2, Color::Red, 7),
            play(3, Color::Blue, 1),
        ];
        let outcome = resolve_trick(&both, None).unwrap();
        assert_eq!(outcome.winner_seat, 2);
        assert_eq!(outcome.points, 1 + 5 - 3);
    }

    #[test]
    fn test_score_round_fulfilled_without_trump() {
        let contract = Contract {
            player: name("c"),
            seat: 2,
            amount: 9,
            without_trump: true,
            forced: false,
        };
        let rules = ScoringRules { without_trump_multiplier: 1 };
        let outcome = score_round(&contract, 10, &rules);
        assert!(outcome.fulfilled);
        assert_eq!(outcome.offense_delta, 10);
        assert_eq!(outcome.defense_delta, -10);

        let doubled = score_round(&contract, 10, &ScoringRules::default());
        assert_eq!(doubled.offense_delta, 20);
        assert_eq!(doubled.defense_delta, -20);
    }

    #[test]
    fn test_score_round_failed_flips_sign() {
        let contract = Contract {
            player: name("a"),
            seat: 0,
            amount: 8,
            without_trump: false,
            forced: false,
        };
        let outcome = score_round(&contract, 6, &ScoringRules::default());
        assert!(!outcome.fulfilled);
        assert_eq!(outcome.offense_delta, -8);
        assert_eq!(outcome.defense_delta, 8);
    }

    fn arb_bid() -> impl Strategy<Value = Bid> {
        prop_oneof![
            Just(Bid::Skip),
            (5u8..14, any::<bool>()).prop_map(|(amount, without_trump)| Bid::Bet { amount, without_trump }),
        ]
    }

    fn arb_hand() -> impl Strategy<Value = Vec<Card>> {
        proptest::sample::subsequence(crate::game::cards::full_deck(), 1..=8)
    }

    proptest! {
        /// Accepted numeric bids within one round strictly increase.
        #[test]
        fn prop_accepted_bids_strictly_increase(proposals in proptest::collection::vec(arb_bid(), 0..12)) {
            let mut accepted: Vec<PlacedBid> = Vec::new();
            for (i, bid) in proposals.into_iter().enumerate() {
                if validate_bet(&accepted, &bid, true).is_ok() {
                    accepted.push(PlacedBid { player: name("p"), seat: i % 4, bid });
                }
            }
            let amounts: Vec<u8> = accepted.iter().filter_map(|b| b.bid.amount()).collect();
            prop_assert!(amounts.windows(2).all(|w| w[0] < w[1]));
        }

        /// Same hand and trick always yield the same legal fallback card.
        #[test]
        fn prop_fallback_card_is_deterministic_and_legal(hand in arb_hand(), led in 0usize..4) {
            let trick = vec![play(0, Color::ALL[led], 4)];
            let first = fallback_card(&hand, &trick);
            let second = fallback_card(&hand, &trick);
            prop_assert_eq!(first, second);
            let card = first.unwrap();
            prop_assert!(legal_plays(&hand, &trick).contains(&card));
        }

        /// The winner holds trump when trump was played, the led color otherwise.
        #[test]
        fn prop_trick_winner_color(cards in proptest::sample::subsequence(crate::game::cards::full_deck(), 4), trump in proptest::option::of(0usize..4)) {
            let trick: Vec<TrickPlay> = cards
                .iter()
                .enumerate()
                .map(|(seat, &card)| TrickPlay { player: name("p"), seat, card })
                .collect();
            let trump = trump.map(|i| Color::ALL[i]);
            let winner = trick[trick_winner(&trick, trump).unwrap()].card;

            match trump {
                Some(t) if trick.iter().any(|p| p.card.color == t) => prop_assert_eq!(winner.color, t),
                _ => prop_assert_eq!(winner.color, trick[0].card.color),
            }
        }
    }
}
