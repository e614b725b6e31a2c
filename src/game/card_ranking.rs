//! Card model and five-card hand ranking.
//!
//! Duels score each participant's hand by category only. Two hands of the
//! same category are equal; there is no kicker comparison.

use std::collections::HashSet;
use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HAND_SIZE: usize = 5;
pub const DECK_SIZE: usize = 52;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suit {
    Hearts,
    Diamonds,
    Clubs,
    Spades,
}

impl Suit {
    pub const ALL: [Suit; 4] = [Suit::Hearts, Suit::Diamonds, Suit::Clubs, Suit::Spades];

    fn symbol(self) -> &'static str {
        match self {
            Suit::Hearts => "♥",
            Suit::Diamonds => "♦",
            Suit::Clubs => "♣",
            Suit::Spades => "♠",
        }
    }
}

/// Card rank with aces high. The discriminant is the comparison value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    Two = 2,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Ten,
    Jack,
    Queen,
    King,
    Ace,
}

impl Rank {
    pub const ALL: [Rank; 13] = [
        Rank::Two,
        Rank::Three,
        Rank::Four,
        Rank::Five,
        Rank::Six,
        Rank::Seven,
        Rank::Eight,
        Rank::Nine,
        Rank::Ten,
        Rank::Jack,
        Rank::Queen,
        Rank::King,
        Rank::Ace,
    ];

    pub fn value(self) -> u8 {
        self as u8
    }

    fn label(self) -> &'static str {
        match self {
            Rank::Two => "2",
            Rank::Three => "3",
            Rank::Four => "4",
            Rank::Five => "5",
            Rank::Six => "6",
            Rank::Seven => "7",
            Rank::Eight => "8",
            Rank::Nine => "9",
            Rank::Ten => "10",
            Rank::Jack => "J",
            Rank::Queen => "Q",
            Rank::King => "K",
            Rank::Ace => "A",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Card {
    pub rank: Rank,
    pub suit: Suit,
}

impl Card {
    pub const fn new(rank: Rank, suit: Suit) -> Self {
        Self { rank, suit }
    }

    /// Maps 0..52 onto the deck, suit-major.
    pub fn from_index(index: u8) -> Option<Self> {
        if usize::from(index) >= DECK_SIZE {
            return None;
        }
        let suit = Suit::ALL[usize::from(index / 13)];
        let rank = Rank::ALL[usize::from(index % 13)];
        Some(Self { rank, suit })
    }

    pub fn index(&self) -> u8 {
        let suit = Suit::ALL.iter().position(|s| *s == self.suit).unwrap_or(0) as u8;
        suit * 13 + (self.rank.value() - 2)
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.rank.label(), self.suit.symbol())
    }
}

/// All 52 cards in index order.
pub fn standard_deck() -> Vec<Card> {
    Suit::ALL
        .iter()
        .flat_map(|&suit| Rank::ALL.iter().map(move |&rank| Card::new(rank, suit)))
        .collect()
}

pub fn shuffled_deck<R: Rng + ?Sized>(rng: &mut R) -> Vec<Card> {
    let mut deck = standard_deck();
    deck.shuffle(rng);
    deck
}

/// Hand categories in ascending strength.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandCategory {
    HighCard,
    Pair,
    TwoPair,
    ThreeOfAKind,
    Straight,
    Flush,
    FullHouse,
    FourOfAKind,
    StraightFlush,
    RoyalFlush,
}

impl HandCategory {
    pub fn damage_multiplier(self) -> u32 {
        match self {
            HandCategory::HighCard => 1,
            HandCategory::Pair => 2,
            HandCategory::TwoPair => 3,
            HandCategory::ThreeOfAKind => 4,
            HandCategory::Straight => 5,
            HandCategory::Flush => 6,
            HandCategory::FullHouse => 8,
            HandCategory::FourOfAKind => 12,
            HandCategory::StraightFlush => 20,
            HandCategory::RoyalFlush => 30,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandEvaluation {
    pub category: HandCategory,
    pub multiplier: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandError {
    #[error("a hand must contain exactly {HAND_SIZE} cards, got {0}")]
    WrongCardCount(usize),
    #[error("card {0} appears more than once")]
    DuplicateCard(Card),
}

pub fn evaluate_hand(cards: &[Card]) -> Result<HandEvaluation, HandError> {
    if cards.len() != HAND_SIZE {
        return Err(HandError::WrongCardCount(cards.len()));
    }
    let mut seen = HashSet::with_capacity(HAND_SIZE);
    for card in cards {
        if !seen.insert(*card) {
            return Err(HandError::DuplicateCard(*card));
        }
    }

    let category = categorize(cards);
    Ok(HandEvaluation {
        category,
        multiplier: category.damage_multiplier(),
    })
}

fn categorize(cards: &[Card]) -> HandCategory {
    let flush = cards.iter().all(|c| c.suit == cards[0].suit);

    let mut values: Vec<u8> = cards.iter().map(|c| c.rank.value()).collect();
    values.sort_unstable();

    // counts per rank, largest group first
    let mut groups: Vec<usize> = Vec::with_capacity(HAND_SIZE);
    let mut run = 1;
    for pair in values.windows(2) {
        if pair[0] == pair[1] {
            run += 1;
        } else {
            groups.push(run);
            run = 1;
        }
    }
    groups.push(run);
    groups.sort_unstable_by(|a, b| b.cmp(a));

    let distinct = groups.len() == HAND_SIZE;
    let wheel = values == [2, 3, 4, 5, 14];
    let straight = distinct && (values[4] - values[0] == 4 || wheel);

    match (straight, flush) {
        (true, true) if values[0] == Rank::Ten.value() => return HandCategory::RoyalFlush,
        (true, true) => return HandCategory::StraightFlush,
        _ => {}
    }

    match groups.as_slice() {
        [4, ..] => HandCategory::FourOfAKind,
        [3, 2] => HandCategory::FullHouse,
        _ if flush => HandCategory::Flush,
        _ if straight => HandCategory::Straight,
        [3, ..] => HandCategory::ThreeOfAKind,
        [2, 2, ..] => HandCategory::TwoPair,
        [2, ..] => HandCategory::Pair,
        _ => HandCategory::HighCard,
    }
}
