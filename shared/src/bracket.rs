//! Single-elimination bracket construction and winner resolution.
//!
//! A bracket is a list of slot rounds. Round 0 holds the seeded pool padded to
//! a power of two with byes; round `k + 1` has half the slots of round `k` and
//! is filled in as round `k` resolves. Slots are paired `(2i, 2i + 1)`, and the
//! winner of pair `i` lands in slot `i` of the next round. The last round has a
//! single slot: the champion.

use crate::model::{Match, MatchId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    Player(UserId),
    /// Sentinel for an empty seat; always loses.
    Bye,
    /// Not decided yet.
    Pending,
}

impl Slot {
    pub fn user(self) -> Option<UserId> {
        match self {
            Slot::Player(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BracketError {
    #[error("a bracket needs at least 2 players, got {0}")]
    NotEnoughPlayers(usize),
    #[error("player {0} appears more than once in the pool")]
    DuplicatePlayer(UserId),
}

/// Seeds round 0 from `players` in the order given, padding with byes.
pub fn generate_pool(players: &[UserId]) -> Result<Vec<Slot>, BracketError> {
    if players.len() < 2 {
        return Err(BracketError::NotEnoughPlayers(players.len()));
    }
    for (i, id) in players.iter().enumerate() {
        if players[..i].contains(id) {
            return Err(BracketError::DuplicatePlayer(*id));
        }
    }

    let size = players.len().next_power_of_two();
    let mut pool: Vec<Slot> = players.iter().copied().map(Slot::Player).collect();
    pool.resize(size, Slot::Bye);
    Ok(pool)
}

/// Pairs `(slots[2i], slots[2i + 1])` into the matches of `round`.
pub fn pair_slots(round: u32, slots: &[Slot]) -> Vec<Match> {
    slots
        .chunks(2)
        .enumerate()
        .filter(|(_, pair)| pair.len() == 2)
        .map(|(i, pair)| Match::paired(MatchId::new(round, i as u32), pair[0], pair[1]))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bracket {
    pub rounds: Vec<Vec<Slot>>,
}

impl Bracket {
    /// Builds the full round skeleton above a seeded pool.
    pub fn from_pool(pool: Vec<Slot>) -> Self {
        let mut rounds = Vec::new();
        let mut width = pool.len();
        rounds.push(pool);
        while width > 1 {
            width /= 2;
            rounds.push(vec![Slot::Pending; width]);
        }
        Self { rounds }
    }

    pub fn generate(players: &[UserId]) -> Result<Self, BracketError> {
        generate_pool(players).map(Self::from_pool)
    }

    /// Number of rounds in which matches are played.
    pub fn match_rounds(&self) -> usize {
        self.rounds.len().saturating_sub(1)
    }

    pub fn matches_in_round(&self, round: usize) -> usize {
        self.rounds.get(round).map_or(0, |r| r.len() / 2)
    }

    pub fn bye_count(&self) -> usize {
        self.rounds
            .first()
            .map_or(0, |r| r.iter().filter(|s| **s == Slot::Bye).count())
    }

    /// Round `round` is the last one with matches.
    pub fn is_final_round(&self, round: usize) -> bool {
        self.rounds.get(round + 1).is_some_and(|r| r.len() == 1)
    }

    pub fn pairings(&self, round: usize) -> Vec<(Slot, Slot)> {
        self.rounds
            .get(round)
            .map(|r| r.chunks(2).map(|pair| (pair[0], pair[1])).collect())
            .unwrap_or_default()
    }

    /// Builds the match records for `round`, resolving bye pairings at once.
    pub fn round_matches(&self, round: usize) -> Vec<Match> {
        self.rounds
            .get(round)
            .map(|slots| pair_slots(round as u32, slots))
            .unwrap_or_default()
    }

    /// Slot list for `round + 1` given the winners of `round`'s matches in order.
    pub fn next_round_slots(&self, round: usize, winners: &[Slot]) -> Option<Vec<Slot>> {
        let next = self.rounds.get(round + 1)?;
        if winners.len() != next.len() {
            return None;
        }
        Some(winners.to_vec())
    }

    /// Replaces the pending slots of `round`; rejects wrong widths and rewrites.
    pub fn install_round(&mut self, round: usize, slots: Vec<Slot>) -> bool {
        match self.rounds.get_mut(round) {
            Some(r) if r.len() == slots.len() && r.iter().all(|s| *s == Slot::Pending) => {
                *r = slots;
                true
            }
            _ => false,
        }
    }

    /// Writes the champion into the single slot of the last round.
    pub fn crown(&mut self, winner: Slot) {
        if let Some(last) = self.rounds.last_mut() {
            if last.len() == 1 {
                last[0] = winner;
            }
        }
    }

    pub fn champion(&self) -> Option<UserId> {
        match self.rounds.last() {
            Some(last) if last.len() == 1 => last[0].user(),
            _ => None,
        }
    }
}

/// Decides a match: higher score wins; a tie goes to the side that did not
/// forfeit, and failing that to player 1, who arrived first.
pub fn resolve_winner(m: &Match) -> Slot {
    match (m.player1, m.player2) {
        (Slot::Bye, Slot::Bye) => return Slot::Bye,
        (p, Slot::Bye) => return p,
        (Slot::Bye, p) => return p,
        _ => {}
    }

    let [s1, s2] = m.scores;
    if s1 != s2 {
        return if s1 > s2 { m.player1 } else { m.player2 };
    }
    match m.forfeited {
        [true, false] => m.player2,
        _ => m.player1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u64) -> Vec<UserId> {
        (1..=n).collect()
    }

    #[test]
    fn test_pool_of_eight_has_three_rounds() {
        let bracket = Bracket::generate(&ids(8)).unwrap();
        assert_eq!(bracket.match_rounds(), 3);
        let sizes: Vec<usize> = (0..bracket.match_rounds())
            .map(|r| bracket.matches_in_round(r))
            .collect();
        assert_eq!(sizes, vec![4, 2, 1]);
        assert_eq!(bracket.bye_count(), 0);
        assert!(bracket.is_final_round(2));
        assert!(!bracket.is_final_round(1));
    }

    #[test]
    fn test_pool_of_five_pads_three_byes() {
        let pool = generate_pool(&ids(5)).unwrap();
        assert_eq!(pool.len(), 8);
        assert_eq!(pool.iter().filter(|s| **s == Slot::Bye).count(), 3);
        assert_eq!(pool[..5], [1, 2, 3, 4, 5].map(Slot::Player));
    }

    #[test]
    fn test_pairing_is_sequential() {
        let bracket = Bracket::generate(&ids(4)).unwrap();
        assert_eq!(
            bracket.pairings(0),
            vec![
                (Slot::Player(1), Slot::Player(2)),
                (Slot::Player(3), Slot::Player(4)),
            ]
        );
    }

    #[test]
    fn test_bye_matches_are_pre_resolved() {
        let bracket = Bracket::generate(&ids(5)).unwrap();
        let matches = bracket.round_matches(0);
        assert_eq!(matches.len(), 4);
        assert!(!matches[0].is_finished());
        assert_eq!(matches[2].winner, Some(Slot::Player(5)));
        assert_eq!(matches[3].winner, Some(Slot::Bye));
    }

    #[test]
    fn test_rejects_tiny_and_duplicate_pools() {
        assert_eq!(
            generate_pool(&[7]),
            Err(BracketError::NotEnoughPlayers(1))
        );
        assert_eq!(
            generate_pool(&[1, 2, 1]),
            Err(BracketError::DuplicatePlayer(1))
        );
    }

    #[test]
    fn test_winner_by_score_then_forfeit_then_arrival() {
        let mut m = Match::new(MatchId::new(0, 0), Slot::Player(1), Slot::Player(2));
        m.scores = [2, 5];
        assert_eq!(resolve_winner(&m), Slot::Player(2));

        m.scores = [3, 3];
        assert_eq!(resolve_winner(&m), Slot::Player(1));

        m.forfeited = [true, false];
        assert_eq!(resolve_winner(&m), Slot::Player(2));

        m.forfeited = [false, true];
        assert_eq!(resolve_winner(&m), Slot::Player(1));
    }

    #[test]
    fn test_install_round_refuses_rewrite() {
        let mut bracket = Bracket::generate(&ids(4)).unwrap();
        assert!(bracket.install_round(1, vec![Slot::Player(1), Slot::Player(4)]));
        assert!(!bracket.install_round(1, vec![Slot::Player(2), Slot::Player(3)]));
        assert!(!bracket.install_round(2, vec![Slot::Player(1), Slot::Player(4)]));

        bracket.crown(Slot::Player(4));
        assert_eq!(bracket.champion(), Some(4));
    }
}
