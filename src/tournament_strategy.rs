//! Pairing policies used by the [`Tournament`](crate::tournament::Tournament).
//!
//! A strategy decides who plays whom, and with which colors, for every game of the
//! tournament. It never sees results: pairings are fixed once the player count is known.
//!
//! # Provided Strategies
//! - [`RoundRobinTournament`]: every pair of players meets the same number of times. With
//!   two players this is a plain match with alternating colors.
//! - [`GauntletTournament`]: the first player meets each of the others.
//!
//! Games between the same two players are played as consecutive *encounters* of
//! `games_per_encounter` games with alternating colors, so that a repeated opening can be
//! played from both sides.

use std::fmt::Debug;

use tracing::debug;

/// Who plays white and black in one game, by player index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pairing {
    pub white: usize,
    pub black: usize,
    /// Position of the game within its encounter, `0` for the first one.
    pub encounter_game: u32,
}

/// Defines how players are paired in a tournament.
pub trait TournamentStrategy: Send + Debug {
    /// Called once before the first pairing is requested.
    fn init(&mut self, player_count: usize);

    /// Pairing of the game with (zero-based) index `game_index`, `None` past the end.
    fn next_pair(&mut self, game_index: usize) -> Option<Pairing>;

    /// Number of games of the whole tournament.
    fn final_game_count(&self) -> usize;

    fn name(&self) -> &str;
}

fn encounter(a: usize, b: usize, games: u32, flip: bool, schedule: &mut Vec<Pairing>) {
    for game in 0..games {
        let (white, black) = if (game % 2 == 0) != flip {
            (a, b)
        } else {
            (b, a)
        };
        schedule.push(Pairing {
            white,
            black,
            encounter_game: game,
        });
    }
}

/// Rounds of the circle method: each unordered pair exactly once, nobody plays twice in
/// one round. A dummy player gives odd fields their byes.
fn circle_rounds(n: usize) -> Vec<Vec<(usize, usize)>> {
    let m = n + n % 2;
    if m < 2 {
        return vec![];
    }
    let mut rounds = vec![];
    for round in 0..m - 1 {
        let mut pairs = vec![];
        for i in 0..m / 2 {
            let (a, b) = if i == 0 {
                (m - 1, round)
            } else {
                ((round + i) % (m - 1), (round + m - 1 - i) % (m - 1))
            };
            if a < n && b < n {
                pairs.push((a.min(b), a.max(b)));
            }
        }
        rounds.push(pairs);
    }
    rounds
}

/// Every player meets every other player `games_per_encounter × rounds` times.
#[derive(Debug, Clone)]
pub struct RoundRobinTournament {
    games_per_encounter: u32,
    rounds: u32,
    schedule: Vec<Pairing>,
}

impl RoundRobinTournament {
    /// Panics if `games_per_encounter` or `rounds` is zero.
    pub fn new(games_per_encounter: u32, rounds: u32) -> Self {
        assert!(
            games_per_encounter >= 1 && rounds >= 1,
            "Must play at least one game per encounter and one round."
        );
        RoundRobinTournament {
            games_per_encounter,
            rounds,
            schedule: vec![],
        }
    }
}

impl TournamentStrategy for RoundRobinTournament {
    fn init(&mut self, player_count: usize) {
        self.schedule.clear();
        let cycle = circle_rounds(player_count);
        for round in 0..self.rounds {
            for (i, pairs) in cycle.iter().enumerate() {
                for &(a, b) in pairs {
                    // colors of the first game alternate from one meeting to the next
                    let flip = (round as usize + i) % 2 == 1;
                    encounter(a, b, self.games_per_encounter, flip, &mut self.schedule);
                }
            }
        }
        debug!(
            "round-robin of {player_count} players: {} games",
            self.schedule.len()
        );
    }

    fn next_pair(&mut self, game_index: usize) -> Option<Pairing> {
        self.schedule.get(game_index).copied()
    }

    fn final_game_count(&self) -> usize {
        self.schedule.len()
    }

    fn name(&self) -> &str {
        "round-robin"
    }
}

/// Player `0` meets every other player `games_per_encounter × rounds` times.
#[derive(Debug, Clone)]
pub struct GauntletTournament {
    games_per_encounter: u32,
    rounds: u32,
    schedule: Vec<Pairing>,
}

impl GauntletTournament {
    /// Panics if `games_per_encounter` or `rounds` is zero.
    pub fn new(games_per_encounter: u32, rounds: u32) -> Self {
        assert!(
            games_per_encounter >= 1 && rounds >= 1,
            "Must play at least one game per encounter and one round."
        );
        GauntletTournament {
            games_per_encounter,
            rounds,
            schedule: vec![],
        }
    }
}

impl TournamentStrategy for GauntletTournament {
    fn init(&mut self, player_count: usize) {
        self.schedule.clear();
        for round in 0..self.rounds {
            for opponent in 1..player_count {
                let flip = round % 2 == 1;
                encounter(0, opponent, self.games_per_encounter, flip, &mut self.schedule);
            }
        }
        debug!(
            "gauntlet of {player_count} players: {} games",
            self.schedule.len()
        );
    }

    fn next_pair(&mut self, game_index: usize) -> Option<Pairing> {
        self.schedule.get(game_index).copied()
    }

    fn final_game_count(&self) -> usize {
        self.schedule.len()
    }

    fn name(&self) -> &str {
        "gauntlet"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn all_pairs(strategy: &mut dyn TournamentStrategy) -> Vec<Pairing> {
        (0..)
            .map_while(|i| strategy.next_pair(i))
            .collect()
    }

    /// games per unordered pair, and (white, black) games per player
    fn census(pairs: &[Pairing]) -> (HashMap<(usize, usize), u32>, HashMap<usize, (u32, u32)>) {
        let mut meetings = HashMap::new();
        let mut colors: HashMap<usize, (u32, u32)> = HashMap::new();
        for p in pairs {
            assert_ne!(p.white, p.black);
            *meetings
                .entry((p.white.min(p.black), p.white.max(p.black)))
                .or_default() += 1;
            colors.entry(p.white).or_default().0 += 1;
            colors.entry(p.black).or_default().1 += 1;
        }
        (meetings, colors)
    }

    #[test]
    fn two_player_match_alternates_colors() {
        let mut rr = RoundRobinTournament::new(2, 3);
        rr.init(2);
        let pairs = all_pairs(&mut rr);
        assert_eq!(rr.final_game_count(), 6);
        assert_eq!(pairs.len(), 6);
        assert_eq!((pairs[0].white, pairs[0].black), (0, 1));
        assert_eq!((pairs[1].white, pairs[1].black), (1, 0));
        assert_eq!(pairs[1].encounter_game, 1);
        let (_, colors) = census(&pairs);
        assert_eq!(colors[&0], (3, 3));
    }

    #[test]
    fn round_robin_is_balanced() {
        for n in 3..=7 {
            let mut rr = RoundRobinTournament::new(2, 1);
            rr.init(n);
            let pairs = all_pairs(&mut rr);
            assert_eq!(pairs.len(), n * (n - 1));
            let (meetings, colors) = census(&pairs);
            assert_eq!(meetings.len(), n * (n - 1) / 2);
            assert!(meetings.values().all(|&m| m == 2));
            for (white, black) in colors.values() {
                assert_eq!(white, black);
            }
        }

        let mut single = RoundRobinTournament::new(1, 1);
        single.init(1);
        assert_eq!(single.final_game_count(), 0);
        assert_eq!(single.next_pair(0), None);
    }

    #[test]
    fn gauntlet_only_pairs_the_first_player() {
        let mut gauntlet = GauntletTournament::new(1, 2);
        gauntlet.init(4);
        let pairs = all_pairs(&mut gauntlet);
        assert_eq!(pairs.len(), 6);
        assert!(pairs.iter().all(|p| p.white == 0 || p.black == 0));
        let (meetings, colors) = census(&pairs);
        assert_eq!(meetings[&(0, 3)], 2);
        assert_eq!(colors[&0], (3, 3));
    }
}
