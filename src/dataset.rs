use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::player_ratings::Position;

/// One finished match as supplied by the loader collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchRecord {
    pub round: u32,
    pub home_id: u32,
    pub away_id: u32,
    pub home_goals: u32,
    pub away_goals: u32,
}

/// One player-round row: the player's own counts plus the team totals that
/// act as exposure for the propensity filters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlayerRound {
    pub round: u32,
    pub player_id: u32,
    pub position: Position,
    pub goals: u32,
    pub assists: u32,
    pub team_goals: u32,
    pub team_assists: u32,
}

#[derive(Debug, Clone)]
pub struct Round {
    pub round: u32,
    pub matches: Vec<MatchRecord>,
}

/// Groups matches by round, ascending. Input order within a round is kept.
pub fn group_by_round(mut records: Vec<MatchRecord>) -> Vec<Round> {
    records.sort_by_key(|record| record.round);
    let mut rounds: Vec<Round> = Vec::new();
    for record in records {
        match rounds.last_mut() {
            Some(last) if last.round == record.round => last.matches.push(record),
            _ => rounds.push(Round {
                round: record.round,
                matches: vec![record],
            }),
        }
    }
    rounds
}

/// Sorts player rows into ascending round order, keeping input order within a
/// round.
pub fn sort_player_rounds(mut rows: Vec<PlayerRound>) -> Vec<PlayerRound> {
    rows.sort_by_key(|row| row.round);
    rows
}

pub fn load_match_records(path: &Path) -> Result<Vec<MatchRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read match records {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse match records {}", path.display()))
}

pub fn load_player_rounds(path: &Path) -> Result<Vec<PlayerRound>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read player rounds {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse player rounds {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(round: u32, home_id: u32) -> MatchRecord {
        MatchRecord {
            round,
            home_id,
            away_id: home_id + 100,
            home_goals: 1,
            away_goals: 0,
        }
    }

    #[test]
    fn grouping_sorts_rounds_ascending() {
        let rounds = group_by_round(vec![record(3, 1), record(1, 2), record(3, 3), record(2, 4)]);
        assert_eq!(
            rounds.iter().map(|r| r.round).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(rounds[2].matches.len(), 2);
        // stable within the round
        assert_eq!(rounds[2].matches[0].home_id, 1);
        assert_eq!(rounds[2].matches[1].home_id, 3);
    }

    #[test]
    fn player_round_json_shape() {
        let raw = r#"[{"round": 2, "player_id": 55, "position": 4,
                       "goals": 1, "assists": 0, "team_goals": 3, "team_assists": 2}]"#;
        let rows: Vec<PlayerRound> = serde_json::from_str(raw).unwrap();
        assert_eq!(rows[0].position, Position::Forward);
        assert_eq!(rows[0].team_goals, 3);
    }
}
