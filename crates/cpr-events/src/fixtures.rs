//! Sample data fixtures for testing.
//!
//! Enable the `test-fixtures` feature to access these helpers.
//!
//! ```ignore
//! // [dev-dependencies]
//! // cpr-events = { path = "../cpr-events", features = ["test-fixtures"] }
//!
//! let record = cpr_events::fixtures::sample_turn_record();
//! ```

use crate::{AgentId, AgentRecord, PoolFlows, TeamId, TeamRecord, TurnRecord};

/// Three-agent team after one turn under a flat quota of 10.
///
/// Agents contribute 10, 10 and 5; the third is flagged and has one offence.
pub fn sample_turn_record() -> TurnRecord {
    let team = TeamId::from_random_bytes([0x10; 16]);
    let agents: Vec<AgentId> = (1..=3u8)
        .map(|n| AgentId::from_random_bytes([n; 16]))
        .collect();

    let contributions = [10, 10, 5];
    let mut record = TurnRecord::new(0, 1);
    for (i, id) in agents.iter().enumerate() {
        record.agents.push(AgentRecord {
            agent_id: *id,
            team_id: Some(team),
            score: 50 - contributions[i] + 8,
            turn_score: 12,
            stated_contribution: 10,
            actual_contribution: contributions[i],
            stated_withdrawal: 8,
            actual_withdrawal: 8,
            rank: None,
            offences: if i == 2 { 1 } else { 0 },
            alive: true,
        });
    }
    record.teams.push(TeamRecord {
        team_id: team,
        common_pool: 1,
        policy_id: "flat_quota".to_string(),
        rank_boundaries: None,
        leader: None,
        member_count: 3,
        flows: PoolFlows {
            opening: 0,
            contributions: 25,
            withdrawals: 24,
            audit_costs: 0,
            closing: 1,
        },
    });
    record
}
