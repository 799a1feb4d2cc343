//! Team governance: vote tallies, chair agreement, ranks and the
//! articles of association each team adopts.

pub mod chair;
pub mod policy;
pub mod rank;
pub mod tally;

pub use chair::{AgreementOutcome, ChairAgreement};
pub use policy::{ArticlesOfAssociation, Assembly, Council, GovernanceRules, PolicyKind, Strictness};
pub use rank::{RankBoundaries, RankTable, DEFAULT_BOUNDARIES, MAX_RANK};
pub use tally::{instant_runoff, tally, Ballot, QuorumRule, TallyOutcome};
