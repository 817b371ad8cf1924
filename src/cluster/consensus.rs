//! Resource-group ownership consensus state
//!
//! A master that wants to manage an unassigned group proposes the
//! claim to its connected peers and commits it against the global
//! state once a quorum of votes arrives and the pass rule holds.
//! Voters remember granted YAYs for a bounded window so they cannot
//! flip sides while the proposer is still committing.

use std::collections::HashMap;

use rand::Rng;
use tracing::debug;

use crate::DEFAULT_AGE_TIMEOUT_SECS;

/// Extra seconds kept on top of the configured age timeout, covering
/// the randomized age jitter proposals start with
pub const AGE_TIMEOUT_HEADROOM_SECS: i64 = 5;

/// Default pass rate for the yay/nay ratio rule
pub const DEFAULT_PASS_RATE: f64 = 0.5;

/// Operation a proposal asks the voters to approve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOperation {
    Manage,
    Unmanage,
}

impl ResourceOperation {
    /// Wire name of the operation
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceOperation::Manage => "MANAGE",
            ResourceOperation::Unmanage => "UNMANAGE",
        }
    }

    /// Parse the wire name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MANAGE" => Some(ResourceOperation::Manage),
            "UNMANAGE" => Some(ResourceOperation::Unmanage),
            _ => None,
        }
    }
}

/// A voter's answer to a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Yay,
    Nay,
}

impl Vote {
    /// Wire name of the vote
    pub fn as_str(&self) -> &'static str {
        match self {
            Vote::Yay => "YAY",
            Vote::Nay => "NAY",
        }
    }
}

/// An in-flight ownership request by one master
#[derive(Debug, Clone)]
pub struct Proposal {
    manager_id: String,
    operation: ResourceOperation,
    group: String,
    age: i64,
    quorum: usize,
    yay: Vec<String>,
    nay: Vec<String>,
}

impl Proposal {
    /// Create a proposal.
    ///
    /// The age starts with a small random jitter so proposals created
    /// in the same second by different masters expire apart.
    pub fn new(
        manager_id: impl Into<String>,
        operation: ResourceOperation,
        group: impl Into<String>,
        quorum: usize,
    ) -> Self {
        Self {
            manager_id: manager_id.into(),
            operation,
            group: group.into(),
            age: rand::thread_rng().gen_range(0..10),
            quorum,
            yay: Vec::new(),
            nay: Vec::new(),
        }
    }

    /// Id of the proposing manager
    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    /// Operation being proposed
    pub fn operation(&self) -> ResourceOperation {
        self.operation
    }

    /// Resource group in question
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Current age in seconds
    pub fn age(&self) -> i64 {
        self.age
    }

    /// Age the proposal by one second
    pub fn increment_age(&mut self) {
        self.age += 1;
    }

    /// Register a vote. Single-shot per voter: a manager already
    /// recorded on either side cannot change sides.
    pub fn vote(&mut self, manager_id: &str, vote: Vote) -> bool {
        if self.yay.iter().any(|voter| voter == manager_id)
            || self.nay.iter().any(|voter| voter == manager_id)
        {
            return false;
        }
        match vote {
            Vote::Yay => self.yay.push(manager_id.to_string()),
            Vote::Nay => self.nay.push(manager_id.to_string()),
        }
        true
    }

    /// Whether enough votes arrived to decide
    pub fn met_quorum(&self) -> bool {
        self.yay.len() + self.nay.len() >= self.quorum
    }

    /// Ratio pass rule: no nays at all, or yay/nay above the rate
    pub fn passed(&self, pass_rate: f64) -> bool {
        self.nay.is_empty() || (self.yay.len() as f64 / self.nay.len() as f64) > pass_rate
    }
}

/// A granted vote remembered for a bounded window
#[derive(Debug, Clone)]
pub struct VoteRecord {
    manager_id: String,
    vote: Vote,
    remaining_secs: i64,
}

impl VoteRecord {
    /// Remember a vote for the given number of seconds
    pub fn new(manager_id: impl Into<String>, vote: Vote, expiry_secs: i64) -> Self {
        Self {
            manager_id: manager_id.into(),
            vote,
            remaining_secs: expiry_secs,
        }
    }

    /// Manager the vote was granted to
    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    /// The remembered vote
    pub fn vote(&self) -> Vote {
        self.vote
    }

    /// Count down one second
    pub fn decrement(&mut self) {
        if self.remaining_secs > 0 {
            self.remaining_secs -= 1;
        }
    }

    /// Whether the window has closed
    pub fn expired(&self) -> bool {
        self.remaining_secs <= 0
    }
}

/// Tunables for the consensus loop
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Proposals older than this are abandoned; valid range (10, 180)
    pub age_timeout: i64,
    /// Pass rate for the yay/nay ratio rule. Note this is a ratio, not
    /// a majority: at the default 0.5, two yays survive three nays.
    pub pass_rate: f64,
    /// Ceiling on concurrently managed groups; None is unlimited
    pub max_managed_groups: Option<usize>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            age_timeout: DEFAULT_AGE_TIMEOUT_SECS,
            pass_rate: DEFAULT_PASS_RATE,
            max_managed_groups: None,
        }
    }
}

/// Proposal and voting-history state held by one manager
pub struct ConsensusState {
    pending: HashMap<String, Proposal>,
    voted_on: HashMap<String, VoteRecord>,
    /// Groups queued for release, retried until the drop commits
    removed: Vec<Proposal>,
    age_timeout: i64,
    pass_rate: f64,
}

impl ConsensusState {
    /// Create the state from its config; the stored age timeout keeps
    /// internal headroom for the proposal age jitter
    pub fn new(config: &ConsensusConfig) -> Self {
        Self {
            pending: HashMap::new(),
            voted_on: HashMap::new(),
            removed: Vec::new(),
            age_timeout: config.age_timeout + AGE_TIMEOUT_HEADROOM_SECS,
            pass_rate: config.pass_rate,
        }
    }

    /// Set the request age timeout; only values strictly between 10 and
    /// 180 seconds are accepted
    pub fn set_age_timeout(&mut self, secs: i64) -> bool {
        if secs <= 10 || secs >= 180 {
            return false;
        }
        self.age_timeout = secs + AGE_TIMEOUT_HEADROOM_SECS;
        true
    }

    /// Stored age timeout, headroom included
    pub fn age_timeout(&self) -> i64 {
        self.age_timeout
    }

    /// Whether a claim for this group is already pending or was granted
    /// a YAY to anyone
    pub fn has_local_history(&self, group: &str) -> bool {
        if self.pending.contains_key(group) {
            return true;
        }
        self.voted_on
            .get(group)
            .map(|record| record.vote() == Vote::Yay)
            .unwrap_or(false)
    }

    /// Track a new outgoing proposal
    pub fn insert_pending(&mut self, proposal: Proposal) {
        self.pending.insert(proposal.group().to_string(), proposal);
    }

    /// Whether a proposal for the group is pending
    pub fn is_pending(&self, group: &str) -> bool {
        self.pending.contains_key(group)
    }

    /// Number of pending proposals
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Register a peer's vote on a pending proposal
    pub fn register_vote(&mut self, group: &str, voter: &str, vote: Vote) -> bool {
        match self.pending.get_mut(group) {
            Some(proposal) => proposal.vote(voter, vote),
            None => false,
        }
    }

    /// Drop a proposal, after its claim committed
    pub fn remove_pending(&mut self, group: &str) {
        self.pending.remove(group);
    }

    /// Advance every pending proposal by one tick.
    ///
    /// Decided-and-failed proposals and proposals past the age timeout
    /// are dropped; survivors age by one second. Returns the groups
    /// whose proposal is decided, passed, and ready to commit while
    /// this node holds quorum.
    pub fn advance_pending(&mut self, in_quorum: bool) -> Vec<String> {
        let mut ready = Vec::new();
        let mut dropped = Vec::new();

        for (group, proposal) in &self.pending {
            let decided = proposal.operation() == ResourceOperation::Manage
                && in_quorum
                && proposal.met_quorum();
            if proposal.age() > self.age_timeout {
                debug!("Proposal for {} aged out", group);
                dropped.push(group.clone());
            } else if decided && proposal.passed(self.pass_rate) {
                ready.push(group.clone());
            } else if decided {
                debug!("Proposal for {} was voted down", group);
                dropped.push(group.clone());
            }
        }

        for group in dropped {
            self.pending.remove(&group);
        }
        for proposal in self.pending.values_mut() {
            proposal.increment_age();
        }
        ready
    }

    /// Answer an incoming vote request.
    ///
    /// YAY when the group is entirely unknown locally, YAY again for
    /// the proposer a YAY is already remembered for, NAY otherwise.
    /// Our own YAY is what gets remembered, with a jittered expiry.
    pub fn handle_vote_request(&mut self, manager_id: &str, group: &str) -> Vote {
        let pending = self.pending.contains_key(group);
        let record = self.voted_on.get(group);

        let vote = if !pending && record.is_none() {
            Vote::Yay
        } else if !pending
            && record
                .map(|existing| {
                    existing.vote() == Vote::Yay && existing.manager_id() == manager_id
                })
                .unwrap_or(false)
        {
            Vote::Yay
        } else {
            Vote::Nay
        };

        if vote == Vote::Yay && !self.voted_on.contains_key(group) {
            let jitter_bound = (self.age_timeout / 2).max(1);
            let expiry = self.age_timeout + rand::thread_rng().gen_range(0..jitter_bound);
            self.voted_on.insert(
                group.to_string(),
                VoteRecord::new(manager_id, Vote::Yay, expiry),
            );
        }
        vote
    }

    /// Count down the voting history, forgetting expired grants
    pub fn tick_vote_history(&mut self) {
        let mut expired = Vec::new();
        for (group, record) in &mut self.voted_on {
            record.decrement();
            if record.expired() {
                expired.push(group.clone());
            }
        }
        for group in expired {
            debug!("Voting history for {} expired", group);
            self.voted_on.remove(&group);
        }
    }

    /// Whether a YAY is currently remembered for the group
    pub fn has_vote_record(&self, group: &str) -> bool {
        self.voted_on.contains_key(group)
    }

    /// Queue a managed group for release
    pub fn queue_release(&mut self, manager_id: &str, group: &str) {
        if self
            .removed
            .iter()
            .any(|proposal| proposal.group() == group)
        {
            return;
        }
        self.removed.push(Proposal::new(
            manager_id,
            ResourceOperation::Unmanage,
            group,
            0,
        ));
    }

    /// Groups currently queued for release
    pub fn release_snapshot(&self) -> Vec<String> {
        self.removed
            .iter()
            .map(|proposal| proposal.group().to_string())
            .collect()
    }

    /// Forget a queued release once its drop committed
    pub fn clear_release(&mut self, group: &str) {
        self.removed.retain(|proposal| proposal.group() != group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConsensusConfig {
        ConsensusConfig::default()
    }

    #[test]
    fn test_vote_is_single_shot() {
        let mut proposal = Proposal::new("n1", ResourceOperation::Manage, "g1", 2);
        assert!(proposal.vote("n2", Vote::Yay));
        assert!(!proposal.vote("n2", Vote::Nay));
        assert!(!proposal.vote("n2", Vote::Yay));
        assert!(proposal.vote("n3", Vote::Nay));

        assert!(proposal.met_quorum());
        // 1 yay / 1 nay = 1.0 > 0.5: passes
        assert!(proposal.passed(DEFAULT_PASS_RATE));
    }

    #[test]
    fn test_pass_rate_is_a_ratio_not_a_majority() {
        let mut proposal = Proposal::new("n1", ResourceOperation::Manage, "g1", 5);
        proposal.vote("n2", Vote::Yay);
        proposal.vote("n3", Vote::Yay);
        proposal.vote("n4", Vote::Nay);
        proposal.vote("n5", Vote::Nay);
        proposal.vote("n6", Vote::Nay);

        // 2 yay / 3 nay = 0.666 > 0.5: passes despite fewer yays
        assert!(proposal.passed(0.5));
        // A stricter rate turns it into a failure
        assert!(!proposal.passed(1.0));
    }

    #[test]
    fn test_no_nays_always_passes() {
        let proposal = Proposal::new("n1", ResourceOperation::Manage, "g1", 1);
        assert!(proposal.passed(100.0));
    }

    #[test]
    fn test_age_jitter_is_bounded() {
        for _ in 0..50 {
            let proposal = Proposal::new("n1", ResourceOperation::Manage, "g1", 1);
            assert!((0..10).contains(&proposal.age()));
        }
    }

    #[test]
    fn test_advance_commits_passed_proposals() {
        let mut state = ConsensusState::new(&config());
        let mut proposal = Proposal::new("n1", ResourceOperation::Manage, "g1", 2);
        proposal.vote("n2", Vote::Yay);
        proposal.vote("n3", Vote::Yay);
        state.insert_pending(proposal);

        let ready = state.advance_pending(true);
        assert_eq!(ready, vec!["g1"]);
        // Still pending until the claim actually commits
        assert!(state.is_pending("g1"));

        state.remove_pending("g1");
        assert!(!state.is_pending("g1"));
    }

    #[test]
    fn test_advance_drops_failed_proposals() {
        let mut state = ConsensusState::new(&config());
        let mut proposal = Proposal::new("n1", ResourceOperation::Manage, "g1", 2);
        proposal.vote("n2", Vote::Nay);
        proposal.vote("n3", Vote::Nay);
        state.insert_pending(proposal);

        let ready = state.advance_pending(true);
        assert!(ready.is_empty());
        assert!(!state.is_pending("g1"));
    }

    #[test]
    fn test_advance_waits_for_quorum_membership() {
        let mut state = ConsensusState::new(&config());
        let mut proposal = Proposal::new("n1", ResourceOperation::Manage, "g1", 2);
        proposal.vote("n2", Vote::Yay);
        proposal.vote("n3", Vote::Yay);
        state.insert_pending(proposal);

        // Out of quorum: the decided proposal neither commits nor drops
        let ready = state.advance_pending(false);
        assert!(ready.is_empty());
        assert!(state.is_pending("g1"));
    }

    #[test]
    fn test_proposals_age_out() {
        let mut state = ConsensusState::new(&config());
        state.insert_pending(Proposal::new("n1", ResourceOperation::Manage, "g1", 99));

        // Never reaches quorum; ages one second per tick until the
        // timeout (30 + 5 headroom + initial jitter < 50 ticks) drops it
        let mut survived = 0;
        for _ in 0..50 {
            state.advance_pending(true);
            if state.is_pending("g1") {
                survived += 1;
            }
        }
        assert!(!state.is_pending("g1"));
        // Timeout 35 minus the at-most-9 initial jitter
        assert!(survived >= 25, "proposal dropped far too early");
    }

    #[test]
    fn test_vote_request_decision_rules() {
        let mut state = ConsensusState::new(&config());

        // Unknown group: granted and remembered
        assert_eq!(state.handle_vote_request("n2", "g1"), Vote::Yay);
        assert!(state.has_vote_record("g1"));

        // Same proposer asks again: idempotent re-grant
        assert_eq!(state.handle_vote_request("n2", "g1"), Vote::Yay);

        // A different proposer is refused while the grant stands
        assert_eq!(state.handle_vote_request("n3", "g1"), Vote::Nay);

        // A group we are proposing ourselves is refused
        state.insert_pending(Proposal::new("n1", ResourceOperation::Manage, "g2", 1));
        assert_eq!(state.handle_vote_request("n2", "g2"), Vote::Nay);
    }

    #[test]
    fn test_vote_history_expires() {
        let mut state = ConsensusState::new(&config());
        state.set_age_timeout(11);
        state.handle_vote_request("n2", "g1");

        // Expiry is at most age_timeout + age_timeout/2 ticks
        for _ in 0..24 {
            state.tick_vote_history();
        }
        assert!(!state.has_vote_record("g1"));

        // With the grant forgotten, another proposer succeeds
        assert_eq!(state.handle_vote_request("n3", "g1"), Vote::Yay);
    }

    #[test]
    fn test_age_timeout_bounds() {
        let mut state = ConsensusState::new(&config());
        assert!(!state.set_age_timeout(10));
        assert!(!state.set_age_timeout(180));
        assert!(state.set_age_timeout(11));
        assert_eq!(state.age_timeout(), 11 + AGE_TIMEOUT_HEADROOM_SECS);
        assert!(state.set_age_timeout(179));
    }

    #[test]
    fn test_release_queue_deduplicates() {
        let mut state = ConsensusState::new(&config());
        state.queue_release("n1", "g1");
        state.queue_release("n1", "g1");
        assert_eq!(state.release_snapshot(), vec!["g1"]);

        state.clear_release("g1");
        assert!(state.release_snapshot().is_empty());
    }
}
