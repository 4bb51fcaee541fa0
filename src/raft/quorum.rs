//! Aggregation of one round of concurrent peer calls.
//!
//! A [`QuorumCall`] is created for every election attempt and every heartbeat
//! tick. Each in-flight call reports exactly one [`Outcome`]; the round
//! decides as soon as enough positive replies have arrived, or as soon as the
//! remaining outstanding calls can no longer make up the difference. After
//! the decision all counts are frozen and late outcomes are ignored.

use tokio::sync::watch;

/// What a single peer call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The transport reported failure (peer down, message lost, timeout).
    Unreachable,
    /// The peer answered. `accepted` is the application-level verdict.
    Replied { accepted: bool },
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// At least `needed` positive replies arrived.
    Reached,
    /// Too few calls remain outstanding to ever reach `needed`.
    Lost,
    /// The caller gave up on the round.
    Cancelled,
}

/// Counters of a round. Frozen once the round has decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub total: usize,
    pub completed: usize,
    pub alive: usize,
    pub granted: usize,
}

impl Tally {
    pub fn outstanding(&self) -> usize {
        self.total - self.completed
    }
}

#[derive(Debug, Clone, Copy)]
struct Round {
    tally: Tally,
    needed: usize,
    decision: Option<Decision>,
}

impl Round {
    fn evaluate(&self) -> Option<Decision> {
        if self.tally.granted >= self.needed {
            Some(Decision::Reached)
        } else if self.tally.granted + self.tally.outstanding() < self.needed {
            Some(Decision::Lost)
        } else {
            None
        }
    }
}

/// One round of `total` concurrent calls that needs `needed` positive replies.
///
/// The counters live inside a `watch` channel, so every update and the wake-up
/// of waiters happen under the channel's own lock.
#[derive(Debug)]
pub struct QuorumCall {
    round: watch::Sender<Round>,
}

impl QuorumCall {
    /// A round where `needed` is zero (a single-node cluster) is decided at
    /// construction.
    pub fn new(total: usize, needed: usize) -> Self {
        let mut round = Round {
            tally: Tally {
                total,
                ..Tally::default()
            },
            needed,
            decision: None,
        };
        round.decision = round.evaluate();
        let (round, _) = watch::channel(round);
        Self { round }
    }

    /// Record the outcome of one call. Returns the decision if this outcome
    /// is the one that decided the round. No-op once decided.
    pub fn record(&self, outcome: Outcome) -> Option<Decision> {
        let mut decided = None;
        self.round.send_if_modified(|round| {
            if round.decision.is_some() || round.tally.completed >= round.tally.total {
                return false;
            }
            round.tally.completed += 1;
            if let Outcome::Replied { accepted } = outcome {
                round.tally.alive += 1;
                if accepted {
                    round.tally.granted += 1;
                }
            }
            round.decision = round.evaluate();
            decided = round.decision;
            decided.is_some()
        });
        decided
    }

    /// Force the round to decide, e.g. after a newer term was observed.
    pub fn cancel(&self) {
        self.round.send_if_modified(|round| {
            if round.decision.is_some() {
                return false;
            }
            round.decision = Some(Decision::Cancelled);
            true
        });
    }

    pub fn decision(&self) -> Option<Decision> {
        self.round.borrow().decision
    }

    pub fn is_decided(&self) -> bool {
        self.decision().is_some()
    }

    pub fn tally(&self) -> Tally {
        self.round.borrow().tally
    }

    /// Wait until the round decides. Returns immediately if it already has.
    pub async fn wait(&self) -> Decision {
        let mut rx = self.round.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let decision = match rx.wait_for(|round| round.decision.is_some()).await {
            Ok(round) => round.decision.unwrap_or(Decision::Cancelled),
            Err(_) => Decision::Cancelled,
        };
        decision
    }
}
