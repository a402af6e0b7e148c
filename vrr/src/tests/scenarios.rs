//! Directed end-to-end scenarios, driving replicas by hand with a virtual
//! clock and explicit message routing.

use std::time::{Duration, Instant};

use crate::{
    ClientRequest, Effect, Envelope, Protocol, Replica, ReplicaConfig, ReplicaStatus,
    SubmitOutcome,
};

use super::harness::{Cluster, FaultPlan, TestCommit, TestEffect, TestReplica};
use super::state_machine::TestOp;

fn ready_cluster(replica_count: usize) -> (Vec<TestReplica>, Instant) {
    let now = Instant::now();
    let mut replicas: Vec<TestReplica> = (0..replica_count)
        .map(|id| Replica::new(replica_count, id, ReplicaConfig::default()))
        .collect();
    for replica in &mut replicas {
        replica.ready(now);
    }
    (replicas, now)
}

fn request(client_id: usize, request_num: usize) -> ClientRequest<TestOp> {
    ClientRequest {
        client_id,
        request_num,
        operation: TestOp {
            client_id,
            request_num,
        },
    }
}

fn sends(effects: Vec<TestEffect>) -> Vec<Envelope<TestOp>> {
    effects
        .into_iter()
        .filter_map(|effect| match effect {
            Effect::Send(envelope) => Some(envelope),
            Effect::Commit(_) => None,
        })
        .collect()
}

fn commits(effects: &[TestEffect]) -> Vec<TestCommit> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::Commit(entry) => Some(entry.clone()),
            Effect::Send(_) => None,
        })
        .collect()
}

/// Deliver each envelope to its addressee and collect the produced effects.
fn deliver(
    replicas: &mut [TestReplica],
    envelopes: Vec<Envelope<TestOp>>,
    now: Instant,
) -> Vec<TestEffect> {
    let mut effects = Vec::new();
    for envelope in envelopes {
        let to = envelope.to;
        effects.extend(replicas[to].process(envelope, now));
    }
    effects
}

fn quiet_plan() -> FaultPlan {
    FaultPlan {
        drop_probability: 0.0,
        fault_window: Duration::ZERO,
        crashes: 0,
        ..FaultPlan::default()
    }
}

/// S1: one request through the full Prepare/PrepareOk/commit path on a
/// three-replica cluster.
#[test]
fn basic_commit() {
    let (mut replicas, now) = ready_cluster(3);

    let (outcome, effects) = replicas[0].submit(request(1, 1), now);
    assert!(outcome.is_accepted());
    let prepares = sends(effects);
    assert_eq!(prepares.len(), 2);

    let acks = sends(deliver(&mut replicas, prepares, now));
    for id in [1, 2] {
        assert_eq!(replicas[id].op_number(), 1);
        assert_eq!(replicas[id].commit_number(), 0);
    }

    let effects = deliver(&mut replicas, acks, now);
    let committed = commits(&effects);
    assert_eq!(committed.len(), 1);
    let entry = &committed[0];
    assert_eq!(entry.view_number, 0);
    assert_eq!(entry.op_number, 1);
    assert_eq!(entry.commit_number, 1);
    assert_eq!(entry.request.client_id, 1);
    assert_eq!(entry.reply.op_number, 1);

    assert_eq!(replicas[0].commit_number(), 1);
    assert_eq!(replicas[0].op_number(), 1);
}

/// S2: a duplicate of an executed request is rejected and surfaces the
/// cached reply; the log does not grow.
#[test]
fn duplicate_suppression() {
    let (mut replicas, now) = ready_cluster(3);

    let (_, effects) = replicas[0].submit(request(1, 1), now);
    let acks = sends(deliver(&mut replicas, sends(effects), now));
    deliver(&mut replicas, acks, now);
    assert_eq!(replicas[0].commit_number(), 1);

    let (outcome, effects) = replicas[0].submit(request(1, 1), now);
    assert!(!outcome.is_accepted());
    let SubmitOutcome::Duplicate(reply) = outcome else {
        panic!("expected the cached reply, got {:?}", outcome);
    };
    assert_eq!(reply.op_number, 1);
    assert!(effects.is_empty());
    assert_eq!(replicas[0].op_number(), 1);

    // A request older than the executed one is dropped outright.
    let (outcome, _) = replicas[0].submit(request(1, 0), now);
    assert_eq!(outcome, SubmitOutcome::Stale);
}

#[test]
fn submit_gating() {
    let (mut replicas, now) = ready_cluster(3);

    let (outcome, effects) = replicas[1].submit(request(1, 1), now);
    assert_eq!(outcome, SubmitOutcome::NotPrimary { primary: 0 });
    assert!(effects.is_empty());

    let mut unready: TestReplica = Replica::new(3, 0, ReplicaConfig::default());
    let (outcome, _) = unready.submit(request(1, 1), now);
    assert_eq!(outcome, SubmitOutcome::NotNormal);
    assert_eq!(unready.status(), ReplicaStatus::Transitioning);

    replicas[0].stop();
    let (outcome, _) = replicas[0].submit(request(1, 1), now);
    assert_eq!(outcome, SubmitOutcome::NotNormal);
}

/// S3: a silent primary is voted out; the next replica in rotation takes
/// over view 1.
#[test]
fn timeout_driven_view_change() {
    let mut cluster = Cluster::new(3, 7, quiet_plan());
    cluster.crash(0);

    cluster.run_until(Duration::from_secs(2), |cluster| {
        let one = cluster.replicas[1].report();
        let two = cluster.replicas[2].report();
        one.status == ReplicaStatus::Normal
            && one.view_number == 1
            && one.is_primary
            && two.status == ReplicaStatus::Normal
            && two.view_number == 1
    });
    assert!(!cluster.replicas[2].report().is_primary);
    assert_eq!(cluster.current_primary(), Some(1));
}

/// S4: the new primary adopts the longest log offered through
/// DoViewChange before announcing the view.
#[test]
fn log_adoption_on_view_change() {
    let (mut replicas, now) = ready_cluster(3);

    // Three requests; replica 2 sees all prepares, replica 1 only the
    // first two, replica 0 (the primary) never learns of any acks.
    for request_num in 1..=3 {
        let (outcome, effects) = replicas[0].submit(request(1, request_num), now);
        assert!(outcome.is_accepted());
        let to_deliver: Vec<_> = sends(effects)
            .into_iter()
            .filter(|envelope| envelope.to == 2 || request_num <= 2)
            .collect();
        deliver(&mut replicas, to_deliver, now);
    }
    assert_eq!(replicas[1].op_number(), 2);
    assert_eq!(replicas[2].op_number(), 3);

    let at = |millis: u64| now + Duration::from_millis(millis);

    // Replica 1 gives up on the primary and starts the change to view 1,
    // of which it is itself the next primary.
    assert!(sends(replicas[1].tick(at(400))).is_empty());
    assert_eq!(replicas[1].status(), ReplicaStatus::ViewChange);
    assert_eq!(replicas[1].view_number(), 1);

    let blast = sends(replicas[1].tick(at(405)));
    assert_eq!(blast.len(), 2);
    let to_two: Vec<_> = blast.into_iter().filter(|e| e.to == 2).collect();
    let acks = sends(deliver(&mut replicas, to_two, at(406)));
    assert_eq!(replicas[2].status(), ReplicaStatus::ViewChange);

    deliver(&mut replicas, acks, at(407));
    assert_eq!(replicas[1].status(), ReplicaStatus::DoViewChange);

    // Replica 2 blasts its own round, reaches the same quorum, and passes
    // its longer log to the new primary.
    let blast = sends(replicas[2].tick(at(410)));
    let to_one: Vec<_> = blast.into_iter().filter(|e| e.to == 1).collect();
    let acks = sends(deliver(&mut replicas, to_one, at(411)));
    deliver(&mut replicas, acks.into_iter().filter(|e| e.to == 2).collect(), at(412));
    assert_eq!(replicas[2].status(), ReplicaStatus::DoViewChange);

    let do_view_change = sends(replicas[2].tick(at(415)));
    assert_eq!(do_view_change.len(), 1);
    assert_eq!(do_view_change[0].to, 1);
    deliver(&mut replicas, do_view_change, at(416));

    // Quorum of logs reached: replica 1 adopted the three-entry log.
    assert_eq!(replicas[1].status(), ReplicaStatus::StartView);
    assert_eq!(replicas[1].op_number(), 3);

    let start_view = sends(replicas[1].tick(at(420)));
    assert!(replicas[1].is_primary());
    assert_eq!(replicas[1].status(), ReplicaStatus::Normal);

    let to_two: Vec<_> = start_view.into_iter().filter(|e| e.to == 2).collect();
    let effects = deliver(&mut replicas, to_two, at(421));
    assert_eq!(replicas[2].view_number(), 1);
    assert_eq!(replicas[2].status(), ReplicaStatus::Normal);
    assert_eq!(replicas[2].op_number(), 3);

    // The tail is still uncommitted; replica 2 re-acks it to the new
    // primary.
    let tail_acks: Vec<_> = sends(effects)
        .into_iter()
        .filter(|envelope| {
            matches!(&envelope.message, Protocol::PrepareOk(ok) if ok.acked && ok.op_number == 3)
        })
        .collect();
    assert_eq!(tail_acks.len(), 1);
    let effects = deliver(&mut replicas, tail_acks, at(422));
    assert_eq!(commits(&effects).len(), 3);
    assert_eq!(replicas[1].commit_number(), 3);
}

/// S5: a backup that spots a gap refuses the prepare and falls back to
/// state transfer.
#[test]
fn gap_detection() {
    let (mut replicas, now) = ready_cluster(3);

    for request_num in 1..=2 {
        let (_, effects) = replicas[0].submit(request(1, request_num), now);
        deliver(&mut replicas, sends(effects), now);
    }
    assert_eq!(replicas[1].op_number(), 2);

    // Two more submissions; replica 1 only ever sees the op-4 prepare.
    let (_, effects) = replicas[0].submit(request(1, 3), now);
    let held = sends(effects);
    assert!(held.iter().all(|e| matches!(&e.message, Protocol::Prepare(p) if p.op_number == 3)));
    let (_, effects) = replicas[0].submit(request(1, 4), now);
    let out_of_order: Vec<_> = sends(effects).into_iter().filter(|e| e.to == 1).collect();

    let effects = deliver(&mut replicas, out_of_order, now);
    assert_eq!(replicas[1].status(), ReplicaStatus::Recovery);
    assert_eq!(replicas[1].op_number(), 2);

    let envelopes = sends(effects);
    let rejected = envelopes
        .iter()
        .any(|e| matches!(&e.message, Protocol::PrepareOk(ok) if !ok.acked));
    assert!(rejected, "the gapped prepare must not be acknowledged");
    let get_state: Vec<_> = envelopes
        .into_iter()
        .filter(|e| matches!(&e.message, Protocol::GetState(_)) && e.to == 0)
        .collect();
    assert_eq!(get_state.len(), 1);

    // The primary serves the missing suffix and the backup rejoins.
    let new_state = sends(deliver(&mut replicas, get_state, now));
    assert_eq!(new_state.len(), 1);
    deliver(&mut replicas, new_state, now);
    assert_eq!(replicas[1].status(), ReplicaStatus::Normal);
    assert_eq!(replicas[1].op_number(), 4);
    assert_eq!(replicas[1].commit_number(), 0);
}

/// S6: steady heartbeats keep every election timer quiet.
#[test]
fn heartbeat_suppresses_election() {
    let mut cluster = Cluster::new(3, 11, quiet_plan());
    cluster.run_for(Duration::from_secs(2));

    for replica in &cluster.replicas {
        assert_eq!(replica.view_number(), 0);
        assert_eq!(replica.status(), ReplicaStatus::Normal);
    }
    assert_eq!(cluster.current_primary(), Some(0));
}

/// A backup that misses the tail of a burst catches up from the commit
/// heartbeat via state transfer.
#[test]
fn heartbeat_reveals_missing_commits() {
    let (mut replicas, now) = ready_cluster(3);

    // Replica 2 replicates and acks; replica 1 misses everything.
    for request_num in 1..=2 {
        let (_, effects) = replicas[0].submit(request(1, request_num), now);
        let to_two: Vec<_> = sends(effects).into_iter().filter(|e| e.to == 2).collect();
        let acks = sends(deliver(&mut replicas, to_two, now));
        deliver(&mut replicas, acks, now);
    }
    assert_eq!(replicas[0].commit_number(), 2);
    assert_eq!(replicas[1].op_number(), 0);

    // The next heartbeat tells replica 1 it is behind.
    let heartbeats = sends(replicas[0].tick(now + Duration::from_millis(60)));
    let to_one: Vec<_> = heartbeats.into_iter().filter(|e| e.to == 1).collect();
    assert_eq!(to_one.len(), 1);
    let effects = deliver(&mut replicas, to_one, now + Duration::from_millis(61));
    assert_eq!(replicas[1].status(), ReplicaStatus::Recovery);

    let get_state: Vec<_> = sends(effects)
        .into_iter()
        .filter(|e| matches!(&e.message, Protocol::GetState(_)))
        .collect();
    let new_state = sends(deliver(&mut replicas, get_state, now + Duration::from_millis(62)));
    let effects = deliver(&mut replicas, new_state, now + Duration::from_millis(63));
    assert_eq!(replicas[1].status(), ReplicaStatus::Normal);
    assert_eq!(replicas[1].commit_number(), 2);
    assert_eq!(commits(&effects).len(), 2);
}
