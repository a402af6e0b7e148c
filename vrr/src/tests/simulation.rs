//! Randomized whole-cluster runs: seeded fault schedules (message delays,
//! drops, primary crashes) with clients pumping requests until everything
//! converges. Invariants are checked continuously.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::SubmitOutcome;

use super::{
    harness::{Cluster, FaultPlan},
    invariants::check_invariants,
};

#[derive(Debug, Clone, Copy)]
struct Workload {
    clients: usize,
    requests_per_client: usize,
}

impl Default for Workload {
    fn default() -> Self {
        Workload {
            clients: 3,
            requests_per_client: 10,
        }
    }
}

const CLIENT_RETRY: Duration = Duration::from_millis(200);
const MAX_VIRTUAL_TIME: Duration = Duration::from_secs(30);
const INVARIANT_EVERY_STEPS: u64 = 10;

/// Run one seeded simulation to convergence and return the virtual time it
/// took. Panics on any invariant violation or on failure to converge.
fn run_single_simulation(
    seed: u64,
    replica_count: usize,
    plan: FaultPlan,
    workload: Workload,
) -> Duration {
    let crashes_planned = plan.crashes;
    let mut cluster = Cluster::new(replica_count, seed, plan);
    let quorum = replica_count / 2 + 1;

    // Per-client position: the next request waiting to commit.
    let mut next_request = vec![1usize; workload.clients];
    let mut last_attempt: Vec<Option<Instant>> = vec![None; workload.clients];
    let mut crashes_done = 0;
    let mut steps = 0u64;

    loop {
        cluster.step();
        steps += 1;

        // Crash the sitting primary partway through the fault window.
        if crashes_done < crashes_planned
            && cluster.elapsed() >= Duration::from_millis(500) * (crashes_done as u32 + 1)
        {
            crashes_done += 1;
            let live = cluster.replica_count() - cluster.down_count();
            if live > quorum {
                let victim = cluster
                    .current_primary()
                    .unwrap_or_else(|| cluster.up.iter().position(|up| *up).unwrap());
                cluster.crash(victim);
            }
        }

        for client_id in 0..workload.clients {
            let request_num = next_request[client_id];
            if request_num > workload.requests_per_client {
                continue;
            }
            if cluster.request_committed(client_id, request_num) {
                next_request[client_id] = request_num + 1;
                last_attempt[client_id] = None;
                continue;
            }
            let due = match last_attempt[client_id] {
                None => true,
                Some(at) => cluster.now - at >= CLIENT_RETRY,
            };
            if due {
                if let Some(primary) = cluster.current_primary() {
                    let outcome = cluster.submit(primary, client_id, request_num);
                    if matches!(outcome, SubmitOutcome::Duplicate(_)) {
                        next_request[client_id] = request_num + 1;
                        last_attempt[client_id] = None;
                    } else {
                        last_attempt[client_id] = Some(cluster.now);
                    }
                }
            }
        }

        if steps % INVARIANT_EVERY_STEPS == 0 {
            check_invariants(&mut cluster, seed);
        }

        if next_request
            .iter()
            .all(|next| *next > workload.requests_per_client)
        {
            break;
        }
        assert!(
            cluster.elapsed() < MAX_VIRTUAL_TIME,
            "seed {}: cluster did not converge",
            seed
        );
    }

    // Let heartbeats carry the final commit point to the backups, then make
    // sure every live replica ended up with the whole history.
    cluster.run_for(Duration::from_secs(1));
    check_invariants(&mut cluster, seed);
    let total_requests = workload.clients * workload.requests_per_client;
    for id in 0..cluster.replica_count() {
        if cluster.up[id] {
            assert_eq!(
                cluster.replicas[id].commit_number(),
                total_requests,
                "seed {}: replica {} is missing commits",
                seed,
                id
            );
        }
    }
    cluster.elapsed()
}

fn run_simulation(
    seeds: std::ops::Range<u64>,
    replica_count: usize,
    plan: FaultPlan,
    workload: Workload,
) -> Duration {
    seeds
        .into_par_iter()
        .map(|seed| run_single_simulation(seed, replica_count, plan.clone(), workload))
        .sum()
}

#[test]
fn no_faults_quick_convergence() {
    let plan = FaultPlan {
        drop_probability: 0.0,
        fault_window: Duration::ZERO,
        crashes: 0,
        ..FaultPlan::default()
    };
    let duration = run_simulation(0..20, 3, plan, Workload::default());
    println!("total virtual duration: {:?}", duration);
}

#[test]
fn crashes_and_message_loss() {
    let duration = run_simulation(0..200, 3, FaultPlan::default(), Workload::default());
    println!("total virtual duration: {:?}", duration);
}

#[test]
fn larger_cluster() {
    let plan = FaultPlan {
        crashes: 2,
        ..FaultPlan::default()
    };
    let duration = run_simulation(0..50, 5, plan, Workload::default());
    println!("total virtual duration: {:?}", duration);
}

#[test]
fn lossy_network_no_crashes() {
    let plan = FaultPlan {
        drop_probability: 0.15,
        fault_window: Duration::from_secs(4),
        crashes: 0,
        ..FaultPlan::default()
    };
    let duration = run_simulation(0..100, 3, plan, Workload::default());
    println!("total virtual duration: {:?}", duration);
}

#[test]
fn single_seed_with_tracing() {
    let _ = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .pretty()
        .try_init();

    let duration = run_single_simulation(1, 3, FaultPlan::default(), Workload::default());
    println!("virtual duration: {:?}", duration);
}
