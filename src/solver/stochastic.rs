// src/solver/stochastic.rs

//! Bounded local search
//!
//! Energy is the number of violated constraints. Each step picks one
//! violation at random and proposes a single change to one of the groups
//! involved. Proposals are drawn proportionally to learned per-candidate
//! weights; a proposal that lowers the energy reinforces the weight of the
//! candidate it chose. Worse proposals are accepted with probability
//! `exp(-delta / temperature)` and the temperature is multiplied by the
//! discount every step.

use super::{Assignment, Problem, SolverOptions, Violation};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

const INITIAL_TEMPERATURE: f64 = 1.0;
const MIN_TEMPERATURE: f64 = 1e-3;

/// Weight of the "leave this name out" move
const DROP_WEIGHT: f64 = 1.0;

/// One proposed change: set `group` to `rank` (or clear it)
#[derive(Debug, Clone, Copy)]
struct Move {
    group: usize,
    rank: Option<usize>,
}

pub(crate) fn solve(problem: &Problem, options: &SolverOptions) -> Result<Assignment, String> {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut weights = vec![1.0_f64; problem.candidates.len()];
    let learn_rate = f64::from(options.learn_rate);
    let discount = f64::from(options.discount);

    // Start from the newest admitted version of every request
    let mut assignment: Assignment = vec![None; problem.groups.len()];
    for request in &problem.requests {
        if let Some(g) = request.group {
            if assignment[g].is_none() {
                assignment[g] = request.best();
            }
        }
    }

    let mut energy = problem.energy(&assignment);
    let mut temperature = INITIAL_TEMPERATURE;
    let mut attempts = 0;

    while energy > 0 && attempts < options.max_attempts {
        attempts += 1;

        let violations = problem.violations(&assignment);
        let target = violations[rng.gen_range(0..violations.len())];
        let moves = candidate_moves(problem, &assignment, target);

        let picked = moves
            .choose_weighted(&mut rng, |m| weight(problem, &weights, m))
            .ok()
            .copied();

        if let Some(step) = picked {
            let mut proposal = assignment.clone();
            proposal[step.group] = step.rank;
            let proposed_energy = problem.energy(&proposal);
            let delta = proposed_energy as f64 - energy as f64;

            let accept = delta <= 0.0
                || rng.gen_bool((-delta / temperature).exp().clamp(0.0, 1.0));

            if accept {
                if delta < 0.0 {
                    if let Some(rank) = step.rank {
                        weights[problem.groups[step.group].members[rank]] += learn_rate;
                    }
                }
                assignment = proposal;
                energy = proposed_energy;
            }
        }

        temperature = (temperature * discount).max(MIN_TEMPERATURE);
    }

    if energy > 0 {
        return Err(format!(
            "no solution after {} attempts ({} constraints still violated)",
            attempts, energy
        ));
    }
    debug!("Stochastic search converged after {} attempts", attempts);

    upgrade(problem, &mut assignment);
    Ok(assignment)
}

fn weight(problem: &Problem, weights: &[f64], m: &Move) -> f64 {
    match m.rank {
        Some(rank) => weights[problem.groups[m.group].members[rank]],
        None => DROP_WEIGHT,
    }
}

/// Changes that could repair `violation`
fn candidate_moves(problem: &Problem, assignment: &Assignment, violation: Violation<'_>) -> Vec<Move> {
    let mut moves = Vec::new();

    match violation {
        Violation::Requirement { owner, constraint } => {
            if let Some(group) = constraint.group {
                for (rank, admitted) in constraint.allowed.iter().enumerate() {
                    if *admitted && assignment[group] != Some(rank) {
                        moves.push(Move {
                            group,
                            rank: Some(rank),
                        });
                    }
                }
            }
            if let Some(owner) = owner {
                alternatives(problem, assignment, owner, &mut moves);
            }
        }
        Violation::Conflict { owner, constraint } => {
            if let Some(group) = constraint.group {
                for (rank, hit) in constraint.allowed.iter().enumerate() {
                    if !*hit && assignment[group] != Some(rank) {
                        moves.push(Move {
                            group,
                            rank: Some(rank),
                        });
                    }
                }
                moves.push(Move { group, rank: None });
            }
            alternatives(problem, assignment, owner, &mut moves);
        }
    }

    moves
}

/// Any other version of `group`, or dropping it
fn alternatives(problem: &Problem, assignment: &Assignment, group: usize, moves: &mut Vec<Move>) {
    for rank in 0..problem.groups[group].members.len() {
        if assignment[group] != Some(rank) {
            moves.push(Move {
                group,
                rank: Some(rank),
            });
        }
    }
    if assignment[group].is_some() {
        moves.push(Move { group, rank: None });
    }
}

/// Raise every choice to the newest version that keeps the plan valid
fn upgrade(problem: &Problem, assignment: &mut Assignment) {
    for group in 0..problem.groups.len() {
        let Some(current) = assignment[group] else {
            continue;
        };
        for rank in 0..current {
            let mut proposal = assignment.clone();
            proposal[group] = Some(rank);
            if problem.energy(&proposal) == 0 {
                *assignment = proposal;
                break;
            }
        }
    }
}
