// src/solver/exact.rs

//! Complete backtracking search
//!
//! Open requirements are taken requests first, then in group order. For
//! each one the admitted candidates are tried highest version first, and a
//! branch is abandoned as soon as an assigned package breaks a requirement
//! or hits a conflict.

use super::{Assignment, Constraint, Problem};

pub(crate) fn solve(problem: &Problem) -> Result<Assignment, String> {
    let mut search = Search {
        problem,
        assignment: vec![None; problem.groups.len()],
        failure: None,
    };

    if search.extend() {
        Ok(search.assignment)
    } else {
        Err(search
            .failure
            .unwrap_or_else(|| "no consistent assignment".to_string()))
    }
}

struct Search<'a> {
    problem: &'a Problem,
    assignment: Assignment,
    failure: Option<String>,
}

impl<'a> Search<'a> {
    fn extend(&mut self) -> bool {
        let problem = self.problem;
        let Some(open) = self.next_open() else {
            return true;
        };

        let Some(group) = open.group else {
            self.note(format!("nothing provides {}", open.label));
            return false;
        };

        for (rank, admitted) in open.allowed.iter().enumerate() {
            if !admitted {
                continue;
            }
            self.assignment[group] = Some(rank);
            if self.consistent() && self.extend() {
                return true;
            }
            self.assignment[group] = None;
        }

        self.note(format!(
            "no candidate of {} satisfies {}",
            problem.groups[group].key, open.label
        ));
        false
    }

    /// First requirement whose group has no choice yet
    fn next_open(&self) -> Option<&'a Constraint> {
        let problem = self.problem;
        let open = |c: &&'a Constraint| c.group.is_none_or(|g| self.assignment[g].is_none());

        if let Some(request) = problem.requests.iter().find(open) {
            return Some(request);
        }
        (0..problem.groups.len())
            .filter_map(|g| problem.chosen(g, &self.assignment))
            .flat_map(|candidate| candidate.requires.iter())
            .find(open)
    }

    /// No assigned requirement is broken and no conflict is hit
    fn consistent(&self) -> bool {
        let assignment = &self.assignment;
        let settled = |c: &Constraint| match c.group.and_then(|g| assignment[g]) {
            Some(_) => c.satisfied_by(assignment),
            None => true,
        };

        if !self.problem.requests.iter().all(settled) {
            return false;
        }

        (0..self.problem.groups.len())
            .filter_map(|g| self.problem.chosen(g, assignment))
            .all(|candidate| {
                candidate.requires.iter().all(settled)
                    && !candidate.conflicts.iter().any(|c| c.hit_by(assignment))
            })
    }

    fn note(&mut self, reason: String) {
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
    }
}
