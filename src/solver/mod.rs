// src/solver/mod.rs

//! Dependency resolution
//!
//! The solver turns a set of requested packages (usually selectors) and the
//! world into a concrete, conflict-free plan ordered dependencies first.
//!
//! Two strategies share the same problem encoding:
//! - `Exact`: depth-first search with constraint checks and backtracking.
//!   Complete, exponential in the worst case.
//! - `Stochastic`: simulated annealing over per-package choices, bounded by
//!   `max_attempts`.
//!
//! Every package name (`category/name`) gets at most one concrete version.

mod exact;
mod stochastic;

use crate::error::{Error, Result};
use crate::packages::{Fingerprint, Package};
use crate::version;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Search strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverType {
    #[default]
    #[serde(alias = "simple", alias = "")]
    Exact,
    #[serde(alias = "qlearning")]
    Stochastic,
}

impl FromStr for SolverType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "exact" | "simple" => Ok(SolverType::Exact),
            "stochastic" | "qlearning" => Ok(SolverType::Stochastic),
            other => Err(Error::ConfigError(format!(
                "Unknown solver type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SolverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverType::Exact => f.write_str("exact"),
            SolverType::Stochastic => f.write_str("stochastic"),
        }
    }
}

/// Solver tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    #[serde(rename = "type")]
    pub solver_type: SolverType,
    /// Temperature multiplier applied after every stochastic step
    pub discount: f32,
    /// Weight added to a choice each time it lowers the energy
    #[serde(alias = "rate")]
    pub learn_rate: f32,
    /// Stochastic iteration budget
    pub max_attempts: usize,
    /// Seed for the stochastic search
    pub seed: u64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            solver_type: SolverType::Exact,
            discount: 1.0,
            learn_rate: 0.7,
            max_attempts: 9000,
            seed: 0,
        }
    }
}

impl fmt::Display for SolverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type: {} discount: {:.2} learn rate: {:.2} max attempts: {}",
            self.solver_type, self.discount, self.learn_rate, self.max_attempts
        )
    }
}

/// Dependency solver
#[derive(Debug, Clone, Default)]
pub struct Solver {
    options: SolverOptions,
}

impl Solver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Resolve runtime requirements of `requests` against `world`
    pub fn solve(&self, requests: &[Package], world: &[Package]) -> Result<Vec<Package>> {
        self.resolve(requests, world, false)
    }

    /// Resolve like `solve`, also following build-time requirements
    pub fn solve_build(&self, requests: &[Package], world: &[Package]) -> Result<Vec<Package>> {
        self.resolve(requests, world, true)
    }

    fn resolve(
        &self,
        requests: &[Package],
        world: &[Package],
        include_build: bool,
    ) -> Result<Vec<Package>> {
        let wanted = requests
            .iter()
            .map(|p| p.human_readable())
            .collect::<Vec<_>>()
            .join(", ");
        debug!("Solving [{}] over {} packages ({})", wanted, world.len(), self.options);

        let problem = Problem::new(requests, world, include_build)?;

        for request in &problem.requests {
            if request.group.is_none() {
                return Err(Error::Unsatisfiable(format!(
                    "nothing provides {}",
                    request.label
                )));
            }
        }

        let assignment = match self.options.solver_type {
            SolverType::Exact => exact::solve(&problem),
            SolverType::Stochastic => stochastic::solve(&problem, &self.options),
        }
        .map_err(|reason| Error::Unsatisfiable(format!("[{}]: {}", wanted, reason)))?;

        let chosen = problem.reachable(&assignment);
        let plan = Self::order(&chosen, include_build)?;
        info!("Resolved [{}] to {} packages", wanted, plan.len());
        Ok(plan)
    }

    /// Every world package that transitively depends on any of `targets`,
    /// in world order. Targets themselves are not included.
    pub fn reverse_dependencies(targets: &[Package], world: &[Package]) -> Result<Vec<Package>> {
        let mut reached: Vec<&Package> = targets.iter().collect();
        let mut seen: HashSet<Fingerprint> = targets.iter().map(|t| t.fingerprint()).collect();
        let mut found = Vec::new();

        loop {
            let mut grew = false;
            for package in world {
                if seen.contains(&package.fingerprint()) {
                    continue;
                }
                if depends_on_any(package, &reached)? {
                    seen.insert(package.fingerprint());
                    found.push(package);
                    reached.push(package);
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        // Restore world order
        let order: HashMap<Fingerprint, usize> = world
            .iter()
            .enumerate()
            .map(|(i, p)| (p.fingerprint(), i))
            .collect();
        found.sort_by_key(|p| order.get(&p.fingerprint()).copied().unwrap_or(usize::MAX));
        Ok(found.into_iter().cloned().collect())
    }

    /// Sort packages so that dependencies come first
    ///
    /// Build-time requirements count as edges only with `include_build`.
    /// Ties keep input order. A dependency cycle is an error naming the
    /// packages on the cycle.
    pub fn order(packages: &[Package], include_build: bool) -> Result<Vec<Package>> {
        let n = packages.len();
        let dependencies = Self::dependency_graph(packages, include_build)?;
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in dependencies.iter().enumerate() {
            for &j in deps {
                dependents[j].push(i);
            }
        }

        let mut indegree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut emitted = vec![false; n];
        let mut ordered = Vec::with_capacity(n);

        while ordered.len() < n {
            let next = (0..n).find(|&i| !emitted[i] && indegree[i] == 0);
            let Some(next) = next else {
                return Err(Error::CircularDependency(find_cycle(
                    packages,
                    &dependencies,
                    &emitted,
                )));
            };
            emitted[next] = true;
            ordered.push(packages[next].clone());
            for &dependent in &dependents[next] {
                indegree[dependent] -= 1;
            }
        }

        Ok(ordered)
    }

    /// For each package, the indices of the packages in the same slice it
    /// requires at runtime, and at build time with `include_build`
    pub fn dependency_graph(
        packages: &[Package],
        include_build: bool,
    ) -> Result<Vec<Vec<usize>>> {
        let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); packages.len()];
        for (i, package) in packages.iter().enumerate() {
            let build: &[Package] = if include_build {
                &package.build_requires
            } else {
                &[]
            };
            for requirement in package.requires.iter().chain(build) {
                for (j, other) in packages.iter().enumerate() {
                    if i != j && requirement.matches(other)? && !dependencies[i].contains(&j) {
                        dependencies[i].push(j);
                    }
                }
            }
        }
        Ok(dependencies)
    }
}

fn depends_on_any(package: &Package, targets: &[&Package]) -> Result<bool> {
    for requirement in package.requires.iter().chain(&package.build_requires) {
        for target in targets {
            if requirement.matches(target)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Walk unemitted dependencies until a node repeats
fn find_cycle(packages: &[Package], dependencies: &[Vec<usize>], emitted: &[bool]) -> Vec<String> {
    let Some(start) = (0..packages.len()).find(|&i| !emitted[i]) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = dependencies[current].iter().find(|&&d| !emitted[d]) else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .map(|&i| packages[i].human_readable())
                .collect();
            cycle.push(packages[next].human_readable());
            return cycle;
        }
        path.push(next);
        current = next;
    }

    path.iter().map(|&i| packages[i].human_readable()).collect()
}

/// Chosen version index per group; `None` leaves the name out of the plan
pub(crate) type Assignment = Vec<Option<usize>>;

/// All versions of one `category/name`, highest version first
#[derive(Debug)]
pub(crate) struct Group {
    pub key: String,
    pub members: Vec<usize>,
}

#[derive(Debug)]
pub(crate) struct Candidate {
    pub package: Package,
    pub group: usize,
    pub requires: Vec<Constraint>,
    pub conflicts: Vec<Constraint>,
}

/// A selector evaluated against every member of its group
#[derive(Debug)]
pub(crate) struct Constraint {
    pub label: String,
    pub group: Option<usize>,
    /// Indexed by rank within the group
    pub allowed: Vec<bool>,
}

impl Constraint {
    /// Requirement reading: the group has an admitted choice
    pub fn satisfied_by(&self, assignment: &Assignment) -> bool {
        self.group
            .and_then(|g| assignment[g])
            .is_some_and(|rank| self.allowed[rank])
    }

    /// Conflict reading: the group's choice is one we cannot coexist with
    pub fn hit_by(&self, assignment: &Assignment) -> bool {
        self.satisfied_by(assignment)
    }

    /// Highest admitted rank
    pub fn best(&self) -> Option<usize> {
        self.allowed.iter().position(|a| *a)
    }
}

/// A broken constraint and the group that owns it (`None` for requests)
#[derive(Debug, Clone, Copy)]
pub(crate) enum Violation<'a> {
    Requirement {
        owner: Option<usize>,
        constraint: &'a Constraint,
    },
    Conflict {
        owner: usize,
        constraint: &'a Constraint,
    },
}

#[derive(Debug)]
pub(crate) struct Problem {
    pub candidates: Vec<Candidate>,
    pub groups: Vec<Group>,
    pub requests: Vec<Constraint>,
}

impl Problem {
    pub fn new(requests: &[Package], world: &[Package], include_build: bool) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut packages: Vec<&Package> = Vec::new();
        for package in world {
            if seen.insert(package.fingerprint()) {
                packages.push(package);
            }
        }

        let mut by_key: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();
        for (id, package) in packages.iter().enumerate() {
            let key = package.package_key();
            let group = *by_key.entry(key.clone()).or_insert_with(|| {
                groups.push(Group {
                    key,
                    members: Vec::new(),
                });
                groups.len() - 1
            });
            groups[group].members.push(id);
        }

        for group in &mut groups {
            // Stable: equal versions keep world order
            group.members.sort_by(|a, b| {
                version::compare_versions(&packages[*b].version, &packages[*a].version)
            });
        }

        let mut group_of = vec![0; packages.len()];
        for (g, group) in groups.iter().enumerate() {
            for &member in &group.members {
                group_of[member] = g;
            }
        }

        let constraint = |selector: &Package| -> Result<Constraint> {
            let group = by_key.get(&selector.package_key()).copied();
            let allowed = match group {
                Some(g) => groups[g]
                    .members
                    .iter()
                    .map(|&m| selector.matches(packages[m]))
                    .collect::<Result<Vec<_>>>()?,
                None => Vec::new(),
            };
            Ok(Constraint {
                label: selector.human_readable(),
                group,
                allowed,
            })
        };

        let mut candidates = Vec::with_capacity(packages.len());
        for (id, package) in packages.iter().enumerate() {
            let mut requires = Vec::new();
            for requirement in &package.requires {
                requires.push(constraint(requirement)?);
            }
            if include_build {
                for requirement in &package.build_requires {
                    requires.push(constraint(requirement)?);
                }
            }

            let mut conflicts = Vec::new();
            for conflict in &package.conflicts {
                let mut c = constraint(conflict)?;
                // A package never conflicts with itself
                if c.group == Some(group_of[id]) {
                    if let Some(rank) = groups[group_of[id]].members.iter().position(|&m| m == id) {
                        c.allowed[rank] = false;
                    }
                }
                conflicts.push(c);
            }

            candidates.push(Candidate {
                package: (*package).clone(),
                group: group_of[id],
                requires,
                conflicts,
            });
        }

        let requests = requests
            .iter()
            .map(|r| constraint(r))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            candidates,
            groups,
            requests,
        })
    }

    pub fn chosen(&self, group: usize, assignment: &Assignment) -> Option<&Candidate> {
        assignment[group].map(|rank| &self.candidates[self.groups[group].members[rank]])
    }

    /// Every broken request, requirement and conflict
    pub fn violations(&self, assignment: &Assignment) -> Vec<Violation<'_>> {
        let mut out = Vec::new();
        for request in &self.requests {
            if !request.satisfied_by(assignment) {
                out.push(Violation::Requirement {
                    owner: None,
                    constraint: request,
                });
            }
        }
        for group in 0..self.groups.len() {
            let Some(candidate) = self.chosen(group, assignment) else {
                continue;
            };
            for requirement in &candidate.requires {
                if !requirement.satisfied_by(assignment) {
                    out.push(Violation::Requirement {
                        owner: Some(group),
                        constraint: requirement,
                    });
                }
            }
            for conflict in &candidate.conflicts {
                if conflict.hit_by(assignment) {
                    out.push(Violation::Conflict {
                        owner: group,
                        constraint: conflict,
                    });
                }
            }
        }
        out
    }

    pub fn energy(&self, assignment: &Assignment) -> usize {
        self.violations(assignment).len()
    }

    /// Chosen packages reachable from the requests, in discovery order
    pub fn reachable(&self, assignment: &Assignment) -> Vec<Package> {
        let mut visited = vec![false; self.groups.len()];
        let mut queue = VecDeque::new();
        let mut out = Vec::new();

        for request in &self.requests {
            if let Some(g) = request.group {
                queue.push_back(g);
            }
        }

        while let Some(group) = queue.pop_front() {
            if visited[group] {
                continue;
            }
            visited[group] = true;
            let Some(candidate) = self.chosen(group, assignment) else {
                continue;
            };
            out.push(candidate.package.clone());
            for requirement in &candidate.requires {
                if let Some(g) = requirement.group {
                    queue.push_back(g);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, version: &str) -> Package {
        Package::new(name, "test", version)
    }

    fn req(name: &str, selector: &str) -> Package {
        Package::new(name, "test", selector)
    }

    fn names(plan: &[Package]) -> Vec<String> {
        plan.iter()
            .map(|p| format!("{}-{}", p.name, p.version))
            .collect()
    }

    fn solvers() -> Vec<Solver> {
        vec![
            Solver::default(),
            Solver::new(SolverOptions {
                solver_type: SolverType::Stochastic,
                ..Default::default()
            }),
        ]
    }

    #[test]
    fn test_solver_type_parsing() {
        assert_eq!("".parse::<SolverType>().unwrap(), SolverType::Exact);
        assert_eq!("qlearning".parse::<SolverType>().unwrap(), SolverType::Stochastic);
        assert!("annealing-ish".parse::<SolverType>().is_err());
    }

    #[test]
    fn test_options_defaults() {
        let options: SolverOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, SolverOptions::default());
        assert_eq!(options.max_attempts, 9000);

        let options: SolverOptions =
            serde_json::from_str(r#"{"type": "qlearning", "rate": 0.5}"#).unwrap();
        assert_eq!(options.solver_type, SolverType::Stochastic);
        assert_eq!(options.learn_rate, 0.5);
    }

    #[test]
    fn test_dependencies_come_first() {
        let world = vec![
            pkg("app", "1.0").with_requires(vec![req("lib", ">=1.0")]),
            pkg("lib", "1.0").with_requires(vec![req("base", ">=0")]),
            pkg("base", "1.0"),
        ];

        for solver in solvers() {
            let plan = solver.solve(&[req("app", ">=0")], &world).unwrap();
            assert_eq!(names(&plan), vec!["base-1.0", "lib-1.0", "app-1.0"]);
        }
    }

    #[test]
    fn test_highest_admitted_version_wins() {
        let world = vec![
            pkg("lib", "1.0"),
            pkg("lib", "2.1"),
            pkg("lib", "2.0"),
            pkg("lib", "3.0"),
        ];

        for solver in solvers() {
            let plan = solver.solve(&[req("lib", "<3.0")], &world).unwrap();
            assert_eq!(names(&plan), vec!["lib-2.1"]);

            let plan = solver.solve(&[req("lib", "2.0")], &world).unwrap();
            assert_eq!(names(&plan), vec!["lib-2.0"]);
        }
    }

    #[test]
    fn test_final_release_beats_prerelease() {
        let world = vec![pkg("lib", "1.0_rc1"), pkg("lib", "1.0"), pkg("lib", "1.0_alpha")];

        for solver in solvers() {
            let plan = solver.solve(&[req("lib", ">=0")], &world).unwrap();
            assert_eq!(names(&plan), vec!["lib-1.0"]);
        }
    }

    #[test]
    fn test_backtracks_to_older_version() {
        // The newest app needs a lib that does not exist
        let world = vec![
            pkg("app", "2.0").with_requires(vec![req("lib", ">=5")]),
            pkg("app", "1.0").with_requires(vec![req("lib", ">=1")]),
            pkg("lib", "1.5"),
        ];

        for solver in solvers() {
            let plan = solver.solve(&[req("app", ">=0")], &world).unwrap();
            assert_eq!(names(&plan), vec!["lib-1.5", "app-1.0"]);
        }
    }

    #[test]
    fn test_conflicts_are_avoided() {
        let world = vec![
            pkg("a", "1.0").with_requires(vec![req("c", ">=0")]),
            pkg("b", "1.0").with_conflicts(vec![req("c", ">=2")]),
            pkg("c", "2.0"),
            pkg("c", "1.0"),
        ];

        for solver in solvers() {
            let plan = solver
                .solve(&[req("a", ">=0"), req("b", ">=0")], &world)
                .unwrap();
            let plan = names(&plan);
            assert!(plan.contains(&"c-1.0".to_string()));
            assert!(!plan.contains(&"c-2.0".to_string()));
        }
    }

    #[test]
    fn test_unsatisfiable_requests() {
        let world = vec![
            pkg("a", "1.0").with_conflicts(vec![req("b", ">=0")]),
            pkg("b", "1.0"),
        ];

        for solver in solvers() {
            let result = solver.solve(&[req("a", ">=0"), req("b", ">=0")], &world);
            assert!(matches!(result, Err(Error::Unsatisfiable(_))));

            let result = solver.solve(&[req("missing", ">=0")], &world);
            match result {
                Err(Error::Unsatisfiable(msg)) => assert!(msg.contains("test/missing")),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_missing_requirement_is_named() {
        let world = vec![pkg("a", "1.0").with_requires(vec![req("ghost", ">=1")])];
        match Solver::default().solve(&[req("a", ">=0")], &world) {
            Err(Error::Unsatisfiable(msg)) => assert!(msg.contains("test/ghost"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_build_requirements_only_in_build_mode() {
        let world = vec![
            pkg("app", "1.0").with_build_requires(vec![req("compiler", ">=0")]),
            pkg("compiler", "1.0"),
        ];
        let solver = Solver::default();

        let plan = solver.solve(&[req("app", ">=0")], &world).unwrap();
        assert_eq!(names(&plan), vec!["app-1.0"]);

        let plan = solver.solve_build(&[req("app", ">=0")], &world).unwrap();
        assert_eq!(names(&plan), vec!["compiler-1.0", "app-1.0"]);
    }

    #[test]
    fn test_build_only_back_edge_is_not_a_runtime_cycle() {
        // Bootstrap shape: a needs b at runtime, b needs a only to build
        let world = vec![
            pkg("a", "1.0").with_requires(vec![req("b", ">=0")]),
            pkg("b", "1.0").with_build_requires(vec![req("a", ">=0")]),
        ];

        for solver in solvers() {
            let plan = solver.solve(&[req("a", ">=0")], &world).unwrap();
            assert_eq!(names(&plan), vec!["b-1.0", "a-1.0"]);
        }

        assert!(matches!(
            Solver::order(&world, true),
            Err(Error::CircularDependency(_))
        ));
        assert!(matches!(
            Solver::default().solve_build(&[req("a", ">=0")], &world),
            Err(Error::CircularDependency(_))
        ));
    }

    #[test]
    fn test_order_is_stable() {
        let packages = vec![pkg("x", "1"), pkg("y", "1"), pkg("z", "1")];
        assert_eq!(
            names(&Solver::order(&packages, false).unwrap()),
            vec!["x-1", "y-1", "z-1"]
        );
    }

    #[test]
    fn test_order_detects_cycles() {
        let packages = vec![
            pkg("a", "1").with_requires(vec![req("b", ">=0")]),
            pkg("b", "1").with_requires(vec![req("a", ">=0")]),
            pkg("c", "1"),
        ];
        match Solver::order(&packages, false) {
            Err(Error::CircularDependency(cycle)) => {
                assert!(cycle.contains(&"test/a-1".to_string()));
                assert!(cycle.contains(&"test/b-1".to_string()));
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_reverse_dependencies() {
        let world = vec![
            pkg("a", "1.0"),
            pkg("b", "1.0").with_requires(vec![req("a", ">=1")]),
            pkg("c", "1.0").with_requires(vec![req("b", ">=1")]),
            pkg("d", "1.0"),
            pkg("e", "1.0").with_build_requires(vec![req("a", ">=1")]),
        ];

        let revdeps = Solver::reverse_dependencies(&[pkg("a", "1.0")], &world).unwrap();
        assert_eq!(names(&revdeps), vec!["b-1.0", "c-1.0", "e-1.0"]);

        let revdeps = Solver::reverse_dependencies(&[pkg("d", "1.0")], &world).unwrap();
        assert!(revdeps.is_empty());
    }

    #[test]
    fn test_stochastic_budget_exhaustion() {
        let world = vec![
            pkg("a", "1.0").with_conflicts(vec![req("b", ">=0")]),
            pkg("b", "1.0"),
        ];
        let solver = Solver::new(SolverOptions {
            solver_type: SolverType::Stochastic,
            max_attempts: 10,
            ..Default::default()
        });
        match solver.solve(&[req("a", ">=0"), req("b", ">=0")], &world) {
            Err(Error::Unsatisfiable(msg)) => assert!(msg.contains("10 attempts"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }
}
