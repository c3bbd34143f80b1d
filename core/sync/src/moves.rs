//! Ordering of file relocations inside one repository.
//!
//! A relocation can only land once its target is vacant: no file sits at
//! the target, no file sits on a directory the target needs, and no file
//! lives below the target (which would make it a directory). Each of those
//! blockers that is itself the origin of another relocation turns into an
//! ordering edge. Rename cycles are broken by parking one member under a
//! temporary name.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use reposync_common::RepoPath;

/// One relocation: the file at `from` must end up at `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    pub from: RepoPath,
    pub to: RepoPath,
}

impl MoveRequest {
    pub fn new(from: RepoPath, to: RepoPath) -> Self {
        Self { from, to }
    }
}

/// One step of a realized move plan. `pair` indexes the request list the
/// plan was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveStep {
    /// Relocate straight to the final path.
    Direct {
        pair: usize,
        from: RepoPath,
        to: RepoPath,
    },
    /// Park the file under a temporary name to break a cycle.
    ToTemporary {
        pair: usize,
        from: RepoPath,
        temporary: RepoPath,
    },
    /// Relocate a parked file to its final path.
    FromTemporary {
        pair: usize,
        temporary: RepoPath,
        to: RepoPath,
    },
}

impl MoveStep {
    pub fn pair(&self) -> usize {
        match self {
            MoveStep::Direct { pair, .. }
            | MoveStep::ToTemporary { pair, .. }
            | MoveStep::FromTemporary { pair, .. } => *pair,
        }
    }

    /// Path the file is at before this step.
    pub fn from(&self) -> &RepoPath {
        match self {
            MoveStep::Direct { from, .. } | MoveStep::ToTemporary { from, .. } => from,
            MoveStep::FromTemporary { temporary, .. } => temporary,
        }
    }

    /// Path the file is at after this step.
    pub fn to(&self) -> &RepoPath {
        match self {
            MoveStep::Direct { to, .. } | MoveStep::FromTemporary { to, .. } => to,
            MoveStep::ToTemporary { temporary, .. } => temporary,
        }
    }

    /// True if this step leaves the file at its final path.
    pub fn is_final(&self) -> bool {
        !matches!(self, MoveStep::ToTemporary { .. })
    }
}

impl fmt::Display for MoveStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from(), self.to())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Parked,
    Done,
}

/// Compute a collision-free realization order for `requests`.
///
/// A move is never placed before a move that vacates its target. Among
/// moves that are free to run the lowest request index goes first, so the
/// plan is deterministic for a given request list. `occupied` holds every
/// path currently present in the repository; temporary names avoid it.
pub fn order_moves(requests: &[MoveRequest], occupied: &BTreeSet<RepoPath>) -> Vec<MoveStep> {
    let n = requests.len();
    let origins: BTreeMap<RepoPath, usize> = requests
        .iter()
        .enumerate()
        .map(|(i, r)| (r.from.clone(), i))
        .collect();

    // blockers[i]: moves that must vacate their origin before i can land.
    let mut blockers: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, request) in requests.iter().enumerate() {
        let mut found = BTreeSet::new();
        // Origins at or below the target.
        for (origin, &j) in origins.range::<RepoPath, _>(&request.to..) {
            if !origin.starts_with(&request.to) {
                break;
            }
            found.insert(j);
        }
        // Origins on a directory the target needs.
        let mut ancestor = request.to.parent();
        while let Some(dir) = ancestor {
            if let Some(&j) = origins.get(&dir) {
                found.insert(j);
            }
            ancestor = dir.parent();
        }
        for j in found {
            blockers[i].push(j);
            dependents[j].push(i);
        }
    }

    let mut waiting: Vec<usize> = blockers.iter().map(Vec::len).collect();
    let mut state = vec![State::Pending; n];
    let mut parked: Vec<Option<RepoPath>> = vec![None; n];
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| waiting[i] == 0).collect();
    let mut reserved: HashSet<RepoPath> = requests
        .iter()
        .flat_map(|r| [r.from.clone(), r.to.clone()])
        .collect();
    let mut steps = Vec::with_capacity(n);
    let mut done = 0;

    while done < n {
        if let Some(i) = ready.pop_first() {
            match parked[i].take() {
                Some(temporary) => steps.push(MoveStep::FromTemporary {
                    pair: i,
                    temporary,
                    to: requests[i].to.clone(),
                }),
                None => {
                    steps.push(MoveStep::Direct {
                        pair: i,
                        from: requests[i].from.clone(),
                        to: requests[i].to.clone(),
                    });
                    vacate(i, &dependents, &mut waiting, &state, &mut ready);
                }
            }
            state[i] = State::Done;
            done += 1;
            continue;
        }

        // Nothing can run: every remaining move waits on a cycle.
        let Some(k) = cycle_member(&state, &blockers) else {
            break;
        };
        let temporary = temporary_name(&requests[k].from, k, occupied, &reserved);
        reserved.insert(temporary.clone());
        steps.push(MoveStep::ToTemporary {
            pair: k,
            from: requests[k].from.clone(),
            temporary: temporary.clone(),
        });
        parked[k] = Some(temporary);
        state[k] = State::Parked;
        vacate(k, &dependents, &mut waiting, &state, &mut ready);
    }

    steps
}

/// Move `j` has left its origin; release the moves it was blocking.
fn vacate(
    j: usize,
    dependents: &[Vec<usize>],
    waiting: &mut [usize],
    state: &[State],
    ready: &mut BTreeSet<usize>,
) {
    for &i in &dependents[j] {
        waiting[i] -= 1;
        if waiting[i] == 0 && state[i] != State::Done {
            ready.insert(i);
        }
    }
}

/// Lowest-index move on a blocking cycle among unfinished moves.
fn cycle_member(state: &[State], blockers: &[Vec<usize>]) -> Option<usize> {
    let start = (0..state.len()).find(|&i| state[i] != State::Done)?;
    let mut seen: Vec<usize> = Vec::new();
    let mut position: BTreeMap<usize, usize> = BTreeMap::new();
    let mut current = start;
    loop {
        if let Some(&at) = position.get(&current) {
            return seen[at..].iter().copied().min();
        }
        position.insert(current, seen.len());
        seen.push(current);
        // Parked moves already left their origin and block nobody.
        current = blockers[current]
            .iter()
            .copied()
            .filter(|&j| state[j] == State::Pending)
            .min()?;
    }
}

/// Hidden name at the repository root that collides with nothing present
/// or planned. The root lies outside every directory a move can target.
fn temporary_name(
    from: &RepoPath,
    pair: usize,
    occupied: &BTreeSet<RepoPath>,
    reserved: &HashSet<RepoPath>,
) -> RepoPath {
    let name = from.name().unwrap_or("file");
    let base = format!(".{}.reposync-move-{}", name, pair);
    let mut suffix = 0usize;
    loop {
        let candidate_name = if suffix == 0 {
            base.clone()
        } else {
            format!("{}-{}", base, suffix)
        };
        if let Ok(candidate) = RepoPath::root().join(&candidate_name) {
            if !occupied.contains(&candidate) && !reserved.contains(&candidate) {
                return candidate;
            }
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn p(s: &str) -> RepoPath {
        RepoPath::parse(s).unwrap()
    }

    fn req(from: &str, to: &str) -> MoveRequest {
        MoveRequest::new(p(from), p(to))
    }

    fn occupied(requests: &[MoveRequest]) -> BTreeSet<RepoPath> {
        requests.iter().map(|r| r.from.clone()).collect()
    }

    /// Replay `steps` over a file map, failing on any collision.
    fn replay(
        files: &mut BTreeMap<RepoPath, usize>,
        steps: &[MoveStep],
    ) -> std::result::Result<(), String> {
        for step in steps {
            let content = files
                .remove(step.from())
                .ok_or_else(|| format!("{} is missing", step.from()))?;
            let target = step.to();
            for path in files.keys() {
                if path.starts_with(target) || target.starts_with(path) {
                    return Err(format!("{} collides with {}", step, path));
                }
            }
            files.insert(target.clone(), content);
        }
        Ok(())
    }

    #[test]
    fn test_independent_moves_keep_index_order() {
        let requests = vec![req("/a", "/x"), req("/b", "/y")];
        let steps = order_moves(&requests, &occupied(&requests));
        assert_eq!(
            steps,
            vec![
                MoveStep::Direct { pair: 0, from: p("/a"), to: p("/x") },
                MoveStep::Direct { pair: 1, from: p("/b"), to: p("/y") },
            ]
        );
    }

    #[test]
    fn test_chain_runs_from_the_free_end() {
        let requests = vec![req("/a", "/b"), req("/b", "/c"), req("/c", "/d")];
        let steps = order_moves(&requests, &occupied(&requests));
        let order: Vec<usize> = steps.iter().map(MoveStep::pair).collect();
        assert_eq!(order, vec![2, 1, 0]);
        assert!(steps.iter().all(MoveStep::is_final));

        // No move lands on a path another move has not yet vacated.
        for (position, step) in steps.iter().enumerate() {
            for later in &steps[position + 1..] {
                assert_ne!(step.to(), later.from());
            }
        }
    }

    #[test]
    fn test_two_cycle_goes_through_temporary() {
        let requests = vec![req("/a", "/b"), req("/b", "/a")];
        let steps = order_moves(&requests, &occupied(&requests));
        let temporary = p("/.a.reposync-move-0");
        assert_eq!(
            steps,
            vec![
                MoveStep::ToTemporary { pair: 0, from: p("/a"), temporary: temporary.clone() },
                MoveStep::Direct { pair: 1, from: p("/b"), to: p("/a") },
                MoveStep::FromTemporary { pair: 0, temporary, to: p("/b") },
            ]
        );

        let mut files = BTreeMap::from([(p("/a"), 1), (p("/b"), 2)]);
        replay(&mut files, &steps).unwrap();
        assert_eq!(files, BTreeMap::from([(p("/a"), 2), (p("/b"), 1)]));
    }

    #[test]
    fn test_move_into_directory_named_like_itself() {
        let requests = vec![req("/x", "/x/y")];
        let steps = order_moves(&requests, &occupied(&requests));
        assert_eq!(steps.len(), 2);
        assert!(!steps[0].is_final());
        assert_eq!(steps[1].to(), &p("/x/y"));

        let mut files = BTreeMap::from([(p("/x"), 1)]);
        replay(&mut files, &steps).unwrap();
        assert_eq!(files, BTreeMap::from([(p("/x/y"), 1)]));
    }

    #[test]
    fn test_move_onto_own_directory() {
        let requests = vec![req("/x/y", "/x")];
        let steps = order_moves(&requests, &occupied(&requests));
        assert_eq!(steps[0].to(), &p("/.y.reposync-move-0"));

        let mut files = BTreeMap::from([(p("/x/y"), 1)]);
        replay(&mut files, &steps).unwrap();
        assert_eq!(files, BTreeMap::from([(p("/x"), 1)]));
    }

    #[test]
    fn test_directory_must_be_emptied_first() {
        // /x is a directory holding /x/g until g moves away.
        let requests = vec![req("/d/f", "/x"), req("/x/g", "/y")];
        let steps = order_moves(&requests, &occupied(&requests));
        let order: Vec<usize> = steps.iter().map(MoveStep::pair).collect();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_file_in_the_way_of_a_directory() {
        // /a is a file until it moves; /a/b needs it to be a directory.
        let requests = vec![req("/q", "/a/b"), req("/a", "/z")];
        let steps = order_moves(&requests, &occupied(&requests));
        let order: Vec<usize> = steps.iter().map(MoveStep::pair).collect();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_temporary_name_avoids_occupied_paths() {
        let requests = vec![req("/a", "/b"), req("/b", "/a")];
        let mut present = occupied(&requests);
        present.insert(p("/.a.reposync-move-0"));
        let steps = order_moves(&requests, &present);
        assert_eq!(steps[0].to(), &p("/.a.reposync-move-0-1"));
    }

    #[test]
    fn test_empty_request_list() {
        assert!(order_moves(&[], &BTreeSet::new()).is_empty());
    }

    proptest! {
        #[test]
        fn prop_permutations_are_realizable(
            perm in (1usize..8).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        ) {
            let names: Vec<RepoPath> = (0..perm.len()).map(|i| p(&format!("/f{}", i))).collect();
            let requests: Vec<MoveRequest> = perm
                .iter()
                .enumerate()
                .filter(|(i, target)| i != *target)
                .map(|(i, &target)| MoveRequest::new(names[i].clone(), names[target].clone()))
                .collect();

            let mut files: BTreeMap<RepoPath, usize> =
                names.iter().cloned().enumerate().map(|(i, path)| (path, i)).collect();
            let present: BTreeSet<RepoPath> = files.keys().cloned().collect();
            let steps = order_moves(&requests, &present);
            prop_assert!(replay(&mut files, &steps).is_ok());

            let expected: BTreeMap<RepoPath, usize> = perm
                .iter()
                .enumerate()
                .map(|(i, &target)| (names[target].clone(), i))
                .collect();
            prop_assert_eq!(files, expected);

            // Same input, same plan.
            prop_assert_eq!(steps, order_moves(&requests, &present));
        }
    }
}
