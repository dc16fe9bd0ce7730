//! Conflict arbitration between elements competing for the same name or URL space.
//!
//! Every element occupies a set of conflict slots per physical context it maps to: its name in
//! its namespace, each of its URL patterns (servlets and resources only) and each error it
//! handles (error pages only). An element is enabled in a physical context when it holds all of
//! its slots there. Elements claim slots greedily in [`TieBreakKey`] order, so the outcome is
//! a pure function of the candidate set.
//!
//! Re-resolution is incremental: starting from the slots a change touched, the resolver walks
//! the slots reachable through shared candidates and only re-arbitrates that region. Every slot
//! is visited at most once, so the walk terminates after at most as many steps as there are
//! distinct slots among the candidates plus the seeds.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    fmt,
};

use serde::{Deserialize, Serialize};

use crate::{
    context::ContextPath,
    element::{ElementDetails, ElementId, ElementKind, ElementModel, ErrorKey, TieBreakKey},
    util::pattern::UrlPattern,
};

/// How an element mapped to several physical contexts is arbitrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationPolicy {
    /// An element is enabled only if it wins in every physical context it maps to. Losing in
    /// one context shadows it everywhere, which may promote competitors in other contexts.
    #[default]
    Strict,
    /// Each physical context is arbitrated on its own.
    PerContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Servlets and resources.
    Servlet,
    Filter,
    Listener,
    ErrorPage,
    WelcomeFile,
}

impl From<ElementKind> for Namespace {
    fn from(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Servlet | ElementKind::Resource => Namespace::Servlet,
            ElementKind::Filter => Namespace::Filter,
            ElementKind::Listener => Namespace::Listener,
            ElementKind::ErrorPage => Namespace::ErrorPage,
            ElementKind::WelcomeFile => Namespace::WelcomeFile,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    Name(String),
    Pattern(UrlPattern),
    Error(ErrorKey),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConflictKey {
    pub physical: ContextPath,
    pub namespace: Namespace,
    pub slot: Slot,
}

impl fmt::Display for ConflictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Slot::Name(name) => write!(f, "{}:{:?} name {name:?}", self.physical, self.namespace),
            Slot::Pattern(p) => write!(f, "{}:{:?} pattern {p}", self.physical, self.namespace),
            Slot::Error(e) => write!(f, "{}:{:?} error {e}", self.physical, self.namespace),
        }
    }
}

/// Slots `element` occupies in each of the given physical contexts.
pub fn conflict_keys(element: &ElementModel, physical: &[ContextPath]) -> Vec<ConflictKey> {
    let namespace = Namespace::from(element.kind());
    let mut keys = Vec::new();
    for path in physical {
        let key = |slot| ConflictKey {
            physical: path.clone(),
            namespace,
            slot,
        };
        keys.push(key(Slot::Name(element.name().to_string())));
        match element.details() {
            ElementDetails::Servlet { .. } | ElementDetails::Resource { .. } => {
                for pattern in element.patterns().url_patterns() {
                    keys.push(key(Slot::Pattern(pattern.clone())));
                }
            }
            ElementDetails::ErrorPage { errors, .. } => {
                for error in errors {
                    keys.push(key(Slot::Error(error.clone())));
                }
            }
            _ => {}
        }
    }
    keys
}

/// Result of arbitrating one `(physical context, name)` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupResolution {
    pub namespace: Namespace,
    pub name: String,
    pub enabled: Option<ElementId>,
    pub shadowed: Vec<ElementId>,
}

/// Arbitrates name groups within a single physical context.
///
/// Candidates of the same namespace sharing a name compete; the best [`TieBreakKey`] wins and
/// every other candidate is shadowed. Groups are returned sorted by namespace and name.
pub fn resolve(candidates: &[&ElementModel]) -> Vec<GroupResolution> {
    let mut groups: BTreeMap<(Namespace, &str), Vec<&ElementModel>> = BTreeMap::new();
    for element in candidates {
        groups
            .entry((element.kind().into(), element.name()))
            .or_default()
            .push(*element);
    }
    groups
        .into_iter()
        .map(|((namespace, name), mut members)| {
            members.sort_by_key(|e| e.tie_break_key());
            let mut ids = members.into_iter().map(ElementModel::id);
            let enabled = ids.next();
            GroupResolution {
                namespace,
                name: name.to_string(),
                enabled,
                shadowed: ids.collect(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupOutcome {
    pub enabled: Option<ElementId>,
    /// Shadowed competitors, best first.
    pub shadowed: Vec<ElementId>,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Every element of the re-arbitrated region, with the physical contexts it is enabled in.
    pub enabled: BTreeMap<ElementId, BTreeSet<ContextPath>>,
    pub groups: BTreeMap<ConflictKey, GroupOutcome>,
    /// Slots processed by the region walk.
    pub iterations: usize,
}

struct Candidate<'a> {
    element: &'a ElementModel,
    key: TieBreakKey,
    physical: Vec<ContextPath>,
    keys: Vec<ConflictKey>,
}

pub struct Resolver<'a> {
    policy: ArbitrationPolicy,
    candidates: BTreeMap<ElementId, Candidate<'a>>,
    index: HashMap<ConflictKey, Vec<ElementId>>,
}

impl<'a> Resolver<'a> {
    /// `candidates` pairs every element with the physical contexts it maps to.
    pub fn new<I>(policy: ArbitrationPolicy, candidates: I) -> Self
    where
        I: IntoIterator<Item = (&'a ElementModel, Vec<ContextPath>)>,
    {
        let mut index: HashMap<ConflictKey, Vec<ElementId>> = HashMap::new();
        let candidates = candidates
            .into_iter()
            .map(|(element, physical)| {
                let keys = conflict_keys(element, &physical);
                for key in &keys {
                    index.entry(key.clone()).or_default().push(element.id());
                }
                let candidate = Candidate {
                    element,
                    key: element.tie_break_key(),
                    physical,
                    keys,
                };
                (element.id(), candidate)
            })
            .collect();
        Self {
            policy,
            candidates,
            index,
        }
    }

    /// Slots of a candidate known to the resolver.
    pub fn keys_of(&self, id: ElementId) -> &[ConflictKey] {
        self.candidates
            .get(&id)
            .map(|c| c.keys.as_slice())
            .unwrap_or_default()
    }

    pub fn total_keys(&self) -> usize {
        self.index.len()
    }

    pub fn resolve_all(&self) -> Resolution {
        let seeds: Vec<ConflictKey> = self.index.keys().cloned().collect();
        self.resolve(seeds)
    }

    /// Re-arbitrates the region reachable from `seeds`.
    pub fn resolve<I>(&self, seeds: I) -> Resolution
    where
        I: IntoIterator<Item = ConflictKey>,
    {
        let mut visited: HashSet<ConflictKey> = HashSet::new();
        let mut queue: VecDeque<ConflictKey> = VecDeque::new();
        for seed in seeds {
            if visited.insert(seed.clone()) {
                queue.push_back(seed);
            }
        }

        let mut region: BTreeSet<ElementId> = BTreeSet::new();
        let mut iterations = 0;
        while let Some(key) = queue.pop_front() {
            iterations += 1;
            let Some(members) = self.index.get(&key) else {
                continue;
            };
            for id in members {
                if !region.insert(*id) {
                    continue;
                }
                for next in &self.candidates[id].keys {
                    if visited.insert(next.clone()) {
                        queue.push_back(next.clone());
                    }
                }
            }
        }

        let mut ordered: Vec<&Candidate<'a>> =
            region.iter().map(|id| &self.candidates[id]).collect();
        ordered.sort_by_key(|c| c.key);

        let mut occupied: HashMap<&ConflictKey, ElementId> = HashMap::new();
        let mut enabled: BTreeMap<ElementId, BTreeSet<ContextPath>> = BTreeMap::new();
        for candidate in &ordered {
            let id = candidate.element.id();
            let won = enabled.entry(id).or_default();
            match self.policy {
                ArbitrationPolicy::Strict => {
                    if !candidate.keys.is_empty()
                        && candidate.keys.iter().all(|k| !occupied.contains_key(k))
                    {
                        for k in &candidate.keys {
                            occupied.insert(k, id);
                        }
                        won.extend(candidate.physical.iter().cloned());
                    }
                }
                ArbitrationPolicy::PerContext => {
                    for path in &candidate.physical {
                        let keys = candidate.keys.iter().filter(|k| &k.physical == path);
                        if keys.clone().all(|k| !occupied.contains_key(k)) {
                            for k in keys {
                                occupied.insert(k, id);
                            }
                            won.insert(path.clone());
                        }
                    }
                }
            }
        }

        let mut groups = BTreeMap::new();
        for key in visited {
            let Some(members) = self.index.get(&key) else {
                continue;
            };
            let winner = occupied.get(&key).copied();
            let mut shadowed: Vec<&Candidate<'a>> = members
                .iter()
                .filter(|id| Some(**id) != winner)
                .map(|id| &self.candidates[id])
                .collect();
            shadowed.sort_by_key(|c| c.key);
            groups.insert(
                key,
                GroupOutcome {
                    enabled: winner,
                    shadowed: shadowed.into_iter().map(|c| c.element.id()).collect(),
                },
            );
        }

        Resolution {
            enabled,
            groups,
            iterations,
        }
    }
}
