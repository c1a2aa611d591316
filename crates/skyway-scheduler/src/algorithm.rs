//! Input version resolution.
//!
//! Each `get` input yields an ordered list of candidate versions. Inputs
//! constrained by `passed` must agree on the upstream builds they came
//! through: if two inputs both pass through job `U`, a single successful
//! build of `U` must have seen both chosen versions. Resolution is a
//! depth-first search over candidates that carries, per upstream job, the
//! set of builds still consistent with every choice made so far.

use skyway_core::build::BuildInput;
use skyway_core::ids::*;
use skyway_core::job::Job;
use skyway_core::pipeline::{VersionConfig, VersionStrategy};
use skyway_core::ports::{BuildVersions, VersionsSnapshot};
use skyway_core::resource::{Resource, ResourceVersion, Version};
use skyway_core::{Error, Result};
use std::collections::{HashMap, HashSet};

/// Candidate combinations tried before resolution gives up for this pass.
pub const DEFAULT_SEARCH_BUDGET: usize = 10_000;

/// A `get` input with names resolved to ids.
#[derive(Debug, Clone, PartialEq)]
pub struct InputConfig {
    pub name: String,
    pub resource_id: ResourceId,
    pub passed: Vec<JobId>,
    pub trigger: bool,
    pub version: VersionConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    pub name: String,
    pub resource_id: ResourceId,
    pub version_id: VersionId,
    pub version: Version,
    pub trigger: bool,
}

impl ResolvedInput {
    /// `first_occurrence` is computed by the store when the build is
    /// scheduled.
    pub fn to_build_input(&self) -> BuildInput {
        BuildInput {
            name: self.name.clone(),
            resource_id: self.resource_id,
            version_id: self.version_id,
            version: self.version.clone(),
            first_occurrence: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Satisfied(Vec<ResolvedInput>),
    Unsatisfiable { input: String, reason: String },
}

impl Resolution {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Resolution::Satisfied(_))
    }
}

/// The job's inputs with resource and job names replaced by ids. A
/// resource pin overrides the step's own version config.
pub fn input_configs(job: &Job, resources: &[Resource], jobs: &[Job]) -> Result<Vec<InputConfig>> {
    job.config
        .inputs()
        .into_iter()
        .map(|input| {
            let resource = resources
                .iter()
                .find(|r| r.name == input.resource)
                .ok_or_else(|| Error::ResourceNotFound(input.resource.clone()))?;
            let passed = input
                .passed
                .iter()
                .map(|name| {
                    jobs.iter()
                        .find(|j| &j.name == name)
                        .map(|j| j.id)
                        .ok_or_else(|| Error::JobNotFound(name.clone()))
                })
                .collect::<Result<Vec<_>>>()?;
            let version = match &resource.pinned_version {
                Some(pin) => VersionConfig::Pinned(pin.clone()),
                None => input.version,
            };
            Ok(InputConfig {
                name: input.name,
                resource_id: resource.id,
                passed,
                trigger: input.trigger,
                version,
            })
        })
        .collect()
}

/// True if a trigger input resolved to a version the job's latest build
/// did not use for it.
pub fn triggers_changed(resolved: &[ResolvedInput], last_inputs: &[BuildInput]) -> bool {
    resolved.iter().filter(|r| r.trigger).any(|r| {
        !last_inputs
            .iter()
            .any(|last| last.name == r.name && last.version_id == r.version_id)
    })
}

pub struct Algorithm<'a> {
    snapshot: &'a VersionsSnapshot,
    row_limit: usize,
    budget: usize,
}

/// Upstream builds still allowed, per passed job.
type Constraints = HashMap<JobId, HashSet<BuildId>>;

struct Candidates<'a> {
    input: &'a InputConfig,
    versions: Vec<&'a ResourceVersion>,
}

impl<'a> Algorithm<'a> {
    pub fn new(snapshot: &'a VersionsSnapshot, row_limit: usize) -> Self {
        Self {
            snapshot,
            row_limit: row_limit.max(1),
            budget: DEFAULT_SEARCH_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget.max(1);
        self
    }

    pub fn resolve(&self, job_id: JobId, inputs: &'a [InputConfig]) -> Resolution {
        let mut candidates = Vec::with_capacity(inputs.len());
        for input in inputs {
            let versions = self.candidates(job_id, input);
            if versions.is_empty() {
                return Resolution::Unsatisfiable {
                    input: input.name.clone(),
                    reason: self.empty_reason(input),
                };
            }
            candidates.push(Candidates { input, versions });
        }

        // Pinned and tightly constrained inputs first: fewer candidates
        // prune the search sooner.
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by_key(|&i| candidates[i].versions.len());

        let mut chosen: Vec<Option<&ResourceVersion>> = vec![None; candidates.len()];
        let mut remaining = self.budget;
        let found = self.search(&candidates, &order, 0, &Constraints::new(), &mut chosen, &mut remaining);
        if !found {
            let input = order
                .first()
                .map(|&i| candidates[i].input.name.clone())
                .unwrap_or_default();
            let reason = if remaining == 0 {
                "search budget exhausted".to_string()
            } else {
                "no combination of versions passed the same upstream builds".to_string()
            };
            return Resolution::Unsatisfiable { input, reason };
        }

        Resolution::Satisfied(
            candidates
                .iter()
                .zip(chosen)
                .filter_map(|(c, v)| {
                    v.map(|v| ResolvedInput {
                        name: c.input.name.clone(),
                        resource_id: c.input.resource_id,
                        version_id: v.id,
                        version: v.version.clone(),
                        trigger: c.input.trigger,
                    })
                })
                .collect(),
        )
    }

    fn search(
        &self,
        candidates: &[Candidates<'a>],
        order: &[usize],
        depth: usize,
        constraints: &Constraints,
        chosen: &mut [Option<&'a ResourceVersion>],
        remaining: &mut usize,
    ) -> bool {
        let Some(&index) = order.get(depth) else {
            return true;
        };
        let entry = &candidates[index];

        for version in &entry.versions {
            if *remaining == 0 {
                return false;
            }
            *remaining -= 1;

            let Some(next) = self.narrow(constraints, entry.input, version.id) else {
                continue;
            };
            chosen[index] = Some(*version);
            if self.search(candidates, order, depth + 1, &next, chosen, remaining) {
                return true;
            }
        }
        chosen[index] = None;
        false
    }

    /// Constraints after choosing `version_id` for `input`, or `None` if
    /// some passed job has no build left that saw every choice.
    fn narrow(&self, constraints: &Constraints, input: &InputConfig, version_id: VersionId) -> Option<Constraints> {
        let mut next = constraints.clone();
        for job_id in &input.passed {
            let builds: HashSet<BuildId> = self
                .successful_builds(*job_id)
                .iter()
                .filter(|b| saw(b, input.resource_id, version_id))
                .map(|b| b.build_id)
                .collect();
            let allowed = match next.get(job_id) {
                Some(existing) => existing.intersection(&builds).copied().collect(),
                None => builds,
            };
            if allowed.is_empty() {
                return None;
            }
            next.insert(*job_id, allowed);
        }
        Some(next)
    }

    /// Ordered candidates for one input, before cross-input correlation.
    fn candidates(&self, job_id: JobId, input: &InputConfig) -> Vec<&'a ResourceVersion> {
        let versions: &'a [ResourceVersion] = self
            .snapshot
            .resource_versions
            .get(&input.resource_id)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut ordered: Vec<&ResourceVersion> = match &input.version {
            VersionConfig::Pinned(pin) => versions.iter().filter(|v| v.version.contains(pin)).collect(),
            VersionConfig::Strategy(VersionStrategy::Latest) => versions.iter().collect(),
            VersionConfig::Strategy(VersionStrategy::Every) => self.every_order(job_id, input, versions),
        };

        // Cheap per-input filter before the correlated search.
        for passed in &input.passed {
            let builds = self.successful_builds(*passed);
            ordered.retain(|v| builds.iter().any(|b| saw(b, input.resource_id, v.id)));
        }

        ordered.truncate(self.row_limit);
        ordered
    }

    /// Versions newer than the last one this input used, oldest first,
    /// then the rest newest first.
    fn every_order(&self, job_id: JobId, input: &InputConfig, versions: &'a [ResourceVersion]) -> Vec<&'a ResourceVersion> {
        let last_order = self
            .snapshot
            .last_inputs
            .get(&job_id)
            .and_then(|inputs| inputs.iter().find(|i| i.name == input.name))
            .and_then(|last| versions.iter().find(|v| v.id == last.version_id))
            .map(|v| v.check_order);

        let Some(last_order) = last_order else {
            return versions.iter().collect();
        };
        let (mut newer, older): (Vec<&ResourceVersion>, Vec<&ResourceVersion>) =
            versions.iter().partition(|v| v.check_order > last_order);
        newer.reverse();
        newer.extend(older);
        newer
    }

    fn successful_builds(&self, job_id: JobId) -> &'a [BuildVersions] {
        self.snapshot
            .successful_builds
            .get(&job_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn empty_reason(&self, input: &InputConfig) -> String {
        let has_versions = self
            .snapshot
            .resource_versions
            .get(&input.resource_id)
            .is_some_and(|v| !v.is_empty());
        match (&input.version, has_versions) {
            (_, false) => "resource has no enabled versions".to_string(),
            (VersionConfig::Pinned(pin), _) => format!("pinned version {} not found", pin.canonical_json()),
            _ => "no versions satisfy passed constraints".to_string(),
        }
    }
}

fn saw(build: &BuildVersions, resource_id: ResourceId, version_id: VersionId) -> bool {
    build
        .versions
        .get(&resource_id)
        .is_some_and(|ids| ids.contains(&version_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const R1: ResourceId = ResourceId::new(1);
    const R2: ResourceId = ResourceId::new(2);
    const UPSTREAM: JobId = JobId::new(10);
    const DOWNSTREAM: JobId = JobId::new(11);

    fn version(id: i64, order: i64, r: &str) -> ResourceVersion {
        ResourceVersion {
            id: VersionId::new(id),
            resource_config_id: ResourceConfigId::new(1),
            version: Version::new().with("ref", r),
            metadata: vec![],
            check_order: order,
        }
    }

    fn input(name: &str, resource_id: ResourceId, passed: Vec<JobId>, version: VersionConfig) -> InputConfig {
        InputConfig {
            name: name.to_string(),
            resource_id,
            passed,
            trigger: true,
            version,
        }
    }

    fn latest() -> VersionConfig {
        VersionConfig::Strategy(VersionStrategy::Latest)
    }

    fn build(id: i64, seen: &[(ResourceId, i64)]) -> BuildVersions {
        let mut versions: HashMap<ResourceId, Vec<VersionId>> = HashMap::new();
        for (r, v) in seen {
            versions.entry(*r).or_default().push(VersionId::new(*v));
        }
        BuildVersions {
            build_id: BuildId::new(id),
            versions,
        }
    }

    fn ids(resolution: &Resolution) -> Vec<(String, i64)> {
        match resolution {
            Resolution::Satisfied(inputs) => inputs.iter().map(|i| (i.name.clone(), i.version_id.get())).collect(),
            Resolution::Unsatisfiable { input, reason } => panic!("unsatisfiable at {input}: {reason}"),
        }
    }

    /// R1 has v1 (101); R2 has v1 (201) and a newer v2 (202).
    fn snapshot() -> VersionsSnapshot {
        let mut snapshot = VersionsSnapshot::default();
        snapshot.resource_versions.insert(R1, vec![version(101, 1, "a1")]);
        snapshot
            .resource_versions
            .insert(R2, vec![version(202, 3, "b2"), version(201, 2, "b1")]);
        snapshot
    }

    #[test]
    fn test_latest_picks_newest() {
        let snapshot = snapshot();
        let inputs = vec![input("r2", R2, vec![], latest())];
        let resolution = Algorithm::new(&snapshot, 100).resolve(DOWNSTREAM, &inputs);
        assert_eq!(ids(&resolution), vec![("r2".to_string(), 202)]);
    }

    #[test]
    fn test_passed_resolves_from_one_upstream_build() {
        let mut snapshot = snapshot();
        // Only one joint success of the upstream job: R1=v1, R2=v1. R2=v2
        // went through a different build that never saw R1.
        snapshot.successful_builds.insert(
            UPSTREAM,
            vec![build(2, &[(R2, 202)]), build(1, &[(R1, 101), (R2, 201)])],
        );
        let inputs = vec![
            input("r1", R1, vec![UPSTREAM], latest()),
            input("r2", R2, vec![UPSTREAM], latest()),
        ];
        let resolution = Algorithm::new(&snapshot, 100).resolve(DOWNSTREAM, &inputs);
        assert_eq!(
            ids(&resolution),
            vec![("r1".to_string(), 101), ("r2".to_string(), 201)]
        );
    }

    #[test]
    fn test_passed_without_upstream_success_is_unsatisfiable() {
        let snapshot = snapshot();
        let inputs = vec![input("r1", R1, vec![UPSTREAM], latest())];
        let resolution = Algorithm::new(&snapshot, 100).resolve(DOWNSTREAM, &inputs);
        assert!(matches!(resolution, Resolution::Unsatisfiable { ref input, .. } if input == "r1"));
    }

    #[test]
    fn test_pinned_matches_exactly() {
        let snapshot = snapshot();
        let pinned = VersionConfig::Pinned(Version::new().with("ref", "b1"));
        let inputs = vec![input("r2", R2, vec![], pinned)];
        let resolution = Algorithm::new(&snapshot, 100).resolve(DOWNSTREAM, &inputs);
        assert_eq!(ids(&resolution), vec![("r2".to_string(), 201)]);

        let missing = vec![input("r2", R2, vec![], VersionConfig::Pinned(Version::new().with("ref", "zz")))];
        let resolution = Algorithm::new(&snapshot, 100).resolve(DOWNSTREAM, &missing);
        assert!(matches!(resolution, Resolution::Unsatisfiable { ref reason, .. } if reason.contains("pinned")));
    }

    #[test]
    fn test_every_walks_forward_from_last_used() {
        let mut snapshot = VersionsSnapshot::default();
        snapshot.resource_versions.insert(
            R1,
            vec![version(4, 4, "d"), version(3, 3, "c"), version(2, 2, "b"), version(1, 1, "a")],
        );
        let every = VersionConfig::Strategy(VersionStrategy::Every);
        let inputs = vec![input("r1", R1, vec![], every)];

        // Never built: newest.
        let resolution = Algorithm::new(&snapshot, 100).resolve(DOWNSTREAM, &inputs);
        assert_eq!(ids(&resolution), vec![("r1".to_string(), 4)]);

        snapshot.last_inputs.insert(
            DOWNSTREAM,
            vec![BuildInput {
                name: "r1".into(),
                resource_id: R1,
                version_id: VersionId::new(2),
                version: Version::new().with("ref", "b"),
                first_occurrence: true,
            }],
        );
        let resolution = Algorithm::new(&snapshot, 100).resolve(DOWNSTREAM, &inputs);
        assert_eq!(ids(&resolution), vec![("r1".to_string(), 3)]);
    }

    #[test]
    fn test_every_with_nothing_newer_uses_newest() {
        let mut snapshot = VersionsSnapshot::default();
        snapshot
            .resource_versions
            .insert(R1, vec![version(2, 2, "b"), version(1, 1, "a")]);
        snapshot.last_inputs.insert(
            DOWNSTREAM,
            vec![BuildInput {
                name: "r1".into(),
                resource_id: R1,
                version_id: VersionId::new(2),
                version: Version::new().with("ref", "b"),
                first_occurrence: true,
            }],
        );
        let inputs = vec![input("r1", R1, vec![], VersionConfig::Strategy(VersionStrategy::Every))];
        let resolution = Algorithm::new(&snapshot, 100).resolve(DOWNSTREAM, &inputs);
        assert_eq!(ids(&resolution), vec![("r1".to_string(), 2)]);
    }

    #[test]
    fn test_row_limit_caps_candidates() {
        let mut snapshot = VersionsSnapshot::default();
        snapshot
            .resource_versions
            .insert(R1, vec![version(3, 3, "c"), version(2, 2, "b"), version(1, 1, "a")]);
        // Upstream only ever saw the oldest version, which is past the cap.
        snapshot
            .successful_builds
            .insert(UPSTREAM, vec![build(1, &[(R1, 1)])]);
        let inputs = vec![input("r1", R1, vec![UPSTREAM], latest())];
        let resolution = Algorithm::new(&snapshot, 2).resolve(DOWNSTREAM, &inputs);
        // The prefilter runs before the cap, so the old version survives.
        assert_eq!(ids(&resolution), vec![("r1".to_string(), 1)]);

        let unconstrained = vec![input("r1", R1, vec![], latest())];
        let algorithm = Algorithm::new(&snapshot, 1);
        assert_eq!(algorithm.candidates(DOWNSTREAM, &unconstrained[0]).len(), 1);
    }

    #[test]
    fn test_search_budget_exhaustion_is_reported() {
        let mut snapshot = snapshot();
        snapshot.successful_builds.insert(
            UPSTREAM,
            vec![build(2, &[(R2, 202)]), build(1, &[(R1, 101), (R2, 201)])],
        );
        let inputs = vec![
            input("r1", R1, vec![UPSTREAM], latest()),
            input("r2", R2, vec![UPSTREAM], latest()),
        ];
        let resolution = Algorithm::new(&snapshot, 100).with_budget(2).resolve(DOWNSTREAM, &inputs);
        assert!(matches!(resolution, Resolution::Unsatisfiable { ref reason, .. } if reason.contains("budget")));
    }

    #[test]
    fn test_triggers_changed() {
        let resolved = vec![ResolvedInput {
            name: "r1".into(),
            resource_id: R1,
            version_id: VersionId::new(7),
            version: Version::new(),
            trigger: true,
        }];
        assert!(triggers_changed(&resolved, &[]));

        let same = vec![resolved[0].to_build_input()];
        assert!(!triggers_changed(&resolved, &same));

        let mut untriggered = resolved.clone();
        untriggered[0].trigger = false;
        assert!(!triggers_changed(&untriggered, &[]));
    }
}
