//! Container placement.
//!
//! Strategies run in the configured order, each narrowing the candidate
//! set left by the previous one. Limit strategies may narrow it to nothing,
//! in which case the pool waits for capacity.

use rand::seq::SliceRandom;
use skyway_core::config::{ConfigError, CoreConfig};
use skyway_core::worker::Worker;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// Prefer workers already holding the most input volumes.
    VolumeLocality,
    FewestBuildContainers,
    Random,
    LimitActiveContainers(usize),
    LimitActiveVolumes(usize),
    LimitActiveTasks(usize),
}

impl PlacementStrategy {
    pub fn parse(name: &str, config: &CoreConfig) -> Result<Self, ConfigError> {
        Ok(match name {
            "volume-locality" => PlacementStrategy::VolumeLocality,
            "fewest-build-containers" => PlacementStrategy::FewestBuildContainers,
            "random" => PlacementStrategy::Random,
            "limit-active-containers" => {
                PlacementStrategy::LimitActiveContainers(config.max_active_containers_per_worker)
            }
            "limit-active-volumes" => PlacementStrategy::LimitActiveVolumes(config.max_active_volumes_per_worker),
            "limit-active-tasks" => PlacementStrategy::LimitActiveTasks(config.max_active_tasks_per_worker),
            other => return Err(ConfigError::UnknownStrategy(other.to_string())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PlacementStrategy::VolumeLocality => "volume-locality",
            PlacementStrategy::FewestBuildContainers => "fewest-build-containers",
            PlacementStrategy::Random => "random",
            PlacementStrategy::LimitActiveContainers(_) => "limit-active-containers",
            PlacementStrategy::LimitActiveVolumes(_) => "limit-active-volumes",
            PlacementStrategy::LimitActiveTasks(_) => "limit-active-tasks",
        }
    }

    pub fn narrow(&self, candidates: Vec<Worker>, ctx: &PlacementContext) -> Vec<Worker> {
        match *self {
            PlacementStrategy::VolumeLocality => {
                let best = candidates
                    .iter()
                    .map(|w| ctx.input_volumes(&w.name))
                    .max()
                    .unwrap_or(0);
                if best == 0 {
                    return candidates;
                }
                candidates
                    .into_iter()
                    .filter(|w| ctx.input_volumes(&w.name) == best)
                    .collect()
            }
            PlacementStrategy::FewestBuildContainers => {
                let Some(fewest) = candidates.iter().map(|w| ctx.build_containers(&w.name)).min() else {
                    return candidates;
                };
                candidates
                    .into_iter()
                    .filter(|w| ctx.build_containers(&w.name) == fewest)
                    .collect()
            }
            PlacementStrategy::Random => {
                let mut rng = rand::thread_rng();
                candidates.choose(&mut rng).cloned().into_iter().collect()
            }
            PlacementStrategy::LimitActiveContainers(0)
            | PlacementStrategy::LimitActiveVolumes(0)
            | PlacementStrategy::LimitActiveTasks(0) => candidates,
            PlacementStrategy::LimitActiveContainers(max) => candidates
                .into_iter()
                .filter(|w| ctx.containers(&w.name) < max)
                .collect(),
            PlacementStrategy::LimitActiveVolumes(max) => candidates
                .into_iter()
                .filter(|w| ctx.volumes(&w.name) < max)
                .collect(),
            PlacementStrategy::LimitActiveTasks(max) => candidates
                .into_iter()
                .filter(|w| (w.active_tasks.max(0) as usize) < max)
                .collect(),
        }
    }
}

/// Per-worker counts the strategies decide on.
#[derive(Debug, Clone, Default)]
pub struct PlacementContext {
    pub containers: HashMap<String, usize>,
    pub build_containers: HashMap<String, usize>,
    pub volumes: HashMap<String, usize>,
    pub input_volumes: HashMap<String, usize>,
}

impl PlacementContext {
    fn containers(&self, worker: &str) -> usize {
        self.containers.get(worker).copied().unwrap_or(0)
    }

    fn build_containers(&self, worker: &str) -> usize {
        self.build_containers.get(worker).copied().unwrap_or(0)
    }

    fn volumes(&self, worker: &str) -> usize {
        self.volumes.get(worker).copied().unwrap_or(0)
    }

    fn input_volumes(&self, worker: &str) -> usize {
        self.input_volumes.get(worker).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementChain {
    strategies: Vec<PlacementStrategy>,
}

impl PlacementChain {
    pub fn new(strategies: Vec<PlacementStrategy>) -> Self {
        Self { strategies }
    }

    pub fn from_config(config: &CoreConfig) -> Result<Self, ConfigError> {
        let strategies = config
            .container_placement_strategy
            .iter()
            .map(|name| PlacementStrategy::parse(name, config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(strategies))
    }

    pub fn strategies(&self) -> &[PlacementStrategy] {
        &self.strategies
    }

    /// The per-worker task cap, when the chain enforces one.
    pub fn active_task_limit(&self) -> Option<usize> {
        self.strategies.iter().find_map(|s| match s {
            PlacementStrategy::LimitActiveTasks(max) if *max > 0 => Some(*max),
            _ => None,
        })
    }

    /// Pick one worker, or `None` when the chain filtered everyone out.
    pub fn choose(&self, candidates: Vec<Worker>, ctx: &PlacementContext) -> Option<Worker> {
        let mut remaining = candidates;
        for strategy in &self.strategies {
            remaining = strategy.narrow(remaining, ctx);
            if remaining.is_empty() {
                return None;
            }
        }
        let mut rng = rand::thread_rng();
        remaining.choose(&mut rng).cloned()
    }
}

impl Default for PlacementChain {
    fn default() -> Self {
        Self::new(vec![
            PlacementStrategy::VolumeLocality,
            PlacementStrategy::FewestBuildContainers,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skyway_core::worker::WorkerState;

    fn worker(name: &str, active_tasks: i32) -> Worker {
        Worker {
            name: name.to_string(),
            state: WorkerState::Running,
            platform: "linux".to_string(),
            tags: vec![],
            team_id: None,
            garden_addr: format!("{name}:7777"),
            baggageclaim_url: format!("http://{name}:7788"),
            version: "2.5".to_string(),
            resource_types: vec![],
            ephemeral: false,
            active_tasks,
            start_time: Utc::now(),
            last_heartbeat: Utc::now(),
        }
    }

    fn names(workers: &[Worker]) -> Vec<&str> {
        workers.iter().map(|w| w.name.as_str()).collect()
    }

    #[test]
    fn test_parse_uses_configured_limits() {
        let config = CoreConfig {
            max_active_tasks_per_worker: 4,
            ..CoreConfig::default()
        };
        assert_eq!(
            PlacementStrategy::parse("limit-active-tasks", &config).unwrap(),
            PlacementStrategy::LimitActiveTasks(4)
        );
        assert!(PlacementStrategy::parse("least-loaded", &config).is_err());
    }

    #[test]
    fn test_volume_locality_prefers_workers_with_inputs() {
        let mut ctx = PlacementContext::default();
        ctx.input_volumes.insert("b".to_string(), 2);
        ctx.input_volumes.insert("c".to_string(), 1);
        let narrowed = PlacementStrategy::VolumeLocality.narrow(vec![worker("a", 0), worker("b", 0), worker("c", 0)], &ctx);
        assert_eq!(names(&narrowed), vec!["b"]);

        let untouched = PlacementStrategy::VolumeLocality.narrow(vec![worker("a", 0), worker("d", 0)], &ctx);
        assert_eq!(untouched.len(), 2);
    }

    #[test]
    fn test_fewest_build_containers_keeps_ties() {
        let mut ctx = PlacementContext::default();
        ctx.build_containers.insert("a".to_string(), 3);
        let narrowed = PlacementStrategy::FewestBuildContainers.narrow(vec![worker("a", 0), worker("b", 0), worker("c", 0)], &ctx);
        assert_eq!(names(&narrowed), vec!["b", "c"]);
    }

    #[test]
    fn test_limits_filter_and_zero_disables() {
        let mut ctx = PlacementContext::default();
        ctx.containers.insert("a".to_string(), 5);
        ctx.volumes.insert("b".to_string(), 9);
        let all = vec![worker("a", 0), worker("b", 3)];

        assert_eq!(names(&PlacementStrategy::LimitActiveContainers(5).narrow(all.clone(), &ctx)), vec!["b"]);
        assert_eq!(names(&PlacementStrategy::LimitActiveVolumes(9).narrow(all.clone(), &ctx)), vec!["a"]);
        assert_eq!(names(&PlacementStrategy::LimitActiveTasks(3).narrow(all.clone(), &ctx)), vec!["a"]);
        assert_eq!(PlacementStrategy::LimitActiveTasks(0).narrow(all, &ctx).len(), 2);
    }

    #[test]
    fn test_chain_returns_none_when_limits_exhaust_candidates() {
        let chain = PlacementChain::new(vec![
            PlacementStrategy::LimitActiveTasks(1),
            PlacementStrategy::FewestBuildContainers,
        ]);
        let ctx = PlacementContext::default();
        assert!(chain.choose(vec![worker("a", 1), worker("b", 2)], &ctx).is_none());
        assert_eq!(chain.choose(vec![worker("a", 1), worker("b", 0)], &ctx).unwrap().name, "b");
    }

    #[test]
    fn test_chain_from_config() {
        let chain = PlacementChain::from_config(&CoreConfig::default()).unwrap();
        assert_eq!(chain, PlacementChain::default());
    }
}
