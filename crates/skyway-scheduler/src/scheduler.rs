//! The scheduling component.
//!
//! Each pass visits pipelines that asked to be scheduled. Per job it makes
//! sure a pending build exists when trigger inputs moved, then schedules
//! pending builds oldest first while the job's serial groups have room.

use crate::algorithm::{Algorithm, Resolution, input_configs, triggers_changed};
use crate::planner::{PlanContext, plan_job};
use crate::versions::VersionsDb;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use skyway_component::{LeaseManager, Task};
use skyway_core::build::{Build, BuildInput, BuildStatus};
use skyway_core::component::leases;
use skyway_core::config::CoreConfig;
use skyway_core::events::{ErrorPayload, Event};
use skyway_core::job::Job;
use skyway_core::pipeline::Pipeline;
use skyway_core::ports::*;
use skyway_core::resource::{Resource, VersionedResourceType};
use skyway_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const JOB_LEASE_TTL: Duration = Duration::from_secs(60);
const TRANSIENT_RETRIES: u32 = 3;

/// What one job's scheduling pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub created: bool,
    pub scheduled: usize,
}

/// Pipeline-wide state shared by every job in one pass.
struct PipelineState {
    pipeline: Pipeline,
    jobs: Vec<Job>,
    resources: Vec<Resource>,
    resource_types: Vec<VersionedResourceType>,
    snapshot: Arc<VersionsSnapshot>,
}

pub struct Scheduler {
    pipelines: Arc<dyn PipelineRepository>,
    builds: Arc<dyn BuildRepository>,
    creator: Arc<dyn BuildCreator>,
    versions: Arc<dyn VersionRepository>,
    events: Arc<dyn EventStore>,
    versions_db: VersionsDb,
    leases: Arc<LeaseManager>,
    max_in_flight: usize,
}

impl Scheduler {
    pub fn new(
        pipelines: Arc<dyn PipelineRepository>,
        builds: Arc<dyn BuildRepository>,
        creator: Arc<dyn BuildCreator>,
        versions: Arc<dyn VersionRepository>,
        events: Arc<dyn EventStore>,
        leases: Arc<LeaseManager>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            pipelines,
            builds,
            creator,
            versions_db: VersionsDb::new(versions.clone(), config.algorithm_candidate_row_limit),
            versions,
            events,
            leases,
            max_in_flight: config.job_scheduling_max_in_flight.max(1),
        }
    }

    /// Schedule every unpaused job of one pipeline.
    pub async fn schedule_pipeline(
        &self,
        pipeline: &Pipeline,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, JobOutcome>> {
        let state = Arc::new(self.load(pipeline).await?);

        let active: Vec<Job> = job_order(&state.jobs).into_iter().filter(|j| !j.paused).collect();

        // Jobs sharing a serial group count each other's builds, so they
        // are scheduled one after another; unrelated jobs run concurrently.
        let outcomes: Vec<Vec<(String, JobOutcome)>> = stream::iter(serial_clusters(active))
            .map(|cluster| {
                let state = state.clone();
                async move {
                    let mut outcomes = Vec::with_capacity(cluster.len());
                    for job in &cluster {
                        match self.schedule_job_leased(&state, job, cancel).await {
                            Ok(Some(outcome)) => outcomes.push((job.name.clone(), outcome)),
                            Ok(None) => {}
                            Err(e) => {
                                warn!(pipeline = %state.pipeline.name, job = %job.name, error = %e, "Job scheduling failed");
                            }
                        }
                    }
                    outcomes
                }
            })
            .buffer_unordered(self.max_in_flight)
            .collect()
            .await;

        Ok(outcomes.into_iter().flatten().collect())
    }

    async fn load(&self, pipeline: &Pipeline) -> Result<PipelineState> {
        let jobs = self.pipelines.jobs(pipeline.id).await?;
        let resources = self.pipelines.resources(pipeline.id).await?;
        let resource_types = self.versioned_resource_types(pipeline).await?;
        let snapshot = self.versions_db.snapshot(pipeline.id).await?;
        Ok(PipelineState {
            pipeline: pipeline.clone(),
            jobs,
            resources,
            resource_types,
            snapshot,
        })
    }

    /// Custom types paired with the latest version of their image.
    async fn versioned_resource_types(&self, pipeline: &Pipeline) -> Result<Vec<VersionedResourceType>> {
        let mut versioned = Vec::new();
        for rt in self.pipelines.resource_types(pipeline.id).await? {
            let version = match rt.resource_config_id {
                Some(config_id) => self.versions.latest_version(config_id).await?.map(|v| v.version),
                None => None,
            };
            versioned.push(VersionedResourceType {
                name: rt.name,
                type_name: rt.type_name,
                source: rt.source,
                params: rt.params,
                privileged: rt.privileged,
                tags: rt.tags,
                version,
            });
        }
        Ok(versioned)
    }

    /// `None` if another scheduler holds the job.
    async fn schedule_job_leased(
        &self,
        state: &PipelineState,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Option<JobOutcome>> {
        let Some(lease) = self
            .leases
            .acquire(&leases::job_scheduling(job.id), JOB_LEASE_TTL)
            .await?
        else {
            debug!(job = %job.name, "Job is being scheduled elsewhere");
            return Ok(None);
        };

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.schedule_job(state, job, cancel).await {
                Err(e) if e.is_transient() && attempt < TRANSIENT_RETRIES && !lease.is_lost() => {
                    debug!(job = %job.name, attempt, error = %e, "Transient scheduling error, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                other => break other,
            }
        };

        if let Err(e) = lease.release().await {
            warn!(job = %job.name, error = %e, "Failed to release job scheduling lease");
        }
        result.map(Some)
    }

    async fn schedule_job(&self, state: &PipelineState, job: &Job, cancel: &CancellationToken) -> Result<JobOutcome> {
        let mut outcome = JobOutcome::default();
        let inputs = input_configs(job, &state.resources, &state.jobs)?;
        let algorithm = Algorithm::new(&state.snapshot, self.versions_db.row_limit());
        let resolution = algorithm.resolve(job.id, &inputs);

        if let Resolution::Satisfied(resolved) = &resolution {
            let last = self.builds.latest_inputs(job.id).await?;
            if triggers_changed(resolved, &last)
                && let Some(build) = self.creator.ensure_pending_build_exists(job).await?
            {
                info!(job = %job.name, build = %build.name, "Created pending build for new trigger inputs");
                outcome.created = true;
            }
        }

        let mut pending = self.builds.pending_builds(job.id).await?;
        pending.sort_by_key(|b| b.id);
        let groups = job.serial_groups();
        let max = job.max_in_flight() as usize;

        for build in pending.into_iter().filter(|b| !b.scheduled) {
            if cancel.is_cancelled() {
                break;
            }
            if max > 0 {
                let in_flight = self.builds.count_in_flight(state.pipeline.id, &groups).await?;
                if in_flight >= max {
                    debug!(job = %job.name, in_flight, max, "Max in flight reached");
                    break;
                }
            }

            let build_inputs: Vec<BuildInput> = if build.inputs_determined {
                self.builds.inputs(build.id).await?
            } else {
                match &resolution {
                    Resolution::Satisfied(resolved) => resolved.iter().map(|r| r.to_build_input()).collect(),
                    Resolution::Unsatisfiable { input, reason } => {
                        debug!(job = %job.name, build = %build.name, input = %input, reason = %reason, "Inputs not satisfiable yet");
                        break;
                    }
                }
            };

            let ctx = PlanContext {
                resources: &state.resources,
                resource_types: &state.resource_types,
                inputs: &build_inputs,
            };
            let plan = match plan_job(&job.config, &ctx) {
                Ok(plan) => plan,
                Err(e) if e.is_user_error() || matches!(e, Error::ResourceNotFound(_)) => {
                    self.error_build(&build, &e).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if self.builds.schedule_build(build.id, &build_inputs, &plan).await? {
                info!(job = %job.name, build = %build.name, "Build scheduled");
                outcome.scheduled += 1;
            }
        }
        Ok(outcome)
    }

    /// A build whose plan cannot be built is errored with the reason on its
    /// event stream.
    async fn error_build(&self, build: &Build, err: &Error) -> Result<()> {
        warn!(build_id = %build.id, build = %build.name, error = %err, "Failed to plan build");
        self.events
            .put(
                build,
                vec![
                    Event::Error(ErrorPayload {
                        origin: None,
                        message: err.to_string(),
                        time: Utc::now(),
                    }),
                    Event::status(BuildStatus::Errored),
                ],
            )
            .await?;
        self.builds.finish_build(build.id, BuildStatus::Errored).await?;
        self.events.finalize(build).await
    }
}

#[async_trait]
impl Task for Scheduler {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        for (pipeline, requested_at) in self.pipelines.pipelines_requesting_schedule().await? {
            if cancel.is_cancelled() {
                break;
            }
            match self.schedule_pipeline(&pipeline, &cancel).await {
                Ok(outcomes) => {
                    let scheduled: usize = outcomes.values().map(|o| o.scheduled).sum();
                    debug!(pipeline = %pipeline.name, jobs = outcomes.len(), scheduled, "Pipeline scheduled");
                    self.pipelines.update_last_scheduled(pipeline.id, requested_at).await?;
                }
                Err(e) => warn!(pipeline = %pipeline.name, error = %e, "Pipeline scheduling failed"),
            }
        }
        Ok(())
    }
}

/// Jobs ordered so upstream `passed` jobs come before their dependents.
/// Cyclic configs fall back to id order.
fn job_order(jobs: &[Job]) -> Vec<Job> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..jobs.len()).map(|i| graph.add_node(i)).collect();
    let by_name: HashMap<&str, NodeIndex> = jobs.iter().zip(&nodes).map(|(j, n)| (j.name.as_str(), *n)).collect();

    for (job, node) in jobs.iter().zip(&nodes) {
        for input in job.config.inputs() {
            for upstream in &input.passed {
                if let Some(from) = by_name.get(upstream.as_str())
                    && from != node
                {
                    graph.update_edge(*from, *node, ());
                }
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => order.into_iter().map(|n| jobs[graph[n]].clone()).collect(),
        Err(_) => {
            let mut sorted = jobs.to_vec();
            sorted.sort_by_key(|j| j.id);
            sorted
        }
    }
}

/// Partition jobs so that any two sharing a serial group, directly or
/// through a chain of jobs, land in the same cluster. Order is kept.
fn serial_clusters(jobs: Vec<Job>) -> Vec<Vec<Job>> {
    let mut clusters: Vec<(Vec<String>, Vec<Job>)> = Vec::new();
    for job in jobs {
        let groups = job.serial_groups();
        let mut merged: (Vec<String>, Vec<Job>) = (groups.clone(), Vec::new());
        let mut i = 0;
        while i < clusters.len() {
            if !groups.is_empty() && clusters[i].0.iter().any(|g| groups.contains(g)) {
                let (cluster_groups, cluster_jobs) = clusters.remove(i);
                merged.0.extend(cluster_groups);
                merged.1.extend(cluster_jobs);
            } else {
                i += 1;
            }
        }
        merged.1.push(job);
        clusters.push(merged);
    }
    clusters.into_iter().map(|(_, jobs)| jobs).collect()
}
