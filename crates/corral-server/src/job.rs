//! Job endpoints: register, deregister, scale.

use serde::{Deserialize, Serialize};
use tracing::info;

use corral_state::{Allocation, Command, EvalTrigger, Evaluation, Job, DEFAULT_NAMESPACE};

use crate::error::{ServerError, ServerResult};
use crate::server::Server;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobWriteResponse {
    pub index: u64,
    pub eval_id: String,
    pub job_modify_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobScaleRequest {
    #[serde(default)]
    pub namespace: String,
    pub job_id: String,
    /// May be omitted when the job has exactly one group.
    #[serde(default)]
    pub group: Option<String>,
    pub count: u32,
    /// Apply only if the job's modify index still matches.
    #[serde(default)]
    pub check_index: Option<u64>,
}

impl Server {
    pub async fn register_job(&self, mut job: Job) -> ServerResult<JobWriteResponse> {
        self.ensure_leader()?;
        job.canonicalize();
        job.validate()?;
        job.stop = false;
        self.commit_job(job, EvalTrigger::JobRegister, None)
    }

    /// Mark a job stopped. Its allocations are stopped by the evaluation.
    pub async fn deregister_job(&self, namespace: &str, job_id: &str) -> ServerResult<JobWriteResponse> {
        self.ensure_leader()?;
        let mut job = self.job_or_not_found(namespace, job_id)?;
        job.stop = true;
        let key = job.key();
        let resp = self.commit_job(job, EvalTrigger::JobDeregister, None)?;
        self.inner.blocked.untrack(&key);
        Ok(resp)
    }

    pub async fn scale_job(&self, req: JobScaleRequest) -> ServerResult<JobWriteResponse> {
        self.ensure_leader()?;
        let namespace = if req.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            req.namespace.as_str()
        };
        let mut job = self.job_or_not_found(namespace, &req.job_id)?;

        let group = match req.group.as_deref() {
            Some(group) => group.to_string(),
            None if job.task_groups.len() == 1 => job.task_groups[0].name.clone(),
            None => return Err(ServerError::invalid("group name required")),
        };
        let Some(tg) = job.task_groups.iter_mut().find(|tg| tg.name == group) else {
            return Err(ServerError::invalid(format!("group {group:?} not found")));
        };
        let previous = tg.count;
        tg.count = req.count;

        let resp = self.commit_job(job, EvalTrigger::JobScaling, req.check_index)?;
        info!(job = %req.job_id, %group, from = previous, to = req.count, "job scaled");
        Ok(resp)
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_job(&self, namespace: &str, job_id: &str) -> ServerResult<Job> {
        self.job_or_not_found(namespace, job_id)
    }

    pub fn list_jobs(&self) -> ServerResult<Vec<Job>> {
        Ok(self.inner.state.list_jobs()?)
    }

    pub fn job_allocations(&self, namespace: &str, job_id: &str) -> ServerResult<Vec<Allocation>> {
        self.job_or_not_found(namespace, job_id)?;
        Ok(self.inner.state.allocs_by_job(namespace, job_id)?)
    }

    pub fn job_evaluations(&self, namespace: &str, job_id: &str) -> ServerResult<Vec<Evaluation>> {
        let mut evals: Vec<Evaluation> = self
            .inner
            .state
            .list_evals()?
            .into_iter()
            .filter(|e| e.namespace == namespace && e.job_id == job_id)
            .collect();
        evals.sort_by_key(|e| e.create_index);
        Ok(evals)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn job_or_not_found(&self, namespace: &str, job_id: &str) -> ServerResult<Job> {
        self.inner
            .state
            .get_job(namespace, job_id)?
            .ok_or_else(|| ServerError::NotFound(format!("job {namespace}/{job_id}")))
    }

    /// Commit `job` with a fresh evaluation. With `check_index` the store
    /// refuses the write unless the job is unchanged since that index.
    fn commit_job(
        &self,
        job: Job,
        trigger: EvalTrigger,
        check_index: Option<u64>,
    ) -> ServerResult<JobWriteResponse> {
        let eval = Evaluation::for_job(&job, trigger);
        let eval_id = eval.id.clone();
        let key = job.key();
        let index = self.inner.state.apply(Command::UpsertJob {
            job,
            eval: Some(eval.clone()),
            check_index,
        })?;
        self.inner.dispatch.enqueue(vec![eval], index);
        info!(job = %key, %eval_id, %trigger, index, "job committed");
        Ok(JobWriteResponse {
            index,
            eval_id,
            job_modify_index: index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::ServerConfig;
    use corral_state::{EvalStatus, Resources, StateStore, TaskGroup};
    use std::collections::BTreeMap;

    async fn leader() -> Server {
        let mut config = ServerConfig::default();
        config.scheduler.num_schedulers = 0;
        let server = Server::new(config, StateStore::open_in_memory().unwrap());
        server.establish_leadership().await.unwrap();
        server
    }

    fn group(name: &str, count: u32) -> TaskGroup {
        TaskGroup {
            name: name.to_string(),
            count,
            resources: Resources::new(100, 64),
            constraints: Vec::new(),
            volumes: BTreeMap::new(),
        }
    }

    fn job(groups: Vec<TaskGroup>) -> Job {
        Job {
            id: "web".to_string(),
            namespace: String::new(),
            name: String::new(),
            node_pool: String::new(),
            priority: 50,
            constraints: Vec::new(),
            task_groups: groups,
            stop: false,
            version: 0,
            create_index: 0,
            modify_index: 0,
            submit_time: 0,
        }
    }

    #[tokio::test]
    async fn test_register_creates_pending_eval() {
        let server = leader().await;
        let resp = server.register_job(job(vec![group("app", 2)])).await.unwrap();

        let stored = server.get_job("default", "web").unwrap();
        assert_eq!(stored.modify_index, resp.job_modify_index);
        let eval = server.state().get_eval(&resp.eval_id).unwrap().unwrap();
        assert_eq!(eval.status, EvalStatus::Pending);
        assert_eq!(eval.triggered_by, EvalTrigger::JobRegister);
        assert!(server.broker().eval_state(&resp.eval_id).is_some());
    }

    #[tokio::test]
    async fn test_register_validates() {
        let server = leader().await;
        let mut bad = job(Vec::new());
        bad.priority = 0;
        let err = server.register_job(bad).await.unwrap_err();
        match err {
            ServerError::Validation(v) => assert_eq!(v.errors.len(), 2),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_scale_rules() {
        let server = leader().await;
        let resp = server
            .register_job(job(vec![group("app", 1), group("db", 1)]))
            .await
            .unwrap();

        let mut req = JobScaleRequest {
            namespace: String::new(),
            job_id: "web".into(),
            group: None,
            count: 3,
            check_index: None,
        };
        let err = server.scale_job(req.clone()).await.unwrap_err();
        assert!(err.to_string().contains("group name required"), "{err}");

        req.group = Some("cache".into());
        let err = server.scale_job(req.clone()).await.unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");

        req.group = Some("app".into());
        req.check_index = Some(resp.job_modify_index + 100);
        assert!(matches!(
            server.scale_job(req.clone()).await,
            Err(ServerError::Conflict(_))
        ));

        req.check_index = Some(resp.job_modify_index);
        let scaled = server.scale_job(req).await.unwrap();
        let stored = server.get_job("default", "web").unwrap();
        assert_eq!(stored.lookup_task_group("app").unwrap().count, 3);
        assert_eq!(stored.version, 1);
        let eval = server.state().get_eval(&scaled.eval_id).unwrap().unwrap();
        assert_eq!(eval.triggered_by, EvalTrigger::JobScaling);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_scales_with_same_check_index() {
        let server = leader().await;
        let resp = server.register_job(job(vec![group("app", 1)])).await.unwrap();
        let scale = |count| JobScaleRequest {
            namespace: String::new(),
            job_id: "web".into(),
            group: None,
            count,
            check_index: Some(resp.job_modify_index),
        };

        let (a, b) = (server.clone(), server.clone());
        let (req_a, req_b) = (scale(2), scale(5));
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.scale_job(req_a).await }),
            tokio::spawn(async move { b.scale_job(req_b).await }),
        );
        let results = [ra.unwrap(), rb.unwrap()];
        let won: Vec<&JobWriteResponse> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(won.len(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ServerError::Conflict(_)))));

        let stored = server.get_job("default", "web").unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.modify_index, won[0].job_modify_index);
    }

    #[tokio::test]
    async fn test_deregister_marks_stopped() {
        let server = leader().await;
        server.register_job(job(vec![group("app", 1)])).await.unwrap();
        let resp = server.deregister_job("default", "web").await.unwrap();
        assert!(server.get_job("default", "web").unwrap().stop);
        let eval = server.state().get_eval(&resp.eval_id).unwrap().unwrap();
        assert_eq!(eval.triggered_by, EvalTrigger::JobDeregister);

        assert!(matches!(
            server.deregister_job("default", "ghost").await,
            Err(ServerError::NotFound(_))
        ));
    }
}
