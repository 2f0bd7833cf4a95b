//! Pipeline observability: evaluation status and plan results.

use serde::Serialize;

use corral_broker::{BrokerStats, EvalState};
use corral_state::{Evaluation, PlanResult};

use crate::error::{ServerError, ServerResult};
use crate::server::Server;

#[derive(Debug, Clone, Serialize)]
pub struct EvalStatusResponse {
    pub eval: Evaluation,
    /// Where the evaluation sits in the leader's broker, if anywhere.
    pub broker_state: Option<EvalState>,
}

impl Server {
    pub fn eval_status(&self, eval_id: &str) -> ServerResult<EvalStatusResponse> {
        let eval = self
            .inner
            .state
            .get_eval(eval_id)?
            .ok_or_else(|| ServerError::NotFound(format!("evaluation {eval_id}")))?;
        Ok(EvalStatusResponse {
            eval,
            broker_state: self.inner.broker.eval_state(eval_id),
        })
    }

    pub fn list_evals(&self) -> ServerResult<Vec<Evaluation>> {
        let mut evals = self.inner.state.list_evals()?;
        evals.sort_by_key(|e| e.create_index);
        Ok(evals)
    }

    pub fn plan_result(&self, eval_id: &str) -> ServerResult<PlanResult> {
        self.inner
            .state
            .get_plan_result(eval_id)?
            .ok_or_else(|| ServerError::NotFound(format!("plan result for evaluation {eval_id}")))
    }

    pub fn broker_stats(&self) -> ServerResult<BrokerStats> {
        self.ensure_leader()?;
        Ok(self.inner.broker.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::ServerConfig;
    use corral_state::{Command, EvalTrigger, StateStore};

    #[tokio::test]
    async fn test_eval_status_reports_broker_state() {
        let mut config = ServerConfig::default();
        config.scheduler.num_schedulers = 0;
        let server = Server::new(config, StateStore::open_in_memory().unwrap());

        let eval = Evaluation::new("default", "web", 50, EvalTrigger::JobRegister);
        server
            .state()
            .apply(Command::UpsertEvals { evals: vec![eval.clone()] })
            .unwrap();

        let status = server.eval_status(&eval.id).unwrap();
        assert_eq!(status.broker_state, None);
        assert!(matches!(server.broker_stats(), Err(ServerError::NotLeader)));

        server.establish_leadership().await.unwrap();
        let status = server.eval_status(&eval.id).unwrap();
        assert_eq!(status.broker_state, Some(EvalState::Ready));
        assert_eq!(server.broker_stats().unwrap().total_ready, 1);

        assert!(matches!(server.eval_status("nope"), Err(ServerError::NotFound(_))));
        assert!(matches!(server.plan_result(&eval.id), Err(ServerError::NotFound(_))));
        server.revoke_leadership().await;
    }
}
