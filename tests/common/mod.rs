#![allow(dead_code)]

use sim_relay::bootstrap::{LocalBootstrapper, RelaySession};
use sim_relay::execution::{Command, JobManagerConfig, ParameterBatch, ParameterSet};
use sim_relay::testing::{ScriptedEngine, DELAY_PARAMETER, TILLER_INTERCEPT};

/// One parameter set per value, varying only the tiller intercept
pub fn tiller_batch(values: &[&str]) -> ParameterBatch {
    values
        .iter()
        .map(|v| ParameterSet::new().with(TILLER_INTERCEPT, *v))
        .collect()
}

/// Tiller batch where worker `slow` sleeps for `delay_ms` before reporting
pub fn tiller_batch_with_delay(values: &[&str], slow: usize, delay_ms: u64) -> ParameterBatch {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let set = ParameterSet::new().with(TILLER_INTERCEPT, *v);
            if i == slow {
                set.with(DELAY_PARAMETER, delay_ms.to_string())
            } else {
                set
            }
        })
        .collect()
}

pub fn yield_command(batch: ParameterBatch) -> Command {
    Command::new(batch, "Report", ["Yield"]).unwrap()
}

/// Session over `count` local TCP workers running `engine`
pub async fn local_session(count: usize, engine: ScriptedEngine, worker_timeout_ms: u64) -> RelaySession {
    let bootstrapper = LocalBootstrapper::new(engine).with_job_manager_config(JobManagerConfig {
        worker_timeout_ms,
    });
    let mut session = RelaySession::start(bootstrapper).await.unwrap();
    session.provision(count, None).await.unwrap();
    session
}
