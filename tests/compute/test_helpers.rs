//! Shared fixtures for provisioning BDD scenarios.

use std::collections::BTreeSet;
use std::time::Duration;

use cumulus::test_support::{ScriptedSocketProbe, ScriptedSshFactory};
use cumulus::{
    BoundedRetry, ComputeService, ComputeSettings, ExecutionStage, NodeId, NodeMetadata,
    RetryablePredicate, StubAccount, StubBackend, Template,
};
use rstest::fixture;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};

pub const IDENTITY: &str = "scenario";
pub const SECRET: &str = "scenario-secret";
pub const KEY: &str = "-----BEGIN SCENARIO KEY-----";

pub type Service = ComputeService<StubBackend, ScriptedSshFactory, ScriptedSocketProbe>;

#[derive(Clone, Debug)]
pub struct ComputeContext {
    pub account: StubAccount,
    pub ssh: ScriptedSshFactory,
    pub probe: ScriptedSocketProbe,
    pub template: Option<Template>,
    pub seeded: Vec<NodeMetadata>,
    pub outcome: Option<StepOutcome>,
}

#[derive(Clone, Debug)]
pub enum StepOutcome {
    Created {
        nodes: Vec<NodeMetadata>,
        failures: usize,
    },
    Script {
        auth_failures: BTreeSet<NodeId>,
        stages: Vec<ExecutionStage>,
    },
    Batch {
        succeeded: usize,
        swallowed: usize,
        failed: usize,
    },
    Templates(Box<Template>, Box<Template>),
    Failed {
        authorization: bool,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("cannot start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

impl ComputeContext {
    pub fn service(&self) -> Service {
        self.service_with_secret(SECRET)
    }

    pub fn service_with_secret(&self, secret: &str) -> Service {
        ComputeService::new(
            StubBackend::new(self.account.clone(), IDENTITY, secret),
            self.ssh.clone(),
            self.probe.clone(),
            settings(),
        )
    }

    pub fn template(&self) -> Result<&Template, StepError> {
        self.template
            .as_ref()
            .ok_or_else(|| StepError::Assertion(String::from("no template resolved")))
    }

    pub fn with_outcome(mut self, outcome: StepOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

fn settings() -> ComputeSettings {
    ComputeSettings {
        node_running_timeout: Duration::from_secs(30),
        node_poll_period: Duration::from_secs(1),
        catalog_ttl: Duration::from_secs(60),
        socket_wait: RetryablePredicate::from_attempts(3, Duration::from_secs(1)),
        verify: BoundedRetry::new(2, Duration::from_secs(1)),
    }
}

/// Single-threaded runtime on a paused clock, so polling waits are instant.
pub fn runtime() -> Result<Runtime, StepError> {
    Ok(Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()?)
}

#[fixture]
pub fn compute_context() -> ComputeContext {
    let account = StubAccount::with_default_catalog(IDENTITY, SECRET);
    ComputeContext {
        ssh: ScriptedSshFactory::for_account(account.clone()),
        probe: ScriptedSocketProbe::always_open(),
        account,
        template: None,
        seeded: Vec::new(),
        outcome: None,
    }
}
