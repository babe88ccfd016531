//! BDD step definitions for tagged node provisioning.

use std::collections::BTreeSet;

use cumulus::{
    ComputeError, Credentials, FailureKind, NodeId, NodeMetadata, NodeState,
    RunScriptOptions, StubError, TemplateOptions, running_in_tag,
};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{ComputeContext, KEY, Service, StepError, StepOutcome, runtime};

fn failed(err: &ComputeError<StubError>) -> StepOutcome {
    StepOutcome::Failed {
        authorization: err.is_authorization(),
        message: err.to_string(),
    }
}

async fn smallest_template(service: &Service) -> Result<cumulus::Template, StepError> {
    service
        .template_builder()
        .await
        .map_err(|err| StepError::Assertion(format!("catalog: {err}")))?
        .smallest()
        .options(TemplateOptions::new().install_private_key(KEY))
        .build()
        .map_err(|err| StepError::Assertion(format!("template: {err}")))
}

fn ids(nodes: &[NodeMetadata]) -> BTreeSet<NodeId> {
    nodes.iter().map(|node| node.id.clone()).collect()
}

#[given("a stub provider account")]
fn stub_account(compute_context: ComputeContext) -> ComputeContext {
    compute_context
}

#[given("a template for the smallest size")]
fn smallest_size_template(
    mut compute_context: ComputeContext,
) -> Result<ComputeContext, StepError> {
    let service = compute_context.service();
    let template = runtime()?.block_on(smallest_template(&service))?;
    compute_context.template = Some(template);
    Ok(compute_context)
}

#[given("\"{count}\" nodes tagged \"{tag}\" already exist")]
fn existing_nodes(
    mut compute_context: ComputeContext,
    count: usize,
    tag: String,
) -> Result<ComputeContext, StepError> {
    let service = compute_context.service();
    let template = compute_context.template()?.clone();
    let outcome = runtime()?
        .block_on(service.run_nodes_with_tag(&tag, count, &template))
        .map_err(|err| StepError::Assertion(format!("seeding nodes: {err}")))?;
    if !outcome.is_complete() {
        return Err(StepError::Assertion(format!(
            "seeding left failures: {:?}",
            outcome.failures
        )));
    }
    compute_context.seeded = outcome.nodes;
    Ok(compute_context)
}

#[given("destroying the first node is unsupported")]
fn first_destroy_unsupported(compute_context: ComputeContext) -> Result<ComputeContext, StepError> {
    let first = compute_context
        .seeded
        .first()
        .ok_or_else(|| StepError::Assertion(String::from("no seeded nodes")))?;
    compute_context
        .account
        .fail_destroy_of(&first.id, FailureKind::Unsupported);
    Ok(compute_context)
}

#[when("I run \"{count}\" nodes tagged \"{tag}\"")]
fn run_nodes(
    compute_context: ComputeContext,
    count: usize,
    tag: String,
) -> Result<ComputeContext, StepError> {
    let service = compute_context.service();
    let template = compute_context.template()?.clone();
    let result = runtime()?.block_on(service.run_nodes_with_tag(&tag, count, &template));
    let outcome = match result {
        Ok(created) => StepOutcome::Created {
            failures: created.failures.len(),
            nodes: created.nodes,
        },
        Err(err) => failed(&err),
    };
    Ok(compute_context.with_outcome(outcome))
}

#[when("I run \"{script}\" on nodes tagged \"{tag}\" with key \"{key}\"")]
fn run_script_with_key(
    compute_context: ComputeContext,
    script: String,
    tag: String,
    key: String,
) -> Result<ComputeContext, StepError> {
    let service = compute_context.service();
    let options =
        RunScriptOptions::new().override_credentials_with(Credentials::new("root", key));
    let report = runtime()?
        .block_on(service.run_script_on_nodes_matching(running_in_tag(&tag), &script, &options))
        .map_err(|err| StepError::Assertion(format!("script run: {err}")))?;
    let outcome = StepOutcome::Script {
        auth_failures: report.auth_failures(),
        stages: report.failures().map(|(_, failure)| failure.stage()).collect(),
    };
    Ok(compute_context.with_outcome(outcome))
}

#[when("I reboot nodes tagged \"{tag}\"")]
fn reboot_nodes(compute_context: ComputeContext, tag: String) -> Result<ComputeContext, StepError> {
    let service = compute_context.service();
    let outcome = match runtime()?.block_on(service.reboot_nodes_with_tag(&tag)) {
        Ok(batch) => StepOutcome::Batch {
            succeeded: batch.succeeded.len(),
            swallowed: batch.swallowed.len(),
            failed: batch.failed.len() + batch.unsettled.len(),
        },
        Err(err) => failed(&err),
    };
    Ok(compute_context.with_outcome(outcome))
}

#[when("I destroy nodes tagged \"{tag}\"")]
fn destroy_nodes(compute_context: ComputeContext, tag: String) -> Result<ComputeContext, StepError> {
    let service = compute_context.service();
    let outcome = match runtime()?.block_on(service.destroy_nodes_with_tag(&tag)) {
        Ok(batch) => StepOutcome::Batch {
            succeeded: batch.succeeded.len(),
            swallowed: batch.swallowed.len(),
            failed: batch.failed.len() + batch.unsettled.len(),
        },
        Err(err) => failed(&err),
    };
    Ok(compute_context.with_outcome(outcome))
}

#[when("I resolve the smallest template twice")]
fn resolve_twice(compute_context: ComputeContext) -> Result<ComputeContext, StepError> {
    let first_service = compute_context.service();
    let second_service = compute_context.service();
    let rt = runtime()?;
    let first = rt.block_on(smallest_template(&first_service))?;
    let second = rt.block_on(smallest_template(&second_service))?;
    Ok(compute_context.with_outcome(StepOutcome::Templates(Box::new(first), Box::new(second))))
}

#[when("a client with secret \"{secret}\" lists nodes")]
fn list_with_secret(
    compute_context: ComputeContext,
    secret: String,
) -> Result<ComputeContext, StepError> {
    let service = compute_context.service_with_secret(&secret);
    let outcome = match runtime()?.block_on(service.list_nodes()) {
        Ok(nodes) => StepOutcome::Created { nodes, failures: 0 },
        Err(err) => failed(&err),
    };
    Ok(compute_context.with_outcome(outcome))
}

fn created(compute_context: &ComputeContext) -> Result<&[NodeMetadata], StepError> {
    match &compute_context.outcome {
        Some(StepOutcome::Created { nodes, failures: 0 }) => Ok(nodes),
        other => Err(StepError::Assertion(format!(
            "expected a complete batch, got {other:?}"
        ))),
    }
}

#[then("\"{count}\" nodes are RUNNING")]
fn nodes_running(compute_context: &ComputeContext, count: usize) -> Result<(), StepError> {
    let nodes = created(compute_context)?;
    if nodes.len() != count {
        return Err(StepError::Assertion(format!(
            "expected {count} nodes, got {}",
            nodes.len()
        )));
    }
    match nodes.iter().find(|node| node.state != NodeState::Running) {
        None => Ok(()),
        Some(node) => Err(StepError::Assertion(format!(
            "node {} is {}",
            node.id, node.state
        ))),
    }
}

#[then("every node uses the template image")]
fn nodes_use_template_image(compute_context: &ComputeContext) -> Result<(), StepError> {
    let image = &compute_context.template()?.image.id;
    let nodes = created(compute_context)?;
    if nodes.iter().all(|node| &node.image == image) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected every node to use {image}"
        )))
    }
}

#[then("every node is placed in the template location or below it")]
fn nodes_in_template_location(compute_context: &ComputeContext) -> Result<(), StepError> {
    let expected = &compute_context.template()?.location.id;
    let nodes = created(compute_context)?;
    let service = compute_context.service();
    let catalog = runtime()?
        .block_on(service.catalog())
        .map_err(|err| StepError::Assertion(format!("catalog: {err}")))?;
    for node in nodes {
        let placed = catalog
            .locations
            .is_same_or_child(&node.location, expected)
            .map_err(|err| StepError::Assertion(err.to_string()))?;
        if !placed {
            return Err(StepError::Assertion(format!(
                "node {} placed in {} outside {expected}",
                node.id, node.location
            )));
        }
    }
    Ok(())
}

#[then("a fresh client lists \"{count}\" nodes tagged \"{tag}\"")]
fn fresh_client_lists(
    compute_context: &ComputeContext,
    count: usize,
    tag: String,
) -> Result<(), StepError> {
    let service = compute_context.service();
    let listed = runtime()?
        .block_on(service.list_nodes_matching(running_in_tag(&tag)))
        .map_err(|err| StepError::Assertion(format!("list: {err}")))?;
    if listed.len() == count && ids(&compute_context.seeded).is_subset(&ids(&listed)) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} nodes including the seeded ones, got {:?}",
            ids(&listed)
        )))
    }
}

#[then("every node reports \"{stage}\"")]
fn every_node_reports(compute_context: &ComputeContext, stage: String) -> Result<(), StepError> {
    let Some(StepOutcome::Script {
        auth_failures,
        stages,
    }) = &compute_context.outcome
    else {
        return Err(StepError::Assertion(String::from(
            "expected a script outcome",
        )));
    };
    let expected = ids(&compute_context.seeded);
    if auth_failures != &expected {
        return Err(StepError::Assertion(format!(
            "expected auth failures on {expected:?}, got {auth_failures:?}"
        )));
    }
    if stages.len() == expected.len() && stages.iter().all(|seen| seen.as_str() == stage) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected every failure at {stage}, got {stages:?}"
        )))
    }
}

#[then("the nodes tagged \"{tag}\" keep their ids and addresses")]
fn nodes_keep_identity(compute_context: &ComputeContext, tag: String) -> Result<(), StepError> {
    match &compute_context.outcome {
        Some(StepOutcome::Batch {
            succeeded,
            swallowed: 0,
            failed: 0,
        }) if *succeeded == compute_context.seeded.len() => {}
        other => {
            return Err(StepError::Assertion(format!(
                "expected a clean reboot, got {other:?}"
            )));
        }
    }
    let service = compute_context.service();
    let listed = runtime()?
        .block_on(service.list_nodes_matching(running_in_tag(&tag)))
        .map_err(|err| StepError::Assertion(format!("list: {err}")))?;
    let before: Vec<_> = compute_context
        .seeded
        .iter()
        .map(|node| (&node.id, &node.public_addresses))
        .collect();
    let after: Vec<_> = listed
        .iter()
        .map(|node| (&node.id, &node.public_addresses))
        .collect();
    if before == after {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "identity changed: {before:?} became {after:?}"
        )))
    }
}

#[then("\"{count}\" destroy failure is swallowed")]
fn destroy_swallowed(compute_context: &ComputeContext, count: usize) -> Result<(), StepError> {
    match &compute_context.outcome {
        Some(StepOutcome::Batch {
            swallowed,
            failed: 0,
            ..
        }) if *swallowed == count => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected {count} swallowed failures, got {other:?}"
        ))),
    }
}

#[then("only the first node tagged \"{tag}\" is left")]
fn only_first_left(compute_context: &ComputeContext, tag: String) -> Result<(), StepError> {
    let service = compute_context.service();
    let survivors = runtime()?
        .block_on(
            service.list_nodes_matching(|node| node.tag == tag && !node.state.is_terminated()),
        )
        .map_err(|err| StepError::Assertion(format!("list: {err}")))?;
    let expected: Vec<_> = compute_context.seeded.iter().take(1).collect();
    let left: Vec<_> = survivors.iter().collect();
    if left.iter().map(|node| &node.id).eq(expected.iter().map(|node| &node.id)) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected only {expected:?} to survive, got {left:?}"
        )))
    }
}

#[then("both templates are equal")]
fn templates_equal(compute_context: &ComputeContext) -> Result<(), StepError> {
    match &compute_context.outcome {
        Some(StepOutcome::Templates(first, second)) if first == second => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected two equal templates, got {other:?}"
        ))),
    }
}

#[then("the operation fails with an authorization error")]
fn fails_with_authorization(compute_context: &ComputeContext) -> Result<(), StepError> {
    match &compute_context.outcome {
        Some(StepOutcome::Failed {
            authorization: true,
            message,
        }) if message.contains("rejected") => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected an authorization failure, got {other:?}"
        ))),
    }
}
