//! Unit tests for remote script execution.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::node::NodeState;
use crate::stub::StubAccount;
use crate::test_support::{ScriptedSocketProbe, ScriptedSshFactory, SshEvent};
use crate::types::{ImageId, LocationId};

const PUBLIC: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 20));

fn node(id: &str, public: Option<IpAddr>) -> NodeMetadata {
    NodeMetadata {
        id: NodeId::new(id),
        tag: String::from("web"),
        name: format!("web-{id}"),
        state: NodeState::Running,
        image: ImageId::new("ubuntu-22.04"),
        location: LocationId::new("stub-zone-a"),
        public_addresses: public.into_iter().collect(),
        private_addresses: BTreeSet::new(),
        credentials: Some(Credentials::new("root", "node-key")),
        user_metadata: BTreeMap::new(),
    }
}

#[fixture]
fn factory() -> ScriptedSshFactory {
    ScriptedSshFactory::permissive()
}

fn executor(
    factory: &ScriptedSshFactory,
    probe: &ScriptedSocketProbe,
) -> ScriptExecutor<ScriptedSshFactory, ScriptedSocketProbe> {
    ScriptExecutor::new(factory.clone(), probe.clone())
}

fn quick_wait() -> RunScriptOptions {
    RunScriptOptions::new().socket_wait(RetryablePredicate::from_attempts(3, Duration::from_secs(1)))
}

#[rstest]
#[tokio::test]
async fn script_is_uploaded_then_run(factory: ScriptedSshFactory) {
    factory.respond_to(
        "/bin/sh /tmp/cumulus-",
        ExecResponse {
            output: String::from("installed\n"),
            error: String::new(),
            exit_status: Some(0),
        },
    );
    let probe = ScriptedSocketProbe::always_open();
    let target = node("n1", Some(PUBLIC));

    let response = executor(&factory, &probe)
        .run_on_node(&target, "apt-get install -y nginx\n", &quick_wait())
        .await
        .unwrap_or_else(|err| panic!("script should run: {err}"));

    assert_eq!(response.output, "installed\n");
    let commands = factory.commands_for(PUBLIC);
    assert_eq!(commands.len(), 2);
    let upload = commands.first().cloned().unwrap_or_default();
    assert!(upload.starts_with("cat > /tmp/cumulus-"));
    assert!(upload.contains("\napt-get install -y nginx\nCUMULUS_EOF_"));
    assert!(upload.ends_with(".sh"));
    let run = commands.last().cloned().unwrap_or_default();
    assert!(run.starts_with("/bin/sh /tmp/cumulus-"));
    assert!(run.contains("; rm -f /tmp/cumulus-"), "{run}");
    assert!(matches!(
        factory.events().last(),
        Some(SshEvent::Disconnect { .. })
    ));
}

#[rstest]
#[tokio::test]
async fn node_key_is_used_without_overrides(factory: ScriptedSshFactory) {
    let probe = ScriptedSocketProbe::always_open();
    executor(&factory, &probe)
        .run_on_node(&node("n1", Some(PUBLIC)), "true", &quick_wait())
        .await
        .unwrap_or_else(|err| panic!("script should run: {err}"));

    assert!(factory.events().iter().any(|event| matches!(
        event,
        SshEvent::Connect { addr, account, accepted: true }
            if addr.port() == DEFAULT_SSH_PORT && account == "root"
    )));
}

#[test]
fn credentials_resolution_prefers_overrides() {
    let target = node("n1", Some(PUBLIC));

    let own = RunScriptOptions::new().credentials_for(&target);
    assert_eq!(own, Some(Credentials::new("root", "node-key")));

    let keyed = RunScriptOptions::new()
        .private_key("other-key")
        .credentials_for(&target);
    assert_eq!(keyed, Some(Credentials::new("root", "other-key")));

    let overridden = RunScriptOptions::new()
        .private_key("other-key")
        .override_credentials_with(Credentials::new("deploy", "deploy-key"))
        .credentials_for(&target);
    assert_eq!(overridden, Some(Credentials::new("deploy", "deploy-key")));

    let blank = RunScriptOptions::new()
        .override_credentials_with(Credentials::new("", "deploy-key"))
        .credentials_for(&target);
    assert_eq!(blank, None);
}

#[test]
fn nodes_without_credentials_use_the_fallback_account() {
    let target = NodeMetadata {
        credentials: None,
        ..node("n1", Some(PUBLIC))
    };

    let keyed = RunScriptOptions::new().private_key("KEY");
    assert_eq!(keyed.credentials_for(&target), None);

    let resolved = keyed.fallback_account_of("root").credentials_for(&target);
    assert_eq!(resolved, Some(Credentials::new("root", "KEY")));

    let keyless = RunScriptOptions::new()
        .fallback_account_of("root")
        .credentials_for(&target);
    assert_eq!(keyless, None);
}

#[test]
fn node_account_wins_over_the_fallback() {
    let resolved = RunScriptOptions::new()
        .fallback_account_of("admin")
        .credentials_for(&node("n1", Some(PUBLIC)));
    assert_eq!(resolved, Some(Credentials::new("root", "node-key")));
}

#[rstest]
#[tokio::test]
async fn rejected_login_is_an_auth_failure() {
    let account = StubAccount::with_default_catalog("id", "secret");
    let factory = ScriptedSshFactory::for_account(account);
    let probe = ScriptedSocketProbe::always_open();
    let options = quick_wait().private_key("not-the-key");

    let failure = executor(&factory, &probe)
        .run_on_node(&node("n1", Some(PUBLIC)), "true", &options)
        .await
        .err()
        .unwrap_or_else(|| panic!("login should be rejected"));

    assert!(failure.is_auth_failure());
    assert_eq!(failure.stage(), ExecutionStage::AuthFailed);
    assert!(root_cause_message(&failure).contains("Auth fail"));
    assert!(factory.commands_for(PUBLIC).is_empty());
}

fn root_cause_message(failure: &ScriptFailure) -> String {
    crate::ssh::root_cause(failure).to_string()
}

#[rstest]
#[tokio::test]
async fn unreachable_host_is_a_transport_failure(factory: ScriptedSshFactory) {
    factory.make_unreachable(PUBLIC);
    let probe = ScriptedSocketProbe::always_open();

    let failure = executor(&factory, &probe)
        .run_on_node(&node("n1", Some(PUBLIC)), "true", &quick_wait())
        .await
        .err()
        .unwrap_or_else(|| panic!("connection should fail"));

    assert!(matches!(
        failure,
        ScriptFailure::Transport {
            stage: ExecutionStage::Connecting,
            ..
        }
    ));
    assert_eq!(failure.stage(), ExecutionStage::TransportFailed);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn closed_socket_times_out(factory: ScriptedSshFactory) {
    let probe = ScriptedSocketProbe::always_open();
    probe.close(PUBLIC);

    let failure = executor(&factory, &probe)
        .run_on_node(&node("n1", Some(PUBLIC)), "true", &quick_wait())
        .await
        .err()
        .unwrap_or_else(|| panic!("socket should never open"));

    assert!(matches!(failure, ScriptFailure::SocketTimeout { .. }));
    assert_eq!(
        probe.attempts(SocketAddr::new(PUBLIC, DEFAULT_SSH_PORT)),
        4
    );
    assert!(factory.events().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn slow_socket_is_waited_for(factory: ScriptedSshFactory) {
    let probe = ScriptedSocketProbe::opening_after(2);
    let options = quick_wait().port(2222);

    executor(&factory, &probe)
        .run_on_node(&node("n1", Some(PUBLIC)), "true", &options)
        .await
        .unwrap_or_else(|err| panic!("script should run: {err}"));

    assert_eq!(probe.attempts(SocketAddr::new(PUBLIC, 2222)), 3);
}

#[rstest]
#[tokio::test]
async fn addressless_node_fails_early(factory: ScriptedSshFactory) {
    let probe = ScriptedSocketProbe::always_open();
    let failure = executor(&factory, &probe)
        .run_on_node(&node("n1", None), "true", &quick_wait())
        .await
        .err()
        .unwrap_or_else(|| panic!("node without address should fail"));
    assert!(matches!(failure, ScriptFailure::NoAddress { .. }));
}

#[rstest]
#[tokio::test]
async fn failed_upload_is_reported(factory: ScriptedSshFactory) {
    factory.respond_to(
        "cat > ",
        ExecResponse {
            output: String::new(),
            error: String::from("No space left on device"),
            exit_status: Some(1),
        },
    );
    let probe = ScriptedSocketProbe::always_open();

    let failure = executor(&factory, &probe)
        .run_on_node(&node("n1", Some(PUBLIC)), "true", &quick_wait())
        .await
        .err()
        .unwrap_or_else(|| panic!("upload should fail"));

    assert!(matches!(
        failure,
        ScriptFailure::UploadRejected {
            status: Some(1),
            ..
        }
    ));
    assert_eq!(factory.commands_for(PUBLIC).len(), 1);
}

#[rstest]
#[tokio::test]
async fn batch_isolates_failures(factory: ScriptedSshFactory) {
    let other = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 21));
    factory.make_unreachable(other);
    let probe = ScriptedSocketProbe::always_open();
    let nodes = [node("n1", Some(PUBLIC)), node("n2", Some(other))];

    let results = executor(&factory, &probe)
        .run_on_nodes(&nodes, "true", &quick_wait())
        .await;

    assert_eq!(results.len(), 2);
    assert!(results.get(&NodeId::new("n1")).is_some_and(Result::is_ok));
    assert!(results.get(&NodeId::new("n2")).is_some_and(Result::is_err));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn verify_finds_marker(factory: ScriptedSshFactory) {
    factory.respond_to(
        "uptime",
        ExecResponse {
            output: String::from(" 10:00 up 1 min, load average: 0.00\n"),
            error: String::new(),
            exit_status: Some(0),
        },
    );
    let probe = ScriptedSocketProbe::always_open();

    let response = executor(&factory, &probe)
        .verify(
            &node("n1", Some(PUBLIC)),
            "uptime",
            "load average",
            &quick_wait(),
            &BoundedRetry::default(),
        )
        .await
        .unwrap_or_else(|err| panic!("verification should pass: {err}"));
    assert!(response.contains("load average"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn verify_gives_up_after_bounded_attempts(factory: ScriptedSshFactory) {
    let probe = ScriptedSocketProbe::always_open();

    let failure = executor(&factory, &probe)
        .verify(
            &node("n1", Some(PUBLIC)),
            "uptime",
            "load average",
            &quick_wait(),
            &BoundedRetry::new(2, Duration::from_secs(1)),
        )
        .await
        .err()
        .unwrap_or_else(|| panic!("marker is never printed"));

    assert!(matches!(failure, ScriptFailure::MarkerMissing { .. }));
    assert_eq!(factory.commands_for(PUBLIC), vec!["uptime", "uptime"]);
}

#[test]
fn upload_command_quotes_the_path() {
    let command = upload_command("/tmp/with space.sh", "echo hi");
    assert!(command.starts_with("cat > '/tmp/with space.sh' <<'CUMULUS_EOF_"));
    assert!(command.ends_with("chmod 0755 '/tmp/with space.sh'"));
}

#[test]
fn run_command_removes_the_script_and_keeps_its_status() {
    assert_eq!(
        run_command("/tmp/with space.sh"),
        "/bin/sh '/tmp/with space.sh'; status=$?; rm -f '/tmp/with space.sh'; exit $status"
    );
}

#[test]
fn stage_names_are_upper_case() {
    assert_eq!(ExecutionStage::AwaitSocket.to_string(), "AWAIT_SOCKET");
    assert_eq!(ExecutionStage::TransportFailed.as_str(), "TRANSPORT_FAILED");
}
