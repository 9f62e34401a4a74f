use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use drover::agent::{
    Agent, AgentConfig, ApprovalHandler, Decision, Mode, ModeCell,
};
use drover::environments::LocalEnvironment;
use drover::errors::ExitStatus;
use drover::providers::mock::MockProvider;
use drover::registry::SubagentRegistry;
use drover::trajectory::Trajectory;

fn write_descriptor(dir: &Path, file: &str, content: &str) {
    fs::write(dir.join(file), content).unwrap();
}

fn registry_with_reviewer(dir: &Path) -> Arc<SubagentRegistry> {
    write_descriptor(
        dir,
        "tdd-reviewer.md",
        "---\nname: tdd-reviewer\ndescription: Reviews diffs for test coverage\n---\nYou review diffs carefully.",
    );
    Arc::new(SubagentRegistry::load(dir).unwrap())
}

fn submit_reply(text: &str) -> String {
    format!("Finishing\n```bash\nprintf 'COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\\n{text}\\n'\n```")
}

fn spawn_reply(target: &str, task: &str) -> String {
    format!("Delegating\n```bash\nDELEGATE_TASK_TO_SUBAGENT{target}\n{task}\n```")
}

#[tokio::test]
async fn test_spawn_runs_child_and_folds_submission() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with_reviewer(dir.path());

    let provider = Arc::new(MockProvider::new(vec![
        spawn_reply("::tdd-reviewer", "Review this diff"),
        submit_reply("LGTM, coverage is fine"),
        submit_reply("Review relayed"),
    ]));
    let mut agent = Agent::new(
        provider.clone(),
        Arc::new(LocalEnvironment::default()),
        AgentConfig {
            cost_limit: 100.0,
            ..AgentConfig::default()
        },
    )
    .with_registry(registry);

    let outcome = agent.run("Get this diff reviewed").await;
    assert_eq!(outcome.status, ExitStatus::Submitted);

    // The child's terminal output became the parent's observation.
    let fold = agent
        .messages()
        .iter()
        .find(|m| m.text().contains("Agent ROOT::S1 returned:"))
        .expect("child fold observation");
    assert!(fold.text().contains("LGTM, coverage is fine"));

    // The second model call belonged to the child: its system prompt is
    // the descriptor body and its task is the delegated one.
    let calls = provider.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1][0].text(), "You review diffs carefully.");
    assert!(calls[1][1].text().contains("Review this diff"));
}

#[tokio::test]
async fn test_spawn_without_name_never_constructs_child() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with_reviewer(dir.path());

    let provider = Arc::new(MockProvider::new(vec![
        spawn_reply("", "Do something"),
        submit_reply("gave up on delegating"),
    ]));
    let mut agent = Agent::new(
        provider.clone(),
        Arc::new(LocalEnvironment::default()),
        AgentConfig::default(),
    )
    .with_registry(registry);

    let outcome = agent.run("Delegate badly").await;
    assert_eq!(outcome.status, ExitStatus::Submitted);

    let correction = agent
        .messages()
        .iter()
        .find(|m| m.text().contains("missing a subagent name"))
        .expect("corrective observation");
    assert!(correction.text().contains("tdd-reviewer"));

    // Both model calls were the parent's: no child history was started.
    let calls = provider.calls();
    assert_eq!(calls.len(), 2);
    for call in &calls {
        assert!(call[0].text().starts_with("You are a helpful assistant"));
    }
    assert_eq!(agent.steps(), 2);
}

#[tokio::test]
async fn test_spawn_of_unknown_name_is_recoverable() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with_reviewer(dir.path());

    let provider = Arc::new(MockProvider::new(vec![
        spawn_reply("::ghost", "Haunt the codebase"),
        submit_reply("done without the ghost"),
    ]));
    let mut agent = Agent::new(
        provider,
        Arc::new(LocalEnvironment::default()),
        AgentConfig::default(),
    )
    .with_registry(registry);

    let outcome = agent.run("Delegate to a missing name").await;
    assert_eq!(outcome.status, ExitStatus::Submitted);
    assert!(agent
        .messages()
        .iter()
        .any(|m| m.text().contains("'ghost' not found in the registry")));
}

#[tokio::test]
async fn test_descriptor_metadata_overrides_child_config() {
    let dir = tempfile::tempdir().unwrap();
    // step_limit 1 is already spent by the parent's first call, so the
    // child limits out immediately and the failure folds back.
    write_descriptor(
        dir.path(),
        "strict.md",
        "---\nname: strict\ndescription: Tightly limited\nstep_limit: 1\n---\nYou are strict.",
    );
    let registry = Arc::new(SubagentRegistry::load(dir.path()).unwrap());

    let provider = Arc::new(MockProvider::new(vec![
        spawn_reply("::strict", "Try anything"),
        submit_reply("child could not help"),
    ]));
    let mut agent = Agent::new(
        provider,
        Arc::new(LocalEnvironment::default()),
        AgentConfig::default(),
    )
    .with_registry(registry);

    let outcome = agent.run("Delegate to the strict agent").await;
    assert_eq!(outcome.status, ExitStatus::Submitted);
    assert!(agent
        .messages()
        .iter()
        .any(|m| m.text().contains("Agent ROOT::S1 failed with LimitsExceeded")));
}

struct YoloOnFirstReview {
    mode: ModeCell,
    reviews: AtomicU32,
}

impl ApprovalHandler for YoloOnFirstReview {
    fn review(&self, _agent_id: &str, _command: &str) -> Decision {
        self.reviews.fetch_add(1, Ordering::SeqCst);
        self.mode.set(Mode::Yolo);
        Decision::Approve
    }
}

#[tokio::test]
async fn test_mode_change_in_child_applies_to_whole_hierarchy() {
    let dir = tempfile::tempdir().unwrap();
    write_descriptor(
        dir.path(),
        "scout.md",
        "---\nname: scout\ndescription: Pokes around\n---\nYou scout ahead.",
    );
    let registry = Arc::new(SubagentRegistry::load(dir.path()).unwrap());

    let provider = Arc::new(MockProvider::new(vec![
        spawn_reply("::scout", "Probe the machine"),
        "Probing\n```bash\necho probe\n```".to_string(),
        submit_reply("probe finished"),
        "Parent action\n```bash\necho after\n```".to_string(),
        submit_reply("all wrapped up"),
    ]));
    let mut agent = Agent::new(
        provider,
        Arc::new(LocalEnvironment::default()),
        AgentConfig {
            mode: Mode::Confirm,
            cost_limit: 100.0,
            ..AgentConfig::default()
        },
    )
    .with_registry(registry);

    let handler = Arc::new(YoloOnFirstReview {
        mode: agent.mode_cell(),
        reviews: AtomicU32::new(0),
    });
    agent = agent.with_approval(handler.clone());

    let outcome = agent.run("Delegate then act").await;
    assert_eq!(outcome.status, ExitStatus::Submitted);
    // The child's first action was reviewed; the switch to yolo it made
    // covered the parent's later action too.
    assert_eq!(handler.reviews.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_live_run_trajectory_round_trips() {
    let provider = Arc::new(MockProvider::new(vec![
        "Working\n```bash\necho 'step one'\n```".to_string(),
        submit_reply("finished the job"),
    ]));
    let mut agent = Agent::new(
        provider,
        Arc::new(LocalEnvironment::default()),
        AgentConfig::default(),
    );

    let outcome = agent.run("Do one step then finish").await;
    let trajectory = Trajectory::from_run(&agent, &outcome);

    let first = trajectory.to_json().unwrap();
    let reloaded = Trajectory::from_json(&first).unwrap();
    assert_eq!(first, reloaded.to_json().unwrap());

    assert_eq!(reloaded.info.exit_status, ExitStatus::Submitted);
    assert_eq!(reloaded.info.submission.as_deref(), Some("finished the job\n"));
    assert_eq!(reloaded.messages.len(), agent.messages().len());
    assert_eq!(
        reloaded.messages.last().unwrap().text(),
        outcome.message
    );
}
