//! End-to-end exercise of `AgentRegistry::bootstrap`: default-agent scaffolding, nested-path name
//! derivation, and live reload via the filesystem watcher.

use quack_gateway::gateway::agents::AgentRegistry;
use std::time::Duration;

#[tokio::test]
async fn bootstrap_writes_default_auto_agent_when_missing() {
    let tmp = tempfile::tempdir().unwrap();
    let agents_dir = tmp.path().join("agents");
    let skills_dir = tmp.path().join("skills");

    let registry = AgentRegistry::bootstrap(agents_dir.clone(), skills_dir)
        .await
        .expect("bootstrap should succeed on a fresh directory");

    assert!(agents_dir.join("auto.agent.md").is_file());
    let auto = registry.get_agent("auto").await.expect("default agent should be loaded");
    assert_eq!(auto.name, "auto");
}

#[tokio::test]
async fn nested_agent_and_skill_files_derive_dotted_names() {
    let tmp = tempfile::tempdir().unwrap();
    let agents_dir = tmp.path().join("agents");
    let skills_dir = tmp.path().join("skills");
    std::fs::create_dir_all(agents_dir.join("support")).unwrap();
    std::fs::create_dir_all(&skills_dir).unwrap();

    std::fs::write(
        agents_dir.join("support").join("billing.agent.md"),
        "---\ndescription: handles billing\ntools:\n  - billing.*\nskills:\n  - refunds\n---\nYou help with billing. {task}\n",
    )
    .unwrap();
    std::fs::write(
        skills_dir.join("refunds.skill.md"),
        "---\ndescription: issue refunds\ntools:\n  - billing.refund\n---\nRefund steps.\n",
    )
    .unwrap();

    let registry = AgentRegistry::bootstrap(agents_dir, skills_dir).await.unwrap();

    let billing = registry
        .get_agent("support.billing")
        .await
        .expect("nested path should derive to a dotted name");
    assert_eq!(billing.skills, vec!["refunds".to_string()]);
    assert_eq!(billing.tools, vec!["billing.*".to_string()]);

    let refunds = registry.get_skill("refunds").await.expect("skill should be loaded");
    assert_eq!(refunds.tools, vec!["billing.refund".to_string()]);
}

#[tokio::test]
async fn malformed_agent_file_is_skipped_not_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let agents_dir = tmp.path().join("agents");
    let skills_dir = tmp.path().join("skills");
    std::fs::create_dir_all(&agents_dir).unwrap();
    std::fs::create_dir_all(&skills_dir).unwrap();

    std::fs::write(agents_dir.join("broken.agent.md"), "no frontmatter here at all").unwrap();

    let registry = AgentRegistry::bootstrap(agents_dir, skills_dir)
        .await
        .expect("a malformed agent file must not fail bootstrap");
    assert!(registry.get_agent("broken").await.is_none());
    // The default agent still loaded alongside the skipped one.
    assert!(registry.get_agent("auto").await.is_some());
}

#[tokio::test]
async fn watcher_picks_up_a_new_agent_file_after_bootstrap() {
    let tmp = tempfile::tempdir().unwrap();
    let agents_dir = tmp.path().join("agents");
    let skills_dir = tmp.path().join("skills");

    let registry = AgentRegistry::bootstrap(agents_dir.clone(), skills_dir).await.unwrap();
    assert!(registry.get_agent("late").await.is_none());

    std::fs::write(
        agents_dir.join("late.agent.md"),
        "---\ndescription: arrived after bootstrap\n---\nBody\n",
    )
    .unwrap();

    // The debouncer coalesces over ~100ms; give it ample margin before asserting.
    let mut seen = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if registry.get_agent("late").await.is_some() {
            seen = true;
            break;
        }
    }
    assert!(seen, "watcher should have picked up the new agent file");
}
