use std::path::PathBuf;

use swarmflow_core::guard::Guard;
use swarmflow_core::spec::{Pattern, WorkflowSpec};
use swarmflow_graph::{GraphBuilder, StepKind, TERMINAL_ID};

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join(name)
}

#[test]
fn test_demo_spec_compiles() {
    let spec = WorkflowSpec::load(&demo("review.toml")).expect("load demo spec");
    spec.validate().expect("demo spec is valid");
    assert_eq!(spec.participants.len(), 7);
    assert!(matches!(spec.phases[2].pattern, Pattern::Consensus { .. }));
    assert_eq!(
        spec.participant("writer").and_then(|p| p.retry.as_ref()).map(|r| r.max_retries),
        Some(1)
    );

    let graph = GraphBuilder::compile(&spec).expect("compile demo spec");
    assert_eq!(graph.entry, "__research__router");
    assert_eq!(
        graph.step("__gate__writer").map(|s| s.kind.clone()),
        Some(StepKind::InterruptGate)
    );
    assert!(graph.contains("__review__vote"));
    let exits: Vec<_> = graph.outgoing("__review__vote").collect();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].to, TERMINAL_ID);
    assert_eq!(
        exits[0].guard,
        Guard::parse("output.__review__vote.approved == true").expect("vote guard")
    );
    // The editor only runs when an edit was asked for.
    assert!(graph
        .outgoing("writer")
        .any(|e| e.to == "editor" && e.guard == Guard::parse("field.needs_edit == true").unwrap()));
    assert!(graph.contains(TERMINAL_ID));

    // Same spec, same graph.
    let again = GraphBuilder::compile(&spec).expect("compile again");
    assert_eq!(graph.id, again.id);
}

#[test]
fn test_demo_config_loads() {
    let config = swarmflow_core::config::AppConfig::load(&demo("swarmflow.toml"))
        .expect("load demo config");
    assert_eq!(config.engine.max_step_visits, 50);
    config.permission_matrix().expect("demo permissions parse");
}
