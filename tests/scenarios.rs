use std::sync::Arc;

use serde_json::json;

use trellis_core::types::{ContextItem, ProjectId, Scope, TaskId, TaskStatus};
use trellis_engine::context::{ContextProfile, RetrievalPolicy, SourceSpec};
use trellis_engine::{ContextAssembler, Engine, FanOut, WordCounter};
use trellis_memory::{MemoryHub, ScopeKey};
use trellis_test_utils::{item_at, linear_manifest, words, Outcome, ScriptedRuntime};

fn profile(id: &str, max_tokens: usize, sources: Vec<SourceSpec>) -> ContextProfile {
    ContextProfile {
        id: id.into(),
        max_tokens,
        policy: RetrievalPolicy::Recency,
        sources,
    }
}

fn assembler(memory: &Arc<MemoryHub>) -> ContextAssembler {
    ContextAssembler::new(Arc::clone(memory), Arc::new(WordCounter))
}

/// Fill all three tiers with items of uneven size.
fn seed(memory: &MemoryHub, key: &ScopeKey) {
    let sizes = [3usize, 17, 8, 1, 25, 12, 6, 9, 30, 4];
    for (i, size) in sizes.iter().enumerate() {
        let secs = (i as i64) * 10;
        let tag = if i % 2 == 0 { "even" } else { "odd" };
        memory
            .write(
                Scope::Task,
                key,
                item_at(&format!("task-{}", i), &words(*size), secs, Scope::Task).with_tags([tag]),
            )
            .unwrap();
        memory
            .write(
                Scope::Project,
                key,
                item_at(&format!("proj-{}", i), &words(size + 2), secs + 5, Scope::Project),
            )
            .unwrap();
        memory
            .write(
                Scope::Global,
                key,
                item_at(&format!("glob-{}", i), &words(size / 2 + 1), secs + 1, Scope::Global),
            )
            .unwrap();
    }
}

fn linear_engine(runtime: ScriptedRuntime) -> Arc<Engine> {
    let memory = Arc::new(MemoryHub::new());
    Arc::new(Engine::from_manifest(&linear_manifest(), Arc::new(runtime), memory).unwrap())
}

fn all_sources() -> Vec<SourceSpec> {
    vec![
        SourceSpec::new(Scope::Task),
        SourceSpec::new(Scope::Project).with_weight(2.0),
        SourceSpec::new(Scope::Global).with_tags(vec!["none-match".into()]),
    ]
}

#[test]
fn test_budget_is_never_exceeded() {
    let memory = Arc::new(MemoryHub::new());
    let key = ScopeKey::new(TaskId::new(), ProjectId::default());
    seed(&memory, &key);
    let assembler = assembler(&memory);

    for budget in [1, 2, 7, 13, 30, 50, 99, 150, 400] {
        let source_sets = [
            vec![SourceSpec::new(Scope::Task)],
            vec![
                SourceSpec::new(Scope::Task).with_tags(vec!["odd".into()]),
                SourceSpec::new(Scope::Global),
            ],
            all_sources(),
        ];
        for sources in source_sets {
            let p = profile("p", budget, sources);
            let pkg = assembler.build(&key, Some(&p)).unwrap();
            let counted: usize = pkg
                .items()
                .iter()
                .map(|i| i.content.split_whitespace().count())
                .sum();

            assert!(pkg.tokens_used() <= budget, "budget {} exceeded", budget);
            assert_eq!(counted, pkg.tokens_used());
            assert!(pkg
                .items()
                .windows(2)
                .all(|w| w[0].timestamp <= w[1].timestamp));
            if pkg.tokens_total() > budget {
                assert!(pkg.compression_ratio() < 1.0);
            }
        }
    }
}

#[test]
fn test_rebuild_is_deterministic() {
    let memory = Arc::new(MemoryHub::new());
    let key = ScopeKey::new(TaskId::new(), ProjectId::default());
    seed(&memory, &key);
    // Equal timestamps: ties break on id.
    memory
        .write(Scope::Task, &key, item_at("tie-b", &words(4), 90, Scope::Task))
        .unwrap();
    memory
        .write(Scope::Task, &key, item_at("tie-a", &words(4), 90, Scope::Task))
        .unwrap();

    let assembler = assembler(&memory);
    let p = profile("p", 60, all_sources());
    let first = assembler.build(&key, Some(&p)).unwrap();
    let second = assembler.build(&key, Some(&p)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_p1_keeps_most_recent_item() {
    let memory = Arc::new(MemoryHub::new());
    let key = ScopeKey::new(TaskId::new(), ProjectId::default());
    for (id, secs) in [("t1", 100), ("t2", 200), ("t3", 300)] {
        memory
            .write(Scope::Task, &key, item_at(id, &words(20), secs, Scope::Task))
            .unwrap();
    }

    let p = profile("P1", 50, vec![SourceSpec::new(Scope::Task)]);
    let pkg = assembler(&memory).build(&key, Some(&p)).unwrap();

    assert!(pkg.compression_ratio() < 1.0);
    assert!(pkg.tokens_used() <= 50);
    let ids: Vec<&str> = pkg.items().iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids.last(), Some(&"t3"));
    assert!(pkg.items().windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[test]
fn test_scope_visibility() {
    let memory = Arc::new(MemoryHub::new());
    let alpha = ProjectId::from_str("alpha");
    let a = ScopeKey::new(TaskId::new(), alpha.clone());
    let b = ScopeKey::new(TaskId::new(), alpha);
    let c = ScopeKey::new(TaskId::new(), ProjectId::from_str("beta"));

    memory
        .write(Scope::Task, &a, ContextItem::new("private", "only a", Scope::Task))
        .unwrap();
    memory
        .write(Scope::Project, &a, ContextItem::new("shared", "alpha notes", Scope::Project))
        .unwrap();
    memory
        .write(Scope::Global, &c, ContextItem::new("world", "everyone", Scope::Global))
        .unwrap();

    let p = profile(
        "all",
        1_000,
        vec![
            SourceSpec::new(Scope::Task),
            SourceSpec::new(Scope::Project),
            SourceSpec::new(Scope::Global),
        ],
    );
    let assembler = assembler(&memory);
    let seen = |key: &ScopeKey| -> Vec<String> {
        let mut ids: Vec<String> = assembler
            .build(key, Some(&p))
            .unwrap()
            .items()
            .iter()
            .map(|i| i.id.clone())
            .collect();
        ids.sort();
        ids
    };

    assert_eq!(seen(&a), vec!["private", "shared", "world"]);
    assert_eq!(seen(&b), vec!["shared", "world"]);
    assert_eq!(seen(&c), vec!["world"]);
}

#[tokio::test]
async fn test_many_tasks_run_concurrently() {
    let runtime = ScriptedRuntime::new()
        .with_delay(std::time::Duration::from_millis(5))
        .script_for_input("work", json!(3), Outcome::Fail(json!("nope")));
    let engine = linear_engine(runtime);

    let mut workers = Vec::new();
    for i in 0..8 {
        let engine = Arc::clone(&engine);
        workers.push(tokio::spawn(async move {
            engine.submit_and_run(ProjectId::default(), json!(i)).await
        }));
    }

    let mut statuses = Vec::new();
    for worker in workers {
        let task = worker.await.unwrap().unwrap();
        assert!(task.is_concluded());
        statuses.push((task.input.clone(), task.status));
    }
    for (input, status) in statuses {
        let expected = if input == json!(3) {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        assert_eq!(status, expected);
    }
}

#[tokio::test]
async fn test_fan_out_scenarios() {
    let runtime = ScriptedRuntime::new()
        .script_for_input("work", json!("s3"), Outcome::Fail(json!(null)))
        .script_sequence(
            "start",
            vec![
                Outcome::Succeed(json!("c1")),
                Outcome::Fail(json!(null)),
                Outcome::Fail(json!(null)),
            ],
        );
    let engine = linear_engine(runtime);

    // Clones first so the scripted `start` sequence is consumed by them.
    let clones_parent = engine.submit(ProjectId::default(), json!("same")).await;
    let status = engine.fan_out(&clones_parent, FanOut::Clones(3)).await.unwrap();
    assert_eq!(status, TaskStatus::Completed);

    let subtasks_parent = engine.submit(ProjectId::default(), json!(null)).await;
    let status = engine
        .fan_out(
            &subtasks_parent,
            FanOut::Subtasks(vec![json!("s1"), json!("s2"), json!("s3")]),
        )
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Partial);

    let err = engine
        .fan_out(&subtasks_parent, FanOut::Clones(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "task_concluded");
}
