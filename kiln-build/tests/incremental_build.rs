//! End-to-end incremental build scenarios on a single target.

mod common;

use common::{class, ArtifactRegistry, RegistryExtractor, ScriptedCompiler, SharedPass};
use kiln_build::{
    BuildOptions, BuildOutcome, BuildTarget, CancelToken, CollectingSink, CompileScope,
    IncrementalBuilder, NodeId, Project, RootId, SourceRoot, TargetId, Usage,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

struct Env {
    temp: TempDir,
    registry: Arc<ArtifactRegistry>,
    compiler: Arc<ScriptedCompiler>,
    a_kt: PathBuf,
    b_kt: PathBuf,
}

fn setup() -> Env {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    std::fs::create_dir_all(&src).unwrap();

    let a_kt = src.join("a.kt");
    let b_kt = src.join("b.kt");
    std::fs::write(&a_kt, "class A { fun main() = B().f() }").unwrap();
    std::fs::write(&b_kt, "class B { fun f(): Int = 1 }").unwrap();

    let registry = Arc::new(ArtifactRegistry::default());
    let compiler = Arc::new(ScriptedCompiler::new("kotlinc", Arc::clone(&registry)));
    compiler.set_nodes(
        a_kt.clone(),
        vec![class(
            "A",
            &[("main()", "fun main()")],
            &[Usage::of_member(NodeId::new("B"), "f()")],
        )],
    );
    compiler.set_nodes(
        b_kt.clone(),
        vec![class("B", &[("f()", "fun f(): Int")], &[])],
    );

    Env {
        temp,
        registry,
        compiler,
        a_kt,
        b_kt,
    }
}

fn make_builder(env: &Env) -> (IncrementalBuilder, Arc<CollectingSink>) {
    let project = Project::new(vec![BuildTarget::new(
        TargetId(1),
        "app",
        vec![SourceRoot {
            id: RootId(0),
            path: env.temp.path().join("src"),
            generated: false,
        }],
        env.temp.path().join("out"),
        false,
        vec![],
    )]);
    let sink = Arc::new(CollectingSink::new());
    let mut options = BuildOptions::new(
        env.temp.path().join("build-data"),
        env.temp.path().to_path_buf(),
    );
    options.rebuild_heuristic = false;
    let builder = IncrementalBuilder::new(
        project,
        vec![Box::new(SharedPass(Arc::clone(&env.compiler)))],
        Arc::new(RegistryExtractor(Arc::clone(&env.registry))),
        sink.clone(),
        options,
    );
    (builder, sink)
}

async fn build(env: &Env) -> BuildOutcome {
    let (builder, _sink) = make_builder(env);
    builder
        .build(CompileScope::incremental(), CancelToken::new())
        .await
}

fn compiled_set(env: &Env) -> BTreeSet<PathBuf> {
    env.compiler.take_compiled().into_iter().collect()
}

#[tokio::test]
async fn first_build_compiles_everything_and_second_is_idempotent() {
    let env = setup();

    assert_eq!(build(&env).await, BuildOutcome::Success);
    assert_eq!(
        compiled_set(&env),
        [env.a_kt.clone(), env.b_kt.clone()].into_iter().collect()
    );
    assert!(env.temp.path().join("out/a.class").exists());
    assert!(env.temp.path().join("out/b.class").exists());

    // no file changed: nothing may enter any round's dirty set
    assert_eq!(build(&env).await, BuildOutcome::Success);
    assert!(compiled_set(&env).is_empty());
}

#[tokio::test]
async fn body_only_change_recompiles_just_that_file() {
    let env = setup();
    assert_eq!(build(&env).await, BuildOutcome::Success);
    let _ = compiled_set(&env);

    // same symbols, different body
    std::fs::write(&env.b_kt, "class B { fun f(): Int = 2 }").unwrap();

    assert_eq!(build(&env).await, BuildOutcome::Success);
    assert_eq!(compiled_set(&env), [env.b_kt.clone()].into_iter().collect());
}

#[tokio::test]
async fn signature_change_recompiles_users_in_the_next_round() {
    let env = setup();
    assert_eq!(build(&env).await, BuildOutcome::Success);
    let _ = compiled_set(&env);

    std::fs::write(&env.b_kt, "class B { fun f(): String = \"2\" }").unwrap();
    env.compiler.set_nodes(
        env.b_kt.clone(),
        vec![class("B", &[("f()", "fun f(): String")], &[])],
    );

    // a.kt's on-disk digest is unchanged, yet it recompiles via the graph
    assert_eq!(build(&env).await, BuildOutcome::Success);
    assert_eq!(
        compiled_set(&env),
        [env.a_kt.clone(), env.b_kt.clone()].into_iter().collect()
    );
}

#[tokio::test]
async fn deleted_source_drops_outputs_and_recompiles_users() {
    let env = setup();
    assert_eq!(build(&env).await, BuildOutcome::Success);
    let _ = compiled_set(&env);

    std::fs::remove_file(&env.b_kt).unwrap();

    assert_eq!(build(&env).await, BuildOutcome::Success);
    assert_eq!(compiled_set(&env), [env.a_kt.clone()].into_iter().collect());
    assert!(!env.temp.path().join("out/b.class").exists());

    // descriptor fully dropped: a third build does nothing
    assert_eq!(build(&env).await, BuildOutcome::Success);
    assert!(compiled_set(&env).is_empty());
}

#[tokio::test]
async fn canceled_build_compiles_nothing() {
    let env = setup();
    let (builder, _sink) = make_builder(&env);
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = builder.build(CompileScope::incremental(), cancel).await;
    assert_eq!(outcome, BuildOutcome::ErrorsReported);
    assert!(compiled_set(&env).is_empty());
}

#[tokio::test]
async fn unaffected_scope_skips_compilation() {
    let env = setup();
    let (builder, _sink) = make_builder(&env);
    let scope = CompileScope::incremental().with_unaffected(vec![TargetId(1)]);

    let outcome = builder.build(scope, CancelToken::new()).await;
    assert_eq!(outcome, BuildOutcome::Success);
    assert!(compiled_set(&env).is_empty());
}

#[tokio::test]
async fn forced_rebuild_recompiles_clean_files() {
    let env = setup();
    assert_eq!(build(&env).await, BuildOutcome::Success);
    let _ = compiled_set(&env);

    let (builder, _sink) = make_builder(&env);
    let outcome = builder
        .build(CompileScope::rebuild_all(), CancelToken::new())
        .await;
    assert_eq!(outcome, BuildOutcome::Success);
    assert_eq!(
        compiled_set(&env),
        [env.a_kt.clone(), env.b_kt.clone()].into_iter().collect()
    );
}
