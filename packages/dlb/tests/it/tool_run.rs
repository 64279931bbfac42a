//! Tool instance runs: the redo decision, scheduling and evidence.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use color_eyre::Result;
use dlb::context::{Context, ContextOptions};
use dlb::redo::Redo;
use dlb::tool::{Dependency, DependencyValue, ToolDefinition};
use dlb::{DependencyError, Error, RedoError};
use pretty_assertions::assert_eq;

use crate::Worktree;

/// Copies `source_file` to `object_file` through a temporary, as a real
/// tool would, and counts its redos.
fn copy_redo(counter: Rc<Cell<usize>>) -> impl Fn(Redo) -> futures::future::LocalBoxFuture<'static, Result<bool, Error>> {
    use futures::FutureExt;
    move |redo: Redo| {
        let counter = Rc::clone(&counter);
        async move {
            counter.set(counter.get() + 1);
            let source = redo.path_value("source_file").expect("explicit input");
            let object = redo.path_value("object_file").expect("explicit output");
            let temporary = redo.temporary(false)?;
            let root = redo.root_path().to_path_buf();
            let data = std::fs::read(root.join(source.native().unwrap().as_path())).unwrap();
            std::fs::write(root.join(temporary.native().unwrap().as_path()), &data).unwrap();
            redo.replace_output(&object, &temporary).await?;
            Ok(false)
        }
        .boxed_local()
    }
}

#[test_log::test(tokio::test)]
async fn s1_redo_happens_only_when_evidence_demands_it() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("src/a.c", "int a;\n");

    let redos = Rc::new(Cell::new(0));
    let compile = ToolDefinition::builder("compile")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo(copy_redo(Rc::clone(&redos)))
        .build()?;
    let instance = compile.instance([
        ("source_file", DependencyValue::path("src/a.c")?),
        ("object_file", DependencyValue::path("out/a.o")?),
    ])?;

    let ctx = Context::open(ContextOptions::default()).await?;

    let first = instance.start(&ctx, false).await?;
    assert!(first.complete().await?);
    assert_eq!(tree.read("out/a.o"), b"int a;\n");
    assert_eq!(redos.get(), 1);

    let second = instance.start(&ctx, false).await?;
    assert_eq!(second.did_redo(), Some(false));
    assert_eq!(redos.get(), 1);

    tree.write("src/a.c", "");
    let third = instance.start(&ctx, false).await?;
    assert!(third.complete().await?);
    assert_eq!(tree.read("out/a.o"), b"");
    assert_eq!(redos.get(), 2);

    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn evidence_survives_across_contexts() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("src/a.c", "int a;\n");

    let redos = Rc::new(Cell::new(0));
    let compile = ToolDefinition::builder("compile")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo(copy_redo(Rc::clone(&redos)))
        .build()?;
    let instance = compile.instance([
        ("source_file", DependencyValue::path("src/a.c")?),
        ("object_file", DependencyValue::path("out/a.o")?),
    ])?;

    let ctx = Context::open(ContextOptions::default()).await?;
    instance.start(&ctx, false).await?.complete().await?;
    ctx.close().await?;
    assert_eq!(redos.get(), 1);

    let ctx = Context::open(ContextOptions::default()).await?;
    let rerun = instance.start(&ctx, false).await?;
    assert_eq!(rerun.did_redo(), Some(false));
    ctx.close().await?;
    assert_eq!(redos.get(), 1);
    Ok(())
}

#[tokio::test]
async fn s2_independent_redos_overlap_up_to_the_cap() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("one.in", "1");
    tree.write("two.in", "2");

    let running = Rc::new(Cell::new(0usize));
    let peak = Rc::new(Cell::new(0usize));
    let slow_copy = |name: &str| {
        use futures::FutureExt;
        let running = Rc::clone(&running);
        let peak = Rc::clone(&peak);
        let name = name.to_owned();
        move |redo: Redo| {
            let running = Rc::clone(&running);
            let peak = Rc::clone(&peak);
            let name = name.clone();
            async move {
                running.set(running.get() + 1);
                peak.set(peak.get().max(running.get()));
                tokio::time::sleep(Duration::from_millis(40)).await;
                running.set(running.get() - 1);
                let object = redo.path_value("object_file").expect("explicit output");
                let temporary = redo.temporary(false)?;
                std::fs::write(
                    redo.root_path().join(temporary.native().unwrap().as_path()),
                    name.as_bytes(),
                )
                .unwrap();
                redo.replace_output(&object, &temporary).await?;
                Ok(false)
            }
            .boxed_local()
        }
    };

    let one = ToolDefinition::builder("one")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo(slow_copy("one"))
        .build()?;
    let two = ToolDefinition::builder("two")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo(slow_copy("two"))
        .build()?;

    let ctx = Context::open(ContextOptions {
        max_parallel_redo_count: 2,
        ..Default::default()
    })
    .await?;

    let first = one
        .instance([
            ("source_file", DependencyValue::path("one.in")?),
            ("object_file", DependencyValue::path("one.out")?),
        ])?
        .start(&ctx, false)
        .await?;
    let second = two
        .instance([
            ("source_file", DependencyValue::path("two.in")?),
            ("object_file", DependencyValue::path("two.out")?),
        ])?
        .start(&ctx, false)
        .await?;

    assert_eq!(first.did_redo(), None);
    assert_eq!(second.did_redo(), None);

    ctx.close().await?;
    assert_eq!(first.did_redo(), Some(true));
    assert_eq!(second.did_redo(), Some(true));
    assert!(tree.exists("one.out") && tree.exists("two.out"));
    assert_eq!(peak.get(), 2, "both redos should have been in flight");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn s3_an_upstream_write_invalidates_downstream_evidence() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("src/in.txt", "payload");

    let producer_redos = Rc::new(Cell::new(0));
    let consumer_redos = Rc::new(Cell::new(0));
    let producer = ToolDefinition::builder("producer")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo(copy_redo(Rc::clone(&producer_redos)))
        .build()?;
    let consumer = ToolDefinition::builder("consumer")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo(copy_redo(Rc::clone(&consumer_redos)))
        .build()?;

    let ctx = Context::open(ContextOptions::default()).await?;
    let producer_instance = producer.instance([
        ("source_file", DependencyValue::path("src/in.txt")?),
        ("object_file", DependencyValue::path("mid.txt")?),
    ])?;
    let consumer_instance = consumer.instance([
        ("source_file", DependencyValue::path("mid.txt")?),
        ("object_file", DependencyValue::path("final.txt")?),
    ])?;

    // the consumer's start waits for the pending producer (its input is
    // the producer's output), then redoes
    producer_instance.start(&ctx, false).await?;
    let consumed = consumer_instance.start(&ctx, false).await?;
    assert!(consumed.complete().await?);
    assert_eq!(tree.read("final.txt"), b"payload");

    let unchanged = consumer_instance.start(&ctx, false).await?;
    assert_eq!(unchanged.did_redo(), Some(false));

    // a forced producer redo replaces mid.txt and declares it modified
    producer_instance.start(&ctx, true).await?.complete().await?;
    let invalidated = consumer_instance.start(&ctx, false).await?;
    assert!(invalidated.complete().await?);

    let settled = consumer_instance.start(&ctx, false).await?;
    assert_eq!(settled.did_redo(), Some(false));

    ctx.close().await?;
    assert_eq!(producer_redos.get(), 2);
    assert_eq!(consumer_redos.get(), 2);
    Ok(())
}

#[tokio::test]
async fn s6_a_failed_redo_leaves_evidence_untouched() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("src/a.c", "one");

    let fail_next = Rc::new(Cell::new(false));
    let redos = Rc::new(Cell::new(0));
    let fragile = ToolDefinition::builder("fragile")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo({
            use futures::FutureExt;
            let fail_next = Rc::clone(&fail_next);
            let redos = Rc::clone(&redos);
            move |redo: Redo| {
                let fail_next = Rc::clone(&fail_next);
                let redos = Rc::clone(&redos);
                async move {
                    redos.set(redos.get() + 1);
                    if fail_next.get() {
                        return Err(dlb::HelperExecutionError::UnknownHelper {
                            helper: "missing-compiler".into(),
                        }
                        .into());
                    }
                    let object = redo.path_value("object_file").expect("explicit output");
                    let temporary = redo.temporary(false)?;
                    std::fs::write(
                        redo.root_path().join(temporary.native().unwrap().as_path()),
                        b"object",
                    )
                    .unwrap();
                    redo.replace_output(&object, &temporary).await?;
                    Ok(false)
                }
                .boxed_local()
            }
        })
        .build()?;
    let instance = fragile.instance([
        ("source_file", DependencyValue::path("src/a.c")?),
        ("object_file", DependencyValue::path("out/a.o")?),
    ])?;

    let ctx = Context::open(ContextOptions::default()).await?;
    instance.start(&ctx, false).await?.complete().await?;
    assert_eq!(redos.get(), 1);

    tree.write("src/a.c", "two");
    fail_next.set(true);
    let failing = instance.start(&ctx, false).await?;
    let failure = failing.complete().await;
    assert!(matches!(
        failure,
        Err(Error::HelperExecution(
            dlb::HelperExecutionError::UnknownHelper { .. }
        ))
    ));
    assert_eq!(redos.get(), 2);

    // the old evidence still says "src/a.c changed": redo again
    fail_next.set(false);
    let retried = instance.start(&ctx, false).await?;
    assert!(retried.complete().await?);
    assert_eq!(redos.get(), 3);

    let settled = instance.start(&ctx, false).await?;
    assert_eq!(settled.did_redo(), Some(false));
    assert_eq!(redos.get(), 3);

    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn redo_runs_again_while_it_requests_so() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("in.txt", "x");

    let countdown = Rc::new(Cell::new(2u32));
    let polling = ToolDefinition::builder("polling")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo({
            use futures::FutureExt;
            let countdown = Rc::clone(&countdown);
            move |redo: Redo| {
                let countdown = Rc::clone(&countdown);
                async move {
                    let object = redo.path_value("object_file").expect("explicit output");
                    let temporary = redo.temporary(false)?;
                    std::fs::write(
                        redo.root_path().join(temporary.native().unwrap().as_path()),
                        b"partial",
                    )
                    .unwrap();
                    redo.replace_output(&object, &temporary).await?;
                    let remaining = countdown.get();
                    countdown.set(remaining.saturating_sub(1));
                    Ok(remaining > 0)
                }
                .boxed_local()
            }
        })
        .build()?;
    let instance = polling.instance([
        ("source_file", DependencyValue::path("in.txt")?),
        ("object_file", DependencyValue::path("out.txt")?),
    ])?;

    let ctx = Context::open(ContextOptions::default()).await?;
    assert!(instance.start(&ctx, false).await?.complete().await?); // countdown 2 -> 1
    assert!(instance.start(&ctx, false).await?.complete().await?); // requested
    assert!(instance.start(&ctx, false).await?.complete().await?); // requested
    let settled = instance.start(&ctx, false).await?;
    assert_eq!(settled.did_redo(), Some(false));
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn validation_rejects_inconsistent_dependency_sets() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("a", "a");

    let tool = ToolDefinition::builder("validation")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .output("listing_file", Dependency::regular_file().required(false))
        .redo(|_: Redo| async { Ok(false) })
        .build()?;

    let ctx = Context::open(ContextOptions::default()).await?;

    // missing input object
    let missing = tool
        .instance([
            ("source_file", DependencyValue::path("missing.c")?),
            ("object_file", DependencyValue::path("a.o")?),
        ])?
        .start(&ctx, false)
        .await;
    assert!(matches!(
        missing,
        Err(Error::Dependency(
            DependencyError::WrongFilesystemObject { .. }
        ))
    ));

    // input of the wrong kind (directory where a file is required)
    std::fs::create_dir(tree.root().join("adir")).unwrap();
    let wrong_kind = tool
        .instance([
            ("source_file", DependencyValue::path("adir")?),
            ("object_file", DependencyValue::path("a.o")?),
        ])?
        .start(&ctx, false)
        .await;
    assert!(matches!(
        wrong_kind,
        Err(Error::Dependency(
            DependencyError::WrongFilesystemObject { .. }
        ))
    ));

    // a path must not be input and output at once
    let cyclic = tool
        .instance([
            ("source_file", DependencyValue::path("a")?),
            ("object_file", DependencyValue::path("./a")?),
        ])?
        .start(&ctx, false)
        .await;
    assert!(matches!(
        cyclic,
        Err(Error::Dependency(DependencyError::InputIsOutput { .. }))
    ));

    // two outputs must not name the same path
    let clashing = tool
        .instance([
            ("source_file", DependencyValue::path("a")?),
            ("object_file", DependencyValue::path("out/x")?),
            ("listing_file", DependencyValue::path("out/x")?),
        ])?
        .start(&ctx, false)
        .await;
    assert!(matches!(
        clashing,
        Err(Error::Dependency(DependencyError::DuplicateOutput { .. }))
    ));

    // output paths must stay inside the working tree
    let escaping = tool
        .instance([
            ("source_file", DependencyValue::path("a")?),
            ("object_file", DependencyValue::path("../escape.o")?),
        ])?
        .start(&ctx, false)
        .await;
    assert!(matches!(
        escaping,
        Err(Error::Dependency(DependencyError::InvalidValue { .. }))
    ));

    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn missing_or_obstructed_outputs_cause_a_redo() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("in.txt", "content");

    let redos = Rc::new(Cell::new(0));
    let tool = ToolDefinition::builder("rebuild")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo(copy_redo(Rc::clone(&redos)))
        .build()?;
    let instance = tool.instance([
        ("source_file", DependencyValue::path("in.txt")?),
        ("object_file", DependencyValue::path("out/o.txt")?),
    ])?;

    let ctx = Context::open(ContextOptions::default()).await?;
    instance.start(&ctx, false).await?.complete().await?;
    assert_eq!(redos.get(), 1);

    // removed output
    std::fs::remove_file(tree.root().join("out/o.txt")).unwrap();
    instance.start(&ctx, false).await?.complete().await?;
    assert_eq!(redos.get(), 2);
    assert_eq!(tree.read("out/o.txt"), b"content");

    // obstructed by a directory of the same name
    std::fs::remove_file(tree.root().join("out/o.txt")).unwrap();
    std::fs::create_dir(tree.root().join("out/o.txt")).unwrap();
    instance.start(&ctx, false).await?.complete().await?;
    assert_eq!(redos.get(), 3);
    assert!(tree.root().join("out/o.txt").is_file());

    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn forced_redo_ignores_clean_evidence() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("in.txt", "content");

    let redos = Rc::new(Cell::new(0));
    let tool = ToolDefinition::builder("forced")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo(copy_redo(Rc::clone(&redos)))
        .build()?;
    let instance = tool.instance([
        ("source_file", DependencyValue::path("in.txt")?),
        ("object_file", DependencyValue::path("out.txt")?),
    ])?;

    let ctx = Context::open(ContextOptions::default()).await?;
    instance.start(&ctx, false).await?.complete().await?;
    instance.start(&ctx, true).await?.complete().await?;
    assert_eq!(redos.get(), 2);
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_starts_of_one_configuration_coalesce() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("in.txt", "content");

    let redos = Rc::new(Cell::new(0));
    let tool = ToolDefinition::builder("coalesced")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo({
            use futures::FutureExt;
            let redos = Rc::clone(&redos);
            move |redo: Redo| {
                let redos = Rc::clone(&redos);
                async move {
                    redos.set(redos.get() + 1);
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    let object = redo.path_value("object_file").expect("explicit output");
                    let temporary = redo.temporary(false)?;
                    std::fs::write(
                        redo.root_path().join(temporary.native().unwrap().as_path()),
                        b"o",
                    )
                    .unwrap();
                    redo.replace_output(&object, &temporary).await?;
                    Ok(false)
                }
                .boxed_local()
            }
        })
        .build()?;
    let instance = tool.instance([
        ("source_file", DependencyValue::path("in.txt")?),
        ("object_file", DependencyValue::path("out.txt")?),
    ])?;

    let ctx = Context::open(ContextOptions {
        max_parallel_redo_count: 2,
        ..Default::default()
    })
    .await?;
    let first = instance.start(&ctx, false).await?;
    let second = instance.start(&ctx, false).await?;
    assert!(first.complete().await?);
    assert!(second.complete().await?);
    assert_eq!(redos.get(), 1, "the second start reuses the pending redo");
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn execution_parameters_participate_in_the_fingerprint() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("in.txt", "content");

    let redos = Rc::new(Cell::new(0));
    let level_one = ToolDefinition::builder("optimize")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .param("LEVEL", 1)
        .redo(copy_redo(Rc::clone(&redos)))
        .build()?;
    let level_two = ToolDefinition::builder("optimize")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .param("LEVEL", 2)
        .redo(copy_redo(Rc::clone(&redos)))
        .build()?;

    let values = [
        ("source_file", DependencyValue::path("in.txt")?),
        ("object_file", DependencyValue::path("out.txt")?),
    ];

    let ctx = Context::open(ContextOptions::default()).await?;
    level_one.instance(values.clone())?.start(&ctx, false).await?.complete().await?;
    assert_eq!(redos.get(), 1);

    // same dependency shape and values, changed parameter: new fingerprint
    level_two.instance(values.clone())?.start(&ctx, false).await?.complete().await?;
    assert_eq!(redos.get(), 2);

    let settled = level_two.instance(values)?.start(&ctx, false).await?;
    assert_eq!(settled.did_redo(), Some(false));
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn non_explicit_env_dependency_is_realized_from_the_context() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("in.txt", "content");
    unsafe { std::env::set_var("DLB_IT_DIALECT", "c11") };

    let redos = Rc::new(Cell::new(0));
    let tool = ToolDefinition::builder("dialect")
        .input("source_file", Dependency::regular_file())
        .input(
            "dialect",
            Dependency::env_var("DLB_IT_DIALECT", "c[0-9]{2}", "c99").explicit(false),
        )
        .output("object_file", Dependency::regular_file())
        .redo(copy_redo(Rc::clone(&redos)))
        .build()?;
    let instance = tool.instance([
        ("source_file", DependencyValue::path("in.txt")?),
        ("object_file", DependencyValue::path("out.txt")?),
    ])?;

    let ctx = Context::open(ContextOptions::default()).await?;

    // required but not importable from the context yet
    let undefined = instance.start(&ctx, false).await;
    assert!(matches!(
        undefined,
        Err(Error::Dependency(DependencyError::EnvVarUndefined { .. }))
    ));

    ctx.import_env_var("DLB_IT_DIALECT", "c[0-9]{2}", "c99").await?;
    let first = instance.start(&ctx, false).await?;
    assert_eq!(
        first.dependency_value("dialect").await?,
        Some(DependencyValue::Str("c11".into()))
    );
    assert_eq!(redos.get(), 1);

    let unchanged = instance.start(&ctx, false).await?;
    assert_eq!(unchanged.did_redo(), Some(false));

    // a different value is a different fingerprint
    ctx.set_env_var("DLB_IT_DIALECT", "c17").await?;
    let changed = instance.start(&ctx, false).await?;
    assert!(changed.complete().await?);
    assert_eq!(redos.get(), 2);

    // switching back redoes once more: the other configuration rewrote
    // the shared output, which invalidated this configuration's evidence
    ctx.set_env_var("DLB_IT_DIALECT", "c11").await?;
    let back = instance.start(&ctx, false).await?;
    assert!(back.complete().await?);
    assert_eq!(redos.get(), 3);
    let settled = instance.start(&ctx, false).await?;
    assert_eq!(settled.did_redo(), Some(false));

    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn required_non_explicit_results_must_be_assigned() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("in.txt", "content");

    let assign = Rc::new(Cell::new(false));
    let tool = ToolDefinition::builder("reporting")
        .input("source_file", Dependency::regular_file())
        .input("included_files", Dependency::object().explicit(false))
        .output("object_file", Dependency::regular_file())
        .redo({
            use futures::FutureExt;
            let assign = Rc::clone(&assign);
            move |redo: Redo| {
                let assign = Rc::clone(&assign);
                async move {
                    let object = redo.path_value("object_file").expect("explicit output");
                    let temporary = redo.temporary(false)?;
                    std::fs::write(
                        redo.root_path().join(temporary.native().unwrap().as_path()),
                        b"o",
                    )
                    .unwrap();
                    redo.replace_output(&object, &temporary).await?;
                    if assign.get() {
                        redo.set(
                            "included_files",
                            DependencyValue::Object(dlb::tool::ParamValue::from(vec!["stdio.h"])),
                        )?;
                    }
                    Ok(false)
                }
                .boxed_local()
            }
        })
        .build()?;
    let instance = tool.instance([
        ("source_file", DependencyValue::path("in.txt")?),
        ("object_file", DependencyValue::path("out.txt")?),
    ])?;

    let ctx = Context::open(ContextOptions::default()).await?;

    let unassigned = instance.start(&ctx, false).await?;
    let failure = unassigned.complete().await;
    assert!(matches!(
        failure,
        Err(Error::Redo(RedoError::UnassignedRequired { .. }))
    ));

    assign.set(true);
    let assigned = instance.start(&ctx, false).await?;
    assert!(assigned.complete().await?);
    assert_eq!(
        assigned.dependency_value("included_files").await?,
        Some(DependencyValue::Object(dlb::tool::ParamValue::from(vec![
            "stdio.h"
        ])))
    );

    ctx.close().await?;
    Ok(())
}
