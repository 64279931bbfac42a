//! Helper execution and output replacement through the redo facade.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use color_eyre::Result;
use dlb::context::{Context, ContextOptions};
use dlb::fs::{AbsolutePath, RelativePath};
use dlb::redo::{ExecuteHelperOptions, HelperArg, OutputRedirection, Redo};
use dlb::tool::{Dependency, DependencyValue, ToolDefinition};
use dlb::{Error, HelperExecutionError};
use pretty_assertions::assert_eq;

use crate::Worktree;

async fn open_with_sh() -> Result<Context> {
    let ctx = Context::open(ContextOptions::default()).await?;
    ctx.set_helper(&RelativePath::new("sh")?, &AbsolutePath::new("/bin/sh")?)
        .await?;
    Ok(ctx)
}

/// Runs a dependency-less tool once and completes it.
async fn run_tool(ctx: &Context, tool: &ToolDefinition) -> Result<(), Error> {
    let instance = tool.instance([])?;
    let result = instance.start(ctx, false).await?;
    result.complete().await?;
    Ok(())
}

#[tokio::test]
async fn helper_exit_codes_are_checked() -> Result<()> {
    let _tree = Worktree::enter();
    let ctx = open_with_sh().await?;

    let tool = ToolDefinition::builder("exit_codes").redo(|redo: Redo| async move {
        let sh = RelativePath::new("sh").unwrap();

        let ok = redo
            .execute_helper(&sh, ["-c".into(), "true".into()], Default::default())
            .await?;
        assert_eq!(ok, 0);

        let tolerated = redo
            .execute_helper(
                &sh,
                ["-c".into(), "exit 3".into()],
                ExecuteHelperOptions {
                    expected_returncodes: vec![0, 3],
                    ..Default::default()
                },
            )
            .await?;
        assert_eq!(tolerated, 3);

        let refused = redo
            .execute_helper(&sh, ["-c".into(), "exit 4".into()], Default::default())
            .await;
        assert!(matches!(
            refused,
            Err(Error::HelperExecution(
                HelperExecutionError::UnexpectedReturnCode { returncode: 4, .. }
            ))
        ));

        let unknown = redo
            .execute_helper(
                &RelativePath::new("no-such-helper").unwrap(),
                [],
                Default::default(),
            )
            .await;
        assert!(matches!(
            unknown,
            Err(Error::HelperExecution(
                HelperExecutionError::UnknownHelper { .. }
            ))
        ));

        Ok(false)
    })
    .build()?;
    run_tool(&ctx, &tool).await?;

    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn helper_sees_cwd_relative_path_arguments() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("src/d.txt", "data");
    std::fs::create_dir(tree.root().join("sub")).unwrap();
    let ctx = open_with_sh().await?;

    let tool = ToolDefinition::builder("cwd_arguments").redo(|redo: Redo| async move {
        let sh = RelativePath::new("sh").unwrap();
        let (code, output) = redo
            .execute_helper_with_output(
                &sh,
                [
                    "-c".into(),
                    r#"pwd && printf '%s\n' "$0" && cat "$0""#.into(),
                    HelperArg::Path(dlb::fs::Path::new("src/d.txt").unwrap()),
                ],
                ExecuteHelperOptions {
                    cwd: Some(RelativePath::new("sub/").unwrap()),
                    ..Default::default()
                },
                false,
            )
            .await?;
        assert_eq!(code, 0);
        let text = String::from_utf8(output).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().ends_with("/sub"));
        assert_eq!(lines.next().unwrap(), "../src/d.txt");
        assert_eq!(lines.next().unwrap(), "data");
        Ok(false)
    })
    .build()?;
    run_tool(&ctx, &tool).await?;

    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn helper_environment_is_the_imported_one() -> Result<()> {
    let _tree = Worktree::enter();
    unsafe {
        std::env::set_var("DLB_IT_VISIBLE", "seen");
        std::env::set_var("DLB_IT_HIDDEN", "leaked");
    }
    let ctx = open_with_sh().await?;
    ctx.import_env_var("DLB_IT_VISIBLE", ".*", "").await?;

    let tool = ToolDefinition::builder("helper_environment").redo(|redo: Redo| async move {
        let sh = RelativePath::new("sh").unwrap();
        let (_, output) = redo
            .execute_helper_with_output(
                &sh,
                [
                    "-c".into(),
                    r#"printf '%s|%s|%s' "${DLB_IT_VISIBLE:-unset}" "${DLB_IT_HIDDEN:-unset}" "${DLB_IT_FORCED:-unset}""#
                        .into(),
                ],
                ExecuteHelperOptions {
                    forced_env: [("DLB_IT_FORCED".to_string(), "forced".to_string())].into(),
                    ..Default::default()
                },
                false,
            )
            .await?;
        assert_eq!(output, b"seen|unset|forced");
        Ok(false)
    })
    .build()?;
    run_tool(&ctx, &tool).await?;

    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn helper_output_redirects_to_a_working_tree_file() -> Result<()> {
    let tree = Worktree::enter();
    let ctx = open_with_sh().await?;

    let tool = ToolDefinition::builder("redirection").redo(|redo: Redo| async move {
        let sh = RelativePath::new("sh").unwrap();
        let code = redo
            .execute_helper(
                &sh,
                ["-c".into(), "echo logged; echo noise >&2".into()],
                ExecuteHelperOptions {
                    stdout: OutputRedirection::File(RelativePath::new("out/log.txt").unwrap()),
                    stderr: OutputRedirection::Discard,
                    ..Default::default()
                },
            )
            .await?;
        assert_eq!(code, 0);
        Ok(false)
    })
    .build()?;
    run_tool(&ctx, &tool).await?;

    assert_eq!(tree.read("out/log.txt"), b"logged\n");
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn helper_output_streams_through_a_chunk_processor() -> Result<()> {
    let _tree = Worktree::enter();
    let ctx = open_with_sh().await?;

    let chunks = Rc::new(RefCell::new(Vec::new()));
    let tool = ToolDefinition::builder("chunked_output").redo({
        let chunks = Rc::clone(&chunks);
        move |redo: Redo| {
            let chunks = Rc::clone(&chunks);
            async move {
                let sh = RelativePath::new("sh").unwrap();
                let code = redo
                    .execute_helper_with_chunks(
                        &sh,
                        ["-c".into(), r"printf 'a\nbb\nccc\n'".into()],
                        Default::default(),
                        false,
                        b'\n',
                        16,
                        |chunk| {
                            chunks.borrow_mut().push(chunk.to_vec());
                            Ok(())
                        },
                    )
                    .await?;
                assert_eq!(code, 0);

                let overrun = redo
                    .execute_helper_with_chunks(
                        &sh,
                        ["-c".into(), r"printf 'a\nbb\nccc\n'".into()],
                        Default::default(),
                        false,
                        b'\n',
                        2,
                        |_| Ok(()),
                    )
                    .await;
                assert!(matches!(
                    overrun,
                    Err(Error::HelperExecution(
                        HelperExecutionError::ChunkTooLarge { .. }
                    ))
                ));
                Ok(false)
            }
        }
    })
    .build()?;
    run_tool(&ctx, &tool).await?;

    assert_eq!(
        *chunks.borrow(),
        vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]
    );
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn helper_raw_hands_out_the_child() -> Result<()> {
    let _tree = Worktree::enter();
    let ctx = open_with_sh().await?;

    let tool = ToolDefinition::builder("raw_child").redo(|redo: Redo| async move {
        use tokio::io::AsyncWriteExt;
        let sh = RelativePath::new("sh").unwrap();
        let mut child = redo
            .execute_helper_raw(
                &sh,
                ["-c".into(), r#"read line; printf '%s' "$line""#.into()],
                Default::default(),
            )
            .await?;
        let mut stdin = child.stdin.take().expect("stdin is piped");
        stdin.write_all(b"ping\n").await.unwrap();
        drop(stdin);
        let output = child.wait_with_output().await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"ping");
        Ok(false)
    })
    .build()?;
    run_tool(&ctx, &tool).await?;

    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn replace_output_validates_its_operands() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("in.txt", "content");

    let tool = ToolDefinition::builder("replace_validation")
        .input("source_file", Dependency::regular_file())
        .output("object_file", Dependency::regular_file())
        .redo(|redo: Redo| async move {
            let object = redo.path_value("object_file").expect("explicit output");

            let not_declared = redo
                .replace_output(&RelativePath::new("other.txt").unwrap(), &object)
                .await;
            assert!(matches!(
                not_declared,
                Err(Error::Dependency(dlb::DependencyError::InvalidValue { .. }))
            ));

            let missing_source = redo
                .replace_output(&object, &RelativePath::new("nowhere.txt").unwrap())
                .await;
            assert!(matches!(
                missing_source,
                Err(Error::WorkingTree(dlb::WorkingTreeError::DoesNotExist { .. }))
            ));

            let itself = redo.replace_output(&object, &object).await;
            assert!(itself.is_err());

            let temporary = redo.temporary(false)?;
            std::fs::write(
                redo.root_path().join(temporary.native().unwrap().as_path()),
                b"o",
            )
            .unwrap();
            redo.replace_output(&object, &temporary).await?;
            assert_eq!(redo.modified_outputs(), vec![
                RelativePath::new("out/deep/o.txt").unwrap()
            ]);
            Ok(false)
        })
        .build()?;

    let ctx = Context::open(ContextOptions::default()).await?;
    let instance = tool.instance([
        ("source_file", DependencyValue::path("in.txt")?),
        // parent directories are created by the replacement
        ("object_file", DependencyValue::path("out/deep/o.txt")?),
    ])?;
    instance.start(&ctx, false).await?.complete().await?;
    assert_eq!(tree.read("out/deep/o.txt"), b"o");
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn unchanged_content_keeps_the_old_file() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("in.txt", "content");

    let tool = ToolDefinition::builder("content_comparing")
        .input("source_file", Dependency::regular_file())
        .output(
            "object_file",
            Dependency::regular_file().replace_by_same_content(false),
        )
        .redo(|redo: Redo| async move {
            let object = redo.path_value("object_file").expect("explicit output");
            let temporary = redo.temporary(false)?;
            std::fs::write(
                redo.root_path().join(temporary.native().unwrap().as_path()),
                b"identical bytes",
            )
            .unwrap();
            redo.replace_output(&object, &temporary).await?;
            Ok(false)
        })
        .build()?;
    let instance = tool.instance([
        ("source_file", DependencyValue::path("in.txt")?),
        ("object_file", DependencyValue::path("out.txt")?),
    ])?;

    let ctx = Context::open(ContextOptions::default()).await?;
    instance.start(&ctx, false).await?.complete().await?;
    let first_mtime = std::fs::metadata(tree.root().join("out.txt"))?.modified()?;

    instance.start(&ctx, true).await?.complete().await?;
    let second_mtime = std::fs::metadata(tree.root().join("out.txt"))?.modified()?;
    assert_eq!(first_mtime, second_mtime, "identical content keeps the old file");

    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn directory_outputs_are_replaced_as_a_tree() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("in.txt", "content");

    let generation = Rc::new(Cell::new(0u32));
    let tool = ToolDefinition::builder("site_generator")
        .input("source_file", Dependency::regular_file())
        .output("site_directory", Dependency::directory())
        .redo({
            use futures::FutureExt;
            let generation = Rc::clone(&generation);
            move |redo: Redo| {
                let generation = Rc::clone(&generation);
                async move {
                    generation.set(generation.get() + 1);
                    let site = redo.path_value("site_directory").expect("explicit output");
                    let temporary = redo.temporary(true)?;
                    let root = redo.root_path().to_path_buf();
                    let staged = root.join(temporary.native().unwrap().as_path());
                    let name = format!("page-{}.html", generation.get());
                    std::fs::write(staged.join(name), b"<html>").unwrap();
                    redo.replace_output(&site, &temporary).await?;
                    Ok(false)
                }
                .boxed_local()
            }
        })
        .build()?;
    let instance = tool.instance([
        ("source_file", DependencyValue::path("in.txt")?),
        ("site_directory", DependencyValue::path("site/")?),
    ])?;

    let ctx = Context::open(ContextOptions::default()).await?;
    instance.start(&ctx, false).await?.complete().await?;
    assert!(tree.exists("site/page-1.html"));

    instance.start(&ctx, true).await?.complete().await?;
    assert!(!tree.exists("site/page-1.html"), "old tree is gone");
    assert!(tree.exists("site/page-2.html"));

    ctx.close().await?;
    Ok(())
}
