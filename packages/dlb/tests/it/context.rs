//! Working-tree context lifecycle: lock, clock, scopes, temporaries,
//! managed-tree path resolution.

use color_eyre::Result;
use dlb::context::{Context, ContextOptions, ScopeOptions};
use dlb::fs::{AbsolutePath, RelativePath};
use dlb::{Error, WorkingTreeError};
use pretty_assertions::assert_eq;

use crate::Worktree;

#[tokio::test]
async fn open_requires_a_management_tree() {
    let tree = Worktree::enter();
    std::fs::remove_dir(tree.root().join(".dlbroot")).unwrap();

    let denied = Context::open(ContextOptions::default()).await;
    assert!(matches!(
        denied,
        Err(Error::WorkingTree(WorkingTreeError::NoManagementTree { .. }))
    ));
}

#[tokio::test]
async fn lock_is_exclusive_per_working_tree() -> Result<()> {
    let _tree = Worktree::enter();

    let ctx = Context::open(ContextOptions::default()).await?;
    let second = Context::open(ContextOptions::default()).await;
    assert!(matches!(
        second,
        Err(Error::WorkingTree(WorkingTreeError::LockHeld { .. }))
    ));
    ctx.close().await?;

    // released on close
    let ctx = Context::open(ContextOptions::default()).await?;
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn worktree_time_is_monotonic_within_and_across_contexts() -> Result<()> {
    let _tree = Worktree::enter();

    let ctx = Context::open(ContextOptions::default()).await?;
    let t1 = ctx.worktree_time()?;
    let t2 = ctx.worktree_time()?;
    assert!(t1 <= t2);
    ctx.close().await?;

    // exit dwells until the clock strictly advanced, so a new context
    // reads a strictly greater value
    let ctx = Context::open(ContextOptions::default()).await?;
    let t3 = ctx.worktree_time()?;
    assert!(t3 > t2, "{t3} should be greater than {t2}");
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn removed_probe_is_a_clock_error() -> Result<()> {
    let tree = Worktree::enter();

    let ctx = Context::open(ContextOptions::default()).await?;
    ctx.worktree_time()?;
    std::fs::remove_file(tree.root().join(".dlbroot/o")).unwrap();
    let denied = ctx.worktree_time();
    assert!(matches!(
        denied,
        Err(Error::WorkingTree(WorkingTreeError::ProbeUnusable { .. }))
    ));
    drop(ctx); // close would need the probe for the exit dwell
    Ok(())
}

#[tokio::test]
async fn temporary_area_lives_and_dies_with_the_context() -> Result<()> {
    let tree = Worktree::enter();

    let ctx = Context::open(ContextOptions::default()).await?;
    let file = ctx.create_temporary(false, "t", "")?;
    let dir = ctx.create_temporary(true, "scratch-", ".d")?;
    assert_ne!(file, dir);
    assert!(tree.root().join(".dlbroot/t").is_dir());
    assert!(ctx.root_path().join(file.native()?.as_path()).is_file());
    assert!(ctx.root_path().join(dir.native()?.as_path()).is_dir());
    ctx.close().await?;

    assert!(!tree.exists(".dlbroot/t"));
    Ok(())
}

#[tokio::test]
async fn environment_is_scoped_and_narrowed() -> Result<()> {
    let _tree = Worktree::enter();
    unsafe { std::env::set_var("DLB_IT_LANG", "de_AT") };

    let ctx = Context::open(ContextOptions::default()).await?;
    assert_eq!(ctx.env_var("DLB_IT_LANG"), None); // not imported yet

    ctx.import_env_var("DLB_IT_LANG", "[a-z]{2}_[A-Z]{2}", "sv_SE")
        .await?;
    assert_eq!(ctx.env_var("DLB_IT_LANG").as_deref(), Some("de_AT"));

    ctx.push_scope(ScopeOptions::default()).await?;
    ctx.import_env_var("DLB_IT_LANG", "de.*", "de_CH").await?;
    let widened = ctx.set_env_var("DLB_IT_LANG", "fr_FR").await;
    assert!(widened.is_err());
    ctx.set_env_var("DLB_IT_LANG", "de_CH").await?;
    ctx.pop_scope().await?;

    assert_eq!(ctx.env_var("DLB_IT_LANG").as_deref(), Some("de_AT"));
    ctx.set_env_var("DLB_IT_LANG", "fr_FR").await?;
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn scopes_must_nest_properly() -> Result<()> {
    let _tree = Worktree::enter();

    let ctx = Context::open(ContextOptions::default()).await?;
    let unbalanced = ctx.pop_scope().await;
    assert!(matches!(
        unbalanced,
        Err(Error::WorkingTree(WorkingTreeError::NestingRestricted { .. }))
    ));

    ctx.push_scope(ScopeOptions::default()).await?;
    let close_denied = ctx.clone().close().await;
    assert!(matches!(
        close_denied,
        Err(Error::WorkingTree(WorkingTreeError::NestingRestricted { .. }))
    ));
    ctx.pop_scope().await?;
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn helper_search_must_be_enabled_by_the_root() -> Result<()> {
    let _tree = Worktree::enter();

    let ctx = Context::open(ContextOptions::default()).await?;
    let denied = ctx
        .push_scope(ScopeOptions {
            find_helpers: Some(true),
            ..Default::default()
        })
        .await;
    assert!(matches!(
        denied,
        Err(Error::WorkingTree(WorkingTreeError::NestingRestricted { .. }))
    ));
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn helpers_resolve_explicitly_or_not_at_all() -> Result<()> {
    let _tree = Worktree::enter();

    let ctx = Context::open(ContextOptions::default()).await?;
    let sh = RelativePath::new("sh")?;
    assert!(ctx.helper(&sh).is_err());

    ctx.set_helper(&sh, &AbsolutePath::new("/bin/sh")?).await?;
    assert_eq!(ctx.helper(&sh)?, AbsolutePath::new("/bin/sh")?);
    ctx.close().await?;
    Ok(())
}

#[tokio::test]
async fn working_tree_paths_are_resolved_and_guarded() -> Result<()> {
    let tree = Worktree::enter();
    tree.write("src/a.c", "int a;\n");

    let ctx = Context::open(ContextOptions::default()).await?;

    let rel = ctx.working_tree_path_of_str("src/a.c", true, false)?;
    assert_eq!(rel, RelativePath::new("src/a.c")?);

    let root_text = ctx.root_path().to_str().unwrap().to_owned();
    let abs = AbsolutePath::new(format!("{root_text}/src/a.c").as_str())?;
    assert_eq!(ctx.working_tree_path_of(&abs, true, false)?, rel);

    assert!(matches!(
        ctx.working_tree_path_of_str("../outside", false, true),
        Err(Error::WorkingTree(WorkingTreeError::OutsideTree { .. }))
    ));
    assert!(matches!(
        ctx.working_tree_path_of_str("/etc/passwd", false, false),
        Err(Error::WorkingTree(WorkingTreeError::OutsideTree { .. }))
    ));
    assert!(matches!(
        ctx.working_tree_path_of_str("src/missing.c", true, false),
        Err(Error::WorkingTree(WorkingTreeError::DoesNotExist { .. }))
    ));

    // collapsing ".." across a symlink is refused unless permitted
    std::fs::create_dir(tree.root().join("real")).unwrap();
    std::os::unix::fs::symlink(tree.root().join("real"), tree.root().join("sym")).unwrap();
    let through = ctx.working_tree_path_of_str("sym/../src/a.c", false, false);
    assert!(matches!(
        through,
        Err(Error::WorkingTree(WorkingTreeError::Uncollapsable { .. }))
    ));
    let collapsed = ctx.working_tree_path_of_str("sym/../src/a.c", false, true)?;
    assert_eq!(collapsed, rel);

    ctx.close().await?;
    Ok(())
}
