//! `dlb` — an incremental build runtime.
//!
//! A build is an imperative script that instantiates *tool instances*
//! (parameterised units of work with typed input and output dependencies)
//! inside a working-tree [`context::Context`] and requests their
//! execution. The runtime decides from recorded evidence whether a tool's
//! `redo` body must run again, schedules necessary redos on a cooperative
//! single-threaded sequencer, and records fresh evidence for the next
//! run.
//!
//! ```no_run
//! use dlb::context::{Context, ContextOptions};
//! use dlb::fs::RelativePath;
//! use dlb::tool::{Dependency, DependencyValue, ToolDefinition};
//!
//! # async fn build() -> Result<(), dlb::Error> {
//! let copy = ToolDefinition::builder("copy")
//!     .input("source_file", Dependency::regular_file())
//!     .output("destination_file", Dependency::regular_file())
//!     .redo(|redo: dlb::redo::Redo| async move {
//!         let source = redo.path_value("source_file").expect("explicit");
//!         let destination = redo.path_value("destination_file").expect("explicit");
//!         let temporary = redo.temporary(false)?;
//!         let cp = RelativePath::new("cp")?;
//!         redo.execute_helper(
//!             &cp,
//!             [(&source).into(), (&temporary).into()],
//!             Default::default(),
//!         )
//!         .await?;
//!         redo.replace_output(&destination, &temporary).await?;
//!         Ok(false)
//!     })
//!     .build()?;
//!
//! // the process working directory must be a working tree root
//! // (a directory containing `.dlbroot/`)
//! let ctx = Context::open(ContextOptions {
//!     find_helpers: true,
//!     ..Default::default()
//! })
//! .await?;
//! let instance = copy.instance([
//!     ("source_file", DependencyValue::path("input.txt")?),
//!     ("destination_file", DependencyValue::path("out/copy.txt")?),
//! ])?;
//! let result = instance.start(&ctx, false).await?;
//! result.complete().await?;
//! ctx.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod fs;
pub mod redo;
pub mod rundb;
pub mod sequencer;
pub mod tool;

mod run;

pub use error::{
    DatabaseError, DefinitionError, DependencyError, Error, ExecutionParameterError,
    HelperExecutionError, RedoError, Result, WorkingTreeError,
};
pub use run::RunResult;
