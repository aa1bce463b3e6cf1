//! Utility functions for retries, external commands, and file plumbing.

use anyhow::{bail, Context, Result};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Call `f` up to `attempts` times, sleeping `delay` between failures.
///
/// Returns the first success or the error from the final attempt.
pub async fn retry<F, Fut, T>(attempts: u32, delay: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(attempt, error = %format!("{:#}", e), "retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run a command to completion, failing with its stderr on non-zero exit.
pub async fn run_checked(cmd: &mut Command, what: &str) -> Result<std::process::Output> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("executing {}", what))?;
    if !output.status.success() {
        bail!(
            "{} failed ({}): {}",
            what,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// Blocking variant of [`run_checked`] for work pinned to a namespace thread.
pub fn run_checked_sync(
    cmd: &mut std::process::Command,
    what: &str,
) -> Result<std::process::Output> {
    let output = cmd
        .output()
        .with_context(|| format!("executing {}", what))?;
    if !output.status.success() {
        bail!(
            "{} failed ({}): {}",
            what,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// Symlink `dest` to the absolute form of `src`.
pub fn abs_symlink(src: &Path, dest: &Path) -> Result<()> {
    let src = std::path::absolute(src)
        .with_context(|| format!("resolving {}", src.display()))?;
    std::os::unix::fs::symlink(&src, dest)
        .with_context(|| format!("symlinking {} -> {}", dest.display(), src.display()))
}

/// Concatenate `inputs` into a new file at `out`.
pub fn cat(out: &Path, inputs: &[&Path]) -> Result<()> {
    let mut outf = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(out)
        .with_context(|| format!("creating {}", out.display()))?;
    for input in inputs {
        let mut inf = std::fs::File::open(input)
            .with_context(|| format!("opening {}", input.display()))?;
        std::io::copy(&mut inf, &mut outf)
            .with_context(|| format!("appending {} to {}", input.display(), out.display()))?;
    }
    Ok(())
}

/// Copy a file, sharing extents with the source where the filesystem allows.
pub async fn copy_reflink(src: &Path, dest: &Path) -> Result<()> {
    run_checked(
        Command::new("cp").arg("--reflink=auto").arg(src).arg(dest),
        "cp --reflink=auto",
    )
    .await?;
    Ok(())
}

/// Whether an executable is reachable through PATH.
pub fn binary_in_path(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}
