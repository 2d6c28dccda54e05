//! Process spawning helpers shared by the sidecar runners.
//!
//! Runner scripts may fork helpers of their own (model loaders, ffmpeg), so
//! killing only the direct child on timeout leaks the rest. Commands built
//! here start in their own process group on unix so the whole tree can be
//! signalled at once.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Put the child into a fresh process group whose id equals its pid.
pub trait ProcessGroupExt {
    fn own_process_group(&mut self) -> &mut Self;
}

#[cfg(feature = "tokio")]
impl ProcessGroupExt for tokio::process::Command {
    fn own_process_group(&mut self) -> &mut Self {
        #[cfg(unix)]
        {
            self.process_group(0);
        }
        self
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    #[allow(unused_mut)]
    let mut cmd = tokio::process::Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Kill a child and every process in its tree, then reap it.
///
/// The child must have been spawned with [`ProcessGroupExt::own_process_group`]
/// for descendants to be reached on unix. Errors from the group signal are
/// logged; the direct child is always killed afterwards.
#[cfg(feature = "tokio")]
pub async fn kill_tree(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        let status = tokio_command("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{pid}"))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;

        #[cfg(windows)]
        let status = tokio_command("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;

        #[cfg(any(unix, windows))]
        match status {
            Ok(status) if !status.success() => {
                tracing::debug!(pid, ?status, "process tree kill reported failure");
            }
            Err(e) => tracing::warn!(pid, error = %e, "failed to signal process tree"),
            _ => {}
        }
    }

    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "child already exited before kill");
    }
}

#[cfg(all(test, unix, feature = "tokio"))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;

    #[tokio::test]
    async fn kill_tree_terminates_sleeping_child() {
        let mut child = tokio_command("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30")
            .own_process_group()
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sh");

        kill_tree(&mut child).await;

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child reaped in time")
            .expect("wait status");
        assert!(!status.success());
    }
}
