//! Process-tree control shared across the workspace.

use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::{debug, warn};

/// Kill a process together with its entire descendant tree.
///
/// External tools routinely spawn helper processes; killing only the parent
/// leaves those orphaned and still writing to the output. Descendants are
/// killed leaf-first, the root last, so no child is reparented mid-walk.
///
/// Returns the number of processes that received a kill signal.
pub fn kill_tree(root_pid: u32) -> usize {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let root = Pid::from_u32(root_pid);
    let mut order = Vec::new();
    collect_descendants(&system, root, &mut order);
    order.push(root);

    let mut killed = 0;
    // `order` is parent-before-child per subtree; walk it backwards.
    for pid in order.iter().rev() {
        if let Some(process) = system.process(*pid) {
            let signalled = process
                .kill_with(Signal::Kill)
                .unwrap_or_else(|| process.kill());
            if signalled {
                killed += 1;
                debug!(pid = pid.as_u32(), "Killed process");
            } else {
                warn!(pid = pid.as_u32(), "Failed to kill process");
            }
        }
    }
    killed
}

fn collect_descendants(system: &System, parent: Pid, out: &mut Vec<Pid>) {
    for (pid, process) in system.processes() {
        if process.parent() == Some(parent) {
            out.push(*pid);
            collect_descendants(system, *pid, out);
        }
    }
}

/// Spawn a task that waits for a process to exit and sends the exit code
/// through a oneshot channel.
///
/// If the cancellation token fires first, the whole process tree is killed
/// and `None` is sent.
#[cfg(feature = "tokio")]
pub fn spawn_process_waiter(
    mut child: tokio::process::Child,
    token: tokio_util::sync::CancellationToken,
) -> tokio::sync::oneshot::Receiver<Option<i32>> {
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let exit_code = tokio::select! {
            _ = token.cancelled() => {
                if let Some(pid) = child.id() {
                    kill_tree(pid);
                }
                let _ = child.kill().await;
                None
            }
            status = child.wait() => {
                match status {
                    Ok(exit_status) => {
                        let code = exit_status.code();
                        if let Some(c) = code
                            && c != 0
                        {
                            warn!("Process exited with code: {c}");
                        }
                        code
                    }
                    Err(e) => {
                        warn!("Error waiting for process: {e}");
                        Some(-1)
                    }
                }
            }
        };
        let _ = tx.send(exit_code);
    });

    rx
}
