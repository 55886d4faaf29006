//! The `Gdb` process wrapper: spawns the real `gdb` binary in MI mode and
//! carries its stdin/stdout pipes (spec.md §4.5 Init phase, §6).

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::error;

pub struct Gdb {
    pub child: Child,
    pub stdin: ChildStdin,
}

impl Gdb {
    /// Spawns `gdb --interpreter=mi2` non-interactively against `program`,
    /// piping stdin/stdout and discarding stderr.
    pub fn spawn(gdb_bin: &str, program: &Path, program_args: &[String]) -> std::io::Result<(Self, mpsc::Receiver<String>)> {
        let mut child = Command::new(gdb_bin)
            .arg("--interpreter=mi2")
            .arg("--nx")
            .arg("-q")
            .arg("--args")
            .arg(program)
            .args(program_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().expect("gdb stdin piped");
        let stdout = child.stdout.take().expect("gdb stdout piped");
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("gdb stdout read error: {e}");
                        break;
                    }
                }
            }
        });
        Ok((Gdb { child, stdin }, rx))
    }

    /// Writes one MI command line, flushing immediately so GDB sees it
    /// without buffering delay.
    pub async fn send(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await
    }
}

/// The fixed setup sequence spec.md §4.5's Init phase requires before a
/// back-end is considered attached: pretty-printing, non-stop, async
/// target, no pagination, then the run command itself.
pub fn startup_commands() -> Vec<&'static str> {
    vec![
        "-gdb-set pagination off",
        "-gdb-set non-stop on",
        "-gdb-set target-async on",
        "-enable-pretty-printing",
        "-exec-run",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_commands_ends_with_exec_run() {
        assert_eq!(startup_commands().last(), Some(&"-exec-run"));
    }
}
