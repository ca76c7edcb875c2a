//! Pipe a line dataset through an external command.
//!
//! A feeder thread writes the partition's lines to the child's stdin while
//! the task thread reads the child's stdout. A broken pipe on the feeder is
//! not fatal (the child may legitimately stop reading early); any other
//! feeder failure is parked in a shared slot and surfaced after stdout EOF.
//! Dropping the iterator mid-stream kills the child and joins the feeder.

use crate::dataset::{Dataset, PartIter};
use anyhow::{Context as _, Result, anyhow};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

impl Dataset<String> {
    /// Run `command` once per partition, feeding records as stdin lines and
    /// yielding stdout lines.
    #[track_caller]
    pub fn pipe(&self, command: &[&str], quiet: bool) -> Dataset<String> {
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        self.derive("Piped", move |it, _| {
            match PipedIter::spawn(&command, quiet, it) {
                Ok(iter) => Box::new(iter),
                Err(e) => Box::new(std::iter::once(Err(e))),
            }
        })
    }
}

struct PipedIter {
    child: Option<Child>,
    stdout: std::io::Lines<BufReader<ChildStdout>>,
    feeder: Option<JoinHandle<()>>,
    error: Arc<Mutex<Option<anyhow::Error>>>,
    finished: bool,
}

impl PipedIter {
    fn spawn(command: &[String], quiet: bool, input: PartIter<String>) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("pipe command must not be empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if quiet {
                Stdio::null()
            } else {
                Stdio::inherit()
            });
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn pipe command {program:?}"))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("pipe child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("pipe child has no stdout"))?;

        let error = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&error);
        let feeder = std::thread::Builder::new()
            .name("millrace-pipe-feeder".into())
            .spawn(move || {
                for record in input {
                    let line = match record {
                        Ok(line) => line,
                        Err(e) => {
                            *slot.lock().unwrap() = Some(e);
                            break;
                        }
                    };
                    let mut bytes = line.into_bytes();
                    if !bytes.ends_with(b"\n") {
                        bytes.push(b'\n');
                    }
                    match stdin.write_all(&bytes) {
                        Ok(()) => {}
                        // The child stopped reading; that is its prerogative.
                        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => break,
                        Err(e) => {
                            *slot.lock().unwrap() = Some(e.into());
                            break;
                        }
                    }
                }
                // stdin drops here, closing the child's input.
            })
            .context("spawn pipe feeder thread")?;

        Ok(Self {
            child: Some(child),
            stdout: BufReader::new(stdout).lines(),
            feeder: Some(feeder),
            error,
            finished: false,
        })
    }

    fn finish(&mut self) -> Option<anyhow::Error> {
        self.finished = true;
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    log::warn!("pipe command exited with {status}");
                }
                Ok(_) => {}
                Err(e) => log::warn!("wait for pipe command: {e}"),
            }
        }
        self.error.lock().unwrap().take()
    }
}

impl Iterator for PipedIter {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.stdout.next() {
            Some(Ok(line)) => Some(Ok(line)),
            Some(Err(e)) => {
                self.finish();
                Some(Err(e.into()))
            }
            None => self.finish().map(Err),
        }
    }
}

impl Drop for PipedIter {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(child) = self.child.as_mut() {
                let _ = child.kill();
            }
            self.finish();
        }
    }
}
