//! The parallel dispatcher: fan a line stream into a pool of child
//! processes.
//!
//! Two modes, named for how they load the pool:
//!
//! * **gatling** — fill one child to its byte quota, close its stdin, then
//!   open the next. Minimizes concurrent connections; right for children
//!   that talk to the Perforce server.
//! * **manifold** — open a child per incoming chunk up to the pool size,
//!   then rotate round-robin. Maximizes CPU use; right for local work like
//!   checksumming.
//!
//! Input is forwarded in chunks truncated at the last newline, so no child
//! ever receives a partial line. Every child's stdout and stderr is drained
//! by a sink thread that buffers until a newline boundary and writes whole
//! lines under a shared lock — output is line-atomic across the pool.

use std::collections::VecDeque;
use std::io::{BufRead, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, bail};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Gatling,
    Manifold,
}

#[derive(Clone, Debug)]
pub struct DispatchOptions {
    pub mode: Mode,
    /// Pool size; defaults to the machine's available parallelism.
    pub max_procs: usize,
    /// Byte quota per child; a child's stdin closes once it has received
    /// this much.
    pub max_bytes: usize,
    /// Input read size.
    pub chunk_size: usize,
}

impl DispatchOptions {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            max_procs: default_procs(),
            max_bytes: 1024 * 1024,
            chunk_size: 4096,
        }
    }

    pub fn max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn max_procs(mut self, max_procs: usize) -> Self {
        self.max_procs = max_procs.min(default_procs()).max(1);
        self
    }
}

fn default_procs() -> usize {
    thread::available_parallelism().map_or(4, usize::from)
}

/// Recipe for one child process; the dispatcher spawns as many as it needs.
#[derive(Clone, Debug)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Environment marshaled across the process boundary (depot path,
    /// client root, target changelist, …).
    pub envs: Vec<(String, String)>,
}

impl ChildCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    pub fn display(&self) -> String {
        format!(
            "{} {}",
            self.program
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.program.display().to_string()),
            self.args.join(" ")
        )
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

type SharedSink = Arc<Mutex<Box<dyn Write + Send>>>;

struct Worker {
    child: Child,
    stdin: Option<ChildStdin>,
    written: usize,
    readers: Vec<JoinHandle<std::io::Result<()>>>,
}

impl Worker {
    fn close_stdin(&mut self) {
        self.stdin.take();
    }

    fn reap(mut self, results: &mut Vec<i32>) -> Result<()> {
        self.close_stdin();
        let status = self.child.wait()?;
        for reader in self.readers {
            match reader.join() {
                Ok(r) => r?,
                Err(_) => bail!("dispatcher sink thread panicked"),
            }
        }
        results.push(status.code().unwrap_or(-1));
        Ok(())
    }
}

/// Run the dispatcher to completion over `input`.
///
/// Returns the number of children spawned. Nonzero child exits are a
/// pipeline failure, reported with a count.
pub fn distribute(
    opts: &DispatchOptions,
    cmd: &ChildCommand,
    input: &mut dyn BufRead,
    stdout: Box<dyn Write + Send>,
) -> Result<usize> {
    let out_sink: SharedSink = Arc::new(Mutex::new(stdout));
    let err_sink: SharedSink = Arc::new(Mutex::new(Box::new(std::io::stderr())));

    let mut open: VecDeque<Worker> = VecDeque::new();
    let mut filled: Vec<Worker> = Vec::new();
    let mut results: Vec<i32> = Vec::new();
    let mut carry: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; opts.chunk_size];

    let outcome = (|| -> Result<()> {
        loop {
            let n = input.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            let data = &chunk[..n];
            let Some(split) = last_newline(data) else {
                carry.extend_from_slice(data);
                continue;
            };

            let mut worker = match opts.mode {
                Mode::Manifold if open.len() + filled.len() == opts.max_procs => open
                    .pop_front()
                    .ok_or_else(|| anyhow!("dispatcher pool accounting broke"))?,
                Mode::Gatling if !open.is_empty() => open
                    .pop_front()
                    .ok_or_else(|| anyhow!("dispatcher pool accounting broke"))?,
                _ => spawn_worker(cmd, &out_sink, &err_sink)?,
            };

            let stdin = worker
                .stdin
                .as_mut()
                .ok_or_else(|| anyhow!("open child has no stdin"))?;
            stdin
                .write_all(&carry)
                .and_then(|()| stdin.write_all(&data[..=split]))
                .with_context(|| format!("writing to `{}`", cmd.display()))?;
            worker.written += carry.len() + split + 1;
            carry.clear();
            carry.extend_from_slice(&data[split + 1..]);

            if worker.written >= opts.max_bytes {
                worker.close_stdin();
                debug!(
                    written = worker.written,
                    pool = filled.len() + open.len(),
                    "child filled"
                );
                filled.push(worker);
                while filled.len() == opts.max_procs {
                    let mut reaped = false;
                    let mut i = 0;
                    while i < filled.len() {
                        if filled[i].child.try_wait()?.is_some() {
                            filled.swap_remove(i).reap(&mut results)?;
                            reaped = true;
                        } else {
                            i += 1;
                        }
                    }
                    if !reaped {
                        thread::sleep(Duration::from_millis(500));
                    }
                }
            } else {
                open.push_back(worker);
            }
        }

        // EOF: hand any trailing partial line to the first still-open child,
        // then close everyone down.
        for mut worker in open.drain(..) {
            if !carry.is_empty() {
                if let Some(stdin) = worker.stdin.as_mut() {
                    stdin.write_all(&carry)?;
                }
                carry.clear();
            }
            worker.close_stdin();
            filled.push(worker);
        }
        if !carry.is_empty() {
            // Input with no newline at all and no child to take it: spawn
            // one rather than drop bytes.
            let mut worker = spawn_worker(cmd, &out_sink, &err_sink)?;
            if let Some(stdin) = worker.stdin.as_mut() {
                stdin.write_all(&carry)?;
            }
            worker.close_stdin();
            filled.push(worker);
        }
        Ok(())
    })();

    if let Err(e) = outcome {
        // Cancellation: close stdins and kill the whole pool before
        // propagating.
        for worker in open.iter_mut().chain(filled.iter_mut()) {
            worker.close_stdin();
            let _ = worker.child.kill();
            let _ = worker.child.wait();
        }
        return Err(e);
    }

    for worker in filled {
        worker.reap(&mut results)?;
    }

    let spawned = results.len();
    let errors = results.iter().filter(|code| **code != 0).count();
    if errors > 0 {
        bail!(
            "{errors} error(s) out of {spawned} `{}` process(es)",
            cmd.display()
        );
    }
    Ok(spawned)
}

fn spawn_worker(cmd: &ChildCommand, out: &SharedSink, err: &SharedSink) -> Result<Worker> {
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning `{}`", cmd.display()))?;
    let stdin = child.stdin.take();
    let mut readers = Vec::with_capacity(2);
    if let Some(pipe) = child.stdout.take() {
        readers.push(spawn_sink(pipe, Arc::clone(out)));
    }
    if let Some(pipe) = child.stderr.take() {
        readers.push(spawn_sink(pipe, Arc::clone(err)));
    }
    debug!(cmd = %cmd.display(), "dispatcher spawned child");
    Ok(Worker {
        child,
        stdin,
        written: 0,
        readers,
    })
}

/// Drain one child pipe into a shared sink, only ever releasing whole lines.
fn spawn_sink(
    mut pipe: impl Read + Send + 'static,
    sink: SharedSink,
) -> JoinHandle<std::io::Result<()>> {
    thread::spawn(move || {
        let mut held: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = pipe.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            let data = &chunk[..n];
            match last_newline(data) {
                Some(i) => {
                    let mut out = sink
                        .lock()
                        .map_err(|_| std::io::Error::other("dispatcher sink lock poisoned"))?;
                    out.write_all(&held)?;
                    out.write_all(&data[..=i])?;
                    held.clear();
                    held.extend_from_slice(&data[i + 1..]);
                }
                None => held.extend_from_slice(data),
            }
        }
        if !held.is_empty() {
            let mut out = sink
                .lock()
                .map_err(|_| std::io::Error::other("dispatcher sink lock poisoned"))?;
            out.write_all(&held)?;
        }
        Ok(())
    })
}

fn last_newline(data: &[u8]) -> Option<usize> {
    data.iter().rposition(|b| *b == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn cat() -> ChildCommand {
        ChildCommand::new("/bin/cat", Vec::new())
    }

    fn run_dispatch(opts: &DispatchOptions, input: &[u8]) -> (usize, Vec<u8>) {
        let collected = Arc::new(Mutex::new(Vec::<u8>::new()));

        struct Tee(Arc<Mutex<Vec<u8>>>);
        impl Write for Tee {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().expect("poisoned").extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut reader = BufReader::new(input);
        let spawned = distribute(opts, &cat(), &mut reader, Box::new(Tee(collected.clone())))
            .expect("dispatch failed");
        let out = collected.lock().unwrap().clone();
        (spawned, out)
    }

    /// 64-byte lines so chunks always end on a line boundary and child
    /// quotas land exactly.
    fn make_input(total: usize) -> Vec<u8> {
        let mut input = Vec::with_capacity(total);
        let mut i = 0usize;
        while input.len() < total {
            let line = format!("{i:08} {}\n", "x".repeat(54));
            assert_eq!(line.len(), 64);
            input.extend_from_slice(line.as_bytes());
            i += 1;
        }
        input
    }

    #[test]
    fn manifold_splits_one_mib_into_sixteen_children() {
        let input = make_input(1024 * 1024);
        let opts = DispatchOptions::new(Mode::Manifold)
            .max_procs(4)
            .max_bytes(64 * 1024);
        let (spawned, out) = run_dispatch(&opts, &input);
        assert_eq!(spawned, 16, "1 MiB / 64 KiB quotas");
        // cat children echo everything: same multiset of lines, all intact.
        let mut in_lines: Vec<&[u8]> = input.split(|b| *b == b'\n').collect();
        let mut out_lines: Vec<&[u8]> = out.split(|b| *b == b'\n').collect();
        in_lines.sort();
        out_lines.sort();
        assert_eq!(in_lines, out_lines);
    }

    #[test]
    fn gatling_fills_children_one_at_a_time() {
        let input = make_input(256 * 1024);
        let opts = DispatchOptions::new(Mode::Gatling)
            .max_procs(2)
            .max_bytes(64 * 1024);
        let (spawned, out) = run_dispatch(&opts, &input);
        assert_eq!(spawned, 4);
        assert_eq!(out.len(), input.len());
    }

    #[test]
    fn output_lines_are_never_spliced() {
        // Children echo distinct lines; any mixed line would show up as a
        // wrong length.
        let input = make_input(128 * 1024);
        let opts = DispatchOptions::new(Mode::Manifold)
            .max_procs(4)
            .max_bytes(32 * 1024);
        let (_, out) = run_dispatch(&opts, &input);
        for line in out.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            assert_eq!(line.len(), 63, "line was clipped or spliced");
        }
    }

    #[test]
    fn failing_children_surface_as_an_error() {
        let cmd = ChildCommand::new(
            "/bin/sh",
            vec!["-c".into(), "cat >/dev/null; exit 3".into()],
        );
        let opts = DispatchOptions::new(Mode::Manifold).max_procs(2).max_bytes(16);
        let mut reader = BufReader::new(&b"one\ntwo\nthree\n"[..]);
        let err = distribute(&opts, &cmd, &mut reader, Box::new(std::io::sink())).unwrap_err();
        assert!(err.to_string().contains("error(s)"), "{err}");
    }
}
