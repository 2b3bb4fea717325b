//! The in-process pipeline driver.
//!
//! A sync is a linear graph of stages — record sources, filters,
//! dispatchers, p4 operators, and the terminal `fail` sink — connected by
//! byte pipes and each running on its own thread. The driver joins every
//! stage, collects per-stage status, and on failure reports which stage
//! broke, keeping the `fail` sink's intentional rejection apart from real
//! stage crashes.

use std::io::{BufRead, BufReader, Write};
use std::thread;

use anyhow::{Result, anyhow};
use tracing::debug;

use crate::pipe;

type StageFn = Box<dyn FnOnce(Box<dyn BufRead + Send>, Box<dyn Write + Send>) -> Result<()> + Send>;

struct Stage {
    name: String,
    fail_sink: bool,
    run: StageFn,
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

enum Outcome {
    Ok,
    /// The stage died writing to a dead downstream — a symptom, not a cause.
    BrokenPipe,
    Failed(String),
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Stages run in insertion order, each reading the
    /// previous stage's output.
    pub fn stage<F>(&mut self, name: impl Into<String>, run: F) -> &mut Self
    where
        F: FnOnce(Box<dyn BufRead + Send>, Box<dyn Write + Send>) -> Result<()> + Send + 'static,
    {
        self.stages.push(Stage {
            name: name.into(),
            fail_sink: false,
            run: Box::new(run),
        });
        self
    }

    /// Append the terminal `fail` sink. Its failure means "files were
    /// rejected", which the driver reports differently from a stage crash.
    pub fn fail_sink<F>(&mut self, name: impl Into<String>, run: F) -> &mut Self
    where
        F: FnOnce(Box<dyn BufRead + Send>, Box<dyn Write + Send>) -> Result<()> + Send + 'static,
    {
        self.stages.push(Stage {
            name: name.into(),
            fail_sink: true,
            run: Box::new(run),
        });
        self
    }

    /// The stage names joined like the shell pipeline they stand in for.
    pub fn description(&self) -> String {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        names.join(" | ")
    }

    /// Run all stages to completion.
    ///
    /// On failure the per-stage status table goes to stderr (unless only the
    /// fail sink rejected files, which already printed its own report) and
    /// an error is returned.
    pub fn run(self) -> Result<()> {
        let names: Vec<String> = self.stages.iter().map(|s| s.name.clone()).collect();
        debug!(pipeline = %names.join(" | "), "running pipeline");

        let count = self.stages.len();
        let mut handles = Vec::with_capacity(count);
        let mut next_input: Option<Box<dyn BufRead + Send>> = None;

        for (i, stage) in self.stages.into_iter().enumerate() {
            let input: Box<dyn BufRead + Send> = next_input
                .take()
                .unwrap_or_else(|| Box::new(BufReader::new(std::io::empty())));
            let output: Box<dyn Write + Send> = if i + 1 == count {
                Box::new(std::io::stdout())
            } else {
                let (w, r) = pipe::pipe();
                next_input = Some(Box::new(BufReader::new(r)));
                Box::new(w)
            };

            let run = stage.run;
            let handle = thread::Builder::new()
                .name(stage.name.clone())
                .spawn(move || (run)(input, output))?;
            handles.push((stage.name, stage.fail_sink, handle));
        }

        let mut results = Vec::with_capacity(count);
        for (name, fail_sink, handle) in handles {
            let outcome = match handle.join() {
                Ok(Ok(())) => Outcome::Ok,
                Ok(Err(e)) if is_broken_pipe(&e) => Outcome::BrokenPipe,
                Ok(Err(e)) => Outcome::Failed(format!("{e:#}")),
                Err(_) => Outcome::Failed("stage panicked".to_owned()),
            };
            results.push((name, fail_sink, outcome));
        }

        let hard_failures: Vec<&(String, bool, Outcome)> = results
            .iter()
            .filter(|(_, fail_sink, o)| !fail_sink && matches!(o, Outcome::Failed(_)))
            .collect();
        let sink_failed = results
            .iter()
            .any(|(_, fail_sink, o)| *fail_sink && matches!(o, Outcome::Failed(_)));

        if !hard_failures.is_empty() {
            let cwd = std::env::current_dir().unwrap_or_default();
            eprintln!("*** ERROR: Pipeline failed in {}:", cwd.display());
            for (name, _, outcome) in &results {
                match outcome {
                    Outcome::Ok => eprintln!(" OK      {name}"),
                    Outcome::BrokenPipe => eprintln!(" (pipe)  {name}"),
                    Outcome::Failed(msg) => eprintln!(" FAILED  {name}: {msg}"),
                }
            }
            return Err(anyhow!("pipeline failed at `{}`", hard_failures[0].0));
        }
        if sink_failed {
            // The fail stage already reported the rejected files.
            return Err(anyhow!("pipeline ended with rejected files"));
        }
        Ok(())
    }
}

fn is_broken_pipe(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::BrokenPipe)
    })
}
