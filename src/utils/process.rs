use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};

/// Wrapper used to reach the host's mount/pid namespaces from a container.
const NSENTER: &str = "/usr/bin/nsenter";
const NSENTER_ARGS: &[&str] = &["-m", "-u", "-i", "-n", "-p", "-t", "1"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdSpec {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CmdSpec {
    #[must_use]
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.envs.push((k.into(), v.into()));
        self
    }

    #[cfg(test)]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[cfg(test)]
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.envs {
            out.push_str(&format!("{k}={} ", sh_quote(v)));
        }
        out.push_str(&sh_quote(&self.program));
        for a in &self.args {
            out.push(' ');
            out.push_str(&sh_quote(a));
        }
        out
    }

    /// Same command, executed in the host namespaces through nsenter.
    fn in_host_namespaces(&self) -> CmdSpec {
        CmdSpec {
            program: NSENTER.to_string(),
            args: NSENTER_ARGS
                .iter()
                .map(|s| s.to_string())
                .chain(std::iter::once(self.program.clone()))
                .chain(self.args.iter().cloned())
                .collect(),
            envs: self.envs.clone(),
        }
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd
    }
}

pub trait Runner: Send + Sync {
    /// Runs the command to completion and returns its stdout. A non-zero exit
    /// is an error carrying the captured stderr.
    fn run(&self, cmd: &CmdSpec) -> Result<String>;
}

#[derive(Default, Clone, Debug)]
pub struct ProcessRunner {
    containerized: bool,
}

impl ProcessRunner {
    pub fn new(containerized: bool) -> Self {
        Self { containerized }
    }

    fn effective(&self, cmd: &CmdSpec) -> CmdSpec {
        if self.containerized {
            cmd.in_host_namespaces()
        } else {
            cmd.clone()
        }
    }
}

impl Runner for ProcessRunner {
    fn run(&self, cmd: &CmdSpec) -> Result<String> {
        let spec = self.effective(cmd);
        tracing::debug!("exec: {}", spec.render());

        let out = spec
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawn {}", spec.render()))?;

        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            bail!(
                "command failed: {} ({}): {}",
                spec.render(),
                out.status,
                stderr.trim()
            );
        }
    }
}

fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".into();
    }
    if !s
        .bytes()
        .any(|b| b == b' ' || b == b'\'' || b == b'"' || b == b'\\')
    {
        return s.to_string();
    }
    let mut out = String::from("'");
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}
