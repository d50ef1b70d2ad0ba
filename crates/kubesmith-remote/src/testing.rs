//! Scripted executor for tests.
//!
//! [`ScriptedRunner`] answers commands from substring rules and records every
//! call, so orchestration code can be exercised without any node.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{RemoteError, RemoteResult};
use crate::exec::{Executor, Login, Target};
use crate::ssh::SSH_PORT;
use crate::transport::ExecOutput;

enum Reply {
    Fixed(ExecOutput),
    Sequence(VecDeque<ExecOutput>),
}

struct Rule {
    target: Option<Target>,
    pattern: String,
    reply: Reply,
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Where the command ran.
    pub target: Target,
    /// The command line.
    pub command: String,
    /// Data streamed on stdin, if any.
    pub stdin: Option<Vec<u8>>,
}

/// [`Executor`] answering from rules.
///
/// Rules match when the command contains the pattern. Later rules take
/// precedence. Unmatched commands succeed with empty output.
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
    connected: Mutex<Vec<IpAddr>>,
    unreachable: Mutex<HashSet<IpAddr>>,
    login: Login,
}

impl std::fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRunner {
    /// Runner logging in as `ops` with password `secret`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_login(Login::with_password("ops", "secret"))
    }

    /// Runner reporting the given login on connect.
    #[must_use]
    pub fn with_login(login: Login) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            connected: Mutex::new(Vec::new()),
            unreachable: Mutex::new(HashSet::new()),
            login,
        }
    }

    fn push(&self, target: Option<Target>, pattern: &str, reply: Reply) -> &Self {
        self.rules.lock().push(Rule {
            target,
            pattern: pattern.to_owned(),
            reply,
        });
        self
    }

    /// Answer commands containing `pattern` with `stdout` on every target.
    pub fn on(&self, pattern: &str, stdout: &str) -> &Self {
        self.push(None, pattern, Reply::Fixed(ExecOutput::ok(stdout)))
    }

    /// Answer commands containing `pattern` on `target` only.
    pub fn on_target(&self, target: Target, pattern: &str, stdout: &str) -> &Self {
        self.push(Some(target), pattern, Reply::Fixed(ExecOutput::ok(stdout)))
    }

    /// Fail commands containing `pattern`.
    pub fn fail(&self, pattern: &str, status: u32, stderr: &str) -> &Self {
        self.push(None, pattern, Reply::Fixed(ExecOutput::failed(status, stderr)))
    }

    /// Fail commands containing `pattern` on `target` only.
    pub fn fail_on(&self, target: Target, pattern: &str, status: u32, stderr: &str) -> &Self {
        self.push(
            Some(target),
            pattern,
            Reply::Fixed(ExecOutput::failed(status, stderr)),
        )
    }

    /// Answer successive matches with successive outputs; the last one repeats.
    pub fn sequence(&self, pattern: &str, outputs: &[&str]) -> &Self {
        self.push(
            None,
            pattern,
            Reply::Sequence(outputs.iter().map(|o| ExecOutput::ok(*o)).collect()),
        )
    }

    /// Make `address` fail the reachability probe.
    pub fn unreachable(&self, address: IpAddr) -> &Self {
        self.unreachable.lock().insert(address);
        self
    }

    /// Every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Commands run on `target`, in order.
    #[must_use]
    pub fn commands_on(&self, target: Target) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.target == target)
            .map(|c| c.command.clone())
            .collect()
    }

    /// Number of commands containing `pattern`.
    #[must_use]
    pub fn count(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.command.contains(pattern))
            .count()
    }

    /// Returns true if any command contained `pattern`.
    #[must_use]
    pub fn ran(&self, pattern: &str) -> bool {
        self.count(pattern) > 0
    }

    /// Index of the first command containing `pattern`.
    #[must_use]
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.calls
            .lock()
            .iter()
            .position(|c| c.command.contains(pattern))
    }

    /// Stdin streamed to the last command containing `pattern`.
    #[must_use]
    pub fn stdin_of(&self, pattern: &str) -> Option<String> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|c| c.command.contains(pattern))
            .and_then(|c| c.stdin.as_deref())
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Addresses connected to, in order.
    #[must_use]
    pub fn connected(&self) -> Vec<IpAddr> {
        self.connected.lock().clone()
    }

    fn answer(&self, target: &Target, command: &str) -> ExecOutput {
        let mut rules = self.rules.lock();
        let rule = rules.iter_mut().rev().find(|r| {
            command.contains(&r.pattern) && r.target.map_or(true, |t| t == *target)
        });
        match rule {
            None => ExecOutput::ok(""),
            Some(Rule {
                reply: Reply::Fixed(out),
                ..
            }) => out.clone(),
            Some(Rule {
                reply: Reply::Sequence(queue),
                ..
            }) => {
                if queue.len() > 1 {
                    queue.pop_front().unwrap_or_default()
                } else {
                    queue.front().cloned().unwrap_or_default()
                }
            }
        }
    }
}

#[async_trait]
impl Executor for ScriptedRunner {
    async fn connect(&self, address: IpAddr) -> RemoteResult<Login> {
        if self.unreachable.lock().contains(&address) {
            return Err(RemoteError::Unreachable {
                address,
                port: SSH_PORT,
            });
        }
        let mut connected = self.connected.lock();
        if !connected.contains(&address) {
            connected.push(address);
        }
        Ok(self.login.clone())
    }

    async fn execute(
        &self,
        target: &Target,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> RemoteResult<ExecOutput> {
        if let Target::Node(address) = target {
            if self.unreachable.lock().contains(address) {
                return Err(RemoteError::Unreachable {
                    address: *address,
                    port: SSH_PORT,
                });
            }
        }
        self.calls.lock().push(Call {
            target: *target,
            command: command.to_owned(),
            stdin: stdin.map(<[u8]>::to_vec),
        });
        Ok(self.answer(target, command))
    }

    async fn close(&self) {
        self.connected.lock().clear();
    }
}
