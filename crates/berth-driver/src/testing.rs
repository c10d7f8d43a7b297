//! Test doubles shared by the crates that sit on top of drivers.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use berth_process::{CommandRunner, CommandSpec, ProcessError, ProcessOutput, RunFuture};

use crate::driver::{BackendStatus, Driver, DriverContext, DriverFuture, ProvisionOutcome};
use crate::error::DriverError;

#[derive(Debug, Default)]
struct LedgerState {
    /// Backend resource per instance id, with its allocation serial.
    live: HashMap<String, u64>,
    next_serial: u64,
    allocations: u64,
    releases: u64,
    violations: Vec<String>,
    fail_after_allocate: u32,
}

/// A driver that models backend resources as a ledger and records every
/// allocation made while an earlier one for the same instance was never
/// released.
///
/// With `reuse_existing` the driver behaves like a well-written driver and
/// adopts a leftover resource. Without it, every provision allocates, so
/// the caller must clean up between attempts.
pub struct LedgerDriver {
    reuse_existing: bool,
    state: Mutex<LedgerState>,
}

impl LedgerDriver {
    pub fn reusing() -> Self {
        Self {
            reuse_existing: true,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn non_reusing() -> Self {
        Self {
            reuse_existing: false,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// The next `n` provisions allocate and then fail with a transient
    /// error, leaving a half-created resource behind.
    pub fn fail_after_allocate(&self, n: u32) {
        self.with_state(|s| s.fail_after_allocate += n);
    }

    /// Allocations made on top of an unreleased resource.
    pub fn violations(&self) -> Vec<String> {
        self.with_state(|s| s.violations.clone())
    }

    pub fn live_resources(&self) -> usize {
        self.with_state(|s| s.live.len())
    }

    pub fn allocations(&self) -> u64 {
        self.with_state(|s| s.allocations)
    }

    pub fn releases(&self) -> u64 {
        self.with_state(|s| s.releases)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LedgerState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

impl Driver for LedgerDriver {
    fn name(&self) -> &'static str {
        "ledger"
    }

    fn provision<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, ProvisionOutcome> {
        Box::pin(async move {
            let id = ctx.instance.id.clone();
            self.with_state(|s| {
                let serial = match s.live.get(&id).copied() {
                    Some(serial) if self.reuse_existing => serial,
                    existing => {
                        if let Some(serial) = existing {
                            s.violations.push(format!(
                                "{id}: allocated again while resource #{serial} is still live"
                            ));
                        }
                        s.next_serial += 1;
                        s.allocations += 1;
                        s.live.insert(id.clone(), s.next_serial);
                        s.next_serial
                    }
                };
                if s.fail_after_allocate > 0 {
                    s.fail_after_allocate -= 1;
                    return Err(DriverError::Transient(format!(
                        "{id}: resource #{serial} half-created"
                    )));
                }
                Ok(ProvisionOutcome::default().with("resource", serial.to_string()))
            })
        })
    }

    fn deprovision<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.with_state(|s| {
                if s.live.remove(&ctx.instance.id).is_some() {
                    s.releases += 1;
                }
            });
            Ok(())
        })
    }

    fn query_status<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, BackendStatus> {
        Box::pin(async move {
            Ok(self.with_state(|s| {
                if s.live.contains_key(&ctx.instance.id) {
                    BackendStatus::Running
                } else {
                    BackendStatus::NotFound
                }
            }))
        })
    }
}

// ── Scripted command runner ──────────────────────────────────────

enum Reply {
    Exit(i32, String),
    Timeout,
}

struct Rule {
    pattern: String,
    replies: VecDeque<Reply>,
    /// Reply used once `replies` is exhausted.
    sticky: Option<(i32, String)>,
}

/// A [`CommandRunner`] that answers from a script instead of spawning.
///
/// Rules match when their pattern is a substring of the command line;
/// the first matching rule wins. Unmatched commands exit 0 with no output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    history: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer commands containing `pattern` with `code` and `output`.
    pub fn on(&self, pattern: &str, code: i32, output: &str) -> &Self {
        self.rule(pattern, |rule| rule.sticky = Some((code, output.to_string())));
        self
    }

    /// Answer the next matching command once, before any sticky reply.
    pub fn once(&self, pattern: &str, code: i32, output: &str) -> &Self {
        self.rule(pattern, |rule| {
            rule.replies.push_back(Reply::Exit(code, output.to_string()))
        });
        self
    }

    /// Make the next matching command time out.
    pub fn timeout_once(&self, pattern: &str) -> &Self {
        self.rule(pattern, |rule| rule.replies.push_back(Reply::Timeout));
        self
    }

    /// Command lines run so far.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.history().iter().filter(|c| c.contains(pattern)).count()
    }

    fn rule(&self, pattern: &str, f: impl FnOnce(&mut Rule)) {
        let mut rules = self
            .rules
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(rule) = rules.iter_mut().find(|r| r.pattern == pattern) {
            f(rule);
            return;
        }
        let mut rule = Rule {
            pattern: pattern.to_string(),
            replies: VecDeque::new(),
            sticky: None,
        };
        f(&mut rule);
        rules.push(rule);
    }

    fn reply(&self, line: &str) -> Reply {
        let mut rules = self
            .rules
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for rule in rules.iter_mut() {
            if !line.contains(&rule.pattern) {
                continue;
            }
            if let Some(reply) = rule.replies.pop_front() {
                return reply;
            }
            if let Some((code, output)) = &rule.sticky {
                return Reply::Exit(*code, output.clone());
            }
        }
        Reply::Exit(0, String::new())
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, cmd: &'a CommandSpec) -> RunFuture<'a> {
        Box::pin(async move {
            let line = cmd.display_line();
            if let Ok(mut history) = self.history.lock() {
                history.push(line.clone());
            }
            match self.reply(&line) {
                Reply::Exit(code, output) => Ok(ProcessOutput {
                    exit_code: Some(code),
                    output,
                    truncated: false,
                    elapsed: Duration::ZERO,
                }),
                Reply::Timeout => Err(ProcessError::Timeout {
                    program: cmd.program.clone(),
                    timeout: cmd.timeout,
                    output: String::new(),
                }),
            }
        })
    }
}
