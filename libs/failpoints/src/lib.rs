//! Fault injection for tests and operators.
//!
//! A [`FailpointRegistry`] maps fault point names to a configured behaviour.
//! Components that contain fault points hold an `Arc<FailpointRegistry>` and
//! call [`FailpointRegistry::check`] at the point where a failure should be
//! injectable. Nothing is global: two registries in one process are fully
//! independent.
//!
//! Configuration strings follow the grammar of the `fail` crate:
//!
//! ```text
//! actions := step ("->" step)*
//! step    := [count "*"] action
//! action  := "off" | "return" | "return(" message ")" | "sleep(" millis ")"
//! ```
//!
//! A step with a count is applied that many times, then the next step takes
//! over. A step without a count stays in effect until reconfigured, so
//! `return` fails every call and `3*return->off` fails exactly three times.
//! Once all steps of a fully counted chain are used up, the point is off.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use anyhow::Context;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Actions that can be taken when a failpoint is hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailpointAction {
    /// Do nothing - effectively disables the failpoint
    Off,
    /// Make the fault point fail, with an optional message
    Return(Option<String>),
    /// Sleep for a specified duration in milliseconds, then continue
    Sleep(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    count: Option<u32>,
    action: FailpointAction,
}

#[derive(Debug)]
struct Failpoint {
    actions: String,
    steps: Vec<Step>,
    current: usize,
    used_in_current: u32,
    hits: u64,
}

impl Failpoint {
    /// Picks the action for this hit and advances the step machine.
    fn next_action(&mut self) -> FailpointAction {
        self.hits += 1;
        loop {
            let Some(step) = self.steps.get(self.current) else {
                return FailpointAction::Off;
            };
            match step.count {
                None => return step.action.clone(),
                Some(count) if self.used_in_current < count => {
                    self.used_in_current += 1;
                    return step.action.clone();
                }
                Some(_) => {
                    if self.current + 1 >= self.steps.len() {
                        return FailpointAction::Off;
                    }
                    self.current += 1;
                    self.used_in_current = 0;
                }
            }
        }
    }
}

/// The error a fault point produces when configured to fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailpointError {
    #[error("failpoint '{name}' triggered{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Injected {
        name: String,
        message: Option<String>,
    },
    #[error("failpoint '{0}' wait cancelled")]
    Cancelled(String),
}

/// One entry of a `configure_failpoints` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailpointConfig {
    pub name: String,
    pub actions: String,
}

impl fmt::Display for FailpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.actions)
    }
}

#[derive(Debug, Default)]
pub struct FailpointRegistry {
    points: Mutex<HashMap<String, Failpoint>>,
}

impl FailpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a `name=actions;name=actions` string, as found in
    /// the `FAILPOINTS` environment variable.
    pub fn from_env_string(s: &str) -> anyhow::Result<Self> {
        let registry = Self::new();
        for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, actions) = entry
                .split_once('=')
                .with_context(|| format!("invalid failpoint entry '{entry}', expected name=actions"))?;
            registry.configure(name.trim(), actions.trim())?;
        }
        Ok(registry)
    }

    /// Sets (or replaces) the behaviour of a fault point. Reconfiguring resets its step counters.
    pub fn configure(&self, name: &str, actions: &str) -> anyhow::Result<()> {
        let steps = parse_actions(actions)
            .with_context(|| format!("failed to parse actions for failpoint '{name}'"))?;
        let mut points = self.points.lock();
        let hits = points.get(name).map(|fp| fp.hits).unwrap_or(0);
        points.insert(
            name.to_string(),
            Failpoint {
                actions: actions.to_string(),
                steps,
                current: 0,
                used_in_current: 0,
                hits,
            },
        );
        tracing::info!("Configured failpoint: {name} = {actions}");
        Ok(())
    }

    pub fn remove(&self, name: &str) {
        self.points.lock().remove(name);
    }

    /// Current configuration of every fault point that was configured.
    pub fn list(&self) -> Vec<FailpointConfig> {
        let points = self.points.lock();
        let mut configs = points
            .iter()
            .map(|(name, fp)| FailpointConfig {
                name: name.clone(),
                actions: fp.actions.clone(),
            })
            .collect::<Vec<_>>();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// How many times the fault point was evaluated since it was first configured.
    pub fn hits(&self, name: &str) -> u64 {
        self.points.lock().get(name).map(|fp| fp.hits).unwrap_or(0)
    }

    /// Evaluates the fault point `name`. Unconfigured points always pass.
    pub async fn check(&self, name: &str) -> Result<(), FailpointError> {
        self.check_with_cancellation(name, &CancellationToken::new())
            .await
    }

    pub async fn check_with_cancellation(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), FailpointError> {
        let action = match self.points.lock().get_mut(name) {
            Some(fp) => fp.next_action(),
            None => return Ok(()),
        };

        match action {
            FailpointAction::Off => Ok(()),
            FailpointAction::Return(message) => {
                tracing::info!("failpoint {name} triggered");
                Err(FailpointError::Injected {
                    name: name.to_string(),
                    message,
                })
            }
            FailpointAction::Sleep(millis) => {
                tracing::info!("failpoint {name} sleeping for {millis}ms");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(()),
                    _ = cancel.cancelled() => Err(FailpointError::Cancelled(name.to_string())),
                }
            }
        }
    }
}

static STEP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(\d+)\*)?(off|return|sleep)(?:\((.*)\))?$").expect("valid regex")
});

fn parse_actions(actions: &str) -> anyhow::Result<Vec<Step>> {
    let steps = actions
        .split("->")
        .map(|step| parse_step(step.trim()))
        .collect::<anyhow::Result<Vec<_>>>()?;
    anyhow::ensure!(!steps.is_empty(), "empty failpoint actions");
    Ok(steps)
}

fn parse_step(step: &str) -> anyhow::Result<Step> {
    let captures = STEP_RE
        .captures(step)
        .with_context(|| format!("Invalid failpoint action: {step}"))?;
    let count = captures
        .get(1)
        .map(|c| c.as_str().parse::<u32>())
        .transpose()
        .with_context(|| format!("invalid count in '{step}'"))?;
    let arg = captures.get(3).map(|a| a.as_str().to_string());
    let action = match (&captures[2], arg) {
        ("off", None) => FailpointAction::Off,
        ("return", arg) => FailpointAction::Return(arg.filter(|a| !a.is_empty())),
        ("sleep", Some(millis)) => FailpointAction::Sleep(
            millis
                .parse()
                .with_context(|| format!("invalid sleep duration in '{step}'"))?,
        ),
        _ => anyhow::bail!("Invalid failpoint action: {step}"),
    };
    Ok(Step { count, action })
}
