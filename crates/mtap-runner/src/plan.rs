//! Test plans
//!
//! A plan is an ordered list of steps. Each step names a command template
//! such as `SET_TEMP {sn} {target}`; `{sn}` is bound per unit, other
//! placeholders come from the step's bindings. Plans arrive pre-parsed from
//! the plan-loading layer and are validated here before any attempt.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use mtap_core::{Command, CommandName};

use crate::{RunError, RunnerResult};

/// Upper bound on a step's retry budget
pub const MAX_RETRIES: u32 = 10;

/// Placeholder bound to the unit's serial number
pub const SN_PLACEHOLDER: &str = "sn";

/// One template argument
#[derive(Clone, Debug, PartialEq, Eq)]
enum TemplateArg {
    Literal(String),
    Placeholder(String),
}

/// Command line with `{name}` placeholders in argument position
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandTemplate {
    name: CommandName,
    args: Vec<TemplateArg>,
}

impl CommandTemplate {
    /// Parse a template. The command must be known and the argument count
    /// must match its arity.
    pub fn parse(template: &str) -> RunnerResult<Self> {
        let mut tokens = template.split_whitespace();
        let head = tokens
            .next()
            .ok_or_else(|| RunError::Plan("empty command template".into()))?;
        let name = CommandName::from_name(&head.to_ascii_uppercase())
            .ok_or_else(|| RunError::Plan(format!("unknown command in template: {}", head)))?;

        let args: Vec<TemplateArg> = tokens
            .map(|token| match token.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
                Some(key) => TemplateArg::Placeholder(key.to_string()),
                None => TemplateArg::Literal(token.to_string()),
            })
            .collect();

        if args.len() != name.arity() {
            return Err(RunError::Plan(format!("{} (template {:?})", name.usage(), template)));
        }
        if args
            .iter()
            .any(|a| matches!(a, TemplateArg::Placeholder(k) if k.is_empty()))
        {
            return Err(RunError::Plan(format!("empty placeholder in {:?}", template)));
        }

        Ok(CommandTemplate { name, args })
    }

    pub fn name(&self) -> CommandName {
        self.name
    }

    /// Placeholder names, in argument order
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(|a| match a {
            TemplateArg::Placeholder(key) => Some(key.as_str()),
            TemplateArg::Literal(_) => None,
        })
    }

    /// Substitute `sn` and `bindings` into a concrete command
    pub fn render(&self, sn: &str, bindings: &HashMap<String, String>) -> RunnerResult<Command> {
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            let value = match arg {
                TemplateArg::Literal(text) => text.as_str(),
                TemplateArg::Placeholder(key) if key == SN_PLACEHOLDER => sn,
                TemplateArg::Placeholder(key) => bindings
                    .get(key)
                    .map(String::as_str)
                    .ok_or_else(|| RunError::Plan(format!("unbound placeholder {{{}}}", key)))?,
            };
            args.push(value.to_string());
        }
        Ok(Command::new(self.name.as_str(), args))
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            match arg {
                TemplateArg::Literal(text) => write!(f, " {}", text)?,
                TemplateArg::Placeholder(key) => write!(f, " {{{}}}", key)?,
            }
        }
        Ok(())
    }
}

/// Measurement limit checked against a successful response's data
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
}

/// A failed limit check
#[derive(Clone, Debug, PartialEq)]
pub struct LimitViolation {
    pub field: String,
    pub value: Option<Value>,
    pub reason: String,
}

impl fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "limit failed on {} = {}: {}", self.field, v, self.reason),
            None => write!(f, "limit failed on {}: {}", self.field, self.reason),
        }
    }
}

impl Limits {
    /// Inclusive range
    pub fn range(field: impl Into<String>, min: f64, max: f64) -> Self {
        Limits {
            field: field.into(),
            min: Some(min),
            max: Some(max),
            equals: None,
        }
    }

    pub fn at_least(field: impl Into<String>, min: f64) -> Self {
        Limits {
            field: field.into(),
            min: Some(min),
            max: None,
            equals: None,
        }
    }

    pub fn at_most(field: impl Into<String>, max: f64) -> Self {
        Limits {
            field: field.into(),
            min: None,
            max: Some(max),
            equals: None,
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Limits {
            field: field.into(),
            min: None,
            max: None,
            equals: Some(value.into()),
        }
    }

    /// Either `equals` or a min/max bound, never both, never neither
    pub fn validate(&self) -> Result<(), String> {
        let bounded = self.min.is_some() || self.max.is_some();
        if self.equals.is_some() && bounded {
            return Err(format!("limits on {}: equals cannot be combined with min/max", self.field));
        }
        if self.equals.is_none() && !bounded {
            return Err(format!("limits on {}: specify min, max or equals", self.field));
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(format!("limits on {}: min {} exceeds max {}", self.field, min, max));
            }
        }
        Ok(())
    }

    /// Check the response data. A missing field fails.
    pub fn check(&self, data: &Map<String, Value>) -> Result<(), LimitViolation> {
        let value = data.get(&self.field);
        let violation = |reason: String| LimitViolation {
            field: self.field.clone(),
            value: value.cloned(),
            reason,
        };

        let Some(value) = value else {
            return Err(violation("field missing from response".into()));
        };

        if let Some(expected) = &self.equals {
            let matches = match (value.as_f64(), expected.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => value == expected,
            };
            return if matches {
                Ok(())
            } else {
                Err(violation(format!("expected {}", expected)))
            };
        }

        let Some(number) = value.as_f64() else {
            return Err(violation("not a number".into()));
        };
        if let Some(min) = self.min {
            if number < min {
                return Err(violation(format!("below min {}", min)));
            }
        }
        if let Some(max) = self.max {
            if number > max {
                return Err(violation(format!("above max {}", max)));
            }
        }
        Ok(())
    }
}

/// One plan step
#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    pub id: String,
    pub template: CommandTemplate,
    pub bindings: HashMap<String, String>,
    /// Per-step deadline; the client default when unset
    pub timeout: Option<Duration>,
    /// Retry budget; the engine default when unset
    pub max_retries: Option<u32>,
    /// Pause between attempts; the engine default when unset
    pub backoff: Option<Duration>,
    pub requirement_ids: Vec<String>,
    pub limits: Option<Limits>,
}

impl Step {
    pub fn new(id: impl Into<String>, template: &str) -> RunnerResult<Self> {
        Ok(Step {
            id: id.into(),
            template: CommandTemplate::parse(template)?,
            bindings: HashMap::new(),
            timeout: None,
            max_retries: None,
            backoff: None,
            requirement_ids: Vec::new(),
            limits: None,
        })
    }

    pub fn with_binding(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.bindings.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_requirements<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirement_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = Some(limits);
        self
    }

    fn validate(&self) -> RunnerResult<()> {
        let fail = |msg: String| Err(RunError::Plan(format!("step {:?}: {}", self.id, msg)));

        if self.id.trim().is_empty() {
            return Err(RunError::Plan("step with empty id".into()));
        }
        if let Some(key) = self
            .template
            .placeholders()
            .find(|k| *k != SN_PLACEHOLDER && !self.bindings.contains_key(*k))
        {
            return fail(format!("unbound placeholder {{{}}}", key));
        }
        if let Some((key, _)) = self.bindings.iter().find(|(_, v)| v.split_whitespace().count() != 1) {
            return fail(format!("binding {:?} must be a single token", key));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return fail("timeout must be positive".into());
        }
        if self.max_retries.is_some_and(|r| r > MAX_RETRIES) {
            return fail(format!("max_retries exceeds {}", MAX_RETRIES));
        }
        if let Some(limits) = &self.limits {
            limits.validate().or_else(fail)?;
        }
        Ok(())
    }
}

/// Ordered sequence of steps
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TestPlan {
    pub name: String,
    pub steps: Vec<Step>,
}

impl TestPlan {
    pub fn new(name: impl Into<String>) -> Self {
        TestPlan {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Validate the plan together with the units it will run against
    pub fn validate(&self, sns: &[String]) -> RunnerResult<()> {
        if self.steps.is_empty() {
            return Err(RunError::Plan("plan has no steps".into()));
        }

        let mut ids = HashSet::new();
        for step in &self.steps {
            step.validate()?;
            if !ids.insert(step.id.as_str()) {
                return Err(RunError::Plan(format!("duplicate step id {:?}", step.id)));
            }
        }

        if sns.is_empty() {
            return Err(RunError::Plan("no serial numbers given".into()));
        }
        let mut seen = HashSet::new();
        for sn in sns {
            if sn.is_empty() || sn.chars().any(char::is_whitespace) {
                return Err(RunError::Plan(format!("invalid serial number {:?}", sn)));
            }
            if !seen.insert(sn.as_str()) {
                return Err(RunError::Plan(format!("duplicate serial number {:?}", sn)));
            }
        }
        Ok(())
    }

    /// Render every step for `sn`, in plan order
    pub fn render(&self, sn: &str) -> RunnerResult<Vec<Command>> {
        self.steps
            .iter()
            .map(|step| step.template.render(sn, &step.bindings))
            .collect()
    }
}

/// `SN0001`, `SN0002`, ... for batches without explicit serial numbers
pub fn sequential_sns(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("SN{:04}", i)).collect()
}
