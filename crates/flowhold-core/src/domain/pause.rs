//! Pause and resume model
//!
//! A [`PauseCondition`] is the verdict of evaluating one step. When it
//! pauses, its [`ResumeConfig`] lists every path allowed to bring the run
//! back: manual action, matching events, a polled predicate and a timeout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::execution_context::ExecutionContext;
use crate::{DataPacket, EngineError, RunId, StepId};

/// Default polling period for auto-resume conditions
pub const DEFAULT_CONDITION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Why a run is suspended
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PauseReason {
    /// A human must look at the run
    ManualReview,
    /// Waiting for an event from outside the engine
    AwaitingExternalEvent,
    /// Waiting for a polled condition to hold
    AwaitingCondition,
    /// Throttled by a downstream limit
    RateLimited,
    /// Waiting for an approver
    AwaitingApproval,
    /// Application-defined reason
    Custom(String),
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::ManualReview => f.write_str("manual_review"),
            PauseReason::AwaitingExternalEvent => f.write_str("awaiting_external_event"),
            PauseReason::AwaitingCondition => f.write_str("awaiting_condition"),
            PauseReason::RateLimited => f.write_str("rate_limited"),
            PauseReason::AwaitingApproval => f.write_str("awaiting_approval"),
            PauseReason::Custom(tag) => f.write_str(tag),
        }
    }
}

/// Predicate deciding whether an event resumes a run
pub trait EventFilter: Send + Sync {
    /// Whether `payload` satisfies the trigger for the paused `context`
    fn accepts(&self, context: &ExecutionContext, payload: &DataPacket)
        -> Result<bool, EngineError>;
}

impl<F> EventFilter for F
where
    F: Fn(&ExecutionContext, &DataPacket) -> Result<bool, EngineError> + Send + Sync,
{
    fn accepts(
        &self,
        context: &ExecutionContext,
        payload: &DataPacket,
    ) -> Result<bool, EngineError> {
        self(context, payload)
    }
}

/// Asynchronous predicate checked on a schedule while a run is paused
#[async_trait]
pub trait ResumePredicate: Send + Sync {
    /// Whether the run may resume now
    async fn check(&self, context: &ExecutionContext) -> Result<bool, EngineError>;
}

/// Adapter turning an async closure into a [`ResumePredicate`]
pub struct ConditionFn<F>(F);

#[async_trait]
impl<F, Fut> ResumePredicate for ConditionFn<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, EngineError>> + Send,
{
    async fn check(&self, context: &ExecutionContext) -> Result<bool, EngineError> {
        (self.0)(context.clone()).await
    }
}

/// Wrap an async closure as a shareable resume predicate
pub fn condition_fn<F, Fut>(f: F) -> Arc<dyn ResumePredicate>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, EngineError>> + Send + 'static,
{
    Arc::new(ConditionFn(f))
}

/// Event type plus filter; fires only when both match
#[derive(Clone)]
pub struct EventTrigger {
    event_type: String,
    filter: Arc<dyn EventFilter>,
}

impl EventTrigger {
    /// Trigger on `event_type` when `filter` accepts the payload
    pub fn new<F>(event_type: impl Into<String>, filter: F) -> Self
    where
        F: Fn(&ExecutionContext, &DataPacket) -> Result<bool, EngineError> + Send + Sync + 'static,
    {
        Self {
            event_type: event_type.into(),
            filter: Arc::new(filter),
        }
    }

    /// Trigger with a filter object
    pub fn with_filter(event_type: impl Into<String>, filter: Arc<dyn EventFilter>) -> Self {
        Self {
            event_type: event_type.into(),
            filter,
        }
    }

    /// Trigger on any event of `event_type`
    pub fn any(event_type: impl Into<String>) -> Self {
        Self::new(event_type, |_, _| Ok(true))
    }

    /// Event type used for routing
    #[inline]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Whether this trigger fires for the given event
    pub fn matches(
        &self,
        event_type: &str,
        context: &ExecutionContext,
        payload: &DataPacket,
    ) -> Result<bool, EngineError> {
        if self.event_type != event_type {
            return Ok(false);
        }
        self.filter.accepts(context, payload)
    }
}

impl fmt::Debug for EventTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTrigger")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// Every permitted way to resume a paused run
#[derive(Clone)]
pub struct ResumeConfig {
    /// Whether an actor may resume the run by hand
    pub allow_manual_resume: bool,
    /// Roles permitted to resume manually; empty means any actor
    pub allowed_roles: HashSet<String>,
    /// Event triggers, checked in order
    pub event_triggers: Vec<EventTrigger>,
    /// Predicate polled while paused
    pub auto_resume_condition: Option<Arc<dyn ResumePredicate>>,
    /// Polling period for `auto_resume_condition`
    pub condition_check_interval: Duration,
    /// Failed checks before the condition path disarms; `None` is unbounded
    pub max_condition_retries: Option<u32>,
    /// Deadline measured from the pause
    pub timeout_duration: Option<Duration>,
    /// Resume (true) or expire (false) when the deadline passes
    pub resume_on_timeout: bool,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            allow_manual_resume: false,
            allowed_roles: HashSet::new(),
            event_triggers: Vec::new(),
            auto_resume_condition: None,
            condition_check_interval: DEFAULT_CONDITION_CHECK_INTERVAL,
            max_condition_retries: None,
            timeout_duration: None,
            resume_on_timeout: false,
        }
    }
}

impl ResumeConfig {
    /// Empty configuration; registering it as-is is a definition error
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow manual resume by any of `roles` (any actor when empty)
    pub fn allow_manual<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_manual_resume = true;
        self.allowed_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Add an event trigger
    pub fn on_event(mut self, trigger: EventTrigger) -> Self {
        self.event_triggers.push(trigger);
        self
    }

    /// Poll `predicate` every `interval`
    pub fn auto_resume_when(
        mut self,
        predicate: Arc<dyn ResumePredicate>,
        interval: Duration,
    ) -> Self {
        self.auto_resume_condition = Some(predicate);
        self.condition_check_interval = interval;
        self
    }

    /// Disarm the condition path after `retries` failed checks
    pub fn with_max_condition_retries(mut self, retries: u32) -> Self {
        self.max_condition_retries = Some(retries);
        self
    }

    /// Resume or expire the run `duration` after it paused
    pub fn with_timeout(mut self, duration: Duration, resume_on_timeout: bool) -> Self {
        self.timeout_duration = Some(duration);
        self.resume_on_timeout = resume_on_timeout;
        self
    }

    /// Whether at least one resume path is configured
    pub fn has_resume_path(&self) -> bool {
        self.allow_manual_resume
            || !self.event_triggers.is_empty()
            || self.auto_resume_condition.is_some()
            || self.timeout_duration.is_some()
    }

    /// Whether an actor holding `roles` may resume manually
    pub fn permits_manual<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        self.allow_manual_resume
            && (self.allowed_roles.is_empty()
                || roles.iter().any(|role| self.allowed_roles.contains(role.as_ref())))
    }
}

impl fmt::Debug for ResumeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeConfig")
            .field("allow_manual_resume", &self.allow_manual_resume)
            .field("allowed_roles", &self.allowed_roles)
            .field("event_triggers", &self.event_triggers)
            .field("auto_resume_condition", &self.auto_resume_condition.is_some())
            .field("condition_check_interval", &self.condition_check_interval)
            .field("max_condition_retries", &self.max_condition_retries)
            .field("timeout_duration", &self.timeout_duration)
            .field("resume_on_timeout", &self.resume_on_timeout)
            .finish()
    }
}

/// Outcome of evaluating whether a step should suspend
#[derive(Debug, Clone)]
pub struct PauseCondition {
    should_pause: bool,
    reason: Option<PauseReason>,
    message: String,
    data: DataPacket,
    resume_config: Option<ResumeConfig>,
}

impl PauseCondition {
    /// Suspend the run
    pub fn pause(
        reason: PauseReason,
        message: impl Into<String>,
        data: DataPacket,
        resume_config: ResumeConfig,
    ) -> Self {
        Self {
            should_pause: true,
            reason: Some(reason),
            message: message.into(),
            data,
            resume_config: Some(resume_config),
        }
    }

    /// Keep going
    pub fn proceed() -> Self {
        Self {
            should_pause: false,
            reason: None,
            message: String::new(),
            data: DataPacket::null(),
            resume_config: None,
        }
    }

    /// Whether the run must suspend
    #[inline]
    pub fn should_pause(&self) -> bool {
        self.should_pause
    }

    /// Pause reason
    #[inline]
    pub fn reason(&self) -> Option<&PauseReason> {
        self.reason.as_ref()
    }

    /// Free-text message
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Opaque payload
    #[inline]
    pub fn data(&self) -> &DataPacket {
        &self.data
    }

    /// Resume configuration (absent when proceeding)
    #[inline]
    pub fn resume_config(&self) -> Option<&ResumeConfig> {
        self.resume_config.as_ref()
    }
}

/// Live, schedulable instance of an auto-resume predicate
#[derive(Clone)]
pub struct ResumeCondition {
    /// Run being watched
    pub run_id: RunId,
    /// Predicate to poll
    pub predicate: Arc<dyn ResumePredicate>,
    /// Polling period
    pub check_interval: Duration,
    /// Earliest time of the next check
    pub next_check: DateTime<Utc>,
    /// Failed checks allowed before disarming; `None` is unbounded
    pub max_retries: Option<u32>,
    /// Failed checks so far
    pub current_retries: u32,
    /// Consecutive checks that errored instead of answering
    pub consecutive_errors: u32,
}

impl ResumeCondition {
    /// Arm a condition; the first check is one interval after `now`
    pub fn new(
        run_id: RunId,
        predicate: Arc<dyn ResumePredicate>,
        check_interval: Duration,
        max_retries: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            predicate,
            check_interval,
            next_check: add_duration(now, check_interval),
            max_retries,
            current_retries: 0,
            consecutive_errors: 0,
        }
    }

    /// Whether a check is due at `now`
    #[inline]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_check <= now
    }

    /// Record an unsatisfied check; returns true when retries are exhausted
    pub fn record_miss(&mut self, now: DateTime<Utc>) -> bool {
        self.current_retries += 1;
        self.next_check = add_duration(now, self.check_interval);
        self.is_exhausted()
    }

    /// Whether the retry budget is spent
    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_retries, Some(max) if self.current_retries >= max)
    }
}

impl fmt::Debug for ResumeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeCondition")
            .field("run_id", &self.run_id)
            .field("check_interval", &self.check_interval)
            .field("next_check", &self.next_check)
            .field("max_retries", &self.max_retries)
            .field("current_retries", &self.current_retries)
            .field("consecutive_errors", &self.consecutive_errors)
            .finish_non_exhaustive()
    }
}

/// The resume path that brought a run back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum ResumeTrigger {
    /// An authorized actor resumed the run
    Manual {
        /// Roles presented by the actor
        roles: Vec<String>,
        /// Data supplied with the resume
        payload: DataPacket,
    },
    /// A matching event arrived
    Event {
        /// Event type
        event_type: String,
        /// Event payload
        payload: DataPacket,
    },
    /// The polled condition held
    Condition,
    /// The deadline passed with `resume_on_timeout`
    Timeout,
}

impl ResumeTrigger {
    /// Short name of the path, for logs and events
    pub fn path_name(&self) -> &'static str {
        match self {
            ResumeTrigger::Manual { .. } => "manual",
            ResumeTrigger::Event { .. } => "event",
            ResumeTrigger::Condition => "condition",
            ResumeTrigger::Timeout => "timeout",
        }
    }
}

/// Persistable projection of a pause; predicates are not persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseRecord {
    /// Step the run is paused at
    pub step_id: StepId,
    /// Why
    pub reason: PauseReason,
    /// Free-text message
    pub message: String,
    /// Opaque payload
    pub data: DataPacket,
    /// When the pause was registered
    pub paused_at: DateTime<Utc>,
    /// Absolute timeout, if any
    pub deadline: Option<DateTime<Utc>>,
    /// Timeout disposition
    pub resume_on_timeout: bool,
    /// Manual path enabled
    pub allow_manual_resume: bool,
    /// Roles for the manual path
    pub allowed_roles: Vec<String>,
    /// Event types with armed triggers
    pub event_types: Vec<String>,
    /// Whether a polled condition was configured
    pub has_auto_resume_condition: bool,
}

impl PauseRecord {
    /// Project a pausing condition for persistence
    pub fn from_condition(
        step_id: StepId,
        condition: &PauseCondition,
        config: &ResumeConfig,
        paused_at: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        let mut allowed_roles: Vec<String> = config.allowed_roles.iter().cloned().collect();
        allowed_roles.sort();
        Self {
            step_id,
            reason: condition
                .reason()
                .cloned()
                .unwrap_or(PauseReason::ManualReview),
            message: condition.message().to_string(),
            data: condition.data().clone(),
            paused_at,
            deadline,
            resume_on_timeout: config.resume_on_timeout,
            allow_manual_resume: config.allow_manual_resume,
            allowed_roles,
            event_types: config
                .event_triggers
                .iter()
                .map(|t| t.event_type().to_string())
                .collect(),
            has_auto_resume_condition: config.auto_resume_condition.is_some(),
        }
    }
}

/// `now + duration`, saturating at the far future
pub(crate) fn add_duration(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
