use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, warn};

use loglens_core::config::{EngineConfig as EngineSettings, GuardMode};
use loglens_core::error::{LoglensError, Result};
use loglens_core::traits::Reasoner;

use super::node::Capability;
use super::state::{keys, Artifacts, Delta, Outcome, SharedState};

/// Option the supervisor returns to end the run.
pub const FINISH: &str = "FINISH";

/// A worker as the supervisor sees it for one job.
#[derive(Debug, Clone, Serialize)]
pub struct RosterEntry {
    pub name: String,
    pub capability: Capability,
    /// Whether the worker accepts this job's request.
    pub eligible: bool,
}

/// Workers in registration order.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn new(entries: Vec<RosterEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&RosterEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn capability_of(&self, name: &str) -> Option<Capability> {
        self.get(name).map(|e| e.capability)
    }

    /// First eligible worker of a class.
    pub fn first_eligible(&self, capability: Capability) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.capability == capability && e.eligible)
            .map(|e| e.name.as_str())
    }

    pub fn serves(&self, capability: Capability) -> bool {
        self.entries.iter().any(|e| e.capability == capability)
    }
}

/// What a capability class has contributed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCoverage {
    pub invocations: usize,
    pub complete: usize,
    pub last: Option<Outcome>,
}

impl ClassCoverage {
    pub fn is_complete(&self) -> bool {
        self.last == Some(Outcome::Complete)
    }
}

/// Per-class contributions, derived from the message history.
#[derive(Debug, Clone, Default)]
pub struct Coverage {
    classes: BTreeMap<Capability, ClassCoverage>,
}

impl Coverage {
    /// Count one contribution per merged delta authored by a roster worker.
    pub fn from_state(state: &SharedState, roster: &Roster) -> Self {
        let mut classes: BTreeMap<Capability, ClassCoverage> = BTreeMap::new();
        let mut last_turn = None;
        for message in state.messages() {
            if last_turn == Some(message.turn) {
                continue;
            }
            last_turn = Some(message.turn);
            let Some(capability) = roster.capability_of(&message.author) else {
                continue;
            };
            let entry = classes.entry(capability).or_default();
            entry.invocations += 1;
            if message.outcome == Outcome::Complete {
                entry.complete += 1;
            }
            entry.last = Some(message.outcome);
        }
        Self { classes }
    }

    pub fn get(&self, capability: Capability) -> ClassCoverage {
        self.classes.get(&capability).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Capability, &ClassCoverage)> {
        self.classes.iter()
    }
}

/// A routing rule a proposed decision broke.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleViolation {
    #[error("{0} has not run yet")]
    MissingRequired(Capability),
    #[error("required artifact '{0}' is missing")]
    MissingArtifact(String),
    #[error("{0} already completed and may not be re-invoked")]
    AlreadyComplete(Capability),
    #[error("{0} may run only once per job")]
    OnceOnly(Capability),
    #[error("{0} does not accept this job")]
    Ineligible(String),
}

/// The business rules every decision must respect.
#[derive(Debug, Clone)]
pub struct SupervisorRules {
    /// Classes that must run before FINISH.
    pub required: Vec<Capability>,
    /// Classes invoked at most once per job.
    pub once_only: Vec<Capability>,
    /// Artifacts that must be filled before FINISH.
    pub required_artifacts: Vec<String>,
}

impl Default for SupervisorRules {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

impl SupervisorRules {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        let mut required = settings.required.clone();
        required.sort();
        required.dedup();
        Self {
            required_artifacts: artifacts_produced_by(&required),
            required,
            once_only: vec![Capability::Visualization],
        }
    }

    /// Replace the required classes. The artifact checklist follows them.
    pub fn with_required(mut self, mut required: Vec<Capability>) -> Self {
        required.sort();
        required.dedup();
        self.required_artifacts = artifacts_produced_by(&required);
        self.required = required;
        self
    }

    pub fn with_once_only(mut self, once_only: Vec<Capability>) -> Self {
        self.once_only = once_only;
        self
    }

    pub fn with_required_artifacts(mut self, keys: Vec<String>) -> Self {
        self.required_artifacts = keys;
        self
    }

    /// Check a decision against the rules. Options that name no roster
    /// worker (other than FINISH) are not this function's concern.
    pub fn check(
        &self,
        decision: &str,
        coverage: &Coverage,
        roster: &Roster,
        artifacts: &Artifacts,
    ) -> Option<RuleViolation> {
        if decision == FINISH {
            if let Some(cap) = self
                .required
                .iter()
                .find(|cap| coverage.get(**cap).invocations == 0)
            {
                return Some(RuleViolation::MissingRequired(*cap));
            }
            return self
                .required_artifacts
                .iter()
                .find(|key| !artifacts.is_filled(key))
                .map(|key| RuleViolation::MissingArtifact(key.clone()));
        }

        let entry = roster.get(decision)?;
        if !entry.eligible {
            return Some(RuleViolation::Ineligible(entry.name.clone()));
        }
        let capability = entry.capability;
        let cov = coverage.get(capability);
        if cov.invocations > 0 && self.once_only.contains(&capability) {
            return Some(RuleViolation::OnceOnly(capability));
        }
        if cov.is_complete() {
            return Some(RuleViolation::AlreadyComplete(capability));
        }
        None
    }

    /// The next decision that satisfies every rule: the first required class
    /// still owed a complete contribution, else FINISH once the required
    /// artifacts are in. `None` when no option can satisfy the rules.
    pub fn next_unmet(
        &self,
        coverage: &Coverage,
        roster: &Roster,
        artifacts: &Artifacts,
    ) -> Option<String> {
        for capability in &self.required {
            let cov = coverage.get(*capability);
            if cov.is_complete() {
                continue;
            }
            if cov.invocations > 0 && self.once_only.contains(capability) {
                continue;
            }
            if let Some(name) = roster.first_eligible(*capability) {
                return Some(name.to_string());
            }
        }

        match self.check(FINISH, coverage, roster, artifacts) {
            None => Some(FINISH.to_string()),
            Some(_) => None,
        }
    }
}

/// Artifacts a job must carry before FINISH, given the classes that run.
/// An artifact no required class produces is never demanded.
fn artifacts_produced_by(required: &[Capability]) -> Vec<String> {
    let mut artifacts = vec![];
    if required.contains(&Capability::Analysis) {
        artifacts.push(keys::SUMMARY.to_string());
    }
    if required.contains(&Capability::Visualization) {
        artifacts.push(keys::IMAGES.to_string());
    }
    artifacts
}

/// Everything a policy may look at when proposing a decision.
pub struct DecisionContext<'a> {
    pub state: &'a SharedState,
    pub roster: &'a Roster,
    pub options: &'a [String],
    pub rules: &'a SupervisorRules,
    pub coverage: &'a Coverage,
}

/// The swappable reasoning behind the supervisor.
pub trait DecisionPolicy: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Propose one of `ctx.options`. Anything else ends the run with an invalid route.
    fn propose<'a>(&'a self, ctx: &'a DecisionContext<'a>) -> BoxFuture<'a, Result<String>>;
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("decision policy failed: {0}")]
    Policy(#[from] LoglensError),

    #[error("decision '{decision}' rejected: {violation}")]
    Rejected {
        decision: String,
        violation: RuleViolation,
    },

    #[error("no admissible route after rejecting '{decision}': {violation}")]
    NoAdmissibleRoute {
        decision: String,
        violation: RuleViolation,
    },
}

/// The supervisor's settled decision for one step.
#[derive(Debug, Clone)]
pub struct Ruling {
    /// What the policy proposed.
    pub proposed: String,
    /// What the engine should route on.
    pub decision: String,
    /// Supervisor-authored note recording a correction.
    pub correction: Option<Delta>,
}

impl Ruling {
    fn accepted(decision: String) -> Self {
        Self {
            proposed: decision.clone(),
            decision,
            correction: None,
        }
    }

    pub fn is_corrected(&self) -> bool {
        self.correction.is_some()
    }
}

/// Decision point of the graph.
pub struct Supervisor {
    name: String,
    policy: Arc<dyn DecisionPolicy>,
    rules: SupervisorRules,
    guard: GuardMode,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, policy: Arc<dyn DecisionPolicy>) -> Self {
        Self {
            name: name.into(),
            policy,
            rules: SupervisorRules::default(),
            guard: GuardMode::default(),
        }
    }

    pub fn with_rules(mut self, rules: SupervisorRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_guard(mut self, guard: GuardMode) -> Self {
        self.guard = guard;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &SupervisorRules {
        &self.rules
    }

    pub fn guard(&self) -> GuardMode {
        self.guard
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    /// Ask the policy for the next option and hold it to the rules.
    ///
    /// A value outside `options` is returned untouched; routing it is the
    /// engine's problem. A rule violation is either corrected to the next
    /// unmet requirement or rejected, depending on the guard mode.
    pub async fn decide(
        &self,
        state: &SharedState,
        roster: &Roster,
        options: &[String],
    ) -> std::result::Result<Ruling, SupervisorError> {
        let coverage = Coverage::from_state(state, roster);
        let ctx = DecisionContext {
            state,
            roster,
            options,
            rules: &self.rules,
            coverage: &coverage,
        };
        let proposed = self.policy.propose(&ctx).await?.trim().to_string();
        debug!(supervisor = %self.name, policy = self.policy.name(), %proposed, "Policy proposed");

        if !options.iter().any(|o| *o == proposed) {
            return Ok(Ruling::accepted(proposed));
        }

        let Some(violation) = self
            .rules
            .check(&proposed, &coverage, roster, state.artifacts())
        else {
            return Ok(Ruling::accepted(proposed));
        };

        match self.guard {
            GuardMode::Strict => Err(SupervisorError::Rejected {
                decision: proposed,
                violation,
            }),
            GuardMode::Correct => {
                let replacement = self
                    .rules
                    .next_unmet(&coverage, roster, state.artifacts())
                    .filter(|next| options.iter().any(|o| o == next));
                match replacement {
                    Some(next) => {
                        warn!(
                            supervisor = %self.name,
                            %proposed,
                            corrected = %next,
                            %violation,
                            "Decision violated a routing rule, corrected"
                        );
                        let note = Delta::incomplete(
                            self.name.clone(),
                            format!("Rerouted from {} to {}: {}", proposed, next, violation),
                        );
                        Ok(Ruling {
                            proposed,
                            decision: next,
                            correction: Some(note),
                        })
                    }
                    None => Err(SupervisorError::NoAdmissibleRoute {
                        decision: proposed,
                        violation,
                    }),
                }
            }
        }
    }
}

/// Deterministic checklist policy.
///
/// Walks the required classes in capability order, re-invoking a class whose
/// last output was not complete, and proposes FINISH once everything is in.
#[derive(Debug, Default, Clone, Copy)]
pub struct RulePolicy;

impl DecisionPolicy for RulePolicy {
    fn name(&self) -> &str {
        "rules"
    }

    fn propose<'a>(&'a self, ctx: &'a DecisionContext<'a>) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            Ok(ctx
                .rules
                .next_unmet(ctx.coverage, ctx.roster, ctx.state.artifacts())
                .unwrap_or_else(|| FINISH.to_string()))
        })
    }
}

/// Policy backed by the reasoning collaborator.
pub struct LlmPolicy {
    reasoner: Arc<dyn Reasoner>,
}

impl LlmPolicy {
    pub fn new(reasoner: Arc<dyn Reasoner>) -> Self {
        Self { reasoner }
    }

    fn build_prompt(ctx: &DecisionContext<'_>) -> String {
        let members: Vec<&str> = ctx
            .options
            .iter()
            .map(String::as_str)
            .filter(|o| *o != FINISH)
            .collect();
        let required: Vec<&str> = ctx.rules.required.iter().map(|c| c.as_str()).collect();
        let once: Vec<&str> = ctx.rules.once_only.iter().map(|c| c.as_str()).collect();

        format!(
            "You supervise a forensic log-analysis team made of: {members}.\n\
             Pick who acts next, or FINISH when the job is done.\n\
             Rules:\n\
             - Every one of these capabilities must run before FINISH: {required}.\n\
             - Do not call a worker again unless its last output was incomplete or failed.\n\
             - These capabilities run at most once: {once}.\n\
             - FINISH only when these artifacts exist: {artifacts}.\n\
             Select one of: {options}.\n\
             Respond with JSON only: {{\"next\": \"<option>\"}}",
            members = members.join(", "),
            required = required.join(", "),
            once = once.join(", "),
            artifacts = ctx.rules.required_artifacts.join(", "),
            options = ctx.options.join(", "),
        )
    }

    fn build_context(ctx: &DecisionContext<'_>) -> String {
        let mut out = String::from("Conversation:\n");
        for m in ctx.state.messages() {
            out.push_str(&format!("[{}] ({}) {}\n", m.author, m.outcome.as_str(), m.content));
        }

        out.push_str("\nProgress:\n");
        for entry in ctx.roster.entries() {
            let cov = ctx.coverage.get(entry.capability);
            let last = cov.last.map(|o| o.as_str()).unwrap_or("not run");
            out.push_str(&format!(
                "- {} ({}): {} run(s), last {}{}\n",
                entry.name,
                entry.capability,
                cov.invocations,
                last,
                if entry.eligible { "" } else { ", not applicable to this job" },
            ));
        }

        let present: Vec<&str> = ctx.state.artifacts().keys().collect();
        out.push_str(&format!("\nArtifacts present: {}\n", present.join(", ")));
        out
    }
}

impl DecisionPolicy for LlmPolicy {
    fn name(&self) -> &str {
        "llm"
    }

    fn propose<'a>(&'a self, ctx: &'a DecisionContext<'a>) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let prompt = Self::build_prompt(ctx);
            let context = Self::build_context(ctx);
            let response = self.reasoner.reason(&prompt, &context).await?;
            parse_decision(&response)
        })
    }
}

/// Extract the chosen option from a reasoner response: `{"next": ...}` JSON,
/// optionally fenced, or a bare single token.
pub fn parse_decision(text: &str) -> Result<String> {
    let trimmed = strip_code_fence(text.trim());

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(next) = value.get("next").and_then(|v| v.as_str()) {
            return Ok(next.trim().to_string());
        }
        if let Some(s) = value.as_str() {
            return Ok(s.trim().to_string());
        }
        return Err(LoglensError::LlmParse(
            "decision JSON has no 'next' field".to_string(),
        ));
    }

    let bare = trimmed
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim();
    if bare.is_empty() || bare.split_whitespace().count() != 1 {
        let preview: String = trimmed.chars().take(80).collect();
        return Err(LoglensError::LlmParse(format!(
            "unparseable decision: {}",
            preview
        )));
    }
    Ok(bare.to_string())
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::state::JobRequest;
    use loglens_core::types::{JobId, JobPayload, LogType};
    use serde_json::json;

    struct Fixed(&'static str);

    impl DecisionPolicy for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn propose<'a>(&'a self, _ctx: &'a DecisionContext<'a>) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move { Ok(self.0.to_string()) })
        }
    }

    struct Broken;

    impl DecisionPolicy for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn propose<'a>(&'a self, _ctx: &'a DecisionContext<'a>) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move { Err(LoglensError::LlmRequest("connection reset".into())) })
        }
    }

    fn roster() -> Roster {
        let entry = |name: &str, capability, eligible| RosterEntry {
            name: name.into(),
            capability,
            eligible,
        };
        Roster::new(vec![
            entry("prefetch", Capability::Collection, true),
            entry("event_log", Capability::Collection, false),
            entry("save", Capability::Persistence, true),
            entry("search", Capability::Search, true),
            entry("analysis", Capability::Analysis, true),
            entry("viz", Capability::Visualization, true),
        ])
    }

    fn options() -> Vec<String> {
        ["prefetch", "event_log", "save", "search", "analysis", "viz", FINISH]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn fresh() -> SharedState {
        let payload = JobPayload::inline(LogType::Prefetch, vec![json!({"exe": "A.EXE"})]);
        SharedState::new(JobRequest::from_payload(JobId::from_string("j"), payload))
    }

    fn collected_and_saved() -> SharedState {
        let mut s = fresh();
        s.merge(Delta::complete("prefetch", "collected"));
        s.merge(Delta::complete("save", "saved"));
        s
    }

    #[test]
    fn test_coverage_counts_deltas_not_messages() {
        let mut s = fresh();
        s.merge(Delta::complete("prefetch", "a").with_message("b").with_message("c"));
        s.merge(Delta::incomplete("analysis", "short"));
        s.merge(Delta::complete("analysis", "good"));
        s.merge(Delta::incomplete("supervisor", "note"));

        let cov = Coverage::from_state(&s, &roster());
        assert_eq!(cov.get(Capability::Collection).invocations, 1);
        let analysis = cov.get(Capability::Analysis);
        assert_eq!(analysis.invocations, 2);
        assert_eq!(analysis.complete, 1);
        assert!(analysis.is_complete());
        assert_eq!(cov.get(Capability::Visualization), ClassCoverage::default());
    }

    #[test]
    fn test_finish_requires_every_class_and_artifacts() {
        let rules = SupervisorRules::default();
        let s = collected_and_saved();
        let cov = Coverage::from_state(&s, &roster());
        assert_eq!(
            rules.check(FINISH, &cov, &roster(), s.artifacts()),
            Some(RuleViolation::MissingRequired(Capability::Analysis))
        );

        let mut s = collected_and_saved();
        s.merge(Delta::complete("analysis", "done").with_artifact(keys::SUMMARY, json!("text")));
        s.merge(Delta::complete("viz", "no charts"));
        let cov = Coverage::from_state(&s, &roster());
        assert_eq!(
            rules.check(FINISH, &cov, &roster(), s.artifacts()),
            Some(RuleViolation::MissingArtifact(keys::IMAGES.into()))
        );
    }

    #[test]
    fn test_reinvocation_rules() {
        let rules = SupervisorRules::default();
        let mut s = collected_and_saved();
        s.merge(Delta::incomplete("analysis", "too short"));
        let cov = Coverage::from_state(&s, &roster());

        assert_eq!(rules.check("analysis", &cov, &roster(), s.artifacts()), None);
        assert_eq!(
            rules.check("prefetch", &cov, &roster(), s.artifacts()),
            Some(RuleViolation::AlreadyComplete(Capability::Collection))
        );

        s.merge(Delta::incomplete("viz", "bad chart data"));
        let cov = Coverage::from_state(&s, &roster());
        assert_eq!(
            rules.check("viz", &cov, &roster(), s.artifacts()),
            Some(RuleViolation::OnceOnly(Capability::Visualization))
        );
    }

    #[test]
    fn test_ineligible_worker_violates() {
        let rules = SupervisorRules::default();
        let s = fresh();
        let cov = Coverage::from_state(&s, &roster());
        assert_eq!(
            rules.check("event_log", &cov, &roster(), s.artifacts()),
            Some(RuleViolation::Ineligible("event_log".into()))
        );
        assert_eq!(rules.check("prefetch", &cov, &roster(), s.artifacts()), None);
    }

    #[test]
    fn test_artifact_checklist_follows_required_classes() {
        assert_eq!(
            SupervisorRules::default().required_artifacts,
            vec![keys::SUMMARY.to_string(), keys::IMAGES.to_string()]
        );

        let rules = SupervisorRules::default().with_required(vec![
            Capability::Collection,
            Capability::Persistence,
            Capability::Analysis,
        ]);
        assert_eq!(rules.required_artifacts, vec![keys::SUMMARY.to_string()]);

        let mut s = collected_and_saved();
        s.merge(Delta::complete("analysis", "ok").with_artifact(keys::SUMMARY, json!("ok")));
        let cov = Coverage::from_state(&s, &roster());
        assert_eq!(rules.check(FINISH, &cov, &roster(), s.artifacts()), None);
        assert_eq!(rules.next_unmet(&cov, &roster(), s.artifacts()).as_deref(), Some(FINISH));

        let collect_only = SupervisorRules::default().with_required(vec![Capability::Collection]);
        assert!(collect_only.required_artifacts.is_empty());
    }

    #[test]
    fn test_next_unmet_walks_checklist() {
        let rules = SupervisorRules::default();
        let r = roster();

        let s = fresh();
        let cov = Coverage::from_state(&s, &r);
        assert_eq!(rules.next_unmet(&cov, &r, s.artifacts()).as_deref(), Some("prefetch"));

        let mut s = collected_and_saved();
        s.merge(Delta::incomplete("analysis", "short"));
        let cov = Coverage::from_state(&s, &r);
        assert_eq!(rules.next_unmet(&cov, &r, s.artifacts()).as_deref(), Some("analysis"));

        s.merge(
            Delta::complete("analysis", "ok")
                .with_analysis("ok")
                .with_artifact(keys::SUMMARY, json!("ok")),
        );
        s.merge(Delta::complete("viz", "charted").with_artifact(keys::IMAGES, json!(["a.svg"])));
        let cov = Coverage::from_state(&s, &r);
        assert_eq!(rules.next_unmet(&cov, &r, s.artifacts()).as_deref(), Some(FINISH));
    }

    #[test]
    fn test_next_unmet_none_when_once_only_spent() {
        let rules = SupervisorRules::default();
        let r = roster();
        let mut s = collected_and_saved();
        s.merge(Delta::complete("analysis", "ok").with_artifact(keys::SUMMARY, json!("ok")));
        s.merge(Delta::failed("viz", "renderer crashed"));
        let cov = Coverage::from_state(&s, &r);
        assert_eq!(rules.next_unmet(&cov, &r, s.artifacts()), None);
    }

    #[test]
    fn test_search_required_runs_before_analysis() {
        let rules = SupervisorRules::default().with_required(vec![
            Capability::Analysis,
            Capability::Search,
            Capability::Collection,
            Capability::Persistence,
        ]);
        let r = roster();
        let s = collected_and_saved();
        let cov = Coverage::from_state(&s, &r);
        assert_eq!(rules.next_unmet(&cov, &r, s.artifacts()).as_deref(), Some("search"));
    }

    #[tokio::test]
    async fn test_unknown_option_passes_through() {
        let sup = Supervisor::new("supervisor", Arc::new(Fixed("ghost_agent")));
        let ruling = sup.decide(&fresh(), &roster(), &options()).await.unwrap();
        assert_eq!(ruling.decision, "ghost_agent");
        assert!(!ruling.is_corrected());
    }

    #[tokio::test]
    async fn test_premature_finish_corrected() {
        let sup = Supervisor::new("supervisor", Arc::new(Fixed(FINISH)));
        let ruling = sup
            .decide(&collected_and_saved(), &roster(), &options())
            .await
            .unwrap();
        assert_eq!(ruling.proposed, FINISH);
        assert_eq!(ruling.decision, "analysis");
        let note = ruling.correction.unwrap();
        assert_eq!(note.author, "supervisor");
        assert_eq!(note.outcome, Outcome::Incomplete);
        assert!(note.messages[0].contains("analysis has not run yet"));
    }

    #[tokio::test]
    async fn test_premature_finish_rejected_in_strict_mode() {
        let sup = Supervisor::new("supervisor", Arc::new(Fixed(FINISH))).with_guard(GuardMode::Strict);
        let err = sup
            .decide(&collected_and_saved(), &roster(), &options())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Rejected {
                violation: RuleViolation::MissingRequired(Capability::Analysis),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ineligible_pick_rerouted() {
        let sup = Supervisor::new("supervisor", Arc::new(Fixed("event_log")));
        let ruling = sup.decide(&fresh(), &roster(), &options()).await.unwrap();
        assert_eq!(ruling.proposed, "event_log");
        assert_eq!(ruling.decision, "prefetch");
        let note = ruling.correction.unwrap();
        assert!(note.messages[0].contains("Rerouted from event_log to prefetch"));
        assert!(note.messages[0].contains("does not accept this job"));
    }

    #[tokio::test]
    async fn test_ineligible_pick_rejected_in_strict_mode() {
        let sup =
            Supervisor::new("supervisor", Arc::new(Fixed("event_log"))).with_guard(GuardMode::Strict);
        let err = sup.decide(&fresh(), &roster(), &options()).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Rejected {
                violation: RuleViolation::Ineligible(ref name),
                ..
            } if name == "event_log"
        ));
    }

    #[tokio::test]
    async fn test_policy_error_is_supervisor_error() {
        let sup = Supervisor::new("supervisor", Arc::new(Broken));
        let err = sup.decide(&fresh(), &roster(), &options()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Policy(_)));
    }

    #[tokio::test]
    async fn test_rule_policy_skips_ineligible_collector() {
        let sup = Supervisor::new("supervisor", Arc::new(RulePolicy));
        let ruling = sup.decide(&fresh(), &roster(), &options()).await.unwrap();
        assert_eq!(ruling.decision, "prefetch");
    }

    #[test]
    fn test_parse_decision() {
        assert_eq!(parse_decision(r#"{"next": "data_save_agent"}"#).unwrap(), "data_save_agent");
        assert_eq!(
            parse_decision("```json\n{\"next\": \"FINISH\"}\n```").unwrap(),
            "FINISH"
        );
        assert_eq!(parse_decision("  \"FINISH\" ").unwrap(), "FINISH");
        assert_eq!(parse_decision("data_analysis_agent").unwrap(), "data_analysis_agent");
        assert!(parse_decision(r#"{"route": "x"}"#).is_err());
        assert!(parse_decision("I think the analyst should go next").is_err());
        assert!(parse_decision("").is_err());
    }
}
