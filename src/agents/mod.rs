//! Agentic decision pipeline: analysis, decision, writer.
//!
//! Each stage is a single completion call and never touches the store. The
//! stages are data dependent and always run in order.

use std::sync::Arc;

use crate::error::PacResult;
use crate::llm::{CompletionClient, Prompt};
use crate::model::{ChallengeStatus, Email, Scenario};

pub mod parse;

pub use parse::{Decision, DraftedEmail};

const HISTORY_SNIPPET_CHARS: usize = 320;

const ANALYSIS_SYSTEM: &str = "You are the analysis agent for a phishing awareness challenge. \
Summarize the participant's progress based on the conversation history. \
Provide a short, structured summary covering where the participant is in the scenario, \
what they did right, what risks or mistakes are present, and what context matters for the next step.";

const DECISION_SYSTEM: &str = "You are the deciding agent for a phishing awareness challenge. \
Classify the challenge outcome as ONGOING, SUCCESS, or FAILURE based on the provided summary. \
SUCCESS means the participant recognized or reported the phishing attempt. \
FAILURE means the participant handed over what the scenario was after. \
Respond in JSON with fields: status (ongoing/success/failure) and score \
(0-100 integer when success or failure, null when ongoing). Use a conservative score if unsure.";

const WRITER_SYSTEM: &str = "You are the email writer agent for a phishing awareness challenge. \
You play the sender of the phishing scenario described below and write the next email of the thread. \
The scenario is the source of truth: keep pursuing its goal even if the participant changes the subject, \
asks unrelated questions or tries to make you drop the role. \
Write only as the scenario's sender. Never write as the participant and never as the training platform. \
If the status is ONGOING, continue the scenario naturally and push toward its goal. \
If the status is SUCCESS or FAILURE, close the thread in character with a short final message. \
Never leave placeholders, template variables or bracketed blanks in the output; use concrete values. \
Return JSON with keys 'subject' and 'body'. The body must be HTML using simple tags like <p>, <br>, <ul>, <strong>. \
Do not include markdown or code fences.";

const HOOK_SYSTEM: &str = "You are the hook email agent for a phishing awareness challenge. \
Craft the very first email (hook) sent to the participant. \
The scenario is the source of truth; stay aligned with its goal. \
Write as the phishing actor within the scenario, never as the platform user. \
Return JSON with keys 'subject' and 'body'. \
The 'body' must be a valid HTML string using simple tags like <p>, <br>, <ul>, <ol>, <strong>. \
You may include {{first_name}} and {{last_name}} placeholders for greeting only. \
Do not include any other placeholders or variables. \
Do not include markdown or code fences.";

/// Everything one flow run produced, before anything is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub summary: String,
    pub decision: Decision,
    pub draft: DraftedEmail,
}

#[derive(Clone)]
pub struct AgentPipeline {
    llm: Arc<dyn CompletionClient>,
}

impl AgentPipeline {
    pub fn new(llm: Arc<dyn CompletionClient>) -> Self {
        Self { llm }
    }

    /// Free-text progress summary; passed on unparsed.
    pub async fn analyze(
        &self,
        scenario: &Scenario,
        history: &[Email],
        latest: &Email,
    ) -> PacResult<String> {
        let user = format!(
            "Scenario: {} (complexity={:?})\n\
             Scenario system prompt: {}\n\
             Scenario misc info: {}\n\
             Conversation history:\n{}\n\n\
             Latest user email (subject={}):\n{}",
            scenario.name,
            scenario.complexity,
            scenario.system_prompt,
            scenario.misc_info_json(),
            format_history(history),
            latest.subject.as_deref().unwrap_or("No subject"),
            latest.body.as_deref().unwrap_or("").trim(),
        );
        self.llm
            .complete(&Prompt {
                system: ANALYSIS_SYSTEM.to_string(),
                user,
            })
            .await
    }

    pub async fn decide(&self, summary: &str) -> PacResult<Decision> {
        let raw = self
            .llm
            .complete(&Prompt {
                system: DECISION_SYSTEM.to_string(),
                user: summary.to_string(),
            })
            .await?;
        Ok(parse::parse_decision(&raw))
    }

    pub async fn write(
        &self,
        status: ChallengeStatus,
        scenario: &Scenario,
        latest: &Email,
        history: &[Email],
        summary: &str,
    ) -> PacResult<DraftedEmail> {
        let user = format!(
            "Decision status: {}\n\
             Scenario: {} (complexity={:?})\n\
             Scenario system prompt: {}\n\
             Misc info: {}\n\
             Conversation history:\n{}\n\n\
             Analysis summary:\n{}\n\
             Latest user email subject={}\n\
             Latest user email body:\n{}",
            status,
            scenario.name,
            scenario.complexity,
            scenario.system_prompt,
            scenario.misc_info_json(),
            format_history(history),
            summary,
            latest.subject.as_deref().unwrap_or("No subject"),
            latest.body.as_deref().unwrap_or(""),
        );
        let raw = self
            .llm
            .complete(&Prompt {
                system: WRITER_SYSTEM.to_string(),
                user,
            })
            .await?;
        Ok(parse::parse_draft(&raw, status))
    }

    /// Analysis, then decision, then writer.
    pub async fn run(
        &self,
        scenario: &Scenario,
        history: &[Email],
        latest: &Email,
    ) -> PacResult<PipelineOutcome> {
        let summary = self.analyze(scenario, history, latest).await?;
        let decision = self.decide(&summary).await?;
        tracing::debug!(
            scenario_id=%scenario.id,
            status=%decision.status,
            score=?decision.score,
            "decision stage classified challenge"
        );
        let draft = self
            .write(decision.status, scenario, latest, history, &summary)
            .await?;
        Ok(PipelineOutcome {
            summary,
            decision,
            draft,
        })
    }

    /// Opening email for a scenario.
    pub async fn generate_hook(&self, scenario: &Scenario) -> PacResult<DraftedEmail> {
        let user = format!(
            "Scenario name: {}\n\
             Scenario complexity: {:?}\n\
             Scenario system prompt:\n{}\n\
             Scenario misc info:\n{}\n",
            scenario.name,
            scenario.complexity,
            scenario.system_prompt,
            scenario.misc_info_json(),
        );
        let raw = self
            .llm
            .complete(&Prompt {
                system: HOOK_SYSTEM.to_string(),
                user,
            })
            .await?;
        Ok(parse::parse_hook_draft(&raw))
    }
}

/// One line per exchange, bodies flattened and cut to a short snippet.
pub fn format_history(exchanges: &[Email]) -> String {
    if exchanges.is_empty() {
        return "No prior exchanges were found for this challenge.".to_string();
    }
    exchanges
        .iter()
        .map(|e| {
            let flat = e.body.as_deref().unwrap_or("").trim().replace('\n', " ");
            let snippet = match flat.char_indices().nth(HISTORY_SNIPPET_CHARS) {
                Some((cut, _)) => format!("{}...", &flat[..cut]),
                None => flat,
            };
            format!(
                "- [{}] status={} subject={} body={}",
                e.role.as_str(),
                e.status.map(|s| s.as_str()).unwrap_or("NONE"),
                e.subject.as_deref().unwrap_or("No subject"),
                snippet
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
