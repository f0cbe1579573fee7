//! Bounded tool-using investigation loop.
//!
//! One investigation per flagged page. The model converses against a closed
//! tool set and must end by invoking a terminal tool; the loop enforces the
//! call and wall-clock budgets and converts every failure mode (model
//! error, malformed turn, exhausted budget) into a recorded skip, never an
//! exception out of the scan.
//!
//! Modules:
//! - llm: Messages API client
//! - tools: closed tool registry and execution
//! - prompts: flagged-page context rendering
//! - guardrails: recommendation pre-flight rules

pub mod guardrails;
pub mod llm;
pub mod prompts;
pub mod tools;

use self::llm::{ChatMessage, LlmClient};
use self::tools::{AgentTool, ToolCall, ToolContext};

use crate::db::{AnalyticsSnapshot, DbError, HealthDb, Page, SearchSnapshot, SpeedScore};
use crate::scoring::HealthBreakdown;
use crate::writer;

/// Non-terminal tool call budget per investigation.
pub const MAX_TOOL_CALLS: usize = 6;

/// Wall-clock budget per investigation.
pub const MAX_DURATION_MS: u64 = 40_000;

/// Token ceiling per model turn.
const MODEL_MAX_TOKENS: u32 = 2048;

/// A page handed to the investigation loop, with everything the prompt needs.
#[derive(Debug, Clone)]
pub struct FlaggedPage {
    pub page: Page,
    pub breakdown: HealthBreakdown,
    pub flag_reasons: Vec<String>,
    pub analytics: Option<AnalyticsSnapshot>,
    pub search: Option<SearchSnapshot>,
    pub speed: Option<SpeedScore>,
}

/// Loop states, advanced once per model turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    AwaitingModel,
    ExecutingTools,
    TerminalSubmit,
    TerminalSkip,
    ForcedSkip,
}

/// How an investigation ended.
#[derive(Debug, Clone)]
pub enum InvestigationOutcome {
    /// Finding drafted and queued for review.
    Submitted { finding_id: String, queue_id: String },
    /// Model skipped, or the loop forced a skip.
    Skipped { finding_id: String },
    /// An open finding already covers this page; the loop never ran.
    Deduped,
}

/// Run one investigation. Every path that touches the model ends in a
/// persisted terminal record.
pub async fn investigate(
    db: &HealthDb,
    flagged: &FlaggedPage,
    ctx: &ToolContext<'_>,
    model: &LlmClient,
) -> Result<InvestigationOutcome, DbError> {
    // Dedup pre-check: an open finding means a human is already on it.
    if db.has_open_finding_for(&flagged.page.url)? {
        log::info!(
            "Skipping investigation for {}: open finding exists",
            flagged.page.url
        );
        db.append_change_log(
            "investigation_deduped",
            &serde_json::json!({"pageUrl": flagged.page.url}),
            "pending",
            None,
        )?;
        return Ok(InvestigationOutcome::Deduped);
    }

    let started = tokio::time::Instant::now();
    let score = flagged.breakdown.total();
    let tool_definitions = tools::tool_definitions();

    let mut messages = vec![ChatMessage::user_text(&prompts::initial_prompt(flagged))];
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut iterations: i64 = 0;
    let mut state = LoopState::AwaitingModel;

    loop {
        debug_assert_eq!(state, LoopState::AwaitingModel);

        if started.elapsed().as_millis() as u64 >= MAX_DURATION_MS {
            state = LoopState::ForcedSkip;
            return forced_skip(
                db,
                flagged,
                score,
                "Forced termination: investigation exceeded the time budget",
                iterations,
                &tool_calls,
                state,
            );
        }

        let turn = match model
            .chat(
                Some(prompts::SYSTEM_PROMPT),
                &messages,
                &tool_definitions,
                MODEL_MAX_TOKENS,
            )
            .await
        {
            Ok(turn) => turn,
            Err(e) => {
                log::warn!("Model call failed for {}: {}", flagged.page.url, e);
                state = LoopState::ForcedSkip;
                return forced_skip(
                    db,
                    flagged,
                    score,
                    &format!("Model error: {}", e),
                    iterations,
                    &tool_calls,
                    state,
                );
            }
        };
        iterations += 1;

        if turn.tool_invocations.is_empty() {
            // A turn without tool use cannot advance the investigation.
            state = LoopState::ForcedSkip;
            return forced_skip(
                db,
                flagged,
                score,
                "Model returned no tool invocation",
                iterations,
                &tool_calls,
                state,
            );
        }

        messages.push(ChatMessage::assistant_blocks(turn.raw_content.clone()));
        state = LoopState::ExecutingTools;
        log::trace!(
            "Investigation {:?} turn {} with {} tool block(s)",
            state,
            iterations,
            turn.tool_invocations.len()
        );

        let mut results: Vec<(String, String)> = Vec::new();
        for invocation in &turn.tool_invocations {
            if tools::is_terminal(&invocation.name) {
                // Acknowledge in-history, then materialize and return.
                messages.push(ChatMessage::tool_results(vec![(
                    invocation.id.clone(),
                    serde_json::json!({"acknowledged": true}).to_string(),
                )]));

                let used = tool_names(&tool_calls);
                if invocation.name == tools::SUBMIT_FINDING {
                    state = LoopState::TerminalSubmit;
                    log::debug!("Investigation for {} ended in {:?}", flagged.page.url, state);
                    let outcome = writer::submit_finding(
                        db,
                        flagged,
                        &invocation.input,
                        iterations,
                        &used,
                    )?;
                    return Ok(InvestigationOutcome::Submitted {
                        finding_id: outcome.finding_id,
                        queue_id: outcome.queue_id,
                    });
                }

                state = LoopState::TerminalSkip;
                log::debug!("Investigation for {} ended in {:?}", flagged.page.url, state);
                let reason = invocation.input["reason"]
                    .as_str()
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or("No reason given");
                let finding_id = writer::skip_finding(
                    db,
                    &flagged.page.url,
                    score,
                    reason,
                    invocation.input["investigation_summary"].as_str(),
                    iterations,
                    &used,
                )?;
                return Ok(InvestigationOutcome::Skipped { finding_id });
            }

            // Budgets are enforced before every execution, not after.
            if tool_calls.len() >= MAX_TOOL_CALLS {
                state = LoopState::ForcedSkip;
                return forced_skip(
                    db,
                    flagged,
                    score,
                    "Forced termination: tool call budget exhausted",
                    iterations,
                    &tool_calls,
                    state,
                );
            }
            if started.elapsed().as_millis() as u64 >= MAX_DURATION_MS {
                state = LoopState::ForcedSkip;
                return forced_skip(
                    db,
                    flagged,
                    score,
                    "Forced termination: investigation exceeded the time budget",
                    iterations,
                    &tool_calls,
                    state,
                );
            }

            match AgentTool::parse(&invocation.name) {
                Some(tool) => {
                    let call = tools::execute(tool, &invocation.input, ctx).await;
                    results.push((invocation.id.clone(), call.output.to_string()));
                    tool_calls.push(call);
                }
                None => {
                    // Outside the closed set; report and count it.
                    let output = serde_json::json!({
                        "error": format!("Unknown tool: {}", invocation.name)
                    });
                    results.push((invocation.id.clone(), output.to_string()));
                    tool_calls.push(ToolCall {
                        tool_name: invocation.name.clone(),
                        input: invocation.input.clone(),
                        output,
                        duration_ms: 0,
                    });
                }
            }
        }

        messages.push(ChatMessage::tool_results(results));
        state = LoopState::AwaitingModel;
    }
}

fn forced_skip(
    db: &HealthDb,
    flagged: &FlaggedPage,
    score: i64,
    reason: &str,
    iterations: i64,
    tool_calls: &[ToolCall],
    state: LoopState,
) -> Result<InvestigationOutcome, DbError> {
    log::warn!(
        "Investigation for {} ended in {:?}: {}",
        flagged.page.url,
        state,
        reason
    );
    let finding_id = writer::skip_finding(
        db,
        &flagged.page.url,
        score,
        reason,
        None,
        iterations,
        &tool_names(tool_calls),
    )?;
    Ok(InvestigationOutcome::Skipped { finding_id })
}

/// Distinct tool names, in first-use order.
fn tool_names(tool_calls: &[ToolCall]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for call in tool_calls {
        if !names.contains(&call.tool_name) {
            names.push(call.tool_name.clone());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_names_dedupe_in_order() {
        let calls = vec![
            ToolCall {
                tool_name: "get_page_analytics".to_string(),
                input: serde_json::json!({}),
                output: serde_json::json!({}),
                duration_ms: 10,
            },
            ToolCall {
                tool_name: "get_page_rankings".to_string(),
                input: serde_json::json!({}),
                output: serde_json::json!({}),
                duration_ms: 12,
            },
            ToolCall {
                tool_name: "get_page_analytics".to_string(),
                input: serde_json::json!({}),
                output: serde_json::json!({}),
                duration_ms: 9,
            },
        ];
        assert_eq!(tool_names(&calls), vec!["get_page_analytics", "get_page_rankings"]);
    }
}
