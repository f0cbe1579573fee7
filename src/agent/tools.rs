//! The closed tool set exposed to the investigation model.
//!
//! Seven non-terminal tools gather evidence; two terminal tools end the
//! loop. Non-terminal execution shares one signature: (input, context) →
//! JSON output, with per-call trouble reported *inside* the output so a
//! failed lookup never aborts the investigation.

use serde::Serialize;

use super::guardrails;
use super::llm::ToolDefinition;
use crate::db::HealthDb;
use crate::signals::{self, SignalQuery};
use crate::sources::analytics::AnalyticsClient;
use crate::sources::cms::CmsClient;
use crate::sources::search::SearchClient;
use crate::sources::speed::SpeedClient;
use crate::util::Deadline;

/// Terminal tool names, switched on by name in the loop.
pub const SUBMIT_FINDING: &str = "submit_finding";
pub const SKIP_FINDING: &str = "skip_finding";

/// Cap on the lookback window any tool accepts.
const MAX_LOOKBACK_DAYS: u32 = 30;

/// Remaining wall-clock under which the speed tool refuses a live audit.
const LIVE_AUDIT_FLOOR_SECS: u64 = 25;

/// The non-terminal tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentTool {
    GetPageAnalytics,
    GetPageRankings,
    GetPageSpeedDetail,
    GetHubspotPageDetail,
    CheckKeywordPageGap,
    CheckSignalBus,
    EvaluateRecommendation,
}

impl AgentTool {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "get_page_analytics" => Some(Self::GetPageAnalytics),
            "get_page_rankings" => Some(Self::GetPageRankings),
            "get_page_speed_detail" => Some(Self::GetPageSpeedDetail),
            "get_hubspot_page_detail" => Some(Self::GetHubspotPageDetail),
            "check_keyword_page_gap" => Some(Self::CheckKeywordPageGap),
            "check_signal_bus" => Some(Self::CheckSignalBus),
            "evaluate_recommendation" => Some(Self::EvaluateRecommendation),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetPageAnalytics => "get_page_analytics",
            Self::GetPageRankings => "get_page_rankings",
            Self::GetPageSpeedDetail => "get_page_speed_detail",
            Self::GetHubspotPageDetail => "get_hubspot_page_detail",
            Self::CheckKeywordPageGap => "check_keyword_page_gap",
            Self::CheckSignalBus => "check_signal_bus",
            Self::EvaluateRecommendation => "evaluate_recommendation",
        }
    }
}

/// Is this name a terminal tool?
pub fn is_terminal(name: &str) -> bool {
    name == SUBMIT_FINDING || name == SKIP_FINDING
}

/// One executed tool call, kept for the investigation record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub duration_ms: u64,
}

/// Everything a tool execution can reach.
pub struct ToolContext<'a> {
    pub db: &'a HealthDb,
    pub access_token: &'a str,
    pub analytics: &'a AnalyticsClient,
    pub search: &'a SearchClient,
    pub speed: &'a SpeedClient,
    pub cms: &'a CmsClient,
    pub deadline: &'a Deadline,
}

/// Execute one non-terminal tool and record the call.
pub async fn execute(
    tool: AgentTool,
    input: &serde_json::Value,
    ctx: &ToolContext<'_>,
) -> ToolCall {
    let started = tokio::time::Instant::now();
    let output = run(tool, input, ctx).await;
    ToolCall {
        tool_name: tool.name().to_string(),
        input: input.clone(),
        output,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

async fn run(tool: AgentTool, input: &serde_json::Value, ctx: &ToolContext<'_>) -> serde_json::Value {
    match tool {
        AgentTool::GetPageAnalytics => {
            let Some(page_path) = input["page_path"].as_str() else {
                return error_output("page_path is required");
            };
            let days = lookback(input);
            match ctx
                .analytics
                .page_detail(ctx.access_token, page_path, days, ctx.deadline)
                .await
            {
                Ok(Some(metrics)) => serde_json::json!({
                    "pagePath": metrics.page_path,
                    "days": days,
                    "activeUsers": metrics.active_users,
                    "sessions": metrics.sessions,
                    "pageViews": metrics.page_views,
                    "bounceRate": metrics.bounce_rate,
                    "avgSessionDuration": metrics.avg_session_duration,
                }),
                Ok(None) => serde_json::json!({"pagePath": page_path, "days": days, "activeUsers": 0, "noData": true}),
                Err(e) => error_output(&e.to_string()),
            }
        }

        AgentTool::GetPageRankings => {
            let Some(page_url) = input["page_url"].as_str() else {
                return error_output("page_url is required");
            };
            let days = lookback(input);
            let detail = ctx
                .search
                .page_detail(ctx.access_token, page_url, days, ctx.deadline)
                .await;
            let queries = ctx
                .search
                .top_queries(ctx.access_token, page_url, days, ctx.deadline)
                .await
                .unwrap_or_default();
            match detail {
                Ok(Some(perf)) => serde_json::json!({
                    "pageUrl": perf.page_url,
                    "days": days,
                    "clicks": perf.clicks,
                    "impressions": perf.impressions,
                    "ctr": perf.ctr,
                    "avgPosition": perf.position,
                    "topQueries": queries.iter().map(|q| serde_json::json!({
                        "query": q.query,
                        "clicks": q.clicks,
                        "impressions": q.impressions,
                        "position": q.position,
                    })).collect::<Vec<_>>(),
                }),
                Ok(None) => serde_json::json!({"pageUrl": page_url, "days": days, "noData": true}),
                Err(e) => error_output(&e.to_string()),
            }
        }

        AgentTool::GetPageSpeedDetail => {
            let Some(url) = input["url"].as_str() else {
                return error_output("url is required");
            };
            let strategy = input["strategy"].as_str().unwrap_or("mobile");

            // Prefer the stored result; a live audit only when there is none
            // and enough budget remains to survive one.
            match ctx.db.latest_speed_for(url, strategy) {
                Ok(Some(stored)) => serde_json::json!({
                    "url": url,
                    "strategy": strategy,
                    "performanceScore": stored.performance_score,
                    "lcpMs": stored.lcp_ms,
                    "cls": stored.cls,
                    "inpMs": stored.inp_ms,
                    "opportunities": serde_json::from_str::<serde_json::Value>(&stored.opportunities)
                        .unwrap_or(serde_json::Value::Null),
                    "fromCache": true,
                }),
                Ok(None) if ctx.deadline.remaining().as_secs() > LIVE_AUDIT_FLOOR_SECS => {
                    match ctx.speed.run_audit(url, strategy, ctx.deadline).await {
                        Ok(audit) => serde_json::json!({
                            "url": url,
                            "strategy": strategy,
                            "performanceScore": audit.performance_score,
                            "lcpMs": audit.lcp_ms,
                            "cls": audit.cls,
                            "inpMs": audit.inp_ms,
                            "opportunities": audit.opportunities,
                            "fromCache": false,
                        }),
                        Err(e) => error_output(&e.to_string()),
                    }
                }
                Ok(None) => serde_json::json!({"url": url, "strategy": strategy, "noData": true}),
                Err(e) => error_output(&e.to_string()),
            }
        }

        AgentTool::GetHubspotPageDetail => {
            let Some(page_url) = input["page_url"].as_str() else {
                return error_output("page_url is required");
            };
            let page = match ctx.db.get_page_by_url(page_url) {
                Ok(Some(page)) => page,
                Ok(None) => return serde_json::json!({"pageUrl": page_url, "noData": true}),
                Err(e) => return error_output(&e.to_string()),
            };

            let mut detail = serde_json::json!({
                "pageUrl": page.url,
                "pageType": page.page_type.as_str(),
                "title": page.title,
                "metaDescription": page.meta_description,
                "hasForm": page.has_form,
                "formIds": page.form_id_list(),
                "hasCta": page.has_cta,
                "publishedAt": page.published_at,
                "lastUpdatedAt": page.last_updated_at,
                "contentAgeDays": page.content_age_days,
                "metaIssues": page.meta_issue_list(),
            });

            if let Some(cms_id) = &page.cms_page_id {
                if let Ok(Some(cms_detail)) =
                    ctx.cms.page_detail(cms_id, page.page_type, ctx.deadline).await
                {
                    detail["cmsSlug"] = serde_json::json!(cms_detail.slug);
                    detail["cmsUpdatedAt"] = serde_json::json!(cms_detail.updated_at);
                }
            }
            detail
        }

        AgentTool::CheckKeywordPageGap => {
            let Some(keyword) = input["keyword"].as_str() else {
                return error_output("keyword is required");
            };
            match ctx
                .search
                .pages_for_keyword(ctx.access_token, keyword, MAX_LOOKBACK_DAYS, ctx.deadline)
                .await
            {
                Ok(rows) => {
                    let best = rows
                        .iter()
                        .min_by(|a, b| a.position.total_cmp(&b.position));
                    let has_organic_page =
                        best.map(|row| row.position <= 20.0).unwrap_or(false);
                    serde_json::json!({
                        "keyword": keyword,
                        "hasOrganicPage": has_organic_page,
                        "position": best.map(|row| row.position),
                        "rankingPages": rows.iter().map(|row| serde_json::json!({
                            "pageUrl": row.page_url,
                            "query": row.query,
                            "impressions": row.impressions,
                            "position": row.position,
                        })).collect::<Vec<_>>(),
                    })
                }
                Err(e) => error_output(&e.to_string()),
            }
        }

        AgentTool::CheckSignalBus => {
            let Some(topic) = input["topic"].as_str() else {
                return error_output("topic is required");
            };
            match signals::query(
                ctx.db,
                &SignalQuery {
                    source_agent: None,
                    event_types: &[topic],
                    within_days: Some(30),
                    limit: 20,
                },
            ) {
                Ok(found) => serde_json::json!({
                    "topic": topic,
                    "count": found.len(),
                    "signals": found.iter().map(|s| serde_json::json!({
                        "sourceAgent": s.source_agent,
                        "eventType": s.event_type,
                        "payload": s.payload_value(),
                        "createdAt": s.created_at,
                    })).collect::<Vec<_>>(),
                }),
                Err(e) => error_output(&e.to_string()),
            }
        }

        AgentTool::EvaluateRecommendation => {
            let action_type = input["action_type"].as_str().unwrap_or("unknown");
            let confidence = input["confidence"].as_f64().unwrap_or(0.0);
            match guardrails::evaluate(ctx.db, action_type, confidence) {
                Ok(evaluation) => serde_json::to_value(&evaluation)
                    .unwrap_or_else(|_| error_output("evaluation serialization failed")),
                Err(e) => error_output(&e.to_string()),
            }
        }
    }
}

fn lookback(input: &serde_json::Value) -> u32 {
    input["days"]
        .as_u64()
        .map(|d| d as u32)
        .unwrap_or(MAX_LOOKBACK_DAYS)
        .min(MAX_LOOKBACK_DAYS)
}

fn error_output(message: &str) -> serde_json::Value {
    serde_json::json!({"error": message})
}

/// Tool definitions shipped with every model request.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "get_page_analytics",
            description: "Traffic metrics for a page path over a trailing window (max 30 days).",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "page_path": {"type": "string", "description": "Path component, e.g. /pricing"},
                    "days": {"type": "integer", "maximum": 30}
                },
                "required": ["page_path"]
            }),
        },
        ToolDefinition {
            name: "get_page_rankings",
            description: "Search performance and top queries for a page URL (max 30 days).",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "page_url": {"type": "string"},
                    "days": {"type": "integer", "maximum": 30}
                },
                "required": ["page_url"]
            }),
        },
        ToolDefinition {
            name: "get_page_speed_detail",
            description: "Latest speed audit for a URL: scores, Core Web Vitals, top opportunities.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "strategy": {"type": "string", "enum": ["mobile", "desktop"]}
                },
                "required": ["url"]
            }),
        },
        ToolDefinition {
            name: "get_hubspot_page_detail",
            description: "CMS record for a page: type, meta fields, forms, CTAs, freshness.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"page_url": {"type": "string"}},
                "required": ["page_url"]
            }),
        },
        ToolDefinition {
            name: "check_keyword_page_gap",
            description: "Whether any page ranks organically (position <= 20) for a keyword.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"keyword": {"type": "string"}},
                "required": ["keyword"]
            }),
        },
        ToolDefinition {
            name: "check_signal_bus",
            description: "Recent cross-agent signals for a topic (last 30 days).",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"topic": {"type": "string"}},
                "required": ["topic"]
            }),
        },
        ToolDefinition {
            name: "evaluate_recommendation",
            description: "Pre-flight a recommendation against the active guardrails. Call before submit_finding.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "action_type": {"type": "string"},
                    "action_summary": {"type": "string"},
                    "severity": {"type": "string", "enum": ["critical", "high", "medium", "low"]},
                    "confidence": {"type": "number", "minimum": 0, "maximum": 1}
                },
                "required": ["action_type", "action_summary", "severity", "confidence"]
            }),
        },
        ToolDefinition {
            name: SUBMIT_FINDING,
            description: "Terminal: file the finding with a recommendation for human review.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "finding_type": {"type": "string",
                        "enum": ["traffic_drop", "ranking_loss", "speed_regression",
                                 "stale_content", "conversion_gap", "technical_issue"]},
                    "severity": {"type": "string", "enum": ["critical", "high", "medium", "low"]},
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "business_impact": {"type": "string"},
                    "action_type": {"type": "string"},
                    "action_summary": {"type": "string"},
                    "action_detail": {"type": "object"},
                    "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                    "risk_level": {"type": "string", "enum": ["low", "medium", "high"]},
                    "investigation_summary": {"type": "string"}
                },
                "required": ["finding_type", "severity", "title", "description",
                             "action_type", "action_summary", "investigation_summary"]
            }),
        },
        ToolDefinition {
            name: SKIP_FINDING,
            description: "Terminal: close the investigation without a recommendation, with a reason.",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string"},
                    "investigation_summary": {"type": "string"}
                },
                "required": ["reason", "investigation_summary"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_names_roundtrip() {
        for tool in [
            AgentTool::GetPageAnalytics,
            AgentTool::GetPageRankings,
            AgentTool::GetPageSpeedDetail,
            AgentTool::GetHubspotPageDetail,
            AgentTool::CheckKeywordPageGap,
            AgentTool::CheckSignalBus,
            AgentTool::EvaluateRecommendation,
        ] {
            assert_eq!(AgentTool::parse(tool.name()), Some(tool));
        }
        assert_eq!(AgentTool::parse("submit_finding"), None, "terminal tools are not in the registry");
        assert_eq!(AgentTool::parse("rm_rf"), None);
    }

    #[test]
    fn test_terminal_detection() {
        assert!(is_terminal(SUBMIT_FINDING));
        assert!(is_terminal(SKIP_FINDING));
        assert!(!is_terminal("get_page_analytics"));
    }

    #[test]
    fn test_lookback_clamped_to_30() {
        assert_eq!(lookback(&serde_json::json!({"days": 90})), 30);
        assert_eq!(lookback(&serde_json::json!({"days": 7})), 7);
        assert_eq!(lookback(&serde_json::json!({})), 30);
    }

    #[test]
    fn test_definitions_cover_the_closed_set() {
        let defs = tool_definitions();
        assert_eq!(defs.len(), 9, "7 non-terminal + 2 terminal");
        assert!(defs.iter().any(|d| d.name == SUBMIT_FINDING));
        assert!(defs.iter().any(|d| d.name == SKIP_FINDING));
        for def in &defs {
            assert!(def.input_schema["type"] == "object");
        }
    }
}
