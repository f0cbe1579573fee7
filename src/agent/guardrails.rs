//! Guardrail evaluation for drafted recommendations.
//!
//! Guardrails live in storage; only two rule shapes are interpreted:
//! `blocked_action_types` and `min_confidence`. Rows with other rule
//! categories are loaded but inert (kept so operators can stage rules ahead
//! of support landing). One rule is hard-wired: confidence under 0.3 always
//! blocks, with or without a stored guardrail.

use crate::db::{DbError, Guardrail, HealthDb, ViolationAction};

/// Hard floor: below this, a recommendation never passes.
pub const HARD_MIN_CONFIDENCE: f64 = 0.3;

/// Outcome of evaluating one proposed recommendation.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub passed: bool,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
}

/// Evaluate a proposed action against the hard rule and every active
/// guardrail.
pub fn evaluate(
    db: &HealthDb,
    action_type: &str,
    confidence: f64,
) -> Result<Evaluation, DbError> {
    let guardrails = db.active_guardrails()?;
    Ok(evaluate_with(&guardrails, action_type, confidence))
}

/// Pure evaluation against an explicit rule set.
pub fn evaluate_with(guardrails: &[Guardrail], action_type: &str, confidence: f64) -> Evaluation {
    let mut violations = Vec::new();
    let mut warnings = Vec::new();

    if confidence < HARD_MIN_CONFIDENCE {
        violations.push(format!(
            "Confidence {:.2} is below the hard minimum {:.1}",
            confidence, HARD_MIN_CONFIDENCE
        ));
    }

    for guardrail in guardrails {
        let config: serde_json::Value = guardrail
            .config
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(serde_json::Value::Null);

        let failure = match guardrail.rule_category.as_str() {
            "blocked_action_types" => {
                let blocked = config["blocked_action_types"]
                    .as_array()
                    .map(|list| {
                        list.iter()
                            .filter_map(|v| v.as_str())
                            .any(|t| t == action_type)
                    })
                    .unwrap_or(false);
                blocked.then(|| {
                    format!(
                        "Action type '{}' is blocked by guardrail '{}'",
                        action_type, guardrail.name
                    )
                })
            }
            "min_confidence" => {
                let min = config["min_confidence"]
                    .as_f64()
                    .or(guardrail.threshold)
                    .unwrap_or(HARD_MIN_CONFIDENCE);
                (confidence < min).then(|| {
                    format!(
                        "Confidence {:.2} is below guardrail '{}' minimum {:.2}",
                        confidence, guardrail.name, min
                    )
                })
            }
            other => {
                // Not yet interpreted; stays inert.
                log::debug!("Guardrail '{}' has uninterpreted category '{}'", guardrail.name, other);
                None
            }
        };

        if let Some(message) = failure {
            match guardrail.violation_action {
                ViolationAction::Block => violations.push(message),
                ViolationAction::Warn => warnings.push(message),
                ViolationAction::Alert => {
                    log::warn!("Guardrail alert: {}", message);
                    warnings.push(message);
                }
            }
        }
    }

    Evaluation {
        passed: violations.is_empty(),
        violations,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrail(category: &str, config: serde_json::Value, action: ViolationAction) -> Guardrail {
        Guardrail {
            id: "g1".to_string(),
            name: format!("test-{}", category),
            rule_category: category.to_string(),
            threshold: None,
            config: Some(config.to_string()),
            violation_action: action,
        }
    }

    #[test]
    fn test_hard_confidence_floor_always_blocks() {
        let eval = evaluate_with(&[], "content_refresh", 0.25);
        assert!(!eval.passed);
        assert_eq!(eval.violations.len(), 1);

        let eval = evaluate_with(&[], "content_refresh", 0.3);
        assert!(eval.passed, "exactly 0.3 passes the strict < check");
    }

    #[test]
    fn test_blocked_action_types() {
        let rules = vec![guardrail(
            "blocked_action_types",
            serde_json::json!({"blocked_action_types": ["delete_page", "redirect_change"]}),
            ViolationAction::Block,
        )];

        let eval = evaluate_with(&rules, "delete_page", 0.9);
        assert!(!eval.passed);

        let eval = evaluate_with(&rules, "content_refresh", 0.9);
        assert!(eval.passed);
    }

    #[test]
    fn test_min_confidence_with_warn_action_does_not_fail() {
        let rules = vec![guardrail(
            "min_confidence",
            serde_json::json!({"min_confidence": 0.8}),
            ViolationAction::Warn,
        )];

        let eval = evaluate_with(&rules, "content_refresh", 0.6);
        assert!(eval.passed, "warn-level failures are advisory");
        assert_eq!(eval.warnings.len(), 1);
    }

    #[test]
    fn test_min_confidence_falls_back_to_threshold_column() {
        let mut rule = guardrail("min_confidence", serde_json::Value::Null, ViolationAction::Block);
        rule.config = None;
        rule.threshold = Some(0.75);

        let eval = evaluate_with(&[rule], "content_refresh", 0.7);
        assert!(!eval.passed);
    }

    #[test]
    fn test_unknown_category_is_inert() {
        let rules = vec![guardrail(
            "max_pages_per_day",
            serde_json::json!({"limit": 3}),
            ViolationAction::Block,
        )];
        let eval = evaluate_with(&rules, "content_refresh", 0.9);
        assert!(eval.passed);
        assert!(eval.violations.is_empty());
        assert!(eval.warnings.is_empty());
    }
}
