//! Usage-record log lines with configurable verbosity.
//!
//! Supports three verbosity levels:
//! - Minimal: One-liner nginx-style
//! - Compact: Two lines, request then outcome
//! - Verbose: Full block with tokens, cost and client metadata

use crate::config::LogVerbosity;
use crate::usage::{Outcome, UsageRecord};

/// Format duration in human-readable form.
fn format_duration(ms: u64) -> String {
    if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}ms", ms)
    }
}

/// Costs are kept in cents.
fn format_cents(cents: f64) -> String {
    format!("{:.6}¢", cents)
}

fn status_text(outcome: &Outcome) -> &str {
    match outcome {
        Outcome::Succeeded => "OK",
        Outcome::Failed { .. } => "FAILED",
    }
}

/// Format a usage record for the log.
pub fn format_usage(record: &UsageRecord, verbosity: LogVerbosity) -> String {
    match verbosity {
        LogVerbosity::Minimal => format_minimal(record),
        LogVerbosity::Compact => format_compact(record),
        LogVerbosity::Verbose => format_verbose(record),
    }
}

fn format_minimal(record: &UsageRecord) -> String {
    format!(
        "{} {} {} {} {}tok {}",
        record.endpoint,
        record.model.id(),
        status_text(&record.outcome),
        format_duration(record.latency_ms),
        record.tokens.total(),
        format_cents(record.cost.total)
    )
}

fn format_compact(record: &UsageRecord) -> String {
    let request_line = format!(
        "→ {} [{}] caller={}",
        record.endpoint,
        record.model.id(),
        record.caller_id
    );
    let outcome_line = match &record.outcome {
        Outcome::Succeeded => format!(
            "← OK ({}, {} tokens, {})",
            format_duration(record.latency_ms),
            record.tokens.total(),
            format_cents(record.cost.total)
        ),
        Outcome::Failed { error } => {
            format!("← FAILED ({}): {}", format_duration(record.latency_ms), error)
        }
    };
    format!("{}\n{}", request_line, outcome_line)
}

fn format_verbose(record: &UsageRecord) -> String {
    let separator = "────────────────────────────────────────";
    let error = match &record.outcome {
        Outcome::Failed { error } => format!("\nError: {}", error),
        Outcome::Succeeded => String::new(),
    };
    let client = format!(
        "{} / {}",
        record.client.ip.as_deref().unwrap_or("-"),
        record.client.user_agent.as_deref().unwrap_or("-")
    );

    format!(
        "{separator}\n\
         {endpoint} request {request_id}\n\
         Caller: {caller}\n\
         Model: {kind} {model}\n\
         Status: {status} in {duration}\n\
         Tokens: {prompt} prompt, {completion} completion, {total} total\n\
         Cost: {prompt_cost} + {completion_cost} = {total_cost}\n\
         Client: {client}{error}\n\
         {separator}",
        separator = separator,
        endpoint = record.endpoint,
        request_id = record.request_id,
        caller = record.caller_id,
        kind = match record.model {
            crate::usage::ModelRef::Internal(_) => "internal",
            crate::usage::ModelRef::External(_) => "external",
        },
        model = record.model.id(),
        status = status_text(&record.outcome),
        duration = format_duration(record.latency_ms),
        prompt = record.tokens.prompt(),
        completion = record.tokens.completion(),
        total = record.tokens.total(),
        prompt_cost = format_cents(record.cost.prompt),
        completion_cost = format_cents(record.cost.completion),
        total_cost = format_cents(record.cost.total),
        client = client,
        error = error,
    )
}

/// Emit a usage record at `info`, with structured fields alongside the formatted line.
pub fn log_usage(record: &UsageRecord, verbosity: LogVerbosity) {
    tracing::info!(
        caller_id = %record.caller_id,
        request_id = %record.request_id,
        model = %record.model.id(),
        tokens = record.tokens.total(),
        cost_cents = record.cost.total,
        success = record.outcome.is_success(),
        "{}",
        format_usage(record, verbosity)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Capability, InternalModel, ModelDescriptor};
    use crate::metering::TokenUsage;
    use crate::usage::{AttemptContext, ClientMeta, Endpoint};

    fn sample_record(outcome: Outcome) -> UsageRecord {
        let descriptor = ModelDescriptor::Internal(InternalModel {
            id: "im-1".to_string(),
            slug: "small".to_string(),
            upstream_model: "small".to_string(),
            prompt_price_per_1k: 0.01,
            completion_price_per_1k: 0.03,
            markup_percent: 20.0,
            capabilities: vec![Capability::Chat],
            context_window: 4096,
            active: true,
        });
        let ctx = AttemptContext {
            caller_id: "caller-1".to_string(),
            request_id: "req-123".to_string(),
            endpoint: Endpoint::ChatCompletions,
            client: ClientMeta {
                ip: Some("10.1.2.3".to_string()),
                user_agent: Some("curl/8.0".to_string()),
            },
        };
        let tokens = if outcome.is_success() {
            TokenUsage::new(100, 50)
        } else {
            TokenUsage::zero()
        };
        UsageRecord::meter(&ctx, &descriptor, tokens, 1200, outcome)
    }

    #[test]
    fn minimal_format_is_single_line() {
        let output = format_usage(&sample_record(Outcome::Succeeded), LogVerbosity::Minimal);

        assert!(!output.contains('\n'), "Minimal should be single line");
        assert!(output.contains("chat_completions"));
        assert!(output.contains("im-1"));
        assert!(output.contains("1.2s"));
        assert!(output.contains("150tok"));
        assert!(output.contains("0.003000¢"));
        assert!(!output.contains('$'));
    }

    #[test]
    fn compact_format_is_two_lines() {
        let output = format_usage(&sample_record(Outcome::Succeeded), LogVerbosity::Compact);

        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2, "Compact should be two lines");
        assert!(lines[0].starts_with('→'));
        assert!(lines[0].contains("caller-1"));
        assert!(lines[1].starts_with('←'));
        assert!(lines[1].contains("150 tokens, 0.003000¢"));
    }

    #[test]
    fn compact_format_shows_failure_reason() {
        let output = format_usage(
            &sample_record(Outcome::Failed { error: "upstream returned 502".to_string() }),
            LogVerbosity::Compact,
        );

        assert!(output.contains("FAILED"));
        assert!(output.contains("upstream returned 502"));
    }

    #[test]
    fn verbose_format_includes_all_details() {
        let output = format_usage(&sample_record(Outcome::Succeeded), LogVerbosity::Verbose);

        assert!(output.contains("───"));
        assert!(output.contains("req-123"));
        assert!(output.contains("internal im-1"));
        assert!(output.contains("100 prompt, 50 completion, 150 total"));
        assert!(output.contains("Cost: 0.001200¢ + 0.001800¢ = 0.003000¢"));
        assert!(!output.contains('$'));
        assert!(output.contains("10.1.2.3 / curl/8.0"));
        assert!(!output.contains("Error:"));
    }

    #[test]
    fn format_duration_switches_units() {
        assert_eq!(format_duration(999), "999ms");
        assert_eq!(format_duration(1500), "1.5s");
    }
}
