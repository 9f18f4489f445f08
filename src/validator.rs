//! Validator: a pure function over a candidate Observation and its Series
//! Descriptor. No I/O, no mutable state — every call is independently
//! reproducible given the same inputs.

use crate::model::{Observation, SeriesDescriptor, ValidationFlags};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NullValue,
    UntrustedSource,
    OutOfRange,
    PlaceholderSuspect,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::NullValue => "NULL_VALUE",
            RejectReason::UntrustedSource => "UNTRUSTED_SOURCE",
            RejectReason::OutOfRange => "OUT_OF_RANGE",
            RejectReason::PlaceholderSuspect => "PLACEHOLDER_SUSPECT",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    Accepted(Observation),
    Rejected(RejectReason),
}

/// Longer identical-decimal runs than this are treated as a placeholder.
const PLACEHOLDER_RUN_LEN: usize = 6;

/// Validates one candidate observation against its series' descriptor.
///
/// `known_sources` is the configured source catalog (authenticity check).
/// `now` is injected rather than read from the clock so the pipeline stays
/// a pure function of its inputs.
pub fn validate(
    mut candidate: Observation,
    descriptor: &SeriesDescriptor,
    known_sources: &[String],
    now: DateTime<Utc>,
    bypass: bool,
) -> ValidationOutcome {
    // 1. Presence — never bypassed. A null primary value is never accepted,
    // bypass mode or not.
    if !candidate.value.is_finite() {
        return ValidationOutcome::Rejected(RejectReason::NullValue);
    }

    // 2. Authenticity — source_id must be known, fetch_time must be recent.
    if !known_sources.iter().any(|s| s == &candidate.source_id) {
        return ValidationOutcome::Rejected(RejectReason::UntrustedSource);
    }
    let fetch_age = now.signed_duration_since(candidate.fetch_time);
    if fetch_age.num_seconds() < 0 || fetch_age.num_seconds() as u64 > descriptor.refresh_period.as_secs().max(60) * 4 {
        return ValidationOutcome::Rejected(RejectReason::UntrustedSource);
    }

    if !bypass {
        // 3. Sanity range.
        if !descriptor.in_range(candidate.value) {
            return ValidationOutcome::Rejected(RejectReason::OutOfRange);
        }

        // 4. Placeholder heuristic.
        if is_placeholder(candidate.value, descriptor) {
            return ValidationOutcome::Rejected(RejectReason::PlaceholderSuspect);
        }
    } else {
        candidate.validation_flags.set(ValidationFlags::BYPASS);
    }

    // 5. Freshness — flags, does not reject.
    let age = now.signed_duration_since(candidate.timestamp);
    let max_staleness = chrono::Duration::from_std(descriptor.max_staleness).unwrap_or(chrono::Duration::zero());
    if age.num_seconds() < 0 || age > max_staleness {
        candidate.validation_flags.set(ValidationFlags::STALE);
    }

    ValidationOutcome::Accepted(candidate)
}

/// Zero is suspect only when the series' own sanity range forbids zero
/// (`lo > 0`); a spread genuinely at 0 bps is legitimate for series whose
/// range permits it. Resolved only via the configured sanity range, never
/// guessed.
fn is_placeholder(value: f64, descriptor: &SeriesDescriptor) -> bool {
    if value == 0.0 {
        if let Some(lo) = descriptor.sanity_lo {
            if lo > 0.0 {
                return true;
            }
        }
    }
    has_long_repeated_decimal_run(value)
}

/// Detects values like `123.111111` — a repeated-digit tail longer than the
/// configured run length, which real market data essentially never produces.
fn has_long_repeated_decimal_run(value: f64) -> bool {
    let formatted = format!("{value:.10}");
    let Some(frac) = formatted.split('.').nth(1) else {
        return false;
    };
    let bytes = frac.as_bytes();
    let mut run = 1usize;
    for i in 1..bytes.len() {
        if bytes[i] == bytes[i - 1] {
            run += 1;
            if run > PLACEHOLDER_RUN_LEN {
                return true;
            }
        } else {
            run = 1;
        }
    }
    false
}
