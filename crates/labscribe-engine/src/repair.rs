use labscribe_contracts::events::EventWriter;
use labscribe_contracts::fence::JsonBlock;
use labscribe_contracts::fhir::{validate_value, ResourceKind, ValidationResult};
use labscribe_contracts::records::Artifact;
use labscribe_contracts::runs::diff::payload_diff;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::convert::{ConversionAttempt, Converter};
use crate::error::ConversionError;

pub const NO_PAYLOAD_MESSAGE: &str = "no JSON payload found";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairState {
    AwaitingConversion,
    Validating,
    NeedsRepair,
    AllValid,
    BudgetExhausted,
    Cancelled,
}

impl RepairState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingConversion => "AWAITING_CONVERSION",
            Self::Validating => "VALIDATING",
            Self::NeedsRepair => "NEEDS_REPAIR",
            Self::AllValid => "ALL_VALID",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    AllValid,
    BudgetExhausted,
    Cancelled,
}

impl RepairOutcome {
    pub fn as_str(self) -> &'static str {
        self.state().as_str()
    }

    pub fn state(self) -> RepairState {
        match self {
            Self::AllValid => RepairState::AllValid,
            Self::BudgetExhausted => RepairState::BudgetExhausted,
            Self::Cancelled => RepairState::Cancelled,
        }
    }
}

/// Latest known state of one payload the model produced.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockReport {
    /// Stable across repairs; assigned in order of first appearance.
    pub index: usize,
    pub payload: String,
    pub value: Option<Value>,
    pub result: ValidationResult,
    /// Attempt that produced the current payload.
    pub attempt: u32,
    pub repairs: u32,
    /// Line diff against the payload this one repaired.
    pub diff: Option<Vec<String>>,
}

impl BlockReport {
    pub fn kind(&self) -> Option<&ResourceKind> {
        self.result.kind.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairReport {
    pub outcome: RepairOutcome,
    pub attempts: u32,
    pub valid: Vec<BlockReport>,
    /// Still-invalid blocks with their last validation result.
    pub invalid: Vec<BlockReport>,
    pub history: Vec<ConversionAttempt>,
}

impl RepairReport {
    pub fn is_all_valid(&self) -> bool {
        self.outcome == RepairOutcome::AllValid
    }
}

/// Drives convert → validate → reconvert until every block validates or the
/// attempt budget is spent.
pub struct RepairLoop<'a, C: ?Sized> {
    converter: &'a C,
    events: Option<&'a EventWriter>,
}

impl<'a, C: Converter + ?Sized> RepairLoop<'a, C> {
    pub fn new(converter: &'a C) -> Self {
        Self {
            converter,
            events: None,
        }
    }

    pub fn with_events(mut self, events: &'a EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn run(
        &self,
        artifact: &Artifact,
        instruction: &str,
        max_attempts: u32,
        cancel: &CancelToken,
    ) -> Result<RepairReport, ConversionError> {
        let budget = max_attempts.max(1);
        let mut attempts = 0u32;
        let mut next_index = 0usize;
        let mut valid: Vec<BlockReport> = Vec::new();
        let mut pending: Vec<BlockReport> = Vec::new();
        let mut history: Vec<ConversionAttempt> = Vec::new();
        // Until a convert reply yields at least one block, there is nothing to repair.
        let mut needs_conversion = true;

        let outcome = loop {
            if cancel.is_cancelled() {
                break RepairOutcome::Cancelled;
            }
            attempts += 1;
            self.transition(RepairState::AwaitingConversion, attempts);

            if needs_conversion {
                let attempt = self
                    .converter
                    .convert(artifact, instruction)?
                    .with_number(attempts);
                self.record_attempt(&attempt);
                self.transition(RepairState::Validating, attempts);
                pending.clear();
                if attempt.blocks.is_empty() {
                    pending.push(BlockReport {
                        index: next_index,
                        payload: String::new(),
                        value: None,
                        result: ValidationResult::invalid(None, NO_PAYLOAD_MESSAGE, Vec::new()),
                        attempt: attempts,
                        repairs: 0,
                        diff: None,
                    });
                } else {
                    needs_conversion = false;
                    for block in &attempt.blocks {
                        let report = check_block(block, next_index, attempts, None);
                        next_index += 1;
                        self.record_block(&report);
                        if report.result.valid {
                            valid.push(report);
                        } else {
                            pending.push(report);
                        }
                    }
                }
                history.push(attempt);
            } else {
                let mut still_invalid = Vec::new();
                for prior in pending.drain(..) {
                    let attempt = self
                        .converter
                        .reconvert(&prior.payload, &prior.result.message)?
                        .with_number(attempts);
                    self.record_attempt(&attempt);
                    self.transition(RepairState::Validating, attempts);
                    if attempt.blocks.is_empty() {
                        let mut kept = prior.clone();
                        kept.result =
                            ValidationResult::invalid(prior.result.kind.clone(), NO_PAYLOAD_MESSAGE, Vec::new());
                        kept.repairs += 1;
                        self.record_block(&kept);
                        still_invalid.push(kept);
                    }
                    for (offset, block) in attempt.blocks.iter().enumerate() {
                        let index = if offset == 0 {
                            prior.index
                        } else {
                            next_index += 1;
                            next_index - 1
                        };
                        let mut report = check_block(block, index, attempts, Some(&prior));
                        report.repairs = prior.repairs + 1;
                        self.record_block(&report);
                        if report.result.valid {
                            valid.push(report);
                        } else {
                            still_invalid.push(report);
                        }
                    }
                    history.push(attempt);
                }
                pending = still_invalid;
            }

            if !needs_conversion && pending.is_empty() {
                break RepairOutcome::AllValid;
            }
            if attempts >= budget {
                break RepairOutcome::BudgetExhausted;
            }
            self.transition(RepairState::NeedsRepair, attempts);
        };

        valid.sort_by_key(|block| block.index);
        pending.sort_by_key(|block| block.index);
        self.transition(outcome.state(), attempts);
        info!(
            outcome = outcome.as_str(),
            attempts,
            valid = valid.len(),
            invalid = pending.len(),
            "repair loop finished"
        );
        let messages: Vec<&str> = pending
            .iter()
            .map(|block| block.result.message.as_str())
            .collect();
        self.emit(
            "repair_finished",
            json!({
                "outcome": outcome.as_str(),
                "attempts": attempts,
                "valid": valid.len(),
                "invalid": pending.len(),
                "messages": messages,
            }),
        );
        Ok(RepairReport {
            outcome,
            attempts,
            valid,
            invalid: pending,
            history,
        })
    }

    fn transition(&self, state: RepairState, attempt: u32) {
        debug!(state = state.as_str(), attempt, "repair state");
    }

    fn record_attempt(&self, attempt: &ConversionAttempt) {
        self.emit(
            "conversion_attempt",
            json!({
                "attempt": attempt.number,
                "mode": attempt.input.mode(),
                "blocks": attempt.blocks.len(),
                "response_chars": attempt.raw_response.chars().count(),
            }),
        );
    }

    fn record_block(&self, block: &BlockReport) {
        debug!(
            attempt = block.attempt,
            index = block.index,
            kind = block.kind().map(ResourceKind::as_str).unwrap_or("unknown"),
            valid = block.result.valid,
            "block validated"
        );
        self.emit(
            "block_validated",
            json!({
                "attempt": block.attempt,
                "index": block.index,
                "kind": block.kind().map(|kind| kind.as_str().to_string()),
                "valid": block.result.valid,
                "message": block.result.message,
                "diff": block.diff,
            }),
        );
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let Some(events) = self.events else {
            return;
        };
        if let Err(err) = events.emit_json(event_type, payload) {
            warn!(event_type, error = %err, "failed to write run event");
        }
    }
}

fn check_block(
    block: &JsonBlock,
    index: usize,
    attempt: u32,
    prior: Option<&BlockReport>,
) -> BlockReport {
    let payload = block.source.trim().to_string();
    let diff = prior.and_then(|prior| payload_diff(&prior.payload, &payload));
    let result = match &block.parsed {
        Ok(value) => validate_value(value),
        Err(err) => ValidationResult::invalid(
            None,
            format!("Error: payload is not valid JSON ({err})."),
            Vec::new(),
        ),
    };
    BlockReport {
        index,
        payload,
        value: block.value().cloned(),
        result,
        attempt,
        repairs: 0,
        diff,
    }
}
