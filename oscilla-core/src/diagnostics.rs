//! Structured compiler/runtime diagnostics and their fix-it actions.
//!
//! A `Diagnostic` is plain data, never a `std::error::Error` — passes collect
//! them and return `Result<T, Vec<Diagnostic>>` (see `error` for the separate
//! channel reserved for genuine internal bugs).

use crate::address::CanonicalAddress;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warn,
    Info,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Domain {
    Authoring,
    Type,
    Schedule,
    Runtime,
}

/// Stable diagnostic codes. Kept as string constants rather than an enum so
/// that adding a new one is a one-line, append-only change and codes survive
/// round-tripping through JSON untouched.
pub mod codes {
    pub const E_TIME_ROOT_MISSING: &str = "E_TIME_ROOT_MISSING";
    pub const W_GRAPH_DISCONNECTED_BLOCK: &str = "W_GRAPH_DISCONNECTED_BLOCK";
    pub const E_TYPE_MISMATCH: &str = "E_TYPE_MISMATCH";
    pub const E_VARARG_TYPE_MISMATCH: &str = "E_VARARG_TYPE_MISMATCH";
    pub const E_VARARG_UNRESOLVED: &str = "E_VARARG_UNRESOLVED";
    pub const E_VARARG_COUNT: &str = "E_VARARG_COUNT";
    pub const E_UNRESOLVED_INSTANCE: &str = "E_UNRESOLVED_INSTANCE";
    pub const E_CYCLE_DETECTED: &str = "E_CYCLE_DETECTED";
    pub const E_DUPLICATE_CANONICAL_NAME: &str = "E_DUPLICATE_CANONICAL_NAME";
    pub const E_ADDRESS_INVALID: &str = "E_ADDRESS_INVALID";
    pub const E_ADDRESS_AMBIGUOUS: &str = "E_ADDRESS_AMBIGUOUS";
    pub const E_ADDRESS_UNKNOWN: &str = "E_ADDRESS_UNKNOWN";
    pub const E_EXPR_PARSE: &str = "E_EXPR_PARSE";
    pub const E_EXPR_UNDEFINED_IDENTIFIER: &str = "E_EXPR_UNDEFINED_IDENTIFIER";
    pub const E_EXPR_TYPE: &str = "E_EXPR_TYPE";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticMetadata {
    pub first_seen_at: u64,
    pub last_seen_at: u64,
    pub occurrence_count: u32,
}

impl Default for DiagnosticMetadata {
    fn default() -> Self {
        DiagnosticMetadata { first_seen_at: 0, last_seen_at: 0, occurrence_count: 1 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticScope {
    pub patch_revision: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DiagnosticAction {
    GoToTarget { target: CanonicalAddress },
    InsertBlock { block_type: String, position: Option<(f64, f64)> },
    RemoveBlock { block_id: CanonicalAddress },
    AddAdapter { from_port: CanonicalAddress, adapter_type: String },
    CreateTimeRoot { time_root_kind: String },
    MuteDiagnostic { id: String },
    OpenDocs { url: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub id: String,
    pub code: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub primary_target: CanonicalAddress,
    pub domain: Domain,
    pub scope: DiagnosticScope,
    pub metadata: DiagnosticMetadata,
    pub actions: Vec<DiagnosticAction>,
}

impl Diagnostic {
    pub fn error(
        code: &str,
        title: impl Into<String>,
        message: impl Into<String>,
        primary_target: CanonicalAddress,
        domain: Domain,
    ) -> Diagnostic {
        Diagnostic {
            id: format!("{}:{}", code, primary_target),
            code: code.to_string(),
            severity: Severity::Error,
            title: title.into(),
            message: message.into(),
            primary_target,
            domain,
            scope: DiagnosticScope { patch_revision: 0 },
            metadata: DiagnosticMetadata::default(),
            actions: Vec::new(),
        }
    }

    pub fn warn(
        code: &str,
        title: impl Into<String>,
        message: impl Into<String>,
        primary_target: CanonicalAddress,
        domain: Domain,
    ) -> Diagnostic {
        let mut d = Diagnostic::error(code, title, message, primary_target, domain);
        d.severity = Severity::Warn;
        d
    }

    pub fn with_action(mut self, action: DiagnosticAction) -> Diagnostic {
        self.actions.push(action);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Splits a pass's collected diagnostics into (errors block compilation,
/// warnings do not).
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

/// Result of dispatching a `DiagnosticAction`. Actions are pure with respect
/// to diagnostics: they mutate the patch but never themselves write
/// diagnostics — re-validation happens on the next compile.
pub struct ActionOutcome {
    pub success: bool,
    pub error: Option<String>,
}

/// Dependencies required to execute a fix-it action against a live patch.
/// `oscilla-core` does not own patch storage or an editing UI (both are
/// out-of-scope collaborators); this trait is the seam an embedder
/// implements to let `execute_action` actually mutate their patch.
pub trait PatchEditor {
    fn insert_block(&mut self, block_type: &str, position: Option<(f64, f64)>) -> Result<(), String>;
    fn remove_block(&mut self, block: &CanonicalAddress) -> Result<(), String>;
    fn add_adapter(&mut self, from_port: &CanonicalAddress, adapter_type: &str) -> Result<(), String>;
    fn create_time_root(&mut self, kind: &str) -> Result<(), String>;
    fn mute_diagnostic(&mut self, id: &str) -> Result<(), String>;
}

pub fn execute_action(action: &DiagnosticAction, deps: &mut dyn PatchEditor) -> ActionOutcome {
    let result = match action {
        DiagnosticAction::GoToTarget { .. } => Ok(()),
        DiagnosticAction::InsertBlock { block_type, position } => {
            deps.insert_block(block_type, *position)
        }
        DiagnosticAction::RemoveBlock { block_id } => deps.remove_block(block_id),
        DiagnosticAction::AddAdapter { from_port, adapter_type } => {
            deps.add_adapter(from_port, adapter_type)
        }
        DiagnosticAction::CreateTimeRoot { time_root_kind } => deps.create_time_root(time_root_kind),
        DiagnosticAction::MuteDiagnostic { id } => deps.mute_diagnostic(id),
        DiagnosticAction::OpenDocs { .. } => Ok(()),
    };

    match result {
        Ok(()) => ActionOutcome { success: true, error: None },
        Err(e) => ActionOutcome { success: false, error: Some(e) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_does_not_count_as_error() {
        let d = Diagnostic::warn(
            codes::W_GRAPH_DISCONNECTED_BLOCK,
            "disconnected",
            "block has no path to a sink",
            CanonicalAddress::Block { name: "foo".into() },
            Domain::Authoring,
        );
        assert!(!has_errors(&[d]));
    }

    #[test]
    fn error_counts_as_error() {
        let d = Diagnostic::error(
            codes::E_TIME_ROOT_MISSING,
            "missing time root",
            "no TimeRoot block reachable from any render sink",
            CanonicalAddress::Block { name: "root".into() },
            Domain::Authoring,
        );
        assert!(has_errors(&[d]));
    }
}
