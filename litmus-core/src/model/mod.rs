//! Data model shared by the engine and the stores

mod result;
mod run;
mod template;

pub use result::{
    ConversationTurn, EvaluationResult, ExchangeRecord, RequestPhase, ResolutionWarning,
    ResultStatus, TestCaseResult, Transcript,
};
pub use run::{Progress, Run, RunStatus};
pub use template::{EvaluationType, Template, TemplateKind, Unit};
