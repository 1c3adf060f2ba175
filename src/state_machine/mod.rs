mod item;
mod state;

pub use item::{
    Artifacts, DocumentKind, FailureKind, GeneratedDocument, MatchAnalysis, ProcessingMeta,
    WorkItem,
};
pub use state::{
    ApplicationStatus, StageOutcome, StateMachine, TerminalOutcome, Transition, TransitionError,
};
