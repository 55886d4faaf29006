//! Front-end and back-end state machines and the varprint protocol
//! (spec.md §4.5).

pub mod backend;
pub mod frontend;
pub mod varobj;

pub use backend::{Backend, BackendError, BackendPhase, BackendStep, VarprintOutcome};
pub use frontend::{Frontend, FrontendPhase, History, HistoryEntry, PrintedLine, RankSpecError};
pub use varobj::{DisplayHint, VarObj, VarObjTable, VarprintError, VarprintLimits, VarprintSession};
