// Exit policies: fixed SL/TP, trailing stop, percentage SL/TP orders
pub mod evaluator;
pub mod policy;
pub mod trail;

pub use evaluator::{
    evaluate_exit, evaluate_intrabar, evaluate_sltp, ExitDecision, ExitReason, PositionView,
    SltpAction, STOP_LOSS_ID, TAKE_PROFIT_ID,
};
pub use policy::{ExitExecution, ExitPolicy, SltpPolicy};
pub use trail::{EntryHistory, TrailState, ENTRY_HISTORY_DEPTH};
