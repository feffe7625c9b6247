// Order intents, their execution state machines and the working-order registry
pub mod callback;
pub mod chaser;
pub mod iceberg;
pub mod registry;
pub mod request;
pub mod sizing;

pub use callback::{CallbackMode, OrderCallback};
pub use chaser::{ChaserAction, ChaserPhase, ChaserStats, LimitChaser};
pub use iceberg::{IcebergAction, IcebergOrder};
pub use registry::{Dispatch, OrderHandler, OrderRegistry, TrackedOrder};
pub use request::{
    Amendment, OrderKind, OrderRequest, TriggerDirection, WorkingOrder, DEFAULT_RETRY_MAKER,
};
pub use sizing::{entry_qty, pyramiding_qty};
