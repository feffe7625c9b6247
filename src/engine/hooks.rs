use crate::backend::BackendKind;
use crate::config::ExitFillModel;

/// A step run around the strategy callback on every base candle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Time and price of the new bar become the engine's "now"
    MarketSnapshot,
    /// Match resting simulated orders against the bar's range
    EvaluateRestingOrders,
    /// Threshold exits filled at their trigger price inside the bar
    IntrabarExit,
    /// Ratchet the trailing-stop price with the bar's range
    TrailRatchet,
    /// Top of book collapses onto the close when there is no real book
    SyncSimulatedBook,
    /// Remember whether this bar opened a position
    RecordEntry,
    ExitPolicy,
    Sltp,
    /// Release iceberg legs held back by their interval
    IcebergTimers,
}

/// Ordered hooks before and after the strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookPipeline {
    pub pre: Vec<Hook>,
    pub post: Vec<Hook>,
}

impl HookPipeline {
    pub fn for_backend(kind: BackendKind, exit_fill: ExitFillModel) -> Self {
        match kind {
            BackendKind::Simulated => {
                let mut pre = vec![Hook::MarketSnapshot, Hook::EvaluateRestingOrders];
                if exit_fill == ExitFillModel::TriggerPrice {
                    pre.push(Hook::IntrabarExit);
                }
                pre.extend([Hook::TrailRatchet, Hook::SyncSimulatedBook]);
                Self {
                    pre,
                    post: vec![
                        Hook::RecordEntry,
                        Hook::ExitPolicy,
                        Hook::Sltp,
                        Hook::IcebergTimers,
                    ],
                }
            }
            BackendKind::Live => Self {
                pre: vec![Hook::MarketSnapshot, Hook::TrailRatchet],
                post: vec![Hook::RecordEntry, Hook::ExitPolicy, Hook::Sltp],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_pipeline_order() {
        let hooks = HookPipeline::for_backend(BackendKind::Simulated, ExitFillModel::TriggerPrice);
        assert_eq!(
            hooks.pre,
            vec![
                Hook::MarketSnapshot,
                Hook::EvaluateRestingOrders,
                Hook::IntrabarExit,
                Hook::TrailRatchet,
                Hook::SyncSimulatedBook
            ]
        );

        let hooks = HookPipeline::for_backend(BackendKind::Simulated, ExitFillModel::MarketPrice);
        assert!(!hooks.pre.contains(&Hook::IntrabarExit));
    }

    #[test]
    fn test_live_pipeline_never_simulates() {
        let hooks = HookPipeline::for_backend(BackendKind::Live, ExitFillModel::TriggerPrice);
        assert!(!hooks.pre.contains(&Hook::EvaluateRestingOrders));
        assert!(!hooks.pre.contains(&Hook::IntrabarExit));
        assert!(!hooks.post.contains(&Hook::IcebergTimers));
    }
}
