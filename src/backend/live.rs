use crate::backend::{BackendKind, ExecutionBackend, MarketContext};
use crate::error::EngineError;
use crate::orders::{Amendment, WorkingOrder};
use crate::Result;
use tokio::sync::mpsc;

/// Instruction for the task that talks to the venue
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCommand {
    Place(WorkingOrder),
    Cancel(String),
    CancelAll,
    Amend {
        client_id: String,
        amendment: Amendment,
    },
}

/// Queues orders for the exchange dispatcher. Updates come back asynchronously
/// through the private stream, never from this type.
pub struct LiveBackend {
    commands: mpsc::Sender<BackendCommand>,
}

impl LiveBackend {
    pub fn new(commands: mpsc::Sender<BackendCommand>) -> Self {
        Self { commands }
    }

    /// Backend plus the receiving end for a `CommandDispatcher`
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BackendCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    fn send(&self, command: BackendCommand) -> Result<()> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(cmd) => {
                EngineError::Fatal(format!("order queue full, dropped {:?}", cmd))
            }
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::Fatal("order dispatcher has stopped".to_string())
            }
        })
    }
}

impl ExecutionBackend for LiveBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Live
    }

    fn submit(&mut self, order: WorkingOrder, _market: &MarketContext) -> Result<()> {
        tracing::debug!(
            "Queue order {} {} {} {:?}",
            order.client_id,
            order.side,
            order.qty,
            order.kind
        );
        self.send(BackendCommand::Place(order))
    }

    fn cancel(&mut self, client_id: &str) -> Result<()> {
        self.send(BackendCommand::Cancel(client_id.to_string()))
    }

    fn cancel_all(&mut self) -> Result<()> {
        self.send(BackendCommand::CancelAll)
    }

    fn amend(&mut self, client_id: &str, amendment: &Amendment) -> Result<()> {
        self.send(BackendCommand::Amend {
            client_id: client_id.to_string(),
            amendment: *amendment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_arrive_in_order() {
        let (mut backend, mut rx) = LiveBackend::channel(4);
        backend.cancel("Long_1").unwrap();
        backend.cancel_all().unwrap();

        assert_eq!(rx.recv().await, Some(BackendCommand::Cancel("Long_1".to_string())));
        assert_eq!(rx.recv().await, Some(BackendCommand::CancelAll));
    }

    #[test]
    fn test_full_queue_is_fatal() {
        let (mut backend, _rx) = LiveBackend::channel(1);
        backend.cancel_all().unwrap();
        let err = backend.cancel_all().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_closed_queue_is_fatal() {
        let (mut backend, rx) = LiveBackend::channel(1);
        drop(rx);
        assert!(backend.cancel("x").unwrap_err().is_fatal());
    }
}
