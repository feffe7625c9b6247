use crate::backend::BackendCommand;
use crate::error::ExchangeError;
use crate::exchange::retry::{with_retry, RetryPolicy};
use crate::exchange::{ExchangeClient, ExchangeEvent};
use crate::models::OrderStatus;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Drains the live backend's command queue into the exchange client, one command at a time.
/// Failures come back as events so the engine sees them on its own queue.
pub struct CommandDispatcher {
    client: Arc<dyn ExchangeClient>,
    retry: RetryPolicy,
    events: mpsc::Sender<ExchangeEvent>,
}

impl CommandDispatcher {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        retry: RetryPolicy,
        events: mpsc::Sender<ExchangeEvent>,
    ) -> Self {
        Self {
            client,
            retry,
            events,
        }
    }

    /// Run until the command queue closes
    pub async fn run(self, mut commands: mpsc::Receiver<BackendCommand>) {
        while let Some(command) = commands.recv().await {
            if !self.execute(command).await {
                break;
            }
        }
        tracing::info!("Order dispatcher stopped");
    }

    /// Returns false once the engine side has gone away
    async fn execute(&self, command: BackendCommand) -> bool {
        match command {
            BackendCommand::Place(order) => {
                let client = self.client.as_ref();
                let pending = &order;
                match with_retry(&self.retry, move || client.place_order(pending)).await {
                    Ok(venue_id) => {
                        tracing::debug!("Order {} accepted as {}", order.client_id, venue_id);
                        true
                    }
                    Err(e) => {
                        tracing::error!(
                            "Order {} {} {} failed: {}",
                            order.client_id,
                            order.side,
                            order.qty,
                            e
                        );
                        let mut update = order.update(OrderStatus::Rejected, 0.0, 0.0, Utc::now());
                        update.reject_reason = Some(e.to_string());
                        let fatal = e.is_fatal();
                        self.emit(ExchangeEvent::Order(update)).await
                            && (!fatal || self.fatal(e).await)
                    }
                }
            }
            BackendCommand::Cancel(client_id) => {
                let client = self.client.as_ref();
                let id = client_id.as_str();
                let result = with_retry(&self.retry, move || client.cancel_order(id)).await;
                self.settle(&format!("cancel {}", client_id), result).await
            }
            BackendCommand::CancelAll => {
                let client = self.client.as_ref();
                let result = with_retry(&self.retry, move || client.cancel_all()).await;
                self.settle("cancel all", result).await
            }
            BackendCommand::Amend {
                client_id,
                amendment,
            } => {
                let client = self.client.as_ref();
                let (id, change) = (client_id.as_str(), &amendment);
                let result = with_retry(&self.retry, move || client.amend_order(id, change)).await;
                self.settle(&format!("amend {}", client_id), result).await
            }
        }
    }

    async fn settle(&self, what: &str, result: Result<(), ExchangeError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) if e.is_benign() => {
                tracing::info!("{}: {}", what, e);
                true
            }
            Err(e) if e.is_fatal() => {
                tracing::error!("{} failed: {}", what, e);
                self.fatal(e).await
            }
            Err(e) => {
                tracing::warn!("{} failed: {}", what, e);
                true
            }
        }
    }

    async fn fatal(&self, e: ExchangeError) -> bool {
        self.emit(ExchangeEvent::Fatal(e.to_string())).await
    }

    async fn emit(&self, event: ExchangeEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeResult, StreamKind};
    use crate::market::Timeframe;
    use crate::models::{Candle, PositionSnapshot, Side, TriggerBy};
    use crate::orders::{Amendment, OrderKind, WorkingOrder};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedClient {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExchangeClient for ScriptedClient {
        async fn place_order(&self, order: &WorkingOrder) -> ExchangeResult<String> {
            self.calls.lock().unwrap().push(format!("place {}", order.client_id));
            if order.client_id.starts_with("Bad") {
                Err(ExchangeError::Http {
                    status: 401,
                    message: "invalid api key".to_string(),
                })
            } else {
                Ok("venue-1".to_string())
            }
        }

        async fn cancel_order(&self, client_id: &str) -> ExchangeResult<()> {
            self.calls.lock().unwrap().push(format!("cancel {}", client_id));
            Err(ExchangeError::UnknownOrder(client_id.to_string()))
        }

        async fn cancel_all(&self) -> ExchangeResult<()> {
            self.calls.lock().unwrap().push("cancel_all".to_string());
            Ok(())
        }

        async fn amend_order(&self, client_id: &str, _amendment: &Amendment) -> ExchangeResult<()> {
            self.calls.lock().unwrap().push(format!("amend {}", client_id));
            Ok(())
        }

        async fn get_position(&self) -> ExchangeResult<PositionSnapshot> {
            Ok(PositionSnapshot::default())
        }

        async fn get_balance(&self) -> ExchangeResult<f64> {
            Ok(0.0)
        }

        async fn get_klines(
            &self,
            _timeframe: &Timeframe,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> ExchangeResult<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn subscribe(&self, _stream: StreamKind) -> ExchangeResult<mpsc::Receiver<ExchangeEvent>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    fn order(id: &str) -> WorkingOrder {
        WorkingOrder {
            client_id: id.to_string(),
            side: Side::Buy,
            qty: 1.0,
            kind: OrderKind::Market,
            reduce_only: false,
            trigger_by: TriggerBy::LastPrice,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_benign_cancel_and_fatal_place() {
        let client = Arc::new(ScriptedClient::default());
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let dispatcher = CommandDispatcher::new(client.clone(), RetryPolicy::no_retry(), event_tx);

        cmd_tx.send(BackendCommand::Place(order("Long_1"))).await.unwrap();
        cmd_tx.send(BackendCommand::Cancel("Long_1".to_string())).await.unwrap();
        cmd_tx.send(BackendCommand::Place(order("Bad_1"))).await.unwrap();
        drop(cmd_tx);
        dispatcher.run(cmd_rx).await;

        assert_eq!(
            *client.calls.lock().unwrap(),
            vec!["place Long_1", "cancel Long_1", "place Bad_1"]
        );

        let Some(ExchangeEvent::Order(rejected)) = event_rx.recv().await else {
            panic!("expected rejection");
        };
        assert_eq!(rejected.client_id, "Bad_1");
        assert_eq!(rejected.status, OrderStatus::Rejected);
        assert!(matches!(event_rx.recv().await, Some(ExchangeEvent::Fatal(_))));
        assert!(event_rx.recv().await.is_none());
    }
}
