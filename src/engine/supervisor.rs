use crate::exchange::StreamKind;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct StreamHealth {
    timeout: Duration,
    last_seen: Instant,
}

/// Per-stream liveness. A stream that has been silent longer than its timeout is
/// reported so only that stream gets reconnected.
#[derive(Debug, Clone)]
pub struct StreamSupervisor {
    streams: HashMap<StreamKind, StreamHealth>,
}

impl StreamSupervisor {
    pub fn new(public_timeout: Duration, private_timeout: Duration, now: Instant) -> Self {
        let mut streams = HashMap::new();
        streams.insert(
            StreamKind::Public,
            StreamHealth {
                timeout: public_timeout,
                last_seen: now,
            },
        );
        streams.insert(
            StreamKind::Private,
            StreamHealth {
                timeout: private_timeout,
                last_seen: now,
            },
        );
        Self { streams }
    }

    /// Any message (data or heartbeat) counts as a sign of life
    pub fn ping(&mut self, stream: StreamKind, now: Instant) {
        if let Some(health) = self.streams.get_mut(&stream) {
            health.last_seen = now;
        }
    }

    pub fn silence(&self, stream: StreamKind, now: Instant) -> Duration {
        self.streams
            .get(&stream)
            .map(|h| now.saturating_duration_since(h.last_seen))
            .unwrap_or_default()
    }

    /// Streams past their timeout, public first
    pub fn expired(&self, now: Instant) -> Vec<StreamKind> {
        [StreamKind::Public, StreamKind::Private]
            .into_iter()
            .filter(|stream| {
                self.streams
                    .get(stream)
                    .is_some_and(|h| now.saturating_duration_since(h.last_seen) > h.timeout)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streams_expire_independently() {
        let start = Instant::now();
        let mut supervisor =
            StreamSupervisor::new(Duration::from_secs(120), Duration::from_secs(60), start);

        assert!(supervisor.expired(start + Duration::from_secs(30)).is_empty());
        assert_eq!(
            supervisor.expired(start + Duration::from_secs(61)),
            vec![StreamKind::Private]
        );

        supervisor.ping(StreamKind::Private, start + Duration::from_secs(100));
        assert_eq!(
            supervisor.expired(start + Duration::from_secs(121)),
            vec![StreamKind::Public]
        );
        assert_eq!(
            supervisor.silence(StreamKind::Private, start + Duration::from_secs(121)),
            Duration::from_secs(21)
        );
    }
}
