//! Following a build's event log.

use futures::{Stream, StreamExt};
use skyway_core::build::Build;
use skyway_core::events::{EventKey, StoredEvent};
use skyway_core::ports::{EventStore, NotificationBus, NotificationStream};
use skyway_core::{Error, Result, channels};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Events to skip from the start of the log.
    pub offset: usize,
    pub page_size: usize,
    /// Re-read even without a notification, in case one was missed.
    pub poll_interval: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            page_size: 100,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl SubscribeOptions {
    pub fn from_offset(offset: usize) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }
}

/// Start following `build`. The notification channel is joined before the
/// first read so nothing appended in between is missed.
pub async fn subscribe(
    store: Arc<dyn EventStore>,
    bus: Arc<dyn NotificationBus>,
    build: Build,
    options: SubscribeOptions,
) -> Result<EventStream> {
    let notifications = bus.listen(&channels::build_events(build.id)).await?;
    debug!(build_id = %build.id, offset = options.offset, "Subscribed to build events");

    Ok(EventStream {
        store,
        build,
        cursor: None,
        skip: options.offset,
        page_size: options.page_size.max(1),
        poll_interval: options.poll_interval,
        buffer: VecDeque::new(),
        notifications: Some(notifications),
        closed: CancellationToken::new(),
    })
}

/// A cursor over one build's events.
pub struct EventStream {
    store: Arc<dyn EventStore>,
    build: Build,
    cursor: Option<EventKey>,
    skip: usize,
    page_size: usize,
    poll_interval: Duration,
    buffer: VecDeque<StoredEvent>,
    notifications: Option<NotificationStream>,
    closed: CancellationToken,
}

impl EventStream {
    /// Wait for the next event.
    ///
    /// Fails with [`Error::EndOfStream`] once the build is finalized (or
    /// reaped) and everything has been read, and with
    /// [`Error::StreamClosed`] after [`close`](Self::close).
    pub async fn next(&mut self) -> Result<StoredEvent> {
        loop {
            if self.closed.is_cancelled() {
                return Err(Error::StreamClosed);
            }
            if let Some(event) = self.buffer.pop_front() {
                return Ok(event);
            }

            let page = self
                .store
                .get(&self.build, self.cursor.as_ref(), self.page_size)
                .await?;
            let read = page.events.len();
            if let Some(next) = page.next {
                self.cursor = Some(next);
            }

            let skipped = self.skip.min(read);
            self.skip -= skipped;
            self.buffer.extend(page.events.into_iter().skip(skipped));

            if read > 0 {
                continue;
            }
            if page.finalized {
                return Err(Error::EndOfStream);
            }
            self.wait().await?;
        }
    }

    async fn wait(&mut self) -> Result<()> {
        let poll = tokio::time::sleep(self.poll_interval);
        let ended = match &mut self.notifications {
            Some(notifications) => tokio::select! {
                _ = self.closed.cancelled() => return Err(Error::StreamClosed),
                signal = notifications.next() => signal.is_none(),
                _ = poll => false,
            },
            None => tokio::select! {
                _ = self.closed.cancelled() => return Err(Error::StreamClosed),
                _ = poll => false,
            },
        };
        if ended {
            warn!(build_id = %self.build.id, "Event notifications ended, polling");
            self.notifications = None;
        }
        Ok(())
    }

    /// Stop the stream; a pending or later `next` fails with `StreamClosed`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// A handle that closes this stream from another task.
    pub fn closer(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn build(&self) -> &Build {
        &self.build
    }

    /// Adapt into a `Stream` that ends cleanly at end of stream or close.
    pub fn into_stream(self) -> impl Stream<Item = Result<StoredEvent>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.next().await {
                Ok(event) => Some((Ok(event), Some(stream))),
                Err(Error::EndOfStream | Error::StreamClosed) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use skyway_core::build::BuildStatus;
    use skyway_core::events::{Event, LogPayload, Origin};
    use skyway_core::ids::*;
    use skyway_db::MemoryStore;

    fn build(id: i64) -> Build {
        Build {
            id: BuildId::new(id),
            name: id.to_string(),
            status: BuildStatus::Started,
            scheduled: true,
            manually_triggered: false,
            inputs_determined: true,
            team_id: TeamId::new(1),
            pipeline_id: Some(PipelineId::new(1)),
            job_id: None,
            rerun_of: None,
            rerun_number: 0,
            private_plan: None,
            public_plan: None,
            abort_requested: false,
            interceptible: true,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            reap_time: None,
        }
    }

    fn log(text: &str) -> Event {
        Event::Log(LogPayload {
            origin: Origin::stdout(PlanId::new("1")),
            time: Utc::now(),
            payload: text.to_string(),
        })
    }

    fn payload(event: &StoredEvent) -> String {
        match event.event().unwrap() {
            Event::Log(log) => log.payload,
            other => panic!("expected a log event, got {other:?}"),
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Build) {
        let store = Arc::new(MemoryStore::new());
        let build = build(7);
        store.initialize(&build).await.unwrap();
        (store, build)
    }

    #[tokio::test]
    async fn test_wakes_on_append() {
        let (store, build) = setup().await;
        let mut stream = subscribe(store.clone(), store.bus(), build.clone(), SubscribeOptions::default())
            .await
            .unwrap();

        let writer = store.clone();
        let target = build.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.put(&target, vec![log("a")]).await.unwrap();
        });

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_id, 0);
        assert_eq!(payload(&event), "a");
    }

    #[tokio::test]
    async fn test_offset_skips_earlier_events() {
        let (store, build) = setup().await;
        store.put(&build, vec![log("a"), log("b"), log("c")]).await.unwrap();

        let mut stream = subscribe(store.clone(), store.bus(), build.clone(), SubscribeOptions::from_offset(1))
            .await
            .unwrap();
        assert_eq!(payload(&stream.next().await.unwrap()), "b");
        assert_eq!(payload(&stream.next().await.unwrap()), "c");
    }

    #[tokio::test]
    async fn test_offset_beyond_current_log() {
        let (store, build) = setup().await;
        store.put(&build, vec![log("a")]).await.unwrap();

        let options = SubscribeOptions {
            offset: 2,
            page_size: 1,
            ..SubscribeOptions::default()
        };
        let mut stream = subscribe(store.clone(), store.bus(), build.clone(), options).await.unwrap();
        store.put(&build, vec![log("b"), log("c")]).await.unwrap();

        let event = stream.next().await.unwrap();
        assert_eq!(event.event_id, 2);
        assert_eq!(payload(&event), "c");
    }

    #[tokio::test]
    async fn test_end_of_stream_after_finalize() {
        let (store, build) = setup().await;
        store.put(&build, vec![log("a")]).await.unwrap();
        store.finalize(&build).await.unwrap();

        let mut stream = subscribe(store.clone(), store.bus(), build.clone(), SubscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(payload(&stream.next().await.unwrap()), "a");
        assert!(matches!(stream.next().await, Err(Error::EndOfStream)));
    }

    #[tokio::test]
    async fn test_end_of_stream_after_reap() {
        let (store, build) = setup().await;
        store.put(&build, vec![log("a")]).await.unwrap();
        store.finalize(&build).await.unwrap();
        store.delete(std::slice::from_ref(&build)).await.unwrap();

        let mut stream = subscribe(store.clone(), store.bus(), build, SubscribeOptions::default())
            .await
            .unwrap();
        assert!(matches!(stream.next().await, Err(Error::EndOfStream)));
    }

    #[tokio::test]
    async fn test_close_interrupts_waiting_reader() {
        let (store, build) = setup().await;
        let mut stream = subscribe(store.clone(), store.bus(), build, SubscribeOptions::default())
            .await
            .unwrap();

        let closer = stream.closer();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.cancel();
        });

        assert!(matches!(stream.next().await, Err(Error::StreamClosed)));
        assert!(matches!(stream.next().await, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn test_into_stream_collects_until_finalized() {
        let (store, build) = setup().await;
        store.put(&build, vec![log("a"), log("b")]).await.unwrap();
        store.finalize(&build).await.unwrap();

        let stream = subscribe(store.clone(), store.bus(), build, SubscribeOptions::default())
            .await
            .unwrap();
        let events: Vec<_> = stream.into_stream().collect().await;
        let texts: Vec<String> = events.iter().map(|e| payload(e.as_ref().unwrap())).collect();
        assert_eq!(texts, vec!["a".to_string(), "b".to_string()]);
    }
}
