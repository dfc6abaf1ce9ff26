#![allow(dead_code)]

use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use streamkeeper::events::ControllerEvent;
use streamkeeper::store::MessageStore;
use streamkeeper::transport::{cancellable, ByteStream, OutboundRequest, ResponseTransport};
use streamkeeper::{
    ConversationId, MessageKey, ResponseMetadata, Result, StoredMessage, StreamKeeperError,
};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

pub fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Chunk(String),
    Pause(Duration),
    /// Connection dropped mid-body.
    Fail(String),
    /// Stays open without sending anything.
    Hang,
    /// Open itself fails.
    Refuse(String),
}

pub fn line(json: &str) -> Step {
    Step::Chunk(format!("{}\n", json))
}

/// Transport double that replays one script per `open`.
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<OutboundRequest>>,
    opens: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// `open` waits for the gate before returning the body.
    pub fn gated(scripts: Vec<Vec<Step>>, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(scripts)
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        guard(&self.requests).clone()
    }
}

impl ResponseTransport for ScriptedTransport {
    async fn open(
        &self,
        request: &OutboundRequest,
        cancel: CancellationToken,
    ) -> Result<ByteStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        guard(&self.requests).push(request.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let steps = guard(&self.scripts).pop_front().unwrap_or_default();
        if let Some(Step::Refuse(message)) = steps.first() {
            return Err(StreamKeeperError::Transport(message.clone()).into());
        }

        let body = futures_util::stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    Step::Chunk(text) => return Some((Ok(Bytes::from(text)), steps)),
                    Step::Pause(d) => tokio::time::sleep(d).await,
                    Step::Fail(message) => {
                        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, message);
                        return Some((Err(err), steps));
                    }
                    Step::Hang => std::future::pending::<()>().await,
                    Step::Refuse(_) => {}
                }
            }
        });
        Ok(cancellable(Box::pin(body), cancel))
    }
}

/// Store double. Each read pops the next scripted answer; once the script
/// runs out the last answer repeats.
pub struct MemoryStore {
    answers: Mutex<VecDeque<Option<StoredMessage>>>,
    last: Mutex<Option<StoredMessage>>,
    reads: AtomicUsize,
    writes: Mutex<Vec<(MessageKey, ResponseMetadata)>>,
}

impl MemoryStore {
    pub fn new(answers: Vec<Option<StoredMessage>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            last: Mutex::new(None),
            reads: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(MessageKey, ResponseMetadata)> {
        guard(&self.writes).clone()
    }
}

impl MessageStore for MemoryStore {
    async fn read_latest_assistant_record(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<Option<StoredMessage>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let next = guard(&self.answers).pop_front();
        match next {
            Some(answer) => {
                *guard(&self.last) = answer.clone();
                Ok(answer)
            }
            None => Ok(guard(&self.last).clone()),
        }
    }

    async fn write_metadata(
        &self,
        message_id: &MessageKey,
        metadata: &ResponseMetadata,
    ) -> Result<()> {
        guard(&self.writes).push((message_id.clone(), metadata.clone()));
        Ok(())
    }
}

/// A row as the backend writes it, after the request that produced it.
/// Scripted answers are built before `submit`, hence the offset.
pub fn stored(id: &str, content: &str) -> StoredMessage {
    StoredMessage {
        id: MessageKey::from(id),
        content: content.to_string(),
        metadata: ResponseMetadata::default(),
        created_at: Utc::now() + chrono::Duration::seconds(1),
        terminal_marker: None,
    }
}

pub fn drain(rx: &mut broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Waits for the first event matching `pred`.
pub async fn wait_for<F>(
    rx: &mut broadcast::Receiver<ControllerEvent>,
    mut pred: F,
) -> ControllerEvent
where
    F: FnMut(&ControllerEvent) -> bool,
{
    loop {
        match rx.recv().await {
            Ok(event) if pred(&event) => return event,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
        }
    }
}

pub async fn settle_spawned() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
