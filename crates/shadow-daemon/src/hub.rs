use std::collections::HashMap;
use std::sync::Mutex;

use shadow_core::{Part, VariantId};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::HubError;

const CHANNEL_CAPACITY: usize = 1024;

/// What a subscriber actually receives. `Lagged` is the `lag` event — the
/// bounded channel dropped parts before the subscriber could keep up; the
/// subscriber is expected to treat this as "some history was lost, resync
/// via a fresh `get-chat-history` round-trip."
#[derive(Debug, Clone)]
pub enum HubMessage {
    Part { cursor: u64, part: Part },
    Lagged,
}

struct ActiveRun {
    run_id: Uuid,
    buffer: Vec<(u64, Part)>,
    next_cursor: u64,
    sender: broadcast::Sender<HubMessage>,
    cancel: CancellationToken,
    completed: bool,
}

/// Durable per-variant fan-out: one active run, many subscribers, a replay
/// buffer so a late joiner's `subscribe(sinceCursor)` never has a gap. Uses
/// `broadcast` rather than `mpsc` because many concurrent subscribers need
/// their own cursor into the same stream.
pub struct SessionHub {
    runs: Mutex<HashMap<VariantId, ActiveRun>>,
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHub {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a fresh run for `variant_id`, replacing any prior (already
    /// terminal) run's buffer. Returns the cancellation token the
    /// Orchestrator's `stopStream` path should cancel and the run id new
    /// subscribers can key off of.
    pub fn start_run(&self, variant_id: VariantId) -> (Uuid, CancellationToken) {
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);

        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            variant_id,
            ActiveRun {
                run_id,
                buffer: Vec::new(),
                next_cursor: 0,
                sender,
                cancel: cancel.clone(),
                completed: false,
            },
        );
        (run_id, cancel)
    }

    /// Appends `part` to the run's replay buffer and forwards it to every
    /// current subscriber. A full subscriber channel degrades to `Lagged`
    /// for that subscriber on its next receive rather than blocking this
    /// call — publish must never stall on a slow consumer.
    pub fn publish(&self, variant_id: VariantId, part: Part) -> Result<u64, HubError> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(&variant_id)
            .ok_or_else(|| HubError::NoActiveRun(variant_id.to_string()))?;

        let cursor = run.next_cursor;
        run.next_cursor += 1;
        run.buffer.push((cursor, part.clone()));
        let _ = run.sender.send(HubMessage::Part { cursor, part });
        Ok(cursor)
    }

    /// Replays buffered parts strictly after `since_cursor` (or the whole
    /// buffer if `None`), then returns a live receiver for everything
    /// published after the snapshot was taken.
    pub fn subscribe(
        &self,
        variant_id: VariantId,
        since_cursor: Option<u64>,
    ) -> Result<(Vec<(u64, Part)>, broadcast::Receiver<HubMessage>), HubError> {
        let runs = self.runs.lock().unwrap();
        let run = runs
            .get(&variant_id)
            .ok_or_else(|| HubError::NoActiveRun(variant_id.to_string()))?;

        let backlog = run
            .buffer
            .iter()
            .filter(|(cursor, _)| since_cursor.map(|since| *cursor > since).unwrap_or(true))
            .cloned()
            .collect();

        Ok((backlog, run.sender.subscribe()))
    }

    /// Signals the run's `CancellationToken` — the Orchestrator's turn loop
    /// observes it between provider events and during tool execution.
    pub fn cancel(&self, variant_id: VariantId) -> Result<(), HubError> {
        let runs = self.runs.lock().unwrap();
        let run = runs
            .get(&variant_id)
            .ok_or_else(|| HubError::NoActiveRun(variant_id.to_string()))?;
        run.cancel.cancel();
        Ok(())
    }

    /// Marks the run complete. The buffer itself is retained (late joiners
    /// after completion still see the full recorded sequence per spec §7's
    /// "late subscribers receive the recorded sequence plus the terminal
    /// marker") until the next `start_run` for this variant replaces it.
    pub fn finish_run(&self, variant_id: VariantId) {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.get_mut(&variant_id) {
            run.completed = true;
        }
    }

    pub fn current_run_id(&self, variant_id: VariantId) -> Option<Uuid> {
        self.runs.lock().unwrap().get(&variant_id).map(|r| r.run_id)
    }

    pub fn is_completed(&self, variant_id: VariantId) -> bool {
        self.runs
            .lock()
            .unwrap()
            .get(&variant_id)
            .map(|r| r.completed)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadow_core::parts::FinishReason;
    use shadow_core::Usage;

    #[test]
    fn late_joiner_replays_only_parts_after_its_cursor() {
        let hub = SessionHub::new();
        let variant = VariantId::new();
        hub.start_run(variant);

        hub.publish(variant, Part::TextDelta { text: "a".into() }).unwrap();
        let cursor_after_a = 0;
        hub.publish(variant, Part::TextDelta { text: "b".into() }).unwrap();

        let (backlog, _rx) = hub.subscribe(variant, Some(cursor_after_a)).unwrap();
        assert_eq!(backlog.len(), 1);
        assert!(matches!(&backlog[0].1, Part::TextDelta { text } if text == "b"));
    }

    #[test]
    fn subscribe_with_no_cursor_replays_everything() {
        let hub = SessionHub::new();
        let variant = VariantId::new();
        hub.start_run(variant);
        hub.publish(variant, Part::TextDelta { text: "a".into() }).unwrap();
        hub.publish(variant, Part::TextDelta { text: "b".into() }).unwrap();

        let (backlog, _rx) = hub.subscribe(variant, None).unwrap();
        assert_eq!(backlog.len(), 2);
    }

    #[test]
    fn cancel_without_active_run_errors() {
        let hub = SessionHub::new();
        let err = hub.cancel(VariantId::new()).unwrap_err();
        assert!(matches!(err, HubError::NoActiveRun(_)));
    }

    #[test]
    fn cancel_signals_the_run_token() {
        let hub = SessionHub::new();
        let variant = VariantId::new();
        let (_, cancel) = hub.start_run(variant);
        assert!(!cancel.is_cancelled());
        hub.cancel(variant).unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn live_subscriber_receives_parts_published_after_subscribe() {
        let hub = SessionHub::new();
        let variant = VariantId::new();
        hub.start_run(variant);
        let (_, mut rx) = hub.subscribe(variant, None).unwrap();

        hub.publish(
            variant,
            Part::Finish {
                reason: FinishReason::Stop,
                usage: Usage::default(),
            },
        )
        .unwrap();

        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, HubMessage::Part { part: Part::Finish { .. }, .. }));
    }
}
