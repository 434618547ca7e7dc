use tokio::sync::broadcast::{error::TryRecvError, Receiver};
use typing_sync_client::{
    accounts::TypingSession,
    store::{LayerViews, StoreEvent},
    DelegationStatus, Layer,
};

/// Drains `events` and returns the status transitions in order.
pub fn drain_status_changes(
    events: &mut Receiver<StoreEvent>,
) -> Vec<(DelegationStatus, DelegationStatus)> {
    let mut changes = Vec::new();
    loop {
        match events.try_recv() {
            Ok(StoreEvent::StatusChanged { from, to, .. }) => changes.push((from, to)),
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return changes,
        }
    }
}

pub fn assert_tally(session: &TypingSession, words_typed: u32, correct_words: u32, errors: u32) {
    assert_eq!(
        (session.words_typed, session.correct_words, session.errors),
        (words_typed, correct_words, errors),
        "unexpected tally for session of {}",
        session.player
    );
    assert!(session.is_consistent());
}

pub fn session_view(views: &LayerViews, layer: Layer) -> Option<TypingSession> {
    views.get(layer).and_then(|account| account.as_session()).cloned()
}
