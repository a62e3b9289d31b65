#![forbid(unsafe_code)]

// Append-only buffer of envelopes received by one simulated client.

use crate::protocol::ServerMessage;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Receipt-ordered message buffer with arrival notification.
///
/// The client's listen task is the only writer. Readers scan under a short
/// lock and may park on `arrivals` until the writer appends again.
#[derive(Default)]
pub struct Inbox {
    messages: Mutex<Vec<ServerMessage>>,
    arrivals: Notify,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, msg: ServerMessage) {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).push(msg);
        self.arrivals.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of everything received so far, in arrival order.
    pub fn snapshot(&self) -> Vec<ServerMessage> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// True if any buffered message satisfies `pred`.
    pub fn contains<F>(&self, pred: F) -> bool
    where
        F: Fn(&ServerMessage) -> bool,
    {
        let messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        messages.iter().any(pred)
    }

    /// Scans messages appended since `*cursor`, advancing the cursor.
    fn scan_from<F>(&self, cursor: &mut usize, pred: &F) -> bool
    where
        F: Fn(&ServerMessage) -> bool,
    {
        let messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        let start = (*cursor).min(messages.len());
        let found = messages[start..].iter().any(pred);
        *cursor = messages.len();
        found
    }

    /// Waits up to `window` for a message matching `pred`, including messages
    /// already buffered.
    ///
    /// Woken by each append; `poll_interval` bounds how long a single park may
    /// last so a missed wake-up costs at most one interval.
    pub async fn wait_for<F>(&self, pred: F, window: Duration, poll_interval: Duration) -> bool
    where
        F: Fn(&ServerMessage) -> bool,
    {
        let deadline = Instant::now() + window;
        let mut cursor = 0;

        loop {
            // Register interest before scanning so an append between the scan
            // and the park is not lost.
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.scan_from(&mut cursor, &pred) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let nap = poll_interval.min(deadline - now);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Waits for a `chat` envelope whose content contains `marker`.
    pub async fn wait_for_chat(&self, marker: &str, window: Duration, poll_interval: Duration) -> bool {
        self.wait_for(
            |msg| msg.chat_content().is_some_and(|content| content.contains(marker)),
            window,
            poll_interval,
        )
        .await
    }
}
