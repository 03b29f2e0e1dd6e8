use std::sync::Mutex;

use tokio::sync::oneshot;

/// Caller-side half of the cooperative cancellation pair.
///
/// The handle is created when an attempt enters `Requesting` and becomes inert
/// once the attempt reaches any terminal state (the driver drops its receiver
/// there). Cancelling an already-terminal attempt is a no-op.
#[derive(Debug)]
pub struct CancelHandle {
    sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl CancelHandle {
    pub fn new_pair() -> (Self, CancelSignal) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(sender)),
            },
            CancelSignal {
                receiver: Some(receiver),
            },
        )
    }

    /// Fires the abort signal. Returns false when the signal was already sent
    /// or the attempt is already terminal; never panics.
    pub fn cancel(&self) -> bool {
        let Ok(mut slot) = self.sender.lock() else {
            return false;
        };
        slot.take().map(|tx| tx.send(()).is_ok()).unwrap_or(false)
    }
}

/// Driver-side half, selected against every suspension point.
///
/// The receiver is fused: once it has resolved, in either direction, it is
/// dropped and every later poll pends forever. A dropped handle must behave
/// like a cancel that never comes, across any number of select iterations.
#[derive(Debug)]
pub struct CancelSignal {
    receiver: Option<oneshot::Receiver<()>>,
}

impl CancelSignal {
    /// Resolves when cancellation fires; pends forever if the handle was
    /// dropped without cancelling, and after the signal has fired once.
    pub async fn cancelled(&mut self) {
        if let Some(receiver) = self.receiver.as_mut() {
            let fired = receiver.await.is_ok();
            self.receiver = None;
            if fired {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}
