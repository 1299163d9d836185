use std::{borrow::BorrowMut, sync::Arc};

use tokio::sync::broadcast::{Receiver, Sender};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct StopHandle {
    sender: Sender<()>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        Self {
            sender: tokio::sync::broadcast::channel(1).0,
        }
    }

    pub fn stop(&self) {
        if let Err(e) = self.sender.send(()) {
            // Will fail if nobody is listening for a stop signal, in which case the log message
            // can be ignored.
            log::debug!("Failed to send stop signal: {e:?}");
        }
    }

    pub fn new_listener(&self) -> DelegatedStopListener {
        DelegatedStopListener::new(self.sender.subscribe())
    }
}

#[derive(Clone, Debug)]
pub struct DelegatedStopListener {
    receiver: Arc<Mutex<Receiver<()>>>,
}

impl DelegatedStopListener {
    pub(crate) fn new(receiver: Receiver<()>) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Point in time check if the stop signal has been received. If this returns true then work
    /// should be wound down so that the run can come to an end.
    pub fn should_stop(&mut self) -> bool {
        match self.receiver.try_lock() {
            Ok(mut guard) => {
                match guard.try_recv() {
                    Ok(_) => true,
                    Err(tokio::sync::broadcast::error::TryRecvError::Closed) => true,
                    // If the receiver is empty or lagged then we should not stop.
                    Err(_) => false,
                }
            }
            Err(_) => false,
        }
    }

    /// Wait for the stop signal to be received. It is safe to race this with another future so
    /// that the stop signal can be used to cancel other work in progress.
    pub async fn wait_for_stop(&mut self) {
        if self.receiver.borrow_mut().lock().await.recv().await.is_err() {
            // The sender going away without a signal means nothing further will arrive, treat it
            // the same as receiving the signal.
            log::warn!("Stop channel closed before a signal was sent");
        }
    }
}

#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct StopSignalError {
    msg: String,
}

impl Default for StopSignalError {
    fn default() -> Self {
        Self {
            msg: "Execution cancelled by stop signal".to_string(),
        }
    }
}
