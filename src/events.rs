//! # Events that the core reports to the hosting UI layer.

use async_channel::{self as channel, Receiver, Sender, TrySendError};

use crate::keyring::KeyringId;

/// Event channel.
#[derive(Debug, Clone)]
pub struct Events {
    receiver: Receiver<EventType>,
    sender: Sender<EventType>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    /// Creates a new event channel.
    pub fn new() -> Self {
        let (sender, receiver) = channel::bounded(1_000);
        Self { receiver, sender }
    }

    /// Emits an event into the event channel.
    ///
    /// When the channel is full, the oldest event is dropped to make room.
    /// Events are informational; losing the oldest one is preferable to
    /// blocking the caller.
    pub fn emit(&self, event: EventType) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let _ = self.receiver.try_recv();
                self.emit(event);
            }
            Err(TrySendError::Closed(_)) => {
                unreachable!("unable to emit event, channel disconnected");
            }
        }
    }

    /// Creates an event emitter for the hosting layer.
    pub fn get_emitter(&self) -> EventEmitter {
        EventEmitter(self.receiver.clone())
    }
}

/// A receiver of events from a [`crate::Context`].
#[derive(Debug, Clone)]
pub struct EventEmitter(Receiver<EventType>);

impl EventEmitter {
    /// Async recv of an event. Return `None` if the `Sender` has been dropped.
    pub async fn recv(&self) -> Option<EventType> {
        self.0.recv().await.ok()
    }

    /// Tries to receive an event without blocking.
    pub fn try_recv(&self) -> Option<EventType> {
        self.0.try_recv().ok()
    }
}

/// The event being reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    /// The library-user may write an informational string to the log.
    ///
    /// This event should not be reported to the end-user using a popup or
    /// something like that.
    Info(String),

    /// The library-user should write a warning string to the log.
    Warning(String),

    /// The library-user should report an error to the end-user.
    ///
    /// As most things are asynchronous, things may go wrong at any time and
    /// the user should not be disturbed by a dialog. Instead, use a bubble
    /// or so.
    Error(String),

    /// Keys of a keyring were added, updated or removed, or the keyring
    /// itself was created or deleted. The UI should refresh key listings.
    KeyringModified(KeyringId),

    /// A sync cycle for the given keyring started (`syncing: true`) or
    /// finished (`syncing: false`).
    SyncStateChanged {
        /// The keyring being synchronized.
        id: KeyringId,
        /// Whether a cycle is currently running.
        syncing: bool,
    },
}
