//! Start records and the thread trampoline.
//!
//! The creator builds a [`StartRecord`] (identity, start closure, result
//! packet) and hands it to the new thread over a zero-capacity channel. The
//! send completes only when the new thread has received the record into its
//! own storage, so the creator can return immediately afterwards. If the new
//! thread terminates without receiving it, the send fails and hands the
//! record back.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

use super::{Outcome, Packet, Substrate};
use crate::thread::{self, ThreadId};

/// Everything a new thread needs to start.
pub struct StartRecord {
    id: ThreadId,
    start: Box<dyn FnOnce() -> i32 + Send>,
    packet: Arc<Packet>,
}

impl StartRecord {
    pub(crate) fn new(id: ThreadId, start: Box<dyn FnOnce() -> i32 + Send>) -> Self {
        Self {
            id,
            start,
            packet: Arc::new(Packet::default()),
        }
    }

    pub(crate) fn id(&self) -> ThreadId {
        self.id
    }

    pub(crate) fn packet(&self) -> Arc<Packet> {
        Arc::clone(&self.packet)
    }
}

impl std::fmt::Debug for StartRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartRecord").field("id", &self.id).finish()
    }
}

/// Unwind payload carried by `thread::exit`.
pub(crate) struct ExitRequest(pub i32);

/// Creator side of the handshake.
pub(crate) struct Handoff(SyncSender<StartRecord>);

/// Spawned-thread side of the handshake.
pub(crate) struct Pickup(Receiver<StartRecord>);

pub(crate) fn handshake() -> (Handoff, Pickup) {
    let (tx, rx) = sync_channel(0);
    (Handoff(tx), Pickup(rx))
}

impl Handoff {
    /// Block until the new thread has taken `record`. Gives the record back
    /// if the thread terminated first.
    pub(crate) fn deliver(self, record: StartRecord) -> Result<(), StartRecord> {
        self.0.send(record).map_err(|err| err.0)
    }
}

impl Pickup {
    /// Take the record and run it. Called first thing on the new thread.
    pub(crate) fn run<S: Substrate>(self) {
        let Ok(record) = self.0.recv() else {
            return;
        };
        drop(self);
        run_record::<S>(record);
    }
}

fn run_record<S: Substrate>(record: StartRecord) {
    let StartRecord { id, start, packet } = record;
    thread::adopt_id(id);
    let outcome = match catch_unwind(AssertUnwindSafe(start)) {
        Ok(code) => Outcome::Exited(code),
        Err(payload) => match payload.downcast::<ExitRequest>() {
            Ok(exit) => Outcome::Exited(exit.0),
            Err(_) => Outcome::Panicked,
        },
    };
    S::run_exit_destructors();
    packet.finish(outcome);
}
