use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{MemberData, RoomData};

pub type ChangeSender = UnboundedSender<ChangeEvent>;

/// A change to a single row.
///
/// Deletes never carry the prior values of the row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange<T> {
    Insert(T),
    Update(T),
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Room(RowChange<RoomData>),
    Member(RowChange<MemberData>),
}

/// The stream of changes for one room subscription.
pub struct ChangeFeed {
    receiver: UnboundedReceiver<ChangeEvent>,
}

impl ChangeFeed {
    /// Creates a feed along with the sender a store pushes changes into.
    pub fn channel() -> (ChangeSender, Self) {
        let (sender, receiver) = unbounded_channel();
        (sender, Self { receiver })
    }

    /// Waits for the next change. Returns `None` once the store stops publishing.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Returns the next change if one is already waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}
