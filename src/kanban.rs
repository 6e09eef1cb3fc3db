//! Board projection of a queue's chats. Derived on every read, never stored.

use serde::Serialize;

use crate::{
    directory::default_kanban_columns,
    types::{Chat, ChatStatus, ChatSummary, KanbanColumnConfig, Queue},
};

/// Anything that can sit on a board.
pub trait BoardCard {
    fn status(&self) -> ChatStatus;
}

impl BoardCard for Chat {
    fn status(&self) -> ChatStatus {
        self.status
    }
}

impl BoardCard for ChatSummary {
    fn status(&self) -> ChatStatus {
        self.status
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KanbanLane<C> {
    pub column: KanbanColumnConfig,
    pub chats: Vec<C>,
}

pub fn project<C: BoardCard + Clone>(queue: &Queue, chats: &[C]) -> Vec<KanbanLane<C>> {
    let columns = if queue.kanban_columns.is_empty() {
        default_kanban_columns()
    } else {
        queue.kanban_columns.clone()
    };

    columns
        .into_iter()
        .map(|column| {
            let chats = chats
                .iter()
                .filter(|chat| column.mapped_statuses.contains(&chat.status()))
                .cloned()
                .collect::<Vec<_>>();
            KanbanLane { column, chats }
        })
        .collect()
}
