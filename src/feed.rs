//! Lazy data streams bound to steps.
//!
//! A feed delivers one item per step execution to the virtual user running
//! the step. Pulls are thread-safe; copies of one scenario share the feed's
//! position.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

/// Type-erased item handed to a step through its context.
pub type FeedItem = Arc<dyn Any + Send + Sync>;

enum FeedKind {
    /// Round-robin over a fixed item list, wrapping forever.
    Circular {
        items: Vec<FeedItem>,
        cursor: AtomicUsize,
    },
    /// Items produced on demand by a generator closure.
    Generator(Mutex<Box<dyn FnMut() -> FeedItem + Send>>),
}

/// A named, shareable item source.
#[derive(Clone)]
pub struct Feed {
    name: String,
    kind: Arc<FeedKind>,
}

impl Feed {
    /// A feed cycling through `items` round-robin.
    pub fn circular<T, I>(name: impl Into<String>, items: I) -> Self
    where
        T: Any + Send + Sync,
        I: IntoIterator<Item = T>,
    {
        let items = items
            .into_iter()
            .map(|item| Arc::new(item) as FeedItem)
            .collect();
        Self {
            name: name.into(),
            kind: Arc::new(FeedKind::Circular {
                items,
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// A feed producing items lazily from a generator.
    pub fn from_fn<T, F>(name: impl Into<String>, mut generate: F) -> Self
    where
        T: Any + Send + Sync,
        F: FnMut() -> T + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: Arc::new(FeedKind::Generator(Mutex::new(Box::new(move || {
                Arc::new(generate()) as FeedItem
            })))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pull the next item. Returns `None` only for an empty circular feed.
    pub async fn pull(&self) -> Option<FeedItem> {
        match &*self.kind {
            FeedKind::Circular { items, cursor } => {
                if items.is_empty() {
                    return None;
                }
                let at = cursor.fetch_add(1, Ordering::Relaxed) % items.len();
                Some(items[at].clone())
            }
            FeedKind::Generator(generate) => {
                let mut generate = generate.lock().await;
                Some((*generate)())
            }
        }
    }
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed").field("name", &self.name).finish()
    }
}
