//! Topic router
//!
//! Associates topic filters with callbacks and dispatches incoming PUBLISH
//! messages to every matching route, in insertion order. Filters may use
//! the MQTT wildcards: `+` matches a single level, `#` matches all
//! remaining levels and is only valid as the final level.

use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::message::{Message, MessageHandler};
use crate::protocol::{ClientError, Publish};
use crate::session::Handle;

struct Route {
    filter: Vec<u8>,
    callback: MessageHandler,
}

/// Byte-wise wildcard match of a topic against a filter, no per-level
/// allocation. Walks filter and topic in lockstep: `+` skips one topic
/// level, `#` accepts the rest, anything else must match literally.
pub fn filter_matches_topic(filter: &[u8], topic: &[u8]) -> bool {
    if filter.is_empty() {
        return topic.is_empty();
    }
    if topic.is_empty() {
        return filter == b"#";
    }

    let mut tp = 0;
    let mut rp = 0;
    while rp < filter.len() {
        match filter[rp] {
            b'#' => return true,
            b'+' => {
                while tp < topic.len() && topic[tp] != b'/' {
                    tp += 1;
                }
            }
            c => {
                if tp == topic.len() {
                    // Topic exhausted: only a trailing "/#" still accepts,
                    // the parent level itself matches a multi-level wildcard
                    return &filter[rp..] == b"/#";
                }
                if c != topic[tp] {
                    return false;
                }
                tp += 1;
            }
        }
        rp += 1;
    }
    tp == topic.len()
}

/// Validate a topic filter: `+` must occupy a whole level, `#` must occupy
/// the final level.
pub fn validate_filter(filter: &str) -> Result<(), ClientError> {
    if filter.is_empty() {
        return Err(ClientError::Protocol("topic filter cannot be empty"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(ClientError::Protocol(
                "multi-level wildcard must be the final level",
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(ClientError::Protocol(
                "single-level wildcard must occupy a whole level",
            ));
        }
    }
    Ok(())
}

/// Subscription route table and dispatcher.
///
/// `add_route`/`delete_route` take the write lock; dispatch snapshots the
/// matching callbacks under the read lock, then invokes them without
/// holding it so a callback may modify the table.
pub struct Router {
    routes: RwLock<Vec<Route>>,
    default_handler: RwLock<Option<MessageHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            default_handler: RwLock::new(None),
        }
    }

    /// Register `callback` for `filter`. An existing route with the exact
    /// same filter has its callback replaced; otherwise the route is
    /// appended.
    pub fn add_route(&self, filter: &str, callback: MessageHandler) -> Result<(), ClientError> {
        validate_filter(filter)?;
        let mut routes = self.routes.write();
        if let Some(route) = routes.iter_mut().find(|r| r.filter == filter.as_bytes()) {
            route.callback = callback;
        } else {
            routes.push(Route {
                filter: filter.as_bytes().to_vec(),
                callback,
            });
        }
        Ok(())
    }

    /// Remove the first route whose filter matches `filter` exactly.
    pub fn delete_route(&self, filter: &str) {
        let mut routes = self.routes.write();
        if let Some(pos) = routes.iter().position(|r| r.filter == filter.as_bytes()) {
            routes.remove(pos);
        }
    }

    /// Assign a fallback invoked only when no route matches a PUBLISH.
    pub fn set_default_handler(&self, callback: MessageHandler) {
        *self.default_handler.write() = Some(callback);
    }

    /// Number of registered routes
    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Callbacks matching `topic`, in insertion order; the default handler
    /// when none match. Snapshotted under the read lock so callbacks run
    /// without holding it; most topics match only a few routes, so the
    /// snapshot stays on the stack.
    fn matching_callbacks(&self, topic: &[u8]) -> SmallVec<[MessageHandler; 4]> {
        let routes = self.routes.read();
        let matched: SmallVec<[MessageHandler; 4]> = routes
            .iter()
            .filter(|r| filter_matches_topic(&r.filter, topic))
            .map(|r| r.callback.clone())
            .collect();
        if matched.is_empty() {
            if let Some(handler) = self.default_handler.read().as_ref() {
                return SmallVec::from_elem(handler.clone(), 1);
            }
        }
        matched
    }

    /// Spawn the dispatcher: consumes routed PUBLISH packets until the
    /// channel closes or stop is signaled. In ordered mode callbacks run
    /// sequentially on this task, preserving per-topic arrival order; in
    /// concurrent mode each callback runs in its own task.
    pub(crate) fn spawn_dispatcher(
        self: &Arc<Self>,
        mut messages: mpsc::Receiver<Publish>,
        handle: Handle,
        ordered: bool,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let publish = tokio::select! {
                    maybe = messages.recv() => match maybe {
                        Some(p) => p,
                        None => return,
                    },
                    _ = stop.changed() => {
                        debug!("router dispatcher stopped");
                        return;
                    }
                };

                let callbacks = router.matching_callbacks(&publish.topic);
                let message = Message::new(Arc::new(publish));
                for callback in callbacks {
                    if ordered {
                        callback(&handle, message.clone());
                    } else {
                        let handle = handle.clone();
                        let message = message.clone();
                        tokio::spawn(async move { callback(&handle, message) });
                    }
                }
                // Dropping the last Message clone returns the packet's
                // buffers to the pool.
            }
        })
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(filter: &str, topic: &str) -> bool {
        filter_matches_topic(filter.as_bytes(), topic.as_bytes())
    }

    #[test]
    fn test_literal_match() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(!matches("a/b/c", "a/b/d"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("a/+/c", "a/anything/c"));
        assert!(!matches("a/+/c", "a/x/y/c"));
        assert!(matches("+/b", "a/b"));
        assert!(matches("+/+", "a/b"));
        assert!(!matches("+/+", "a"));
        // An empty level still counts as a level
        assert!(matches("a/+", "a/"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("a/#", "a/b/c/d"));
        assert!(matches("a/#", "a/b"));
        assert!(matches("#", "anything/at/all"));
        assert!(matches("#", ""));
        assert!(matches("a/#", "a/"));
        // The parent level itself matches
        assert!(matches("a/#", "a"));
        assert!(matches("a/b/#", "a/b"));
        assert!(!matches("a/+", "a"));
        assert!(!matches("b/#", "a"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(validate_filter("a/b/c").is_ok());
        assert!(validate_filter("a/+/c").is_ok());
        assert!(validate_filter("a/#").is_ok());
        assert!(validate_filter("#").is_ok());
        assert!(validate_filter("+").is_ok());

        assert!(validate_filter("").is_err());
        assert!(validate_filter("a/#/b").is_err());
        assert!(validate_filter("a#").is_err());
        assert!(validate_filter("a/b+").is_err());
        assert!(validate_filter("+a/b").is_err());
    }

    #[test]
    fn test_add_route_replaces_identical_filter() {
        let router = Router::new();
        let noop: MessageHandler = Arc::new(|_, _| {});
        router.add_route("a/b", noop.clone()).unwrap();
        router.add_route("a/b", noop.clone()).unwrap();
        assert_eq!(router.route_count(), 1);

        router.add_route("a/+", noop).unwrap();
        assert_eq!(router.route_count(), 2);
    }

    #[test]
    fn test_add_route_rejects_invalid_filter() {
        let router = Router::new();
        let noop: MessageHandler = Arc::new(|_, _| {});
        assert!(router.add_route("a/#/b", noop).is_err());
        assert_eq!(router.route_count(), 0);
    }

    #[test]
    fn test_delete_route() {
        let router = Router::new();
        let noop: MessageHandler = Arc::new(|_, _| {});
        router.add_route("a/b", noop.clone()).unwrap();
        router.add_route("a/+", noop).unwrap();

        router.delete_route("a/b");
        assert_eq!(router.route_count(), 1);
        // Unknown filter is a no-op
        router.delete_route("x/y");
        assert_eq!(router.route_count(), 1);
    }
}
