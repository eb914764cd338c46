//! Identifier routing of inbound messages.
//!
//! Every inbound message is routed by the identifier that correlates it
//! with the command that caused it: acks by command id, query results by
//! query id, publishes by each subscription id they satisfy.

mod dispatcher;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sowlink_message::{AckTypes, Identifier};

use crate::error::{Error, Result};
use crate::handler::MessageHandler;

pub use dispatcher::Dispatcher;

/// A registered destination for inbound messages.
#[derive(Clone)]
pub struct Route {
    handler: Arc<dyn MessageHandler>,
    requested_acks: AckTypes,
    system_acks: AckTypes,
    received_acks: AckTypes,
    is_subscription: bool,
    resubscribable: bool,
    bookmarked: bool,
}

impl Route {
    /// A one-shot route delivering to `handler`.
    #[must_use]
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            handler,
            requested_acks: AckTypes::NONE,
            system_acks: AckTypes::NONE,
            received_acks: AckTypes::NONE,
            is_subscription: false,
            resubscribable: false,
            bookmarked: false,
        }
    }

    /// Acks the handler asked to see.
    #[must_use]
    pub const fn with_requested_acks(mut self, acks: AckTypes) -> Self {
        self.requested_acks = acks;
        self
    }

    /// Acks the session itself consumes; they complete the route but are
    /// not delivered to the handler.
    #[must_use]
    pub const fn with_system_acks(mut self, acks: AckTypes) -> Self {
        self.system_acks = acks;
        self
    }

    /// Mark the route as a standing subscription. Subscription routes are
    /// never removed by acks.
    #[must_use]
    pub const fn subscription(mut self) -> Self {
        self.is_subscription = true;
        self
    }

    /// Keep the route across a disconnect so resubscription can reuse it.
    #[must_use]
    pub const fn resubscribable(mut self) -> Self {
        self.resubscribable = true;
        self
    }

    /// Track the route's messages in the bookmark journal.
    #[must_use]
    pub const fn bookmarked(mut self) -> Self {
        self.bookmarked = true;
        self
    }

    /// Whether the route is a standing subscription.
    #[must_use]
    pub const fn is_subscription(&self) -> bool {
        self.is_subscription
    }

    fn is_complete(&self) -> bool {
        self.received_acks
            .contains(self.requested_acks | self.system_acks)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("requested_acks", &self.requested_acks)
            .field("system_acks", &self.system_acks)
            .field("received_acks", &self.received_acks)
            .field("is_subscription", &self.is_subscription)
            .field("resubscribable", &self.resubscribable)
            .finish_non_exhaustive()
    }
}

/// What an ack did to the route it matched.
pub(crate) struct AckRouting {
    /// Handler to deliver the ack to, if it asked for this ack type.
    pub(crate) handler: Option<Arc<dyn MessageHandler>>,
    /// Whether the route completed and was removed.
    pub(crate) removed: bool,
}

/// Registered routes, at most one per identifier.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<Identifier, Route>,
    generation: Arc<AtomicU64>,
}

impl RouteTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `route` under `id`.
    ///
    /// Returns `true` if no route existed for `id`, `false` if one was
    /// replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubscriptionExists`] if the existing route is a
    /// subscription and `replace` is not set. The table is unchanged in
    /// that case.
    pub fn add_route(&mut self, id: Identifier, route: Route, replace: bool) -> Result<bool> {
        if let Some(existing) = self.routes.get(&id) {
            if existing.is_subscription && !replace {
                return Err(Error::SubscriptionExists(id));
            }
        }
        let added = self.routes.insert(id, route).is_none();
        self.bump();
        Ok(added)
    }

    /// Remove the route for `id`. Returns whether one existed.
    pub fn remove_route(&mut self, id: &Identifier) -> bool {
        let removed = self.routes.remove(id).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    /// Whether a route exists for `id`.
    #[must_use]
    pub fn has_route(&self, id: &Identifier) -> bool {
        self.routes.contains_key(id)
    }

    /// Number of routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Counter bumped on every change.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn generation_handle(&self) -> Arc<AtomicU64> {
        self.generation.clone()
    }

    pub(crate) fn handler(&self, id: &Identifier) -> Option<Arc<dyn MessageHandler>> {
        self.routes.get(id).map(|route| route.handler.clone())
    }

    pub(crate) fn is_bookmarked(&self, id: &Identifier) -> bool {
        self.routes.get(id).is_some_and(|route| route.bookmarked)
    }

    /// Record an ack of `ack_type` against the route for `id`.
    ///
    /// A one-shot route is removed once every ack it waits for has
    /// arrived, or on the first failure.
    pub(crate) fn record_ack(
        &mut self,
        id: &Identifier,
        ack_type: AckTypes,
        failed: bool,
    ) -> Option<AckRouting> {
        let route = self.routes.get_mut(id)?;
        route.received_acks |= ack_type;
        let handler = route
            .requested_acks
            .intersects(ack_type)
            .then(|| route.handler.clone());
        let removed = !route.is_subscription && (failed || route.is_complete());
        if removed {
            self.routes.remove(id);
            self.bump();
        }
        Some(AckRouting { handler, removed })
    }

    /// Drop every route that does not survive a disconnect.
    pub(crate) fn retain_resubscribable(&mut self) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, route| route.resubscribable);
        let dropped = before - self.routes.len();
        if dropped > 0 {
            self.bump();
        }
        dropped
    }

    /// Remove the route for `id` only if it still delivers to `handler`.
    pub(crate) fn remove_handler(
        &mut self,
        id: &Identifier,
        handler: &Arc<dyn MessageHandler>,
    ) -> Option<Route> {
        if !self
            .routes
            .get(id)
            .is_some_and(|route| Arc::ptr_eq(&route.handler, handler))
        {
            return None;
        }
        let route = self.routes.remove(id);
        self.bump();
        route
    }

    /// Ids of every subscription route.
    pub(crate) fn subscription_ids(&self) -> Vec<Identifier> {
        self.routes
            .iter()
            .filter(|(_, route)| route.is_subscription)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        if !self.routes.is_empty() {
            self.routes.clear();
            self.bump();
        }
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::error::HandlerError;

    fn route() -> Route {
        Route::new(Arc::new(|_: &sowlink_message::Message| Ok::<(), HandlerError>(())))
    }

    #[test]
    fn test_subscription_conflict_requires_replace() {
        let mut table = RouteTable::new();
        assert!(table.add_route("s".into(), route().subscription(), false).unwrap());
        assert!(matches!(
            table.add_route("s".into(), route().subscription(), false),
            Err(Error::SubscriptionExists(_))
        ));
        assert!(!table.add_route("s".into(), route().subscription(), true).unwrap());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_one_shot_route_cannot_displace_subscription() {
        let id = Identifier::from("s");
        let mut table = RouteTable::new();
        table.add_route(id.clone(), route().subscription(), false).unwrap();

        assert!(matches!(
            table.add_route(id.clone(), route(), false),
            Err(Error::SubscriptionExists(_))
        ));
        assert!(table.routes[&id].is_subscription);

        assert!(!table.add_route(id.clone(), route(), true).unwrap());
        assert!(!table.routes[&id].is_subscription);
    }

    #[test]
    fn test_one_shot_route_removed_when_acks_complete() {
        let mut table = RouteTable::new();
        let acks = AckTypes::PROCESSED | AckTypes::COMPLETED;
        table
            .add_route("c".into(), route().with_requested_acks(acks), false)
            .unwrap();

        let first = table.record_ack(&"c".into(), AckTypes::PROCESSED, false).unwrap();
        assert!(first.handler.is_some());
        assert!(!first.removed);

        let last = table.record_ack(&"c".into(), AckTypes::COMPLETED, false).unwrap();
        assert!(last.removed);
        assert!(!table.has_route(&"c".into()));
    }

    #[test]
    fn test_system_acks_are_not_delivered() {
        let mut table = RouteTable::new();
        table
            .add_route(
                "q".into(),
                route().with_system_acks(AckTypes::COMPLETED),
                false,
            )
            .unwrap();
        let routing = table.record_ack(&"q".into(), AckTypes::COMPLETED, false).unwrap();
        assert!(routing.handler.is_none());
        assert!(routing.removed);
    }

    #[test]
    fn test_subscription_survives_acks_and_failures() {
        let mut table = RouteTable::new();
        table
            .add_route(
                "s".into(),
                route().subscription().with_requested_acks(AckTypes::PROCESSED),
                false,
            )
            .unwrap();
        let routing = table.record_ack(&"s".into(), AckTypes::PROCESSED, true).unwrap();
        assert!(!routing.removed);
        assert!(table.has_route(&"s".into()));
    }

    #[test]
    fn test_stale_handler_does_not_remove_replacement() {
        let mut table = RouteTable::new();
        let old = route();
        let old_handler = old.handler.clone();
        table.add_route("s".into(), old.subscription(), false).unwrap();
        table.add_route("s".into(), route().subscription(), true).unwrap();

        assert!(table.remove_handler(&"s".into(), &old_handler).is_none());
        assert!(table.has_route(&"s".into()));
    }

    #[test]
    fn test_disconnect_keeps_only_resubscribable_routes() {
        let mut table = RouteTable::new();
        table.add_route("a".into(), route().subscription(), false).unwrap();
        table
            .add_route("b".into(), route().subscription().resubscribable(), false)
            .unwrap();
        table.add_route("c".into(), route(), false).unwrap();

        let generation = table.generation();
        assert_eq!(table.retain_resubscribable(), 2);
        assert!(table.has_route(&"b".into()));
        assert!(table.generation() > generation);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add { id: u8, subscription: bool, replace: bool },
        Remove { id: u8 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, any::<bool>(), any::<bool>()).prop_map(|(id, subscription, replace)| {
                Op::Add {
                    id,
                    subscription,
                    replace,
                }
            }),
            (0u8..4).prop_map(|id| Op::Remove { id }),
        ]
    }

    proptest! {
        #[test]
        fn prop_one_route_per_id(ops in proptest::collection::vec(op(), 1..64)) {
            let mut table = RouteTable::new();
            let mut model: HashMap<u8, bool> = HashMap::new();

            for op in ops {
                match op {
                    Op::Add { id, subscription, replace } => {
                        let mut new = route();
                        if subscription {
                            new = new.subscription();
                        }
                        let result = table.add_route(u64::from(id).into(), new, replace);
                        match model.get(&id) {
                            Some(true) if !replace => {
                                prop_assert!(result.is_err());
                            }
                            existing => {
                                prop_assert_eq!(result.unwrap(), existing.is_none());
                                model.insert(id, subscription);
                            }
                        }
                    }
                    Op::Remove { id } => {
                        prop_assert_eq!(
                            table.remove_route(&u64::from(id).into()),
                            model.remove(&id).is_some()
                        );
                    }
                }
                prop_assert_eq!(table.len(), model.len());
            }
        }
    }
}
