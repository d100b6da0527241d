//! Buffered publish/subscribe hub for resource and document changes.
//!
//! [`NotificationManager::notify`] never calls a subscriber by itself. It appends to a per-target buffer and requests
//! a flush. Depending on the context the flush runs right away, at the end of the current store batch, or whenever
//! the configured [`FlushScheduler`] decides. A flush swaps the buffer out before delivering, so notifications raised
//! by subscribers while handling a pass are delivered in the next pass, never interleaved with the current one.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::rc::Weak;

use indexmap::IndexMap;
use tracing::instrument;
use tracing::trace;

use crate::config::StoreConfig;
use crate::identifier::IdentifierCache;
use crate::identifier::ResourceKey;
use crate::scheduler::FlushScheduler;
use crate::scheduler::TaskQueue;
use crate::types::Identifier;
use crate::types::Operation;
use crate::types::SubscriptionTarget;

pub type NotificationCallback = Rc<dyn Fn(&Identifier, Operation, Option<&str>)>;

/// Wraps a closure into a [`NotificationCallback`].
pub fn callback<F>(f: F) -> NotificationCallback
where
    F: Fn(&Identifier, Operation, Option<&str>) + 'static,
{
    Rc::new(f)
}

/// Handle returned by [`NotificationManager::subscribe`], used to cancel the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Subscriber {
    token:    SubscriptionToken,
    callback: NotificationCallback,
}

#[derive(Default)]
struct Subscribers {
    by_key:       HashMap<Identifier, Vec<Subscriber>>,
    any_resource: Vec<Subscriber>,
    any_document: Vec<Subscriber>,
    tokens:       HashMap<SubscriptionToken, SubscriptionTarget>,
    next_token:   u64,
}

impl Subscribers {
    fn list(&self, target: &SubscriptionTarget) -> Option<&Vec<Subscriber>> {
        match target {
            SubscriptionTarget::Key(identifier) => self.by_key.get(identifier),
            SubscriptionTarget::AnyResource => Some(&self.any_resource),
            SubscriptionTarget::AnyDocument => Some(&self.any_document),
        }
    }

    fn list_mut(&mut self, target: &SubscriptionTarget) -> &mut Vec<Subscriber> {
        match target {
            SubscriptionTarget::Key(identifier) => self.by_key.entry(identifier.clone()).or_default(),
            SubscriptionTarget::AnyResource => &mut self.any_resource,
            SubscriptionTarget::AnyDocument => &mut self.any_document,
        }
    }

    fn channel(&self, identifier: &Identifier) -> &Vec<Subscriber> {
        match identifier {
            Identifier::Resource(_) => &self.any_resource,
            Identifier::Document(_) => &self.any_document,
        }
    }

    fn snapshot(list: Option<&Vec<Subscriber>>) -> Vec<(SubscriptionToken, NotificationCallback)> {
        list.map(|l| l.iter().map(|s| (s.token, s.callback.clone())).collect())
            .unwrap_or_default()
    }
}

type Buffer = IndexMap<Identifier, Vec<(Operation, Option<String>)>>;

pub struct NotificationManager {
    myself:            Weak<NotificationManager>,
    identifiers:       Rc<IdentifierCache>,
    queue:             Rc<TaskQueue>,
    scheduler:         Rc<dyn FlushScheduler>,
    async_flush:       bool,
    log_notifications: bool,
    subscribers:       RefCell<Subscribers>,
    buffered:          RefCell<Buffer>,
    flush_scheduled:   Cell<bool>,
    flushing:          Cell<bool>,
    destroyed:         Cell<bool>,
}

impl NotificationManager {
    pub fn new(
        identifiers: Rc<IdentifierCache>,
        queue: Rc<TaskQueue>,
        scheduler: Rc<dyn FlushScheduler>,
        config: &StoreConfig,
    ) -> Rc<Self> {
        Rc::new_cyclic(|myself| Self {
            myself: myself.clone(),
            identifiers,
            queue,
            scheduler,
            async_flush: config.async_flush(),
            log_notifications: config.log_notifications(),
            subscribers: RefCell::new(Subscribers::default()),
            buffered: RefCell::new(Buffer::default()),
            flush_scheduled: Cell::new(false),
            flushing: Cell::new(false),
            destroyed: Cell::new(false),
        })
    }

    /// Registers `callback` for `target`.
    ///
    /// # Panics
    ///
    /// When the manager has been destroyed, when `target` names an identifier that isn't stable, or when the very
    /// same callback is already subscribed to `target`.
    pub fn subscribe(
        &self,
        target: impl Into<SubscriptionTarget>,
        callback: NotificationCallback,
    ) -> SubscriptionToken {
        assert!(
            !self.destroyed.get(),
            "Cannot subscribe to notifications after the store has been destroyed"
        );
        let target = target.into();
        if let SubscriptionTarget::Key(identifier) = &target {
            self.assert_stable(identifier);
        }

        let mut subscribers = self.subscribers.borrow_mut();
        let token = SubscriptionToken(subscribers.next_token);
        subscribers.next_token += 1;

        let list = subscribers.list_mut(&target);
        assert!(
            !list.iter().any(|s| Rc::ptr_eq(&s.callback, &callback)),
            "The same callback is already subscribed to {target:?}"
        );
        list.push(Subscriber { token, callback });
        subscribers.tokens.insert(token, target);

        token
    }

    /// Cancels a subscription. A no-op once the manager has been destroyed.
    ///
    /// # Panics
    ///
    /// When the token is unknown, including a token that has already been unsubscribed.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        if self.destroyed.get() {
            return;
        }
        let mut subscribers = self.subscribers.borrow_mut();
        let Some(target) = subscribers.tokens.remove(&token)
        else {
            panic!("Cannot unsubscribe {token:?}: it is not a known subscription");
        };

        let list = subscribers.list_mut(&target);
        list.retain(|s| s.token != token);
        if list.is_empty() {
            if let SubscriptionTarget::Key(identifier) = &target {
                subscribers.by_key.remove(identifier);
            }
        }
    }

    pub fn is_subscribed(&self, token: SubscriptionToken) -> bool {
        self.subscribers.borrow().tokens.contains_key(&token)
    }

    pub fn has_subscribers(&self, target: &SubscriptionTarget) -> bool {
        self.subscribers
            .borrow()
            .list(target)
            .is_some_and(|list| !list.is_empty())
    }

    /// Buffers a notification and requests a flush.
    ///
    /// Returns whether anybody listens: the target itself or, for channel operations, the wildcard channel. Nothing is
    /// buffered when nobody does.
    ///
    /// # Panics
    ///
    /// When `sub_key` is given for an operation that doesn't accept one, when a resource is notified as
    /// `invalidated` or a document with a non-document operation, and when the identifier is not stable.
    pub fn notify(&self, target: impl Into<Identifier>, operation: Operation, sub_key: Option<&str>) -> bool {
        if self.destroyed.get() {
            return false;
        }
        let target = target.into();

        assert!(
            sub_key.is_none() || operation.allows_sub_key(),
            "Notifying for a sub-key is only supported for field operations, not for '{operation}'"
        );
        match &target {
            Identifier::Resource(_) => assert!(
                operation != Operation::Invalidated,
                "'invalidated' can only be notified for documents, not for {target}"
            ),
            Identifier::Document(_) => assert!(
                operation.is_channel_operation(&target),
                "'{operation}' cannot be notified for {target}"
            ),
        }
        self.assert_stable(&target);

        let (has_subscribers, has_channel) = {
            let subscribers = self.subscribers.borrow();
            (
                subscribers.by_key.get(&target).is_some_and(|l| !l.is_empty()),
                operation.is_channel_operation(&target) && !subscribers.channel(&target).is_empty(),
            )
        };

        if !has_subscribers && !has_channel {
            return false;
        }

        if self.log_notifications {
            trace!("notify {target} '{operation}' {sub_key:?}");
        }

        self.buffered
            .borrow_mut()
            .entry(target)
            .or_default()
            .push((operation, sub_key.map(String::from)));
        self.request_flush();

        true
    }

    pub fn has_pending(&self) -> bool {
        !self.buffered.borrow().is_empty()
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.flush_scheduled.get()
    }

    fn request_flush(&self) {
        if self.flush_scheduled.get() || self.flushing.get() {
            return;
        }
        self.flush_scheduled.set(true);

        let myself = self.myself.clone();
        let task: Box<dyn FnOnce()> = Box::new(move || {
            if let Some(manager) = myself.upgrade() {
                manager.flush();
            }
        });

        if let Err(task) = self.queue.schedule(task) {
            if self.async_flush {
                self.scheduler.schedule_flush(task);
            }
            else {
                task();
            }
        }
    }

    /// Delivers everything buffered so far. Calling it while a flush is already running is a no-op; the running flush
    /// picks up whatever gets buffered meanwhile in its next pass.
    #[instrument(level = "trace", skip(self))]
    pub fn flush(&self) {
        if self.flushing.get() {
            return;
        }
        if self.destroyed.get() {
            self.buffered.borrow_mut().clear();
            return;
        }

        self.flushing.set(true);
        let _guard = FlushGuard(self);

        loop {
            let buffered = std::mem::take(&mut *self.buffered.borrow_mut());
            if buffered.is_empty() {
                break;
            }
            for (target, entries) in buffered {
                for (operation, sub_key) in entries {
                    self.deliver(&target, operation, sub_key.as_deref());
                }
            }
        }
    }

    fn deliver(&self, target: &Identifier, operation: Operation, sub_key: Option<&str>) {
        if self.log_notifications {
            trace!("deliver {target} '{operation}' {sub_key:?}");
        }

        let (channel, keyed) = {
            let subscribers = self.subscribers.borrow();
            let channel = if operation.is_channel_operation(target) {
                Subscribers::snapshot(Some(subscribers.channel(target)))
            }
            else {
                Vec::new()
            };
            (channel, Subscribers::snapshot(subscribers.by_key.get(target)))
        };

        for (token, callback) in channel.into_iter().chain(keyed) {
            // A subscriber may have been cancelled by an earlier callback of this same delivery.
            if self.is_subscribed(token) {
                callback(target, operation, sub_key);
            }
        }
    }

    /// Drops buffered field-scoped notifications for a key that is being disconnected. Channel operations stay so that
    /// collections still learn about the removal.
    pub fn purge(&self, key: &ResourceKey) {
        let target = Identifier::Resource(key.clone());
        let mut buffered = self.buffered.borrow_mut();
        if let Some(entries) = buffered.get_mut(&target) {
            entries.retain(|(operation, _)| operation.is_channel_operation(&target));
            if entries.is_empty() {
                buffered.shift_remove(&target);
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    pub fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        self.buffered.borrow_mut().clear();
        let mut subscribers = self.subscribers.borrow_mut();
        subscribers.by_key.clear();
        subscribers.any_resource.clear();
        subscribers.any_document.clear();
        subscribers.tokens.clear();
    }

    fn assert_stable(&self, identifier: &Identifier) {
        let stable = match identifier {
            Identifier::Resource(key) => self.identifiers.is_stable(key),
            Identifier::Document(key) => self.identifiers.is_stable_document(key),
        };
        assert!(stable, "Expected a stable identifier, got {identifier}");
    }
}

struct FlushGuard<'a>(&'a NotificationManager);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.flushing.set(false);
        self.0.flush_scheduled.set(false);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scheduler::SyncScheduler;
    use crate::test::ManualScheduler;
    use crate::test::Recorder;

    fn manager(config: StoreConfig, scheduler: Rc<dyn FlushScheduler>) -> (Rc<NotificationManager>, Rc<TaskQueue>) {
        let identifiers = Rc::new(IdentifierCache::new());
        let queue = Rc::new(TaskQueue::new());
        (NotificationManager::new(identifiers, queue.clone(), scheduler, &config), queue)
    }

    fn sync_manager() -> (Rc<NotificationManager>, Rc<TaskQueue>) {
        manager(StoreConfig::new(), Rc::new(SyncScheduler))
    }

    #[test]
    fn delivers_to_key_subscribers() {
        let (nm, _) = sync_manager();
        let key = nm.identifiers.get_or_create("widget", Some("1"), None);
        let other = nm.identifiers.get_or_create("widget", Some("2"), None);
        let recorder = Recorder::new();
        nm.subscribe(&key, recorder.callback());

        assert!(nm.notify(&key, Operation::Attributes, Some("name")));
        assert!(!nm.notify(&other, Operation::Attributes, Some("name")));

        assert_eq!(recorder.events(), vec!["Record<widget:1 (@lid:widget-1)> attributes name"]);
        assert!(!nm.has_pending());
    }

    #[test]
    fn no_subscribers_short_circuits() {
        let (nm, queue) = sync_manager();
        let key = nm.identifiers.get_or_create("widget", Some("1"), None);
        queue.join(|| {
            assert!(!nm.notify(&key, Operation::Added, None));
            assert!(!nm.has_pending());
            assert!(!nm.is_flush_scheduled());
        });
    }

    #[test]
    fn wildcard_channels() {
        let (nm, _) = sync_manager();
        let key = nm.identifiers.get_or_create("widget", Some("1"), None);
        let doc = nm.identifiers.document("/widgets");
        let resources = Recorder::new();
        let documents = Recorder::new();
        let keyed = Recorder::new();
        nm.subscribe(SubscriptionTarget::AnyResource, resources.callback());
        nm.subscribe(SubscriptionTarget::AnyDocument, documents.callback());
        nm.subscribe(&key, keyed.callback());

        // A channel listener alone is enough, but only for channel operations.
        let other = nm.identifiers.get_or_create("widget", Some("2"), None);
        assert!(nm.notify(&other, Operation::Added, None));
        assert!(!nm.notify(&other, Operation::Attributes, Some("name")));
        assert!(nm.notify(&key, Operation::State, None));
        nm.notify(&key, Operation::Attributes, Some("name"));
        nm.notify(&doc, Operation::Updated, None);

        assert_eq!(
            resources.events(),
            vec!["Record<widget:2 (@lid:widget-2)> added", "Record<widget:1 (@lid:widget-1)> state"]
        );
        assert_eq!(documents.events(), vec!["Document</widgets> updated"]);
        assert_eq!(
            keyed.events(),
            vec![
                "Record<widget:1 (@lid:widget-1)> state",
                "Record<widget:1 (@lid:widget-1)> attributes name"
            ]
        );
    }

    #[test]
    fn flush_isolation() {
        let (nm, queue) = sync_manager();
        let a = nm.identifiers.get_or_create("widget", Some("1"), None);
        let b = nm.identifiers.get_or_create("widget", Some("2"), None);
        let log = Rc::new(RefCell::new(Vec::<String>::new()));

        let weak = Rc::downgrade(&nm);
        let b2 = b.clone();
        let l = log.clone();
        nm.subscribe(
            &a,
            callback(move |_, op, _| {
                l.borrow_mut().push(format!("a:{op}"));
                if op == Operation::Attributes {
                    weak.upgrade().unwrap().notify(&b2, Operation::Meta, None);
                }
            }),
        );
        let l = log.clone();
        nm.subscribe(&b, callback(move |_, op, _| l.borrow_mut().push(format!("b:{op}"))));

        queue.join(|| {
            nm.notify(&a, Operation::Attributes, None);
            nm.notify(&b, Operation::Attributes, None);
            nm.notify(&a, Operation::Errors, None);
        });

        // The meta notification raised from within a's callback lands after the whole first pass.
        assert_eq!(*log.borrow(), vec!["a:attributes", "a:errors", "b:attributes", "b:meta"]);
    }

    #[test]
    fn batching_defers_delivery() {
        let (nm, queue) = sync_manager();
        let key = nm.identifiers.get_or_create("widget", Some("1"), None);
        let recorder = Recorder::new();
        nm.subscribe(&key, recorder.callback());

        queue.join(|| {
            nm.notify(&key, Operation::Attributes, Some("a"));
            nm.notify(&key, Operation::Attributes, Some("b"));
            assert!(recorder.events().is_empty());
            assert!(nm.is_flush_scheduled());
        });
        assert_eq!(recorder.events().len(), 2);
    }

    #[test]
    fn async_flush_coalesces() {
        let scheduler = Rc::new(ManualScheduler::new());
        let (nm, _) = manager(StoreConfig::builder().async_flush(true).build().unwrap(), scheduler.clone());
        let key = nm.identifiers.get_or_create("widget", Some("1"), None);
        let recorder = Recorder::new();
        nm.subscribe(&key, recorder.callback());

        nm.notify(&key, Operation::Attributes, Some("a"));
        nm.notify(&key, Operation::Attributes, Some("b"));
        assert_eq!(scheduler.pending(), 1);
        assert!(recorder.events().is_empty());

        // An explicit flush doesn't wait for the scheduler; the scheduled one becomes a no-op.
        nm.flush();
        assert_eq!(recorder.events().len(), 2);
        scheduler.run_pending();
        assert_eq!(recorder.events().len(), 2);

        nm.notify(&key, Operation::Meta, None);
        assert_eq!(scheduler.pending(), 1);
        scheduler.run_pending();
        assert_eq!(recorder.events().len(), 3);
    }

    #[test]
    fn unsubscribe_during_delivery() {
        let (nm, _) = sync_manager();
        let key = nm.identifiers.get_or_create("widget", Some("1"), None);
        let second = Recorder::new();
        let token_cell = Rc::new(Cell::new(None::<SubscriptionToken>));

        let weak = Rc::downgrade(&nm);
        let tc = token_cell.clone();
        nm.subscribe(
            &key,
            callback(move |_, _, _| {
                if let Some(token) = tc.take() {
                    weak.upgrade().unwrap().unsubscribe(token);
                }
            }),
        );
        token_cell.set(Some(nm.subscribe(&key, second.callback())));

        nm.notify(&key, Operation::Meta, None);
        assert!(second.events().is_empty());
    }

    #[test]
    #[should_panic(expected = "not a known subscription")]
    fn double_unsubscribe_panics() {
        let (nm, _) = sync_manager();
        let token = nm.subscribe(SubscriptionTarget::AnyResource, Recorder::new().callback());
        nm.unsubscribe(token);
        nm.unsubscribe(token);
    }

    #[test]
    #[should_panic(expected = "already subscribed")]
    fn same_callback_twice_panics() {
        let (nm, _) = sync_manager();
        let callback = Recorder::new().callback();
        nm.subscribe(SubscriptionTarget::AnyResource, callback.clone());
        nm.subscribe(SubscriptionTarget::AnyResource, callback);
    }

    #[test]
    #[should_panic(expected = "only supported for field operations")]
    fn forbidden_sub_key_panics() {
        let (nm, _) = sync_manager();
        let key = nm.identifiers.get_or_create("widget", Some("1"), None);
        nm.notify(&key, Operation::Added, Some("name"));
    }

    #[test]
    #[should_panic(expected = "Expected a stable identifier")]
    fn unstable_identifier_panics() {
        let (nm, _) = sync_manager();
        let key = nm.identifiers.get_or_create("widget", Some("1"), None);
        nm.identifiers.forget(&key);
        nm.notify(&key, Operation::State, None);
    }

    #[test]
    fn purge_keeps_channel_operations() {
        let (nm, queue) = sync_manager();
        let key = nm.identifiers.get_or_create("widget", Some("1"), None);
        let recorder = Recorder::new();
        nm.subscribe(&key, recorder.callback());

        queue.join(|| {
            nm.notify(&key, Operation::Attributes, Some("name"));
            nm.notify(&key, Operation::Removed, None);
            nm.purge(&key);
        });
        assert_eq!(recorder.events(), vec!["Record<widget:1 (@lid:widget-1)> removed"]);
    }

    #[test]
    fn destroyed_manager() {
        let (nm, _) = sync_manager();
        let key = nm.identifiers.get_or_create("widget", Some("1"), None);
        let token = nm.subscribe(&key, Recorder::new().callback());
        nm.destroy();
        nm.destroy();
        assert!(!nm.notify(&key, Operation::State, None));
        nm.unsubscribe(token);
        assert!(nm.is_destroyed());
    }

    #[test]
    #[should_panic(expected = "after the store has been destroyed")]
    fn subscribe_after_destroy_panics() {
        let (nm, _) = sync_manager();
        nm.destroy();
        nm.subscribe(SubscriptionTarget::AnyResource, Recorder::new().callback());
    }
}
