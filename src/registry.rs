//! Filterable dispatch table for inbound stanzas.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::DispatchError;
use crate::jid::Jid;
use crate::stanza::Element;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// What happens to a registration after its callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Preserve,
    /// One-shot: never fire again.
    Remove,
}

pub type HandlerCallback = Arc<dyn Fn(&Element) -> anyhow::Result<HandlerOutcome> + Send + Sync>;

/// Fields a stanza must match. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerFilter {
    ns: Option<String>,
    name: Option<String>,
    stanza_type: Option<String>,
    id: Option<String>,
    from: Option<Jid>,
}

impl HandlerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches the stanza's own `xmlns` or that of any direct child.
    pub fn ns(mut self, ns: impl Into<String>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stanza_type(mut self, stanza_type: impl Into<String>) -> Self {
        self.stanza_type = Some(stanza_type.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// A bare address matches every resource; a full address only itself.
    pub fn from(mut self, from: Jid) -> Self {
        self.from = Some(from);
        self
    }

    pub fn matches(&self, stanza: &Element) -> bool {
        if let Some(ns) = &self.ns {
            let own = stanza.ns() == Some(ns.as_str());
            if !own && !stanza.children().any(|c| c.ns() == Some(ns.as_str())) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if stanza.local_name() != name {
                return false;
            }
        }
        if let Some(stanza_type) = &self.stanza_type {
            if stanza.get_attr("type") != Some(stanza_type.as_str()) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if stanza.get_attr("id") != Some(id.as_str()) {
                return false;
            }
        }
        if let Some(from) = &self.from {
            let Some(raw) = stanza.get_attr("from") else {
                return false;
            };
            let Ok(sender) = Jid::parse(raw) else {
                return false;
            };
            let matched = if from.is_bare() {
                sender.bare() == from.bare()
            } else {
                sender == *from
            };
            if !matched {
                return false;
            }
        }
        true
    }
}

/// A callback with its filter and liveness flag.
///
/// The flag is shared with any in-flight dispatch snapshot, so clearing it
/// stops the callback even if a dispatch already selected it.
pub struct Registration {
    id: HandlerId,
    filter: HandlerFilter,
    callback: HandlerCallback,
    live: Arc<AtomicBool>,
    transient: bool,
}

impl Registration {
    pub fn new<F>(filter: HandlerFilter, callback: F) -> Self
    where
        F: Fn(&Element) -> anyhow::Result<HandlerOutcome> + Send + Sync + 'static,
    {
        Self {
            id: HandlerId::next(),
            filter,
            callback: Arc::new(callback),
            live: Arc::new(AtomicBool::new(true)),
            transient: false,
        }
    }

    /// Bound to one connection: dropped instead of migrated when it is replaced.
    /// Used for request/response correlation.
    pub fn transient<F>(filter: HandlerFilter, callback: F) -> Self
    where
        F: Fn(&Element) -> anyhow::Result<HandlerOutcome> + Send + Sync + 'static,
    {
        Self {
            transient: true,
            ..Self::new(filter, callback)
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn filter(&self) -> &HandlerFilter {
        &self.filter
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn kill(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<Vec<Registration>>,
    // Serializes dispatch so a one-shot handler can't be selected twice concurrently.
    dispatching: Mutex<()>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, filter: HandlerFilter, callback: F) -> HandlerId
    where
        F: Fn(&Element) -> anyhow::Result<HandlerOutcome> + Send + Sync + 'static,
    {
        self.insert(Registration::new(filter, callback))
    }

    /// Add an existing registration, keeping its id. Used when handlers migrate
    /// between connections.
    pub fn insert(&self, registration: Registration) -> HandlerId {
        let id = registration.id;
        if registration.is_live() {
            self.handlers.lock().push(registration);
        }
        id
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        match handlers.iter().position(|r| r.id == id) {
            Some(pos) => {
                handlers.remove(pos).kill();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers.lock().iter().any(|r| r.id == id)
    }

    /// Unregister everything.
    pub fn clear(&self) {
        for registration in self.handlers.lock().drain(..) {
            registration.kill();
        }
    }

    /// Take every live registration out, leaving them alive for re-insertion elsewhere.
    pub fn drain(&self) -> Vec<Registration> {
        self.handlers.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every live registration whose filter matches. Returns the number invoked.
    pub fn dispatch(&self, stanza: &Element) -> usize {
        let _serial = self.dispatching.lock();

        let matched: Vec<(HandlerId, HandlerCallback, Arc<AtomicBool>)> = self
            .handlers
            .lock()
            .iter()
            .filter(|r| r.filter.matches(stanza))
            .map(|r| (r.id, r.callback.clone(), r.live.clone()))
            .collect();

        trace!(name = stanza.name(), matched = matched.len(), "Dispatching stanza");

        let mut invoked = 0;
        for (id, callback, live) in matched {
            // An earlier callback in this pass may have unregistered it.
            if !live.load(Ordering::SeqCst) {
                continue;
            }
            invoked += 1;

            let reason = match catch_unwind(AssertUnwindSafe(|| callback(stanza))) {
                Ok(Ok(HandlerOutcome::Preserve)) => continue,
                Ok(Ok(HandlerOutcome::Remove)) => {
                    live.store(false, Ordering::SeqCst);
                    self.unregister(id);
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic.as_ref()),
            };

            let error = DispatchError {
                handler: id.as_u64(),
                stanza: stanza.name().to_string(),
                reason,
            };
            warn!(error = %error, "Stanza handler failed");
        }
        invoked
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (c.clone(), c)
    }

    fn stanza(xml: &str) -> Element {
        Element::parse(xml).unwrap()
    }

    #[test]
    fn test_one_shot_fires_once() {
        let registry = HandlerRegistry::new();
        let (count, seen) = counter();
        registry.register(HandlerFilter::new().id("q1"), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Remove)
        });

        let reply = stanza(r#"<iq type="result" id="q1"/>"#);
        assert_eq!(registry.dispatch(&reply), 1);
        assert_eq!(registry.dispatch(&reply), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregistered_handler_never_fires() {
        let registry = HandlerRegistry::new();
        let (count, seen) = counter();
        let id = registry.register(HandlerFilter::new().name("presence"), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Preserve)
        });
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        registry.dispatch(&stanza("<presence/>"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_unregistered_mid_dispatch_is_skipped() {
        let registry = Arc::new(HandlerRegistry::new());
        let (count, seen) = counter();

        let victim = registry.register(HandlerFilter::new().name("message"), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Preserve)
        });
        // Insert the killer ahead of the victim so it runs first.
        let killer_registry = registry.clone();
        let killer = Registration::new(HandlerFilter::new().name("message"), move |_| {
            killer_registry.unregister(victim);
            Ok(HandlerOutcome::Preserve)
        });
        {
            let mut handlers = registry.handlers.lock();
            handlers.insert(0, killer);
        }

        registry.dispatch(&stanza("<message/>"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failing_and_panicking_handlers_are_isolated() {
        let registry = HandlerRegistry::new();
        let (count, seen) = counter();
        let failing = registry.register(HandlerFilter::new(), |_| Err(anyhow::anyhow!("boom")));
        let panicking = registry.register(HandlerFilter::new(), |_| panic!("handler bug"));
        registry.register(HandlerFilter::new(), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Preserve)
        });

        assert_eq!(registry.dispatch(&stanza("<message/>")), 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(registry.contains(failing));
        assert!(registry.contains(panicking));
    }

    #[test]
    fn test_filter_namespace_matches_child() {
        let filter = HandlerFilter::new().ns("jabber:iq:roster").stanza_type("set");
        assert!(filter.matches(&stanza(r#"<iq type="set"><query xmlns="jabber:iq:roster"/></iq>"#)));
        assert!(!filter.matches(&stanza(r#"<iq type="get"><query xmlns="jabber:iq:roster"/></iq>"#)));
        assert!(!filter.matches(&stanza(r#"<iq type="set"><query xmlns="other"/></iq>"#)));
    }

    #[test]
    fn test_filter_from_bare_and_full() {
        let msg = stanza(r#"<message from="Bob@example.com/phone"/>"#);
        let bare = HandlerFilter::new().from(Jid::parse("bob@example.com").unwrap());
        let full = HandlerFilter::new().from(Jid::parse("bob@example.com/phone").unwrap());
        let other = HandlerFilter::new().from(Jid::parse("bob@example.com/laptop").unwrap());
        assert!(bare.matches(&msg));
        assert!(full.matches(&msg));
        assert!(!other.matches(&msg));
        assert!(!bare.matches(&stanza("<message/>")));
    }

    #[test]
    fn test_drain_keeps_registrations_alive() {
        let source = HandlerRegistry::new();
        let target = HandlerRegistry::new();
        let (count, seen) = counter();
        let id = source.register(HandlerFilter::new(), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Preserve)
        });
        for registration in source.drain() {
            assert!(registration.is_live());
            target.insert(registration);
        }
        assert!(source.is_empty());
        assert!(target.contains(id));
        target.dispatch(&stanza("<presence/>"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_kills_registrations() {
        let registry = HandlerRegistry::new();
        registry.register(HandlerFilter::new(), |_| Ok(HandlerOutcome::Preserve));
        registry.register(HandlerFilter::new(), |_| Ok(HandlerOutcome::Preserve));
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.dispatch(&stanza("<presence/>")), 0);
    }
}
