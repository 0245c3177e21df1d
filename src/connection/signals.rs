//! Signal subscriptions and name owner resolution.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::match_rule::{in_namespace, MatchRule};
use crate::message::Message;
use crate::org_freedesktop_dbus as bus;
use crate::protocol::Flags;
use crate::value::Value;

use super::connection::{Connection, ConnectionState, Inner, Subscription};

/// A handler invoked for every signal matching a subscription.
///
/// Handlers run on the connection's receive task, or on the configured
/// callback executor, and should return promptly.
pub trait SignalHandler: Send + Sync {
    fn on_signal(&self, message: &Message);
}

impl<F> SignalHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn on_signal(&self, message: &Message) {
        self(message)
    }
}

pub(crate) type StateWatcher =
    Arc<dyn Fn(ConnectionState, Option<&Error>) + Send + Sync>;

/// Keeps a signal subscription alive. Dropping the handle removes the
/// subscription and, for the last subscription on a rule, removes the rule
/// from the bus.
#[must_use = "dropping the handle removes the subscription"]
pub struct SubscriptionHandle {
    inner: Weak<Inner>,
    id: u64,
}

impl SubscriptionHandle {
    /// Remove the subscription now.
    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            unsubscribe(&inner, self.id);
        }
    }
}

impl Connection {
    /// Subscribe to the signals matching `rule`.
    ///
    /// The first subscription on a rule installs it on the bus with
    /// `AddMatch` and completes once the bus has confirmed it; further
    /// subscriptions on the same rule share the installed match. The rule is
    /// removed from the bus when the last subscription on it is dropped.
    pub async fn watch(
        &self,
        rule: MatchRule,
        handler: Arc<dyn SignalHandler>,
    ) -> Result<SubscriptionHandle> {
        self.ensure_connected().await?;

        let key = rule.to_string();

        let (id, install) = {
            let mut s = self.inner.shared();
            let id = s.next_subscription;
            s.next_subscription += 1;

            s.subscriptions.insert(
                id,
                Subscription {
                    rule,
                    rule_key: key.clone(),
                    handler,
                },
            );

            let refs = s.rules.entry(key.clone()).or_insert(0);
            *refs += 1;
            (id, *refs == 1)
        };

        if install {
            let m = self.bus_call("AddMatch").with_arg(key.as_str());

            if let Err(e) = self.call(m).await {
                let mut s = self.inner.shared();
                s.subscriptions.remove(&id);

                let drained = match s.rules.get_mut(&key) {
                    Some(refs) => {
                        *refs -= 1;
                        *refs == 0
                    }
                    None => false,
                };

                if drained {
                    s.rules.remove(&key);
                }

                return Err(e);
            }
        }

        Ok(SubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            id,
        })
    }

    /// Track the owner of a well-known name, or of every name below a
    /// namespace.
    ///
    /// `name` is either an exact well-known name, a namespace of the form
    /// `com.example.*`, or `*` for every well-known name on the bus. The
    /// observer sees the current owner of each matching name exactly once as
    /// an initial event with no previous owner, followed by live
    /// `NameOwnerChanged` transitions in bus order.
    pub async fn resolve_service_owner(
        &self,
        name: &str,
        observer: Arc<dyn ServiceOwnerObserver>,
    ) -> Result<SubscriptionHandle> {
        let scope = Scope::parse(name);

        let mut rule = MatchRule::signal()
            .with_sender(bus::DESTINATION)
            .with_interface(bus::INTERFACE)
            .with_member("NameOwnerChanged");

        match &scope {
            Scope::Exact(name) => rule = rule.with_arg0(name.clone()),
            Scope::Namespace(namespace) => {
                rule = rule.with_arg0_namespace(namespace.clone());
            }
            Scope::All => {}
        }

        let tracker = Arc::new(OwnerTracker {
            observer,
            sweep: Mutex::new(Some(HashSet::new())),
        });

        let handle = self.watch(rule, tracker.clone()).await?;

        let sweep = match &scope {
            Scope::Exact(name) => match self.get_name_owner(name).await {
                Ok(owner) => {
                    tracker.synthesize(name, owner);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Scope::Namespace(..) | Scope::All => self.sweep_names(&scope, &tracker).await,
        };

        if let Err(e) = sweep {
            tracker.observer.error(&e);
            drop(handle);
            return Err(e);
        }

        tracker.finish_sweep();
        Ok(handle)
    }

    async fn sweep_names(&self, scope: &Scope, tracker: &OwnerTracker) -> Result<()> {
        let names = self.list_names().await?;

        for name in names {
            // Unique names are not services.
            if name.starts_with(':') {
                continue;
            }

            if let Scope::Namespace(namespace) = scope {
                if !in_namespace(&name, namespace) {
                    continue;
                }
            }

            let owner = self.get_name_owner(&name).await?;
            tracker.synthesize(&name, owner);
        }

        Ok(())
    }
}

enum Scope {
    Exact(String),
    Namespace(String),
    All,
}

impl Scope {
    fn parse(name: &str) -> Self {
        if name == "*" || name == ".*" {
            Scope::All
        } else if let Some(namespace) = name.strip_suffix(".*") {
            Scope::Namespace(namespace.to_owned())
        } else {
            Scope::Exact(name.to_owned())
        }
    }
}

/// A change of ownership of a well-known name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChange {
    /// The well-known name.
    pub name: String,
    /// The previous owner, `None` when the name had no known owner.
    pub old_owner: Option<String>,
    /// The new owner, `None` when the name was released.
    pub new_owner: Option<String>,
}

/// Observer of name ownership, for [`Connection::resolve_service_owner`].
pub trait ServiceOwnerObserver: Send + Sync {
    /// An ownership transition, synthetic or live.
    fn owner_changed(&self, change: &OwnerChange);

    /// The subscription failed and has been disposed.
    fn error(&self, _error: &Error) {}
}

impl<F> ServiceOwnerObserver for F
where
    F: Fn(&OwnerChange) + Send + Sync,
{
    fn owner_changed(&self, change: &OwnerChange) {
        self(change)
    }
}

/// Bridges `NameOwnerChanged` signals and the initial probe, suppressing the
/// synthetic event for names whose real transition arrived first.
struct OwnerTracker {
    observer: Arc<dyn ServiceOwnerObserver>,
    /// Names already reported. `Some` while the initial sweep is running,
    /// dropped afterwards.
    sweep: Mutex<Option<HashSet<String>>>,
}

impl OwnerTracker {
    fn synthesize(&self, name: &str, owner: Option<String>) {
        let Some(owner) = owner else {
            return;
        };

        // The lock is held through the emission to keep per-name order; see
        // on_signal.
        let mut sweep = lock(&self.sweep);

        let Some(emitted) = sweep.as_mut() else {
            return;
        };

        if !emitted.insert(name.to_owned()) {
            // A real event for this name won the race.
            return;
        }

        self.observer.owner_changed(&OwnerChange {
            name: name.to_owned(),
            old_owner: None,
            new_owner: Some(owner),
        });
    }

    fn finish_sweep(&self) {
        *lock(&self.sweep) = None;
    }
}

impl SignalHandler for OwnerTracker {
    fn on_signal(&self, message: &Message) {
        let mut args = message.body().iter().filter_map(Value::as_str);

        let (Some(name), Some(old), Some(new)) = (args.next(), args.next(), args.next()) else {
            tracing::debug!("malformed NameOwnerChanged signal");
            return;
        };

        let not_empty = |s: &str| (!s.is_empty()).then(|| s.to_owned());
        let mut change = OwnerChange {
            name: name.to_owned(),
            old_owner: not_empty(old),
            new_owner: not_empty(new),
        };

        let mut sweep = lock(&self.sweep);

        if let Some(emitted) = sweep.as_mut() {
            if emitted.insert(change.name.clone()) {
                // The first transition the caller sees starts from "no
                // known owner".
                change.old_owner = None;
            }
        }

        self.observer.owner_changed(&change);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn dispatch_signal(inner: &Arc<Inner>, message: Message) {
    let handlers: Vec<Arc<dyn SignalHandler>> = {
        let s = inner.shared();

        s.subscriptions
            .values()
            .filter(|sub| sub.rule.matches(&message))
            .map(|sub| sub.handler.clone())
            .collect()
    };

    if handlers.is_empty() {
        return;
    }

    inner.execute(move || {
        for handler in handlers {
            handler.on_signal(&message);
        }
    });
}

fn unsubscribe(inner: &Arc<Inner>, id: u64) {
    let remove_rule = {
        let mut s = inner.shared();

        let Some(subscription) = s.subscriptions.remove(&id) else {
            return;
        };

        let key = subscription.rule_key;

        let drained = match s.rules.get_mut(&key) {
            Some(refs) => {
                *refs -= 1;
                *refs == 0
            }
            None => false,
        };

        if drained {
            s.rules.remove(&key);
            Some(key)
        } else {
            None
        }
    };

    // The removal is best effort; a failure only leaves a stale match on
    // the bus.
    if let Some(rule) = remove_rule {
        let m = Message::method_call(bus::PATH, "RemoveMatch")
            .with_interface(bus::INTERFACE)
            .with_destination(bus::DESTINATION)
            .with_flags(Flags::NO_REPLY_EXPECTED)
            .with_arg(rule);

        if let Err(e) = inner.send_message(m) {
            tracing::debug!(error = %e, "failed to remove match rule");
        }
    }
}
