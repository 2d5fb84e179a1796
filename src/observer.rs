//! Subscription lists for synchronous, registration-ordered observers

/// Handle returned by `subscribe`, used to unsubscribe later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Ordered list of observers of one kind.
///
/// Delivery always follows registration order.
pub struct ObserverList<O: ?Sized> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Box<O>)>,
}

impl<O: ?Sized> Default for ObserverList<O> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<O: ?Sized> ObserverList<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer and return the observer itself for an initial delivery
    pub fn subscribe(&mut self, observer: Box<O>) -> (SubscriptionId, &mut O) {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, observer));
        let last = self.entries.len() - 1;
        (id, self.entries[last].1.as_mut())
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        match self.entries.iter().position(|(entry_id, _)| *entry_id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut O> {
        self.entries.iter_mut().map(|(_, observer)| observer.as_mut())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
