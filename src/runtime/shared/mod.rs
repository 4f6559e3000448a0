//! Lists shared between tasks
//!
//! Tasks run one at a time, so a `RefCell` is enough to share a list. The
//! only hazard is a borrow (or an iterator) that outlives a suspension point
//! and observes the list after another task changed it. `SharedList` never
//! hands out such a borrow: access is by index, by snapshot, or through a
//! synchronous closure that cannot contain an `.await`.

use std::cell::RefCell;
use std::rc::Rc;

/// A list shared by the tasks of one scheduler.
pub struct SharedList<T> {
    items: Rc<RefCell<Vec<T>>>,
}

impl<T> Clone for SharedList<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T> Default for SharedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SharedList<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_list().entries(self.items.borrow().iter()).finish()
    }
}

impl<T> From<Vec<T>> for SharedList<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            items: Rc::new(RefCell::new(items)),
        }
    }
}

impl<T> SharedList<T> {
    pub fn new() -> Self {
        Self::from(Vec::new())
    }

    pub fn push(
        &self,
        item: T,
    ) {
        self.items.borrow_mut().push(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.items.borrow_mut().pop()
    }

    /// Remove the item at `index`; `None` when out of range.
    pub fn remove(
        &self,
        index: usize,
    ) -> Option<T> {
        let mut items = self.items.borrow_mut();
        (index < items.len()).then(|| items.remove(index))
    }

    /// Replace the item at `index`, returning the old one.
    pub fn set(
        &self,
        index: usize,
        item: T,
    ) -> Option<T> {
        self.items
            .borrow_mut()
            .get_mut(index)
            .map(|slot| std::mem::replace(slot, item))
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.items.borrow_mut().clear();
    }

    pub fn retain(
        &self,
        keep: impl FnMut(&T) -> bool,
    ) {
        self.items.borrow_mut().retain(keep);
    }

    /// Run `f` over the current contents. `f` is synchronous, so the borrow
    /// ends before the caller can suspend.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&[T]) -> R,
    ) -> R {
        f(&self.items.borrow())
    }

    /// Mutable counterpart of `with`.
    pub fn with_mut<R>(
        &self,
        f: impl FnOnce(&mut Vec<T>) -> R,
    ) -> R {
        f(&mut self.items.borrow_mut())
    }
}

impl<T: Clone> SharedList<T> {
    pub fn get(
        &self,
        index: usize,
    ) -> Option<T> {
        self.items.borrow().get(index).cloned()
    }

    /// Copy of the current contents, safe to iterate across suspensions.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.borrow().clone()
    }
}

#[cfg(test)]
mod tests;
