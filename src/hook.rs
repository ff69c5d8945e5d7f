//! The engine's per-step extension point.
//!
//! A [`StepHook`] owns the engine's default per-step handler and at most one
//! installed observer. [`StepHook::dispatch`] runs the observer first and then
//! always forwards to the default handler. Installing returns a
//! [`HookRegistration`]; dropping it puts the hook back into passthrough.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::engine::StepInfo;

pub trait StepObserver: Send {
    fn on_step(&mut self, step: &StepInfo<'_>);
}

impl<F> StepObserver for F
where
    F: FnMut(&StepInfo<'_>) + Send,
{
    fn on_step(&mut self, step: &StepInfo<'_>) {
        self(step)
    }
}

struct Slots {
    default: Box<dyn StepObserver>,
    installed: Option<(u64, Box<dyn StepObserver>)>,
    next_id: u64,
}

/// Cloning shares the same slots; the engine and the capture layer each hold
/// a handle.
#[derive(Clone)]
pub struct StepHook {
    slots: Arc<Mutex<Slots>>,
}

impl StepHook {
    pub fn new(default: impl StepObserver + 'static) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                default: Box::new(default),
                installed: None,
                next_id: 1,
            })),
        }
    }

    /// A hook whose default handler does nothing.
    pub fn passthrough() -> Self {
        Self::new(|_: &StepInfo<'_>| {})
    }

    /// Installs `observer`, replacing any observer already installed.
    pub fn install(&self, observer: impl StepObserver + 'static) -> HookRegistration {
        let mut slots = self.lock();
        let id = slots.next_id;
        slots.next_id += 1;
        if let Some((previous, _)) = slots.installed.replace((id, Box::new(observer))) {
            warn!(previous, replacement = id, "replacing installed step observer");
        } else {
            debug!(id, "installed step observer");
        }
        HookRegistration {
            hook: self.clone(),
            id,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.lock().installed.is_some()
    }

    /// Called by the engine once per iteration, on the engine thread.
    ///
    /// Observers must not call back into the same hook.
    pub fn dispatch(&self, step: &StepInfo<'_>) {
        let mut slots = self.lock();
        if let Some((_, observer)) = slots.installed.as_mut() {
            observer.on_step(step);
        }
        slots.default.on_step(step);
    }

    fn uninstall(&self, id: u64) -> bool {
        let mut slots = self.lock();
        match &slots.installed {
            Some((current, _)) if *current == id => {
                slots.installed = None;
                debug!(id, "restored passthrough step handler");
                true
            }
            _ => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps an observer installed for as long as it lives.
///
/// A registration that was superseded by a later install does not remove the
/// newer observer when dropped.
#[must_use = "dropping the registration uninstalls the observer"]
pub struct HookRegistration {
    hook: StepHook,
    id: u64,
}

impl HookRegistration {
    pub fn is_active(&self) -> bool {
        matches!(&self.hook.lock().installed, Some((current, _)) if *current == self.id)
    }

    pub fn uninstall(self) {
        drop(self);
    }
}

impl Drop for HookRegistration {
    fn drop(&mut self) {
        self.hook.uninstall(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::engine::Preview;

    fn counting(counter: &Arc<AtomicU32>) -> impl StepObserver + 'static {
        let counter = Arc::clone(counter);
        move |_: &StepInfo<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn step(preview: &Preview, index: u32) -> StepInfo<'_> {
        StepInfo { index, preview }
    }

    #[test]
    fn default_handler_always_runs() {
        let defaults = Arc::new(AtomicU32::new(0));
        let observed = Arc::new(AtomicU32::new(0));
        let hook = StepHook::new(counting(&defaults));
        let preview = Preview::new(1, 1, vec![0; 4]).unwrap();

        hook.dispatch(&step(&preview, 0));
        let registration = hook.install(counting(&observed));
        hook.dispatch(&step(&preview, 1));
        drop(registration);
        hook.dispatch(&step(&preview, 2));

        assert_eq!(defaults.load(Ordering::SeqCst), 3);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert!(!hook.is_installed());
    }

    #[test]
    fn install_replaces_instead_of_stacking() {
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        let hook = StepHook::passthrough();
        let preview = Preview::new(1, 1, vec![0; 4]).unwrap();

        let old = hook.install(counting(&first));
        let new = hook.install(counting(&second));
        assert!(!old.is_active());
        assert!(new.is_active());

        hook.dispatch(&step(&preview, 0));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        // The stale registration must not remove its replacement.
        drop(old);
        assert!(hook.is_installed());
        new.uninstall();
        assert!(!hook.is_installed());
    }
}
