use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

// notify is a single atomic store, safe from ISR context
#[derive(Debug, Clone, Default)]
pub struct FlowSignal(Arc<AtomicBool>);

impl FlowSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpgradeFlag(Arc<AtomicBool>);

impl UpgradeFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}
