use anyhow::{Context as _, Result};
use std::{
    error::Error,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Once tripped, graph nodes that have not started yet will not start.
/// Nodes that are already running are left to finish.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    canceled: Arc<AtomicBool>,
}

#[derive(Clone, Debug)]
pub struct InterruptedError {}
impl Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted")
    }
}
impl Error for InterruptedError {}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn check_raw(&self) -> Result<(), InterruptedError> {
        if self.is_canceled() {
            Err(InterruptedError {})
        } else {
            Ok(())
        }
    }

    pub fn check(&self) -> anyhow::Result<()> {
        self.check_raw().map_err(|x| x.into())
    }
}

/// Trip the returned signal on Ctrl-C.
pub fn set_up_process_interrupt_handler() -> Result<CancelSignal> {
    let signal = CancelSignal::new();
    let handler_signal = signal.clone();
    ctrlc::set_handler(move || {
        handler_signal.cancel();
    })
    .context("setting up the interrupt handler")?;
    Ok(signal)
}
