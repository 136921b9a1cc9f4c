//! Trigger dispatch (C9): a file may name a subroutine invoked around
//! writes, deletes, clears and reads. A non-zero return vetoes the
//! operation. Grounded on spec.md §4.9; the original invokes a named
//! BASIC subroutine by symbol lookup, which has no equivalent in a typed
//! Rust library, so the dispatch point is a trait object a caller supplies
//! (an in-process closure, an FFI shim, whatever fits the embedding).

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    PreWrite,
    PostWrite,
    PreDelete,
    PostDelete,
    PreClear,
    PostClear,
    Read,
}

pub struct TriggerEvent<'a> {
    pub action: TriggerAction,
    pub id: &'a [u8],
    pub data: Option<&'a [u8]>,
    pub error_flag: bool,
}

pub trait Trigger: Send + Sync {
    /// Zero permits the operation, non-zero vetoes it.
    fn invoke(&self, event: &TriggerEvent) -> i32;
}

pub struct TriggerDispatch {
    handler: Option<Box<dyn Trigger>>,
    modes: u8,
}

pub const TRIGGER_PRE_WRITE: u8 = 0x01;
pub const TRIGGER_POST_WRITE: u8 = 0x02;
pub const TRIGGER_PRE_DELETE: u8 = 0x04;
pub const TRIGGER_POST_DELETE: u8 = 0x08;
pub const TRIGGER_PRE_CLEAR: u8 = 0x10;
pub const TRIGGER_POST_CLEAR: u8 = 0x20;
pub const TRIGGER_READ: u8 = 0x40;

fn mode_bit(action: TriggerAction) -> u8 {
    match action {
        TriggerAction::PreWrite => TRIGGER_PRE_WRITE,
        TriggerAction::PostWrite => TRIGGER_POST_WRITE,
        TriggerAction::PreDelete => TRIGGER_PRE_DELETE,
        TriggerAction::PostDelete => TRIGGER_POST_DELETE,
        TriggerAction::PreClear => TRIGGER_PRE_CLEAR,
        TriggerAction::PostClear => TRIGGER_POST_CLEAR,
        TriggerAction::Read => TRIGGER_READ,
    }
}

impl TriggerDispatch {
    pub fn new(handler: Option<Box<dyn Trigger>>, modes: u8) -> Self {
        Self { handler, modes }
    }

    pub fn none() -> Self {
        Self {
            handler: None,
            modes: 0,
        }
    }

    /// Calls the registered handler if this action's mode bit is set.
    /// Returns `Err(Triggered(code))` on a non-zero veto.
    pub fn fire(&self, event: TriggerEvent) -> Result<()> {
        if self.modes & mode_bit(event.action) == 0 {
            return Ok(());
        }
        let Some(handler) = &self.handler else {
            return Ok(());
        };
        let code = handler.invoke(&event);
        if code != 0 {
            return Err(StoreError::Triggered(code));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    struct CountingTrigger {
        calls: Arc<AtomicI32>,
        veto: bool,
    }

    impl Trigger for CountingTrigger {
        fn invoke(&self, _event: &TriggerEvent) -> i32 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.veto {
                1
            } else {
                0
            }
        }
    }

    #[test]
    fn disabled_mode_bit_skips_handler() {
        let calls = Arc::new(AtomicI32::new(0));
        let dispatch = TriggerDispatch::new(
            Some(Box::new(CountingTrigger {
                calls: calls.clone(),
                veto: false,
            })),
            TRIGGER_PRE_WRITE,
        );
        dispatch
            .fire(TriggerEvent {
                action: TriggerAction::PostWrite,
                id: b"K01",
                data: None,
                error_flag: false,
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn nonzero_return_vetoes_operation() {
        let calls = Arc::new(AtomicI32::new(0));
        let dispatch = TriggerDispatch::new(
            Some(Box::new(CountingTrigger {
                calls: calls.clone(),
                veto: true,
            })),
            TRIGGER_PRE_WRITE,
        );
        let err = dispatch
            .fire(TriggerEvent {
                action: TriggerAction::PreWrite,
                id: b"K01",
                data: Some(b"x"),
                error_flag: false,
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Triggered(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
