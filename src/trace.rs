//! Processor trace toggling around guest execution

use crate::addrs::Vcpu;

/// Hypervisor hooks that enable processor trace collection while the guest runs.
///
/// Both hooks return `true` if the trace state changed.
pub trait TraceToggle {
    /// Called right before entering the guest
    fn vm_entry(&mut self, vcpu: Vcpu) -> bool;

    /// Called right after the guest exits
    fn vm_exit(&mut self, vcpu: Vcpu) -> bool;
}

/// [`TraceToggle`] for runs without processor trace
#[derive(Debug, Default, Copy, Clone)]
pub struct NoTrace;

impl TraceToggle for NoTrace {
    fn vm_entry(&mut self, _vcpu: Vcpu) -> bool {
        false
    }

    fn vm_exit(&mut self, _vcpu: Vcpu) -> bool {
        false
    }
}
