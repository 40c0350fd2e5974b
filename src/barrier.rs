use std::sync::atomic::{compiler_fence, fence, Ordering};

/// Makes buffer writes visible before a transfer is handed to the engine.
#[inline(always)]
pub fn dmb() {
    compiler_fence(Ordering::SeqCst);
    fence(Ordering::SeqCst);
    compiler_fence(Ordering::SeqCst);
}
