//! Host-side state shared between the translator and generated code.
//!
//! - [`ExecMemory`]: the executable region translated code is written to.
//! - [`GuestMemory`] and [`MemoryMap`]: guest RAM and the per-page table
//!   generated code uses for inline memory access.
//! - [`InvalidCode`]: per-page flags telling stores whether to notify.
//! - [`CpuContext`]: register backing store and host hooks of one guest
//!   processor, addressed by generated code through `r15`.

mod context;
mod guest;
mod memory;

pub use context::{
    CpuContext, ExceptionHook, HostHooks, InterpHook, LinkHook, LookupHook, NotifyHook, ReadHook,
    VerifyHook, WriteHook,
};
pub use guest::{
    GUEST_PAGE_SHIFT, GUEST_PAGE_SIZE, GUEST_PAGES, GuestMemory, InvalidCode, MemoryMap, SLOW_PATH,
};
pub use memory::{ExecMemory, HOST_PAGE_SIZE, MemoryError};
