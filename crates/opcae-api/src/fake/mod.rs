//! In-process stand-in for an OPC Alarms & Events server.
//!
//! Everything the client crate drives through vtables is implemented here as
//! genuine COM-layout objects, so the whole call contract (reference counts,
//! out-parameter ownership, callbacks on foreign threads) is exercised without
//! a Windows host. Every block handed to the client comes from a
//! [`CountingAllocator`] that reports leaks and double frees.

mod alloc;
mod records;
mod server;

pub use alloc::CountingAllocator;
pub use records::{FakeCondition, FakeEvent};
pub use server::{FakeEventServer, MAX_BATCH_SIZE, MIN_BUFFER_TIME_MS};
