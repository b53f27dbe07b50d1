//! Shared-memory object kit.
//!
//! A typed record/array/lock/signal library over a linear byte region used
//! as a shared allocator. The region is shared between the host controller
//! thread and guest worker threads; every structure that lives inside it is
//! laid out explicitly (little-endian, platform alignment rules) so that
//! all threads agree on the byte image.
//!
//! Layering, bottom up:
//!
//! - [`buffer`]: fixed-size shared byte buffers (no allocator) used for
//!   one-shot message exchange.
//! - [`region`]: the allocating region plus owning/borrowed range views.
//! - [`futex`]: address-keyed wait/wake parking, the blocking substrate.
//! - [`lock`]: re-entrant mutual exclusion and one-shot signals on shared
//!   32-bit cells.
//! - [`record`]: record descriptors with computed field offsets and typed
//!   accessors.
//! - [`handle`]: resource handles encoding pointer + generation counter.
//! - [`array`] / [`list`]: shared containers built on all of the above.

pub mod array;
pub mod buffer;
pub mod futex;
pub mod handle;
pub mod list;
pub mod lock;
pub mod record;
pub mod region;

mod error;

pub use array::SharedArray;
pub use buffer::{BufferId, SharedBuffer};
pub use error::{MemoryError, ShmError};
pub use handle::ResourceHandle;
pub use list::SharedLinkedList;
pub use lock::{Lock, Signal};
pub use record::{PropertyType, Record, RecordDescriptor};
pub use region::{MemoryRange, MemoryRegion, ReadonlyMemoryRange, RegionId};
