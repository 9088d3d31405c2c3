//! Flag words carried on requests.

use bitflags::bitflags;

bitflags! {
    /// Flags on IO requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoFlags: u32 {
        /// Fail a PUT if the key already exists.
        const DONT_STOMP = 0x01;
        /// Client requests direct (RDMA) placement regardless of size.
        const DIRECT = 0x02;
        /// Create-only semantics for the underlying store operation.
        const CREATE_ONLY = 0x04;
    }
}

bitflags! {
    /// Flags on pool requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PoolFlags: u32 {
        /// Fail CREATE if the pool is already open.
        const CREATE_ONLY = 0x01;
    }
}

bitflags! {
    /// Flags on ADO invocations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AdoFlags: u64 {
        /// Allocate the payload as a detached buffer, not assigned to the key.
        const DETACHED = 0x01;
        /// Skip the put when the key already exists.
        const NO_OVERWRITE = 0x02;
        /// Create and zero the value; do not invoke the ADO.
        const CREATE_ONLY = 0x04;
        /// Take a read lock instead of a write lock.
        const READ_ONLY = 0x08;
        /// Asynchronous invocation: no completion response is sent; failures
        /// are recorded and reported later.
        const ASYNC = 0x10;
    }
}
