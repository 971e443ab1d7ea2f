use thiserror::Error;

/// Errors reported by dispatchers and queues.
///
/// Listener-raised errors are not represented here: a panicking listener propagates to the
/// caller of `dispatch`/`process` while traversal state is unwound. A `wait_for` timeout is
/// reported as a `false` return value, never as an error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A queue node could not be obtained because the underlying allocator failed.
    #[error("could not allocate a queue node: the allocator is out of memory")]
    AllocationFailure,

    /// The anchor handle passed to an insert operation belongs to a different list or was
    /// already removed.
    #[error("insert anchor does not belong to this list or was already removed")]
    InvalidAnchor,

    /// A heterogeneous dispatcher operation used a different argument type than the one the
    /// event was registered with.
    #[error("event listeners take `{expected}` arguments, but `{actual}` was supplied")]
    SignatureMismatch {
        /// The argument type the event key was first registered with.
        expected: &'static str,

        /// The argument type supplied by the failing operation.
        actual: &'static str,
    },
}

/// A specialized `Result` type returning the crate's [`Error`] as the error value.
pub type Result<T> = std::result::Result<T, Error>;
