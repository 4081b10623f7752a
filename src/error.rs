/// Errors reported by link layer software
#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// No buffer available in a fixed-capacity pool or queue
    NoMemory,
    /// The module is busy with ongoing operation
    WouldBlock,
    /// The requested item is not present
    NotFound,
    /// A pool reference does not match the slot's current generation
    StaleRef,
    /// The operation is not valid in the current state
    InvalidState,
    /// A parameter is out of range for this operation
    InvalidParam,
    /// Unknown connection handle
    UnknownHandle,
}
