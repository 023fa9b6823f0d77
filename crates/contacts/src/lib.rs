//! Contact store — concurrent map of marketing contacts with a unique
//! case-insensitive email index, versioned read-modify-write updates, and
//! one-way subscription-status transitions.

pub mod store;

pub use store::ContactStore;
