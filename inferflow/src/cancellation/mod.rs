//! Cooperative shutdown signalling for consumer loops.

mod token;

pub use token::CancellationToken;
