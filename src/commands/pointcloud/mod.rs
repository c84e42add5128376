pub mod convert;
pub mod destination;
pub mod pipeline;
pub mod potree;
pub mod safety;
