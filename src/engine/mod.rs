pub mod candidates;
pub mod offers;
pub mod presence;
pub mod scoring;
pub mod sweep;
pub mod trips;
