pub mod api;
pub mod election;
pub mod record;
