pub mod auth;
pub mod notes;
pub mod remote;
pub mod status;
pub mod sync;
