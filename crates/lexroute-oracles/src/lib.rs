pub mod classify;
pub mod extract;
pub mod news;
pub mod notify;
