pub mod interface;
pub mod protocol;
pub mod service;
pub mod shared;
