pub mod calendar;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod hours;
pub mod inference;
pub mod jobs;
pub mod limits;
pub mod model;
pub mod observability;
pub mod wal;
