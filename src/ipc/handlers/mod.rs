pub mod admin;
pub mod backentry;
pub mod catalog;
pub mod certificates;
pub mod core;
pub mod grading;
pub mod lessons;
pub mod notifications;
