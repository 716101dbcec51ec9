pub mod alert;
pub mod archive;
pub mod cache;
pub mod catalog;
pub mod conf;
pub mod coverage;
pub mod event;
pub mod filter;
pub mod report;
pub mod scanner;
pub mod skymap;
pub mod utils;
