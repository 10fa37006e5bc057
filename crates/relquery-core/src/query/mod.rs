pub mod builder;
pub mod cache;
pub mod guards;
pub mod keyword;
pub mod metrics;
pub mod payload;
pub mod planner;
pub mod service;
pub mod traversal;
pub mod validator;
pub mod vector;
