pub mod config;
pub mod controller;
pub mod custom_id;
pub mod encoder;
pub mod errors;
pub mod jsonl;
pub mod model;
pub mod normalize;
pub mod providers;
pub mod reconcile;
pub mod sentinel;
pub mod split_merge;
pub mod storage;
