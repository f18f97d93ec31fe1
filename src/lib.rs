pub mod calibration;
pub mod catalog;
pub mod conf;
pub mod frames;
pub mod fusion;
pub mod host;
pub mod limits;
pub mod pipeline;
pub mod redshift;
pub mod sky;
pub mod spatial;
pub mod stats;
pub mod utils;
