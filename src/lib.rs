pub mod data;
pub mod logging;
pub mod ml;
pub mod model;
