mod send_side_bandwidth_estimation;

pub use send_side_bandwidth_estimation::*;
