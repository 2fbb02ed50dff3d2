//! Small shared utility library used by the traffic data pipeline.

pub mod notify;
